//! Length-bounded record framing and payload decoding.

use scroll::{Pread, LE};

use quarry_msf::StreamWalker;

use crate::{raw, CodeViewError, CodeViewErrorKind};

/// One framed record: a 2-byte length, a 2-byte kind tag, then payload.
///
/// The length counts everything after the length field itself, so the
/// payload holds exactly `length - 2` bytes and a decoder can never read
/// past the record's declared bounds.
#[derive(Debug, Clone)]
pub struct Record {
    /// The record's kind tag.
    pub kind: u16,
    /// Stream offset of the length field.
    pub start: u64,
    /// Stream offset just past the record.
    pub end: u64,
    /// The payload following the kind tag.
    pub data: Vec<u8>,
}

impl Record {
    /// Reads the next record from the walker.
    ///
    /// Returns `Ok(None)` at the end of the window or on the zero-length
    /// terminator some streams carry.
    pub fn read(walker: &mut StreamWalker<'_, '_>) -> Result<Option<Record>, CodeViewError> {
        if walker.remaining() < 4 {
            return Ok(None);
        }
        let start = walker.pos();
        let len = walker.read_u16()?;
        if len < 2 {
            return Ok(None);
        }
        let kind = walker.read_u16()?;
        let mut data = vec![0u8; len as usize - 2];
        walker.read(&mut data)?;
        Ok(Some(Record {
            kind,
            start,
            end: start + 2 + len as u64,
            data,
        }))
    }

    /// A cursor over this record's payload.
    pub fn cursor(&self) -> RecordCursor<'_> {
        RecordCursor::new(&self.data)
    }
}

/// A bounded cursor over a record payload.
pub struct RecordCursor<'r> {
    data: &'r [u8],
    offset: usize,
}

impl<'r> RecordCursor<'r> {
    /// Creates a cursor at the start of `data`.
    pub fn new(data: &'r [u8]) -> Self {
        RecordCursor { data, offset: 0 }
    }

    fn bad<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> CodeViewError {
        CodeViewError::new(CodeViewErrorKind::InvalidRecord, e)
    }

    /// The current payload offset.
    pub fn pos(&self) -> usize {
        self.offset
    }

    /// Bytes left in the payload.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    /// Moves the cursor to an absolute payload offset.
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Advances the cursor without reading.
    pub fn skip(&mut self, n: usize) {
        self.offset += n;
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> Result<u8, CodeViewError> {
        self.data.gread_with(&mut self.offset, LE).map_err(Self::bad)
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, CodeViewError> {
        self.data.gread_with(&mut self.offset, LE).map_err(Self::bad)
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, CodeViewError> {
        self.data.gread_with(&mut self.offset, LE).map_err(Self::bad)
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, CodeViewError> {
        self.data.gread_with(&mut self.offset, LE).map_err(Self::bad)
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, CodeViewError> {
        self.data.gread_with(&mut self.offset, LE).map_err(Self::bad)
    }

    /// Reads a NUL-terminated UTF-8 string.
    pub fn read_cstring(&mut self) -> Result<String, CodeViewError> {
        let tail = self
            .data
            .get(self.offset..)
            .ok_or(CodeViewErrorKind::InvalidRecord)?;
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodeViewErrorKind::InvalidRecord)?;
        let s = std::str::from_utf8(&tail[..nul]).map_err(Self::bad)?;
        self.offset += nul + 1;
        Ok(s.to_string())
    }

    /// Reads a numeric leaf: either an immediate `u16 < 0x8000` or a
    /// tagged integer of the size the tag dictates.
    pub fn read_numeric(&mut self) -> Result<i64, CodeViewError> {
        let tag = self.read_u16()?;
        if tag < raw::LF_NUMERIC {
            return Ok(tag as i64);
        }
        match tag {
            raw::LF_CHAR => Ok(self.read_u8()? as i8 as i64),
            raw::LF_SHORT => Ok(self.read_u16()? as i16 as i64),
            raw::LF_USHORT => Ok(self.read_u16()? as i64),
            raw::LF_LONG => Ok(self.read_i32()? as i64),
            raw::LF_ULONG => Ok(self.read_u32()? as i64),
            raw::LF_QUADWORD | raw::LF_UQUADWORD => Ok(self.read_u64()? as i64),
            _ => Err(CodeViewErrorKind::Unsupported.into()),
        }
    }
}
