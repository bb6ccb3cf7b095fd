use std::collections::HashMap;

use crate::{raw, MsfError, MsfErrorKind, StreamWalker};

/// The parsed info stream: debug identity plus the stream-name directory.
///
/// The directory is a serialized string map: a names buffer, entry count
/// and capacity, a present bitset, a deleted bitset, then `(name offset,
/// stream id)` pairs for every present slot.
#[derive(Debug)]
pub(crate) struct NameDirectory {
    pub(crate) age: u32,
    pub(crate) guid: [u8; 16],
    streams: HashMap<String, u32>,
}

impl NameDirectory {
    pub(crate) fn parse(mut walker: StreamWalker<'_, '_>) -> Result<Self, MsfError> {
        let version = walker.read_u32()?;
        let _signature = walker.read_u32()?;
        let age = walker.read_u32()?;
        let mut guid = [0u8; 16];
        walker.read(&mut guid)?;

        if version != raw::INFO_STREAM_VERSION {
            tracing::warn!(version, "unknown info stream version");
            return Err(MsfErrorKind::UnsupportedVersion.into());
        }

        let names_len = walker.read_u32()?;
        let mut names = vec![0u8; names_len as usize];
        walker.read(&mut names)?;

        let _used = walker.read_u32()?;
        let capacity = walker.read_u32()?;

        // Present bitset, then a deleted bitset we have no use for.
        let present_words = walker.read_u32()?;
        let mut present = walker;
        walker.skip(present_words as u64 * 4);
        let deleted_words = walker.read_u32()?;
        walker.skip(deleted_words as u64 * 4);

        let mut streams = HashMap::new();
        let mut word = 0u32;
        for slot in 0..capacity {
            if slot % 32 == 0 {
                word = if slot / 32 < present_words {
                    present.read_u32()?
                } else {
                    0
                };
            }
            if word & (1 << (slot % 32)) == 0 {
                continue;
            }
            let name_offset = walker.read_u32()? as usize;
            let stream_id = walker.read_u32()?;
            let name_bytes = names
                .get(name_offset..)
                .and_then(|tail| tail.split(|&b| b == 0).next())
                .ok_or(MsfErrorKind::InvalidHeader)?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|e| MsfError::new(MsfErrorKind::InvalidStringData, e))?;
            streams.insert(name.to_string(), stream_id);
        }

        Ok(NameDirectory { age, guid, streams })
    }

    pub(crate) fn stream_id(&self, name: &str) -> Option<u32> {
        self.streams.get(name).copied()
    }
}

/// The `/names` global string table.
///
/// Strings referenced from line-number checksums and frame-data records
/// are stored here as NUL-terminated bytes behind a small header; they are
/// fetched on demand by byte offset.
#[derive(Clone, Copy, Debug)]
pub struct StringTable<'m, 'data> {
    walker: StreamWalker<'m, 'data>,
    data_base: u64,
}

impl<'m, 'data> StringTable<'m, 'data> {
    pub(crate) fn parse(mut walker: StreamWalker<'m, 'data>) -> Result<Self, MsfError> {
        let magic = walker.read_u32()?;
        let version = walker.read_u32()?;
        let _data_size = walker.read_u32()?;
        if magic != raw::STRING_TABLE_MAGIC {
            return Err(MsfErrorKind::InvalidHeader.into());
        }
        if version != 1 && version != 2 {
            tracing::warn!(version, "unknown string table version");
            return Err(MsfErrorKind::UnsupportedVersion.into());
        }
        let data_base = walker.pos();
        Ok(StringTable { walker, data_base })
    }

    /// Fetches the string starting at `offset` within the table.
    pub fn get(&self, offset: u32) -> Result<String, MsfError> {
        let mut walker = self.walker;
        walker.seek(self.data_base + offset as u64);
        walker.read_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Msf, MsfErrorKind};
    use quarry_testutils::ContainerBuilder;

    #[test]
    fn resolves_stream_names_and_debug_id() {
        let data = ContainerBuilder::new(&[b"zero".to_vec()])
            .info_stream(7, [0x11; 16], &[("/names", 4), ("/LinkInfo", 5)])
            .build();
        let msf = Msf::parse(&data).unwrap();

        assert_eq!(msf.stream_by_name("/names").unwrap(), 4);
        assert_eq!(msf.stream_by_name("/LinkInfo").unwrap(), 5);
        assert_eq!(
            msf.stream_by_name("/nope").unwrap_err().kind(),
            MsfErrorKind::NotFound
        );
        assert_eq!(msf.debug_id().unwrap().appendix(), 7);
    }

    #[test]
    fn string_table_lookup() {
        let mut table = Vec::new();
        table.extend_from_slice(&0xEFFE_EFFEu32.to_le_bytes());
        table.extend_from_slice(&1u32.to_le_bytes());
        let strings = b"\0one.c\0two.c\0";
        table.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        table.extend_from_slice(strings);

        let data = ContainerBuilder::new(&[Vec::new()])
            .info_stream(1, [0; 16], &[("/names", 4)])
            .stream_at(4, table)
            .build();
        let msf = Msf::parse(&data).unwrap();
        let names = msf.string_table().unwrap();

        assert_eq!(names.get(1).unwrap(), "one.c");
        assert_eq!(names.get(7).unwrap(), "two.c");
        assert_eq!(names.get(0).unwrap(), "");
    }

    #[test]
    fn missing_string_table_degrades() {
        let data = ContainerBuilder::new(&[Vec::new()])
            .info_stream(1, [0; 16], &[])
            .build();
        let msf = Msf::parse(&data).unwrap();
        assert_eq!(
            msf.string_table().unwrap_err().kind(),
            MsfErrorKind::MissingInformation
        );
    }
}
