//! The memory-read capability unwinding is built on.

use crate::{UnwindError, UnwindErrorKind};

/// Read access to the memory of the process being unwound.
///
/// This is a plain byte-range request with no ordering or atomicity
/// guarantees beyond "the bytes returned were live at the time of the
/// call". Implementations may read a live process, a crash snapshot or a
/// captured buffer.
pub trait ProcessMemory {
    /// Reads exactly `buf.len()` bytes at `address`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), UnwindError>;

    /// Reads one little-endian machine word of `width` bytes (4 or 8).
    fn read_word(&self, address: u64, width: usize) -> Result<u64, UnwindError> {
        let mut buf = [0u8; 8];
        match width {
            4 => {
                self.read(address, &mut buf[..4])?;
                Ok(u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64)
            }
            8 => {
                self.read(address, &mut buf)?;
                Ok(u64::from_le_bytes(buf))
            }
            _ => Err(UnwindError::new(
                UnwindErrorKind::MemoryUnreadable,
                format!("unsupported word width {width}"),
            )),
        }
    }
}

/// A captured region of memory, given by a base address and a slice.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion<'a> {
    pub base: u64,
    pub contents: &'a [u8],
}

impl MemoryRegion<'_> {
    /// The region's length in bytes.
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    /// Returns true if the region is empty.
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

impl ProcessMemory for MemoryRegion<'_> {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), UnwindError> {
        let start = address
            .checked_sub(self.base)
            .ok_or_else(|| unreadable(address, buf.len()))? as usize;
        let bytes = self
            .contents
            .get(start..start + buf.len())
            .ok_or_else(|| unreadable(address, buf.len()))?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

fn unreadable(address: u64, len: usize) -> UnwindError {
    UnwindError::new(
        UnwindErrorKind::MemoryUnreadable,
        format!("cannot read {len} bytes at {address:#x}"),
    )
}
