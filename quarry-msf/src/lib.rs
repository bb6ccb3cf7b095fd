//! A reader for the block-structured multi-stream container format used by
//! program-database debug files.
//!
//! A container is a sequence of fixed-size blocks. A *stream* is a logical
//! byte sequence stored as an ordered list of block indices plus a byte
//! length; the *directory* maps stream ids to those lists. [`Msf::parse`]
//! validates the superblock and loads the directory; actual stream data is
//! read through [`StreamWalker`] cursors, which copy bytes transparently
//! across block boundaries and can be narrowed to a sub-window so that a
//! consumer can never escape a record's declared bounds.
//!
//! The container is immutable once opened. Walkers borrow the reader
//! immutably, so any number of them may traverse the same container
//! concurrently.

use std::error::Error;
use std::fmt;

use debugid::DebugId;
use once_cell::sync::OnceCell;
use thiserror::Error;
use uuid::Uuid;

pub mod raw;

mod names;
mod walker;

pub use names::StringTable;
pub use walker::StreamWalker;

use names::NameDirectory;

/// The kind of a [`MsfError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MsfErrorKind {
    /// The file does not start with the container magic.
    #[error("invalid signature")]
    InvalidSignature,
    /// The superblock or directory is malformed.
    #[error("invalid header")]
    InvalidHeader,
    /// A read extends past the end of the file or a block list.
    #[error("read outside the container")]
    Io,
    /// The caller violated a walker or lookup contract.
    #[error("invalid argument")]
    InvalidArgument,
    /// The caller's buffer cannot hold the string being read.
    #[error("buffer too small")]
    BufferTooSmall,
    /// A well-formed lookup had no match.
    #[error("not found")]
    NotFound,
    /// An optional substructure is absent from the container.
    #[error("missing information")]
    MissingInformation,
    /// String data is not valid UTF-8.
    #[error("invalid string data")]
    InvalidStringData,
    /// A substructure uses an unsupported format version.
    #[error("unsupported version")]
    UnsupportedVersion,
}

/// An error encountered while reading a multi-stream container.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct MsfError {
    pub(crate) kind: MsfErrorKind,
    #[source]
    pub(crate) source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl MsfError {
    /// Creates a new error from a known kind and an arbitrary payload.
    pub(crate) fn new<E>(kind: MsfErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Returns the corresponding [`MsfErrorKind`] for this error.
    pub fn kind(&self) -> MsfErrorKind {
        self.kind
    }
}

impl From<MsfErrorKind> for MsfError {
    fn from(kind: MsfErrorKind) -> Self {
        Self { kind, source: None }
    }
}

/// One stream's directory entry: byte size plus ordered block list.
#[derive(Debug, Clone, Default)]
struct StreamEntry {
    size: u32,
    blocks: Vec<u32>,
}

/// A parsed multi-stream container over a borrowed buffer.
pub struct Msf<'data> {
    data: &'data [u8],
    block_size: u32,
    num_blocks: u32,
    streams: Vec<StreamEntry>,
    names: OnceCell<NameDirectory>,
}

impl fmt::Debug for Msf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msf")
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_streams", &self.streams.len())
            .finish()
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, MsfError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(MsfErrorKind::InvalidHeader)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

impl<'data> Msf<'data> {
    /// Checks whether the buffer could be a multi-stream container,
    /// without parsing it.
    pub fn peek(buf: &[u8]) -> bool {
        buf.get(..raw::MSF_MAGIC.len()) == Some(&raw::MSF_MAGIC[..])
    }

    /// Parses the provided buffer into a container reader.
    ///
    /// Fails with `InvalidSignature` on an unknown magic (including the
    /// legacy small-block format) and with `InvalidHeader` when the
    /// superblock or the stream directory is inconsistent. A rejected
    /// container is never partially usable.
    pub fn parse(data: &'data [u8]) -> Result<Self, MsfError> {
        if !Self::peek(data) {
            return Err(MsfErrorKind::InvalidSignature.into());
        }

        let header_base = raw::MSF_MAGIC.len();
        let superblock = raw::SuperBlock {
            block_size: read_u32(data, header_base)?,
            free_block_map: read_u32(data, header_base + 4)?,
            num_blocks: read_u32(data, header_base + 8)?,
            directory_size: read_u32(data, header_base + 12)?,
            reserved: read_u32(data, header_base + 16)?,
            directory_block_list: read_u32(data, header_base + 20)?,
        };

        let block_size = superblock.block_size;
        if !(512..=8192).contains(&block_size) || !block_size.is_power_of_two() {
            return Err(MsfErrorKind::InvalidHeader.into());
        }
        if superblock.num_blocks as u64 * block_size as u64 > data.len() as u64 {
            return Err(MsfErrorKind::InvalidHeader.into());
        }

        let mut msf = Msf {
            data,
            block_size,
            num_blocks: superblock.num_blocks,
            streams: Vec::new(),
            names: OnceCell::new(),
        };

        // The superblock points at a block holding the list of directory
        // blocks; the directory itself is reassembled from those.
        let num_dir_blocks = msf.blocks_for(superblock.directory_size);
        let list_offset = superblock.directory_block_list as usize * block_size as usize;
        let mut dir_blocks = Vec::with_capacity(num_dir_blocks);
        for i in 0..num_dir_blocks {
            dir_blocks.push(read_u32(data, list_offset + i * 4)?);
        }

        let directory = msf.read_blocks(&dir_blocks, superblock.directory_size as usize)?;

        let num_streams = read_u32(&directory, 0)? as usize;
        let sizes_end = 4 + num_streams * 4;
        if sizes_end > directory.len() {
            return Err(MsfErrorKind::InvalidHeader.into());
        }

        let mut streams = Vec::with_capacity(num_streams);
        let mut block_cursor = sizes_end;
        for i in 0..num_streams {
            let mut size = read_u32(&directory, 4 + i * 4)?;
            // Absent streams are recorded with a nil size; normalize.
            if size == u32::MAX {
                size = 0;
            }
            let num_blocks = msf.blocks_for(size);
            let mut blocks = Vec::with_capacity(num_blocks);
            for _ in 0..num_blocks {
                let block = read_u32(&directory, block_cursor)?;
                if block >= superblock.num_blocks {
                    return Err(MsfErrorKind::InvalidHeader.into());
                }
                blocks.push(block);
                block_cursor += 4;
            }
            streams.push(StreamEntry { size, blocks });
        }

        msf.streams = streams;
        Ok(msf)
    }

    /// The container's block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// The number of streams in the directory.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// The byte size of the given stream.
    ///
    /// Fails with `InvalidArgument` for stream ids outside the directory.
    pub fn stream_size(&self, stream: u32) -> Result<u32, MsfError> {
        self.streams
            .get(stream as usize)
            .map(|entry| entry.size)
            .ok_or_else(|| MsfErrorKind::InvalidArgument.into())
    }

    /// Creates a walker spanning the whole of the given stream.
    pub fn walker(&self, stream: u32) -> Result<StreamWalker<'_, 'data>, MsfError> {
        let size = self.stream_size(stream)?;
        Ok(StreamWalker::new(self, stream, 0, size as u64))
    }

    /// Looks up a stream id by its directory name, e.g. `"/names"`.
    ///
    /// The name directory is parsed from the info stream on first use.
    /// Fails with `NotFound` when no stream carries the name.
    pub fn stream_by_name(&self, name: &str) -> Result<u32, MsfError> {
        self.name_directory()?
            .stream_id(name)
            .ok_or_else(|| MsfErrorKind::NotFound.into())
    }

    /// The debug identifier (GUID plus age) from the info stream.
    pub fn debug_id(&self) -> Result<DebugId, MsfError> {
        let directory = self.name_directory()?;
        let uuid = Uuid::from_bytes_le(directory.guid);
        Ok(DebugId::from_parts(uuid, directory.age))
    }

    /// The `/names` global string table.
    ///
    /// Fails with `MissingInformation` when the container has no such
    /// stream; callers degrade gracefully (e.g. skip file names).
    pub fn string_table(&self) -> Result<StringTable<'_, 'data>, MsfError> {
        let stream = match self.stream_by_name("/names") {
            Ok(stream) => stream,
            Err(e) if e.kind() == MsfErrorKind::NotFound => {
                return Err(MsfErrorKind::MissingInformation.into())
            }
            Err(e) => return Err(e),
        };
        StringTable::parse(self.walker(stream)?)
    }

    fn name_directory(&self) -> Result<&NameDirectory, MsfError> {
        self.names
            .get_or_try_init(|| NameDirectory::parse(self.walker(raw::STREAM_INFO)?))
    }

    /// Number of blocks needed to store `size` bytes.
    fn blocks_for(&self, size: u32) -> usize {
        ((size as u64 + self.block_size as u64 - 1) / self.block_size as u64) as usize
    }

    /// The raw bytes of one block.
    pub(crate) fn block_data(&self, block: u32) -> Result<&'data [u8], MsfError> {
        if block >= self.num_blocks {
            return Err(MsfErrorKind::Io.into());
        }
        let start = block as usize * self.block_size as usize;
        self.data
            .get(start..start + self.block_size as usize)
            .ok_or_else(|| MsfErrorKind::Io.into())
    }

    pub(crate) fn stream_entry(&self, stream: u32) -> Result<&StreamEntry, MsfError> {
        self.streams
            .get(stream as usize)
            .ok_or_else(|| MsfErrorKind::InvalidArgument.into())
    }

    /// Reassembles `size` bytes from an explicit block list.
    fn read_blocks(&self, blocks: &[u32], size: usize) -> Result<Vec<u8>, MsfError> {
        let mut out = Vec::with_capacity(size);
        for &block in blocks {
            let data = self.block_data(block)?;
            let want = size - out.len();
            out.extend_from_slice(&data[..want.min(data.len())]);
        }
        if out.len() != size {
            return Err(MsfErrorKind::InvalidHeader.into());
        }
        Ok(out)
    }

    /// Copies bytes out of a stream at an absolute offset.
    ///
    /// This is the one primitive walkers are built on; it performs the
    /// block translation and fails with `Io` when the stream's block list
    /// cannot back the requested range.
    pub(crate) fn read_stream_at(
        &self,
        stream: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), MsfError> {
        let entry = self.stream_entry(stream)?;
        if offset + buf.len() as u64 > entry.size as u64 {
            return Err(MsfErrorKind::Io.into());
        }

        let block_size = self.block_size as u64;
        let mut filled = 0usize;
        let mut offset = offset;
        while filled < buf.len() {
            let block_index = (offset / block_size) as usize;
            let delta = (offset % block_size) as usize;
            let block = *entry.blocks.get(block_index).ok_or(MsfErrorKind::Io)?;
            let data = self.block_data(block)?;
            let take = (buf.len() - filled).min(data.len() - delta);
            buf[filled..filled + take].copy_from_slice(&data[delta..delta + take]);
            filled += take;
            offset += take as u64;
        }
        Ok(())
    }
}
