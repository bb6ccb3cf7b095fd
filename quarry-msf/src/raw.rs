//! On-disk layout of the multi-stream container.

/// Magic bytes opening every big-format container file.
pub const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// Magic bytes of the legacy small-format container, which is rejected.
pub const MSF_MAGIC_JG: &[u8; 8] = b"Microsof";

/// Version number expected in the info stream header.
pub const INFO_STREAM_VERSION: u32 = 2000_0404;

/// Magic opening the `/names` global string table.
pub const STRING_TABLE_MAGIC: u32 = 0xEFFE_EFFE;

/// Byte size of the superblock following the magic: six `u32` fields.
pub const SUPERBLOCK_FIELDS: usize = 24;

/// Fixed stream id of the info stream (name directory, GUID and age).
pub const STREAM_INFO: u32 = 1;

/// Fixed stream id of the type-information stream.
pub const STREAM_TPI: u32 = 2;

/// Fixed stream id of the debug-information (symbols) stream.
pub const STREAM_DBI: u32 = 3;

/// Fixed stream id of the id-information stream.
pub const STREAM_IPI: u32 = 4;

/// The superblock: everything needed to find the stream directory.
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    /// Size of a block in bytes; a power of two between 512 and 8192.
    pub block_size: u32,
    /// Block index of the free-block bitmap (unused by a reader).
    pub free_block_map: u32,
    /// Number of blocks in the file.
    pub num_blocks: u32,
    /// Byte size of the stream directory.
    pub directory_size: u32,
    /// Reserved field.
    pub reserved: u32,
    /// Block index of the list of directory block indices.
    pub directory_block_list: u32,
}
