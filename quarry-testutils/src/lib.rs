//! Test support for the quarry crates.
//!
//! [`ContainerBuilder`] assembles a minimal but structurally faithful
//! multi-stream container image in memory: real superblock, directory
//! block list, directory and block-scattered stream data. Tests use it to
//! exercise the readers against byte layouts they control completely.

const BLOCK_SIZE: usize = 512;
const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// Builds synthetic multi-stream container images.
pub struct ContainerBuilder {
    streams: Vec<Option<Vec<u8>>>,
}

impl ContainerBuilder {
    /// Starts a builder whose streams 0.. are the given byte vectors.
    pub fn new(streams: &[Vec<u8>]) -> Self {
        ContainerBuilder {
            streams: streams.iter().cloned().map(Some).collect(),
        }
    }

    /// Sets the stream with the given id, padding gaps with empty streams.
    pub fn stream_at(mut self, id: u32, content: Vec<u8>) -> Self {
        let id = id as usize;
        if self.streams.len() <= id {
            self.streams.resize(id + 1, None);
        }
        self.streams[id] = Some(content);
        self
    }

    /// Installs an info stream (stream 1) with the given age, GUID and
    /// stream-name directory entries.
    pub fn info_stream(self, age: u32, guid: [u8; 16], names: &[(&str, u32)]) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2000_0404u32.to_le_bytes()); // version
        buf.extend_from_slice(&0u32.to_le_bytes()); // signature
        buf.extend_from_slice(&age.to_le_bytes());
        buf.extend_from_slice(&guid);

        let mut name_buf = Vec::new();
        let mut offsets = Vec::new();
        for (name, _) in names {
            offsets.push(name_buf.len() as u32);
            name_buf.extend_from_slice(name.as_bytes());
            name_buf.push(0);
        }
        buf.extend_from_slice(&(name_buf.len() as u32).to_le_bytes());
        buf.extend_from_slice(&name_buf);

        let count = names.len() as u32;
        buf.extend_from_slice(&count.to_le_bytes()); // used
        buf.extend_from_slice(&count.to_le_bytes()); // capacity

        // Present bitset covering `count` slots, all set; empty deleted set.
        let words = count.div_ceil(32);
        buf.extend_from_slice(&words.to_le_bytes());
        for word in 0..words {
            let bits = if (word + 1) * 32 <= count {
                u32::MAX
            } else {
                (1u32 << (count % 32)) - 1
            };
            buf.extend_from_slice(&bits.to_le_bytes());
        }
        buf.extend_from_slice(&0u32.to_le_bytes());

        for (offset, (_, stream)) in offsets.iter().zip(names) {
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&stream.to_le_bytes());
        }

        self.stream_at(1, buf)
    }

    /// Assembles the container image.
    pub fn build(&self) -> Vec<u8> {
        // Blocks 0 (superblock) and 1..2 (free block maps) come first.
        let mut blocks: Vec<[u8; BLOCK_SIZE]> = vec![[0u8; BLOCK_SIZE]; 3];

        let mut append_data = |blocks: &mut Vec<[u8; BLOCK_SIZE]>, data: &[u8]| -> Vec<u32> {
            let mut indices = Vec::new();
            for chunk in data.chunks(BLOCK_SIZE) {
                let mut block = [0u8; BLOCK_SIZE];
                block[..chunk.len()].copy_from_slice(chunk);
                indices.push(blocks.len() as u32);
                blocks.push(block);
            }
            indices
        };

        let mut stream_blocks = Vec::new();
        for stream in &self.streams {
            let data = stream.clone().unwrap_or_default();
            let indices = append_data(&mut blocks, &data);
            stream_blocks.push((data.len() as u32, indices));
        }

        // Serialize the directory: count, sizes, then block lists.
        let mut directory = Vec::new();
        directory.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
        for (size, _) in &stream_blocks {
            directory.extend_from_slice(&size.to_le_bytes());
        }
        for (_, indices) in &stream_blocks {
            for index in indices {
                directory.extend_from_slice(&index.to_le_bytes());
            }
        }
        let directory_size = directory.len() as u32;
        let dir_blocks = append_data(&mut blocks, &directory);

        let mut dir_list = Vec::new();
        for index in &dir_blocks {
            dir_list.extend_from_slice(&index.to_le_bytes());
        }
        let dir_list_block = append_data(&mut blocks, &dir_list)[0];

        // Superblock.
        let mut super_block = [0u8; BLOCK_SIZE];
        super_block[..MSF_MAGIC.len()].copy_from_slice(MSF_MAGIC);
        let fields = [
            BLOCK_SIZE as u32,
            1,                   // free block map
            blocks.len() as u32, // num blocks
            directory_size,
            0,
            dir_list_block,
        ];
        for (i, field) in fields.iter().enumerate() {
            let at = MSF_MAGIC.len() + i * 4;
            super_block[at..at + 4].copy_from_slice(&field.to_le_bytes());
        }
        blocks[0] = super_block;

        blocks.concat()
    }
}
