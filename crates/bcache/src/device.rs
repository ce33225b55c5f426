use core::error::Error;

use derive_more::Display;

use crate::{BLOCK_SIZE, NBUCKET};

/// Identity of one on-disk block.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{dev}:{blockno}")]
pub struct BlockId {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockId {
    #[must_use]
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }

    /// Index of the hash bucket this block belongs to.
    pub(crate) fn bucket(self) -> usize {
        let hash = (self.dev << 27) | self.blockno;
        hash as usize % NBUCKET
    }
}

/// Storage backend the cache reads blocks from and writes them back to.
///
/// Both calls are synchronous and transfer exactly one block.
pub trait BlockDevice: Sync {
    type Error: Error;

    fn read_block(&self, id: BlockId, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;

    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}
