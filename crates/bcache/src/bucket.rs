use arrayvec::ArrayVec;

use crate::{NBUF, device::BlockId};

/// Bookkeeping for one buffer, owned by the bucket the buffer hashes to.
///
/// The entry moves between buckets when the buffer is recycled for another
/// block, so it is always protected by the lock of the bucket that can find
/// it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    /// Index into the buffer pool.
    pub(crate) buf: usize,
    /// `None` until the buffer caches its first block.
    pub(crate) id: Option<BlockId>,
    pub(crate) refcnt: u32,
    /// Tick at which `refcnt` last dropped to zero.
    pub(crate) last_use: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Bucket {
    pub(crate) entries: ArrayVec<Entry, NBUF>,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn find_mut(&mut self, id: BlockId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == Some(id))
    }

    pub(crate) fn entry_of_mut(&mut self, buf: usize) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.buf == buf)
    }

    /// Takes a reference on the buffer caching `id`, if any.
    pub(crate) fn acquire_cached(&mut self, id: BlockId) -> Option<usize> {
        let entry = self.find_mut(id)?;
        entry.refcnt += 1;
        Some(entry.buf)
    }

    /// Position and release time of the unreferenced entry released longest
    /// ago.
    ///
    /// Ties go to the entry that comes first in the bucket.
    pub(crate) fn least_recently_released(&self) -> Option<(usize, u64)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.refcnt == 0)
            .min_by_key(|(_, e)| e.last_use)
            .map(|(pos, e)| (pos, e.last_use))
    }
}
