//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents in a fixed
//! pool of buffers. Caching blocks in memory reduces the number of disk reads
//! and also gives the file system a synchronization point for blocks used by
//! several threads.
//!
//! # Interface
//!
//! - [`BlockCache::read`] returns a locked buffer holding the block.
//! - [`BufGuard::write`] writes the buffer back to disk.
//! - Dropping the [`BufGuard`] (or calling [`BufGuard::release`]) releases it.
//! - Only one thread at a time can use a buffer, so do not keep them longer
//!   than necessary.
//!
//! # Locking
//!
//! Buffers are hashed by `(dev, blockno)` into [`NBUCKET`] buckets, each with
//! its own spin lock. A hit touches only the lock of its bucket. A miss drops
//! the bucket lock, takes the eviction lock, checks the bucket again, and
//! then scans every bucket for the least recently released unreferenced
//! buffer. During the scan only the bucket holding the best candidate so far
//! stays locked, next to the bucket being scanned. No bucket lock is ever
//! held while waiting for the eviction lock, so the lock order is always
//! eviction lock, then bucket locks in index order.
//!
//! Each buffer's content is protected by a [`SleepLock`]; acquiring it is the
//! only place the cache may block.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::boxed::Box;
use core::{
    array, fmt,
    mem::ManuallyDrop,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use ksync::{Platform, SleepLock, SleepLockGuard, SpinMutex, SpinMutexGuard, error};

pub use self::device::{BlockDevice, BlockId};
use self::bucket::{Bucket, Entry};

mod bucket;
mod device;

/// Size of a disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;
/// Number of buffers in the pool.
pub const NBUF: usize = 30;
/// Number of hash buckets.
pub const NBUCKET: usize = 13;

struct Buf<P>
where
    P: Platform,
{
    /// Whether `data` holds the block's content.
    ///
    /// Cleared while the buffer is unreferenced and being recycled, set by
    /// the holder of `data` after reading the block in.
    valid: AtomicBool,
    data: SleepLock<[u8; BLOCK_SIZE], P>,
}

impl<P> Buf<P>
where
    P: Platform,
{
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new([0; BLOCK_SIZE]),
        }
    }
}

/// Most recent unreferenced buffer found while scanning for a victim, with
/// its bucket still locked.
struct Victim<'a, P>
where
    P: Platform,
{
    bucket: usize,
    pos: usize,
    last_use: u64,
    guard: SpinMutexGuard<'a, Bucket, P>,
}

/// Hashed buffer cache in front of a [`BlockDevice`].
pub struct BlockCache<D, P>
where
    P: Platform,
{
    device: D,
    bufs: Box<[Buf<P>]>,
    buckets: [SpinMutex<Bucket, P>; NBUCKET],
    eviction_lock: SpinMutex<(), P>,
}

impl<D, P> BlockCache<D, P>
where
    D: BlockDevice,
    P: Platform,
{
    /// Creates a cache of [`NBUF`] buffers.
    #[must_use]
    pub fn new(device: D) -> Self {
        Self::with_capacity(device, NBUF)
    }

    /// Creates a cache of `nbuf` buffers.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= nbuf <= NBUF`.
    #[must_use]
    pub fn with_capacity(device: D, nbuf: usize) -> Self {
        assert!(
            (1..=NBUF).contains(&nbuf),
            "binit: capacity {nbuf} out of range 1..={NBUF}"
        );

        let bufs = (0..nbuf).map(|_| Buf::new()).collect::<Box<[_]>>();
        let mut buckets = array::from_fn(|_| SpinMutex::new(Bucket::new()));
        // every buffer starts out in bucket 0
        buckets[0].get_mut().entries.extend((0..nbuf).map(|buf| Entry {
            buf,
            id: None,
            refcnt: 0,
            last_use: 0,
        }));
        log::info!("bcache: {nbuf} buffers of {BLOCK_SIZE} bytes in {NBUCKET} buckets");

        Self {
            device,
            bufs,
            buckets,
            eviction_lock: SpinMutex::new(()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }

    /// Returns a locked buffer for the block, without reading it.
    ///
    /// The content is only meaningful if [`BufGuard::is_valid`] returns
    /// `true`.
    ///
    /// # Panics
    ///
    /// Panics if the block is not cached and every buffer is referenced.
    pub fn get(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, P> {
        let id = BlockId::new(dev, blockno);
        let buf = self.acquire(id);
        BufGuard {
            cache: self,
            buf,
            id,
            data: ManuallyDrop::new(self.bufs[buf].data.lock()),
        }
    }

    /// Returns a locked buffer holding the content of the block.
    ///
    /// # Panics
    ///
    /// Panics if the device read fails, or if the block is not cached and
    /// every buffer is referenced.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, P> {
        let mut buf = self.get(dev, blockno);
        if !buf.is_valid() {
            if let Err(err) = self.device.read_block(buf.id, &mut buf.data) {
                error::report(err);
            }
            self.bufs[buf.buf].valid.store(true, Ordering::Relaxed);
        }
        buf
    }

    /// Drops a reference taken by [`BufGuard::pin`].
    ///
    /// # Panics
    ///
    /// Panics if `pin` was taken on a buffer of another cache.
    pub fn unpin(&self, pin: BufPin<'_, D, P>) {
        assert!(ptr::eq(pin.cache, self), "bunpin: pin from another cache");
        self.put_ref(pin.buf, pin.id, "bunpin");
    }

    /// Whether the block currently has a buffer.
    #[must_use]
    pub fn is_cached(&self, dev: u32, blockno: u32) -> bool {
        self.refcount(dev, blockno).is_some()
    }

    /// Reference count of the block's buffer, or `None` if it is not cached.
    #[must_use]
    pub fn refcount(&self, dev: u32, blockno: u32) -> Option<u32> {
        let id = BlockId::new(dev, blockno);
        self.buckets[id.bucket()]
            .lock()
            .find_mut(id)
            .map(|e| e.refcnt)
    }

    /// Finds or recycles the buffer for `id` and takes a reference on it.
    fn acquire(&self, id: BlockId) -> usize {
        let key = id.bucket();

        // Is the block already cached?
        if let Some(buf) = self.buckets[key].lock().acquire_cached(id) {
            return buf;
        }

        // Not cached. The bucket lock is released before taking the
        // eviction lock; another thread may insert the block in between, so
        // look again.
        let _eviction = self.eviction_lock.lock();
        if let Some(buf) = self.buckets[key].lock().acquire_cached(id) {
            return buf;
        }

        let Some(mut victim) = self.find_victim() else {
            panic!("bget: no buffers");
        };
        let old = victim.guard.entries[victim.pos];
        self.bufs[old.buf].valid.store(false, Ordering::Relaxed);
        let entry = Entry {
            buf: old.buf,
            id: Some(id),
            refcnt: 1,
            last_use: old.last_use,
        };

        if victim.bucket == key {
            victim.guard.entries[victim.pos] = entry;
        } else {
            victim.guard.entries.remove(victim.pos);
            drop(victim);
            self.buckets[key].lock().entries.push(entry);
        }

        match old.id {
            Some(old_id) => {
                log::debug!("bcache: buffer {} recycled from {old_id} to {id}", old.buf);
            }
            None => log::debug!("bcache: buffer {} first used for {id}", old.buf),
        }
        entry.buf
    }

    /// Scans all buckets for the least recently released unreferenced buffer.
    ///
    /// Must be called with the eviction lock held and no bucket lock held.
    fn find_victim(&self) -> Option<Victim<'_, P>> {
        let mut best: Option<Victim<'_, P>> = None;
        for (bucket, lock) in self.buckets.iter().enumerate() {
            let guard = lock.lock();
            let Some((pos, last_use)) = guard.least_recently_released() else {
                continue;
            };
            if best.as_ref().is_none_or(|b| last_use < b.last_use) {
                // replacing the candidate unlocks its bucket
                best = Some(Victim {
                    bucket,
                    pos,
                    last_use,
                    guard,
                });
            }
        }
        best
    }

    fn put_ref(&self, buf: usize, id: BlockId, op: &str) {
        let mut bucket = self.buckets[id.bucket()].lock();
        let Some(entry) = bucket.entry_of_mut(buf) else {
            panic!("{op}: buffer {buf} is not caching {id}");
        };
        assert_eq!(entry.id, Some(id), "{op}: buffer {buf} changed identity");
        assert!(entry.refcnt > 0, "{op}: {id} is not referenced");
        entry.refcnt -= 1;
        if entry.refcnt == 0 {
            // no one is waiting for it.
            entry.last_use = P::ticks();
        }
    }

    fn get_ref(&self, buf: usize, id: BlockId) {
        let mut bucket = self.buckets[id.bucket()].lock();
        let Some(entry) = bucket.entry_of_mut(buf) else {
            panic!("bpin: buffer {buf} is not caching {id}");
        };
        entry.refcnt += 1;
    }
}

/// A referenced buffer whose content lock is held by the current thread.
///
/// Dropping the guard releases the content lock and then the reference.
#[must_use]
pub struct BufGuard<'a, D, P>
where
    D: BlockDevice,
    P: Platform,
{
    cache: &'a BlockCache<D, P>,
    buf: usize,
    id: BlockId,
    data: ManuallyDrop<SleepLockGuard<'a, [u8; BLOCK_SIZE], P>>,
}

impl<'a, D, P> BufGuard<'a, D, P>
where
    D: BlockDevice,
    P: Platform,
{
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    #[must_use]
    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }

    /// Whether the buffer holds the block's content read from the device.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cache.bufs[self.buf].valid.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }

    /// Writes the buffer's content to the device.
    ///
    /// # Panics
    ///
    /// Panics if the device write fails.
    pub fn write(&self) {
        assert!(
            self.data.lock().is_held_by_current(),
            "bwrite: buffer {} not locked",
            self.id
        );
        if let Err(err) = self.cache.device.write_block(self.id, &self.data) {
            error::report(err);
        }
    }

    /// Keeps the buffer cached after this guard is released.
    ///
    /// The reference is dropped by [`BlockCache::unpin`].
    #[must_use = "the buffer stays referenced until the pin is passed to `unpin`"]
    pub fn pin(&self) -> BufPin<'a, D, P> {
        self.cache.get_ref(self.buf, self.id);
        BufPin {
            cache: self.cache,
            buf: self.buf,
            id: self.id,
        }
    }

    pub fn release(self) {
        let _ = self; // drop
    }
}

impl<D, P> Drop for BufGuard<'_, D, P>
where
    D: BlockDevice,
    P: Platform,
{
    fn drop(&mut self) {
        assert!(
            self.data.lock().is_held_by_current(),
            "brelse: buffer {} not locked",
            self.id
        );
        unsafe {
            ManuallyDrop::drop(&mut self.data);
        }
        self.cache.put_ref(self.buf, self.id, "brelse");
    }
}

/// A reference keeping a buffer cached without holding its content lock.
///
/// It borrows the cache it was taken from and can only be dropped through
/// that cache's [`BlockCache::unpin`].
#[must_use = "the buffer stays referenced until the pin is passed to `unpin`"]
pub struct BufPin<'a, D, P>
where
    D: BlockDevice,
    P: Platform,
{
    cache: &'a BlockCache<D, P>,
    buf: usize,
    id: BlockId,
}

impl<D, P> fmt::Debug for BufPin<'_, D, P>
where
    D: BlockDevice,
    P: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufPin")
            .field("buf", &self.buf)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<D, P> BufPin<'_, D, P>
where
    D: BlockDevice,
    P: Platform,
{
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.id
    }
}
