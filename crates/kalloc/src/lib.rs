//! Physical page allocator.
//!
//! Hands out whole 4096-byte pages to the rest of the kernel: user memory,
//! kernel stacks, page-table pages and pipe buffers.
//!
//! # Design
//!
//! Every CPU owns a free list protected by its own [`SpinMutex`], so CPUs
//! allocating and freeing at the same time do not contend on a single lock.
//! Free pages are chained through their own first bytes; a free page carries
//! no other metadata.
//!
//! - [`PageAllocator::allocate`] pops from the current CPU's list. If that
//!   list is empty it releases it and scans the other CPUs' lists in index
//!   order, holding one remote lock at a time, and takes the first page it
//!   finds.
//! - [`PageAllocator::free`] always pushes onto the current CPU's list.
//!
//! The current CPU is read inside an [`InterruptGuard`](ksync::InterruptGuard)
//! that spans the whole list operation, so the thread cannot migrate between
//! reading its CPU index and locking that CPU's list.
//!
//! Allocated pages are filled with `0x05` and freed pages with `0x01` so that
//! reads of uninitialized memory and dangling references show up as junk.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::boxed::Box;
use core::{ops::Range, ptr::NonNull};

use ksync::{Platform, SpinMutex, error::Location, interrupt};
use snafu::{Snafu, ensure};

/// Size of a physical page in bytes.
pub const PAGE_SIZE: usize = 4096;

const ALLOC_JUNK: u8 = 0x05;
const FREE_JUNK: u8 = 0x01;

/// One physical page.
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

const _: () = assert!(size_of::<Page>() == PAGE_SIZE);

struct Run {
    next: Option<NonNull<Run>>,
}

struct FreeList {
    head: Option<NonNull<Run>>,
    len: usize,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn pop(&mut self) -> Option<NonNull<Run>> {
        let run = self.head?;
        self.head = unsafe { run.as_ref() }.next;
        self.len -= 1;
        Some(run)
    }

    /// # Safety
    ///
    /// `run` must point to a free page owned by the allocator and not already
    /// linked into any list.
    unsafe fn push(&mut self, run: NonNull<Run>) {
        unsafe {
            run.write(Run { next: self.head });
        }
        self.head = Some(run);
        self.len += 1;
    }
}

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("memory region {start:#x}..{end:#x} holds no whole page"))]
    EmptyRange {
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Per-CPU physical page allocator.
pub struct PageAllocator<P>
where
    P: Platform,
{
    range: Range<usize>,
    total_pages: usize,
    lists: Box<[SpinMutex<FreeList, P>]>,
}

impl<P> PageAllocator<P>
where
    P: Platform,
{
    /// Creates an allocator owning every whole page in the given region.
    ///
    /// The start is rounded up and the end rounded down to page boundaries.
    /// All pages are freed onto the calling CPU's list, as at boot only one
    /// CPU runs.
    ///
    /// # Safety
    ///
    /// The region `heap_start..heap_start + heap_size` must be valid for reads
    /// and writes, must not be used by anything else, and must outlive the
    /// allocator.
    pub unsafe fn new(heap_start: NonNull<u8>, heap_size: usize) -> Result<Self, InitError> {
        let start = heap_start.addr().get();
        let end = start + heap_size;
        let first = start.next_multiple_of(PAGE_SIZE);
        let last = end - end % PAGE_SIZE;
        ensure!(first < last, EmptyRangeSnafu { start, end });

        let lists = (0..P::ncpu())
            .map(|_| SpinMutex::new(FreeList::new()))
            .collect();
        let total_pages = (last - first) / PAGE_SIZE;
        let this = Self {
            range: first..last,
            total_pages,
            lists,
        };

        for i in 0..total_pages {
            unsafe {
                let page = heap_start.add(first - start + i * PAGE_SIZE);
                this.free(page.cast());
            }
        }
        log::info!(
            "kalloc: {total_pages} pages in {first:#x}..{last:#x} across {} cpus",
            P::ncpu()
        );

        Ok(this)
    }

    /// Allocates one page.
    ///
    /// Returns `None` only if every CPU's free list is empty.
    #[must_use]
    pub fn allocate(&self) -> Option<NonNull<Page>> {
        let run = {
            let interrupt_guard = interrupt::push_disabled::<P>();
            let cpu = interrupt_guard.cpu_index();
            let local = self.lists[cpu].lock().pop();
            local.or_else(|| self.steal(cpu))
        };

        let page = run?.cast::<Page>();
        unsafe {
            page.cast::<u8>().write_bytes(ALLOC_JUNK, PAGE_SIZE);
        }
        Some(page)
    }

    /// Allocates one page filled with zeros.
    #[must_use]
    pub fn allocate_zeroed(&self) -> Option<NonNull<Page>> {
        let page = self.allocate()?;
        unsafe {
            page.cast::<u8>().write_bytes(0, PAGE_SIZE);
        }
        Some(page)
    }

    fn steal(&self, cpu: usize) -> Option<NonNull<Run>> {
        self.lists
            .iter()
            .enumerate()
            .filter(|(victim, _)| *victim != cpu)
            .find_map(|(victim, list)| {
                let run = list.lock().pop()?;
                log::trace!("kalloc: cpu {cpu} stole a page from cpu {victim}");
                Some(run)
            })
    }

    /// Returns a page to the current CPU's free list.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not page-aligned or lies outside the managed
    /// region.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator and must not be used after this call.
    pub unsafe fn free(&self, page: NonNull<Page>) {
        let addr = page.addr().get();
        assert!(
            addr.is_multiple_of(PAGE_SIZE) && self.range.contains(&addr),
            "kfree: {addr:#x} is not a page of {:#x}..{:#x}",
            self.range.start,
            self.range.end,
        );

        unsafe {
            page.cast::<u8>().write_bytes(FREE_JUNK, PAGE_SIZE);
        }

        let interrupt_guard = interrupt::push_disabled::<P>();
        let cpu = interrupt_guard.cpu_index();
        unsafe {
            self.lists[cpu].lock().push(page.cast());
        }
    }

    /// Number of free pages across all CPUs.
    ///
    /// The lists are sampled one at a time, so the result is only exact when
    /// no other CPU is allocating or freeing.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.lists.iter().map(|list| list.lock().len).sum()
    }

    /// Number of free pages on `cpu`'s list.
    #[must_use]
    pub fn free_count_on(&self, cpu: usize) -> usize {
        self.lists[cpu].lock().len
    }

    /// Number of pages carved out of the region at initialization.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Page-aligned address range managed by this allocator.
    #[must_use]
    pub fn managed_range(&self) -> Range<usize> {
        self.range.clone()
    }
}
