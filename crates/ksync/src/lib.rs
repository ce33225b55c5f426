//! Kernel primitives shared by the page allocator, the buffer cache and the
//! network driver.
//!
//! Everything here is generic over a [`Platform`], the zero-sized type through
//! which the surrounding kernel supplies interrupt control, CPU identity, the
//! tick counter and sleep/wakeup. The primitives themselves never touch
//! hardware, so the same code runs inside the kernel and, with the
//! [`testing`] platform, in host unit tests.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[cfg(any(test, feature = "testing"))]
extern crate std;

pub mod error;
pub mod interrupt;
pub mod platform;
pub mod sleeplock;
pub mod spinlock;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use self::{
    interrupt::InterruptGuard,
    platform::Platform,
    sleeplock::{SleepLock, SleepLockGuard},
    spinlock::{SpinMutex, SpinMutexGuard},
};

/// Maximum number of CPUs supported by the kernel.
pub const MAX_CPUS: usize = 8;
