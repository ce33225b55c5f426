use core::{
    cell::UnsafeCell,
    fmt, hint,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    interrupt::{self, InterruptGuard},
    platform::Platform,
};

/// A mutual-exclusion lock that spins while contended.
///
/// Interrupts stay disabled on the holding CPU for as long as the guard lives,
/// so an interrupt handler taking the same lock can never deadlock against
/// the code it interrupted. The lock is not reentrant.
pub struct SpinMutex<T, P>
where
    P: Platform,
{
    locked: AtomicBool,
    data: UnsafeCell<T>,
    locked_at: UnsafeCell<&'static Location<'static>>,
    _platform: PhantomData<fn() -> P>,
}

impl<T, P> Default for SpinMutex<T, P>
where
    T: Default,
    P: Platform,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

unsafe impl<T, P> Sync for SpinMutex<T, P>
where
    T: Send,
    P: Platform,
{
}

impl<T, P> fmt::Debug for SpinMutex<T, P>
where
    T: fmt::Debug,
    P: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T, P> SpinMutex<T, P>
where
    P: Platform,
{
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            locked_at: UnsafeCell::new(Location::caller()),
            _platform: PhantomData,
        }
    }

    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T, P> {
        let interrupt_guard = interrupt::push_disabled::<P>();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }

        unsafe {
            *self.locked_at.get() = Location::caller();
        }

        SpinMutexGuard {
            mutex: self,
            _interrupt_guard: interrupt_guard,
        }
    }

    #[track_caller]
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T, P>> {
        let interrupt_guard = interrupt::push_disabled::<P>();

        if self.locked.swap(true, Ordering::Acquire) {
            return None;
        }

        unsafe {
            *self.locked_at.get() = Location::caller();
        }

        Some(SpinMutexGuard {
            mutex: self,
            _interrupt_guard: interrupt_guard,
        })
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard of a [`SpinMutex`].
///
/// Dropping it releases the lock and then restores the interrupt state.
#[must_use]
pub struct SpinMutexGuard<'a, T, P>
where
    P: Platform,
{
    mutex: &'a SpinMutex<T, P>,
    _interrupt_guard: InterruptGuard<P>,
}

impl<T, P> Drop for SpinMutexGuard<'_, T, P>
where
    P: Platform,
{
    fn drop(&mut self) {
        assert!(
            self.mutex.is_locked(),
            "SpinMutexGuard dropped without holding the lock"
        );
        self.mutex.locked.store(false, Ordering::Release);
    }
}

impl<T, P> Deref for SpinMutexGuard<'_, T, P>
where
    P: Platform,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, P> DerefMut for SpinMutexGuard<'_, T, P>
where
    P: Platform,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T, P> SpinMutexGuard<'a, T, P>
where
    P: Platform,
{
    pub fn unlock(self) {
        let _ = self; // drop
    }

    /// Where the lock was acquired.
    #[must_use]
    pub fn locked_at(&self) -> &'static Location<'static> {
        unsafe { *self.mutex.locked_at.get() }
    }

    /// Releases the lock, runs `f`, and acquires the lock again.
    ///
    /// This is the building block for [`Platform::sleep`].
    #[must_use]
    #[track_caller]
    pub fn unlocked<F>(self, f: F) -> Self
    where
        F: FnOnce(),
    {
        let mutex: &'a SpinMutex<T, P> = self.mutex;
        drop(self);
        f();
        mutex.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, vec::Vec};

    use super::*;
    use crate::testing::HostPlatform;

    #[test]
    fn lock_disables_interrupts_while_held() {
        let mutex = SpinMutex::<u32, HostPlatform>::new(0);
        {
            let mut guard = mutex.lock();
            assert!(!HostPlatform::interrupts_enabled());
            *guard += 1;
        }
        assert!(HostPlatform::interrupts_enabled());
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = SpinMutex::<(), HostPlatform>::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
        assert!(HostPlatform::interrupts_enabled());
    }

    #[test]
    fn unlocked_releases_for_the_closure() {
        let mutex = SpinMutex::<u32, HostPlatform>::new(7);
        let guard = mutex.lock();
        let guard = guard.unlocked(|| {
            *mutex.try_lock().unwrap() = 8;
        });
        assert_eq!(*guard, 8);
    }

    #[test]
    fn guard_remembers_where_it_was_taken() {
        let mutex = SpinMutex::<(), HostPlatform>::new(());
        let line = line!() + 1;
        let guard = mutex.lock();
        assert_eq!(guard.locked_at().line(), line);
        assert_eq!(guard.locked_at().file(), file!());
    }

    #[test]
    fn debug_shows_locked_state() {
        let mutex = SpinMutex::<u32, HostPlatform>::new(5);
        assert_eq!(std::format!("{mutex:?}"), "SpinMutex { data: 5 }");
        let _guard = mutex.lock();
        assert_eq!(std::format!("{mutex:?}"), "SpinMutex { data: \"<locked>\" }");
    }

    #[test]
    fn counter_is_consistent_across_threads() {
        let mutex = SpinMutex::<usize, HostPlatform>::new(0);
        thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        for _ in 0..1000 {
                            *mutex.lock() += 1;
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }
        });
        assert_eq!(mutex.into_inner(), 4000);
    }
}
