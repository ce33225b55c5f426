use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr,
};

use crate::{platform::Platform, spinlock::SpinMutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    locked: bool,
    holder: Option<usize>,
}

/// A long-term lock whose waiters sleep instead of spinning.
///
/// The holder may block (for example on disk I/O) while holding it. The lock
/// remembers which kernel thread holds it so that callers can check the
/// contract with [`is_held_by_current`](Self::is_held_by_current).
pub struct SleepLock<T, P>
where
    P: Platform,
{
    state: SpinMutex<State, P>,
    data: UnsafeCell<T>,
}

unsafe impl<T, P> Sync for SleepLock<T, P>
where
    T: Send,
    P: Platform,
{
}

impl<T, P> fmt::Debug for SleepLock<T, P>
where
    P: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("SleepLock")
            .field("locked", &state.locked)
            .field("holder", &state.holder)
            .finish_non_exhaustive()
    }
}

impl<T, P> SleepLock<T, P>
where
    P: Platform,
{
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            state: SpinMutex::new(State {
                locked: false,
                holder: None,
            }),
            data: UnsafeCell::new(data),
        }
    }

    fn channel(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    /// Acquires the lock, sleeping until the current holder releases it.
    pub fn lock(&self) -> SleepLockGuard<'_, T, P> {
        let mut state = self.state.lock();
        while state.locked {
            state = P::sleep(self.channel(), state);
        }
        state.locked = true;
        state.holder = Some(P::task_id());
        state.unlock();

        SleepLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T, P>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        state.holder = Some(P::task_id());
        state.unlock();

        Some(SleepLockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Returns `true` if the calling kernel thread holds the lock.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        let state = self.state.lock();
        state.locked && state.holder == Some(P::task_id())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        assert!(
            state.locked && state.holder == Some(P::task_id()),
            "releasesleep: lock not held by the current thread"
        );
        state.locked = false;
        state.holder = None;
        P::wakeup(self.channel());
    }
}

/// RAII guard of a [`SleepLock`].
///
/// The holder is tracked per kernel thread, so the guard cannot move to
/// another thread.
#[must_use]
pub struct SleepLockGuard<'a, T, P>
where
    P: Platform,
{
    lock: &'a SleepLock<T, P>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T, P> SleepLockGuard<'a, T, P>
where
    P: Platform,
{
    #[must_use]
    pub fn lock(&self) -> &'a SleepLock<T, P> {
        self.lock
    }
}

impl<T, P> Drop for SleepLockGuard<'_, T, P>
where
    P: Platform,
{
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<T, P> Deref for SleepLockGuard<'_, T, P>
where
    P: Platform,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, P> DerefMut for SleepLockGuard<'_, T, P>
where
    P: Platform,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
