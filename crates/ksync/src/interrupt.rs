use core::{fmt, marker::PhantomData};

use crate::platform::Platform;

/// Disables interrupts on the current CPU until the returned guard is dropped.
pub fn push_disabled<P>() -> InterruptGuard<P>
where
    P: Platform,
{
    P::push_off();
    InterruptGuard {
        _not_send: PhantomData,
    }
}

/// RAII scope of disabled interrupts.
///
/// The guard must be dropped on the CPU it was created on, so it is neither
/// `Send` nor `Sync`.
#[must_use]
pub struct InterruptGuard<P>
where
    P: Platform,
{
    _not_send: PhantomData<(*mut (), P)>,
}

impl<P> InterruptGuard<P>
where
    P: Platform,
{
    /// Index of the CPU this guard pins the caller to.
    #[must_use]
    pub fn cpu_index(&self) -> usize {
        assert!(!P::interrupts_enabled(), "cpu_index: interrupts enabled");
        let index = P::cpu_index();
        assert!(index < P::ncpu(), "cpu_index: {index} out of range");
        index
    }
}

impl<P> Drop for InterruptGuard<P>
where
    P: Platform,
{
    fn drop(&mut self) {
        P::pop_off();
    }
}

impl<P> fmt::Debug for InterruptGuard<P>
where
    P: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptGuard").finish_non_exhaustive()
    }
}
