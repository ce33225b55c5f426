use crate::spinlock::SpinMutexGuard;

/// Services the surrounding kernel provides to the primitives in this crate.
///
/// A platform is a zero-sized type; every function is an associated function
/// so that lock types only need to carry a `PhantomData` of it.
pub trait Platform: Sized + 'static {
    /// Disables interrupts on the current CPU.
    ///
    /// Calls nest: interrupts are restored by the matching outermost
    /// [`pop_off`](Self::pop_off), and only if they were enabled before the
    /// first `push_off`.
    fn push_off();

    /// Undoes one [`push_off`](Self::push_off).
    fn pop_off();

    fn interrupts_enabled() -> bool;

    /// Index of the current CPU, in `0..ncpu()`.
    ///
    /// The result is stale as soon as interrupts are re-enabled, because the
    /// running thread may migrate. Read it through
    /// [`InterruptGuard::cpu_index`](crate::InterruptGuard::cpu_index).
    fn cpu_index() -> usize;

    /// Number of CPUs in the system.
    fn ncpu() -> usize;

    /// Monotonic tick counter.
    fn ticks() -> u64;

    /// Identity of the running kernel thread.
    fn task_id() -> usize;

    /// Atomically releases `guard` and suspends the caller until `chan` is
    /// woken up, then reacquires the lock.
    ///
    /// Spurious returns are allowed; callers re-check their condition.
    fn sleep<T>(chan: usize, guard: SpinMutexGuard<'_, T, Self>) -> SpinMutexGuard<'_, T, Self>;

    /// Wakes every thread sleeping on `chan`.
    fn wakeup(chan: usize);
}
