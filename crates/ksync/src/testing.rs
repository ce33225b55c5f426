//! Host implementation of [`Platform`] for unit tests.
//!
//! Each host thread plays one kernel thread. The "current CPU" and the
//! interrupt state are per-thread, so tests running in parallel do not observe
//! each other. The tick counter is shared by the whole process, like the
//! kernel's, so it only ever moves forward.

use std::{
    cell::Cell,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    thread,
};

use crate::{MAX_CPUS, platform::Platform, spinlock::SpinMutexGuard};

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);
static TICKS: AtomicU64 = AtomicU64::new(0);

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static OFF_DEPTH: Cell<usize> = const { Cell::new(0) };
    static ENABLED_BEFORE_OFF: Cell<bool> = const { Cell::new(false) };
    static TASK_ID: usize = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostPlatform;

impl HostPlatform {
    /// Pretends that the calling thread now runs on `cpu`.
    pub fn set_current_cpu(cpu: usize) {
        assert!(cpu < MAX_CPUS, "set_current_cpu: {cpu} out of range");
        CURRENT_CPU.set(cpu);
    }

    /// Advances the process-wide tick counter.
    pub fn advance_ticks(ticks: u64) {
        TICKS.fetch_add(ticks, Ordering::SeqCst);
    }

    #[must_use]
    pub fn interrupt_depth() -> usize {
        OFF_DEPTH.get()
    }
}

impl Platform for HostPlatform {
    fn push_off() {
        let enabled = INTERRUPTS_ENABLED.get();
        INTERRUPTS_ENABLED.set(false);
        let depth = OFF_DEPTH.get();
        if depth == 0 {
            ENABLED_BEFORE_OFF.set(enabled);
        }
        OFF_DEPTH.set(depth + 1);
    }

    fn pop_off() {
        assert!(!INTERRUPTS_ENABLED.get(), "pop_off: interruptible");
        let depth = OFF_DEPTH.get();
        assert!(depth > 0, "pop_off: not pushed");
        OFF_DEPTH.set(depth - 1);
        if depth == 1 && ENABLED_BEFORE_OFF.get() {
            INTERRUPTS_ENABLED.set(true);
        }
    }

    fn interrupts_enabled() -> bool {
        INTERRUPTS_ENABLED.get()
    }

    fn cpu_index() -> usize {
        CURRENT_CPU.get()
    }

    fn ncpu() -> usize {
        MAX_CPUS
    }

    fn ticks() -> u64 {
        TICKS.load(Ordering::SeqCst)
    }

    fn task_id() -> usize {
        TASK_ID.with(|id| *id)
    }

    fn sleep<T>(_chan: usize, guard: SpinMutexGuard<'_, T, Self>) -> SpinMutexGuard<'_, T, Self> {
        guard.unlocked(thread::yield_now)
    }

    fn wakeup(_chan: usize) {}
}
