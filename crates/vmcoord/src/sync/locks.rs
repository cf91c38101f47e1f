//! Runtime-wide locks shared by the thread list and every [`Thread`](crate::runtime::threads::Thread).
//!
//! Lock order: thread list lock, then `suspend_count`, then per-thread leaf locks.
//! The mutator lock is never acquired while holding `suspend_count`.

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{barrier::Barrier, mutator_lock::MutatorLock, WakeRegistry};

/// State protected by the suspend count lock besides the per-thread counts.
#[derive(Debug, Default)]
pub struct SuspendCountState {
    /// Number of suspend-all operations in flight. At most one at a time.
    pub suspend_all_count: u32,
}

pub type SuspendCountGuard<'a> = MutexGuard<'a, SuspendCountState>;

pub struct Locks {
    /// Guards every thread's suspend counts and barrier lists.
    pub suspend_count: Mutex<SuspendCountState>,
    /// Signalled after suspend counts were lowered.
    pub resume_cond: Condvar,
    pub mutator: MutatorLock,
    /// Passed by threads answering an empty checkpoint.
    pub empty_checkpoint_barrier: Barrier,
    /// Blocking primitives that must be poked so Runnable waiters answer empty checkpoints.
    pub wakeups: WakeRegistry,
}

impl Locks {
    pub fn new() -> Self {
        Self {
            suspend_count: Mutex::new(SuspendCountState::default()),
            resume_cond: Condvar::new(),
            mutator: MutatorLock::new(),
            empty_checkpoint_barrier: Barrier::new(0),
            wakeups: WakeRegistry::new(),
        }
    }

    pub fn lock_suspend_count(&self) -> SuspendCountGuard<'_> {
        self.suspend_count.lock()
    }

    /// Whether `guard` was taken from this lock set's suspend count lock.
    pub fn owns(&self, guard: &SuspendCountGuard<'_>) -> bool {
        std::ptr::eq(MutexGuard::mutex(guard), &self.suspend_count)
    }

    /// Wake every thread waiting for its suspend count to drop.
    pub fn broadcast_resume(&self, guard: &SuspendCountGuard<'_>) {
        debug_assert!(self.owns(guard));
        self.resume_cond.notify_all();
    }
}

impl Default for Locks {
    fn default() -> Self {
        Self::new()
    }
}
