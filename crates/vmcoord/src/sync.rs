use crate::runtime::threads::{Thread, ThreadState};
use crate::utils::os_thread_id;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

pub mod barrier;
pub mod locks;
pub mod mutator_lock;

/// A blocking primitive that can be woken so that Runnable threads parked in it
/// notice a pending empty checkpoint.
pub trait CheckpointWakeable: Send + Sync {
    fn wake_for_checkpoint(&self);
}

/// Weak registrations of [`CheckpointWakeable`] primitives.
///
/// Empty checkpoints call [`wake_all`](WakeRegistry::wake_all) periodically until
/// every Runnable thread has passed the checkpoint barrier.
pub struct WakeRegistry {
    entries: Mutex<Vec<Weak<dyn CheckpointWakeable>>>,
}

impl WakeRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, wakeable: Weak<dyn CheckpointWakeable>) {
        self.entries.lock().push(wakeable);
    }

    /// Wake every live registration. Returns the number woken.
    pub fn wake_all(&self) -> usize {
        let live = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| entry.strong_count() != 0);
            entries
                .iter()
                .filter_map(Weak::upgrade)
                .collect::<Vec<_>>()
        };

        for wakeable in live.iter() {
            wakeable.wake_for_checkpoint();
        }
        live.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WakeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const NO_HOLDER: u64 = u64::MAX;

/// A monitor is mechanism to control concurrent access to an object.
///
/// This type is implemented on top of regular mutex + condvar and also
/// can function as a recursive mutex. Locking "with handshake" moves the
/// calling managed thread out of Runnable while it blocks, so a pending
/// suspend request never has to wait for the lock holder.
pub struct Monitor<T> {
    lock: Mutex<T>,
    cvar: Condvar,
    holder: AtomicU64,
    rec_count: AtomicUsize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RecCount(usize);

impl RecCount {
    pub fn value(&self) -> usize {
        self.0
    }
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            cvar: Condvar::new(),
            holder: AtomicU64::new(NO_HOLDER),
            rec_count: AtomicUsize::new(0),
        }
    }

    /// Release the monitor no matter how many times it was re-entered.
    ///
    /// # Safety
    ///
    /// The returned [`RecCount`] must be handed back to a relock call before the
    /// monitor is used by this thread again.
    pub unsafe fn unlock_completely(guard: MonitorGuard<'_, T>) -> (RecCount, &Self) {
        let mut guard = guard;
        let monitor = guard.monitor;
        let rec_count = monitor.rec_count.swap(0, Ordering::Relaxed);
        monitor.holder.store(NO_HOLDER, Ordering::Relaxed);
        drop(guard.guard.take());
        (RecCount(rec_count), monitor)
    }

    pub fn lock_no_handshake(&self) -> MonitorGuard<'_, T> {
        let my_slot = os_thread_id();
        if my_slot != self.holder.load(Ordering::Relaxed) {
            let guard = self.lock.lock();
            self.holder.store(my_slot, Ordering::Relaxed);
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            return MonitorGuard {
                guard: Some(guard),
                monitor: self,
            };
        }

        self.rec_count.fetch_add(1, Ordering::Relaxed);
        MonitorGuard {
            guard: unsafe { Some(self.lock.make_guard_unchecked()) },
            monitor: self,
        }
    }

    /// Lock the monitor on behalf of `thread`, leaving Runnable while blocked.
    ///
    /// A thread that is not Runnable simply blocks.
    pub fn lock_with_handshake(&self, thread: &Thread) -> MonitorGuard<'_, T> {
        let my_slot = os_thread_id();
        if my_slot != self.holder.load(Ordering::Relaxed) {
            let guard = self.lock_with_handshake_no_rec(thread);
            self.holder.store(my_slot, Ordering::Relaxed);
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            return guard;
        }

        self.rec_count.fetch_add(1, Ordering::Relaxed);
        MonitorGuard {
            guard: unsafe { Some(self.lock.make_guard_unchecked()) },
            monitor: self,
        }
    }

    pub fn relock_with_handshake(&self, thread: &Thread, rec_count: RecCount) -> MonitorGuard<'_, T> {
        let guard = self.lock_with_handshake_no_rec(thread);
        self.holder.store(os_thread_id(), Ordering::Relaxed);
        self.rec_count.store(rec_count.0, Ordering::Relaxed);
        guard
    }

    fn lock_with_handshake_no_rec(&self, thread: &Thread) -> MonitorGuard<'_, T> {
        if thread.state() != ThreadState::Runnable {
            return MonitorGuard {
                guard: Some(self.lock.lock()),
                monitor: self,
            };
        }

        if let Some(guard) = self.lock.try_lock() {
            return MonitorGuard {
                guard: Some(guard),
                monitor: self,
            };
        }

        loop {
            thread.transition_from_runnable_to_suspended(ThreadState::Blocked);
            let guard = self.lock.lock();

            if thread.try_transition_to_runnable() {
                return MonitorGuard {
                    guard: Some(guard),
                    monitor: self,
                };
            }

            // a suspend request is pending: never sit on the monitor while suspended
            drop(guard);
            thread.transition_from_suspended_to_runnable();
        }
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }

    pub fn notify_one(&self) {
        self.cvar.notify_one();
    }
}

impl<T: Send + 'static> Monitor<T> {
    /// Create a monitor whose Runnable waiters are poked by empty checkpoints.
    pub fn new_registered(registry: &WakeRegistry, value: T) -> Arc<Self> {
        let monitor = Arc::new(Self::new(value));
        let weak: Weak<dyn CheckpointWakeable> = Arc::downgrade(&monitor) as Weak<dyn CheckpointWakeable>;
        registry.register(weak);
        monitor
    }
}

impl<T: Send> CheckpointWakeable for Monitor<T> {
    fn wake_for_checkpoint(&self) {
        // Missed wakeups are covered by the periodic re-poke of empty checkpoints.
        let _guard = self.lock.try_lock();
        self.cvar.notify_all();
    }
}

pub struct MonitorGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    monitor: &'a Monitor<T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn monitor(&self) -> &'a Monitor<T> {
        self.monitor
    }

    pub fn wait_no_handshake(&mut self) {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::Relaxed);
        self.monitor.holder.store(NO_HOLDER, Ordering::Relaxed);

        if let Some(guard) = self.guard.as_mut() {
            self.monitor.cvar.wait(guard);
        }

        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(os_thread_id(), Ordering::Relaxed);
    }

    /// Wait while staying Runnable. Wakes up to answer empty checkpoints, so callers
    /// must re-check their condition.
    pub fn wait_runnable(&mut self, thread: &Thread) {
        thread.check_empty_checkpoint_from_wait();
        self.wait_no_handshake();
        thread.check_empty_checkpoint_from_wait();
    }

    /// Wait in the `Waiting` state, then reacquire the monitor with a handshake.
    pub fn wait_with_handshake(mut self, thread: &Thread) -> Self {
        let runnable = thread.state() == ThreadState::Runnable;
        if runnable {
            thread.transition_from_runnable_to_suspended(ThreadState::Waiting);
        }
        self.wait_no_handshake();
        if !runnable {
            return self;
        }

        let (rec_count, monitor) = unsafe { Monitor::unlock_completely(self) };
        thread.transition_from_suspended_to_runnable();
        monitor.relock_with_handshake(thread, rec_count)
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };

        if self.monitor.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.monitor.holder.store(NO_HOLDER, Ordering::Relaxed);
            drop(guard);
        } else {
            MutexGuard::leak(guard);
        }
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicBool, thread, time::Duration};

    use super::*;
    use crate::{
        runtime::threads::{ScopedObjectAccess, ThreadId},
        sync::locks::Locks,
    };

    fn managed_thread(locks: &Arc<Locks>, name: &str) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId(1), name, false, None, locks.clone()))
    }

    #[test]
    fn monitor_is_recursive() {
        let monitor = Monitor::new(0usize);
        let mut outer = monitor.lock_no_handshake();
        *outer += 1;
        {
            let mut inner = monitor.lock_no_handshake();
            *inner += 1;
        }
        assert_eq!(*outer, 2);
        drop(outer);

        let other = thread::scope(|scope| {
            scope
                .spawn(|| *monitor.lock_no_handshake())
                .join()
                .unwrap()
        });
        assert_eq!(other, 2);
    }

    #[test]
    fn wake_registry_drops_dead_entries() {
        let registry = WakeRegistry::new();
        let kept = Monitor::new_registered(&registry, ());
        let dropped = Monitor::new_registered(&registry, ());
        drop(dropped);

        assert_eq!(registry.wake_all(), 1);
        assert_eq!(registry.len(), 1);
        drop(kept);
        assert_eq!(registry.wake_all(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn wake_for_checkpoint_wakes_waiter() {
        let registry = WakeRegistry::new();
        let monitor = Monitor::new_registered(&registry, false);
        let woken = Arc::new(AtomicBool::new(false));

        let waiter = {
            let monitor = monitor.clone();
            let woken = woken.clone();
            thread::spawn(move || {
                let mut guard = monitor.lock_no_handshake();
                guard.wait_no_handshake();
                woken.store(true, Ordering::Release);
            })
        };

        while !woken.load(Ordering::Acquire) {
            registry.wake_all();
            thread::sleep(Duration::from_millis(1));
        }
        waiter.join().unwrap();
    }

    #[test]
    fn handshake_lock_leaves_runnable_while_blocked() {
        let locks = Arc::new(Locks::new());
        let thread = managed_thread(&locks, "blocked");
        let monitor = Arc::new(Monitor::new(0u32));
        let held = monitor.lock_no_handshake();

        let worker = {
            let thread = thread.clone();
            let monitor = monitor.clone();
            thread::spawn(move || {
                let _soa = ScopedObjectAccess::new(&thread);
                let mut guard = monitor.lock_with_handshake(&thread);
                assert_eq!(thread.state(), ThreadState::Runnable);
                *guard += 1;
            })
        };

        while thread.state() != ThreadState::Blocked {
            thread::yield_now();
        }
        // a blocked thread gives up its share of the mutator lock
        assert_eq!(locks.mutator.shared_holders(), 0);
        drop(held);
        worker.join().unwrap();
        assert_eq!(*monitor.lock_no_handshake(), 1);
    }

    #[test]
    fn handshake_wait_parks_in_waiting_state() {
        let locks = Arc::new(Locks::new());
        let thread = managed_thread(&locks, "waiter");
        let monitor = Arc::new(Monitor::new(false));

        let worker = {
            let thread = thread.clone();
            let monitor = monitor.clone();
            thread::spawn(move || {
                let _soa = ScopedObjectAccess::new(&thread);
                let mut guard = monitor.lock_with_handshake(&thread);
                while !*guard {
                    guard = guard.wait_with_handshake(&thread);
                }
                assert_eq!(thread.state(), ThreadState::Runnable);
            })
        };

        while thread.state() != ThreadState::Waiting {
            thread::yield_now();
        }
        assert_eq!(locks.mutator.shared_holders(), 0);
        *monitor.lock_no_handshake() = true;
        monitor.notify_all();
        worker.join().unwrap();
        assert_eq!(thread.state(), ThreadState::Native);
    }

    #[test]
    fn relock_restores_recursion_count() {
        let locks = Arc::new(Locks::new());
        let thread = managed_thread(&locks, "relock");
        let monitor = Monitor::new(());

        let outer = monitor.lock_with_handshake(&thread);
        let inner = monitor.lock_with_handshake(&thread);
        let (rec_count, monitor) = unsafe { Monitor::unlock_completely(inner) };
        assert_eq!(rec_count.value(), 2);
        std::mem::forget(outer);

        let guard = monitor.relock_with_handshake(&thread, rec_count);
        assert_eq!(monitor.rec_count.load(Ordering::Relaxed), 2);
        drop(guard);
        assert_eq!(monitor.rec_count.load(Ordering::Relaxed), 1);
    }
}
