use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Single-use countdown a suspend requester blocks on until every targeted thread
/// acknowledged the request.
///
/// Targets (or the requester, on behalf of threads that were already suspended)
/// call [`SuspendBarrier::decrement`] exactly once each.
pub struct SuspendBarrier {
    pending: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SuspendBarrier {
    pub fn new(count: i32) -> Self {
        Self {
            pending: AtomicI32::new(count),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn decrement(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "suspend barrier passed too many times");
        if prev == 1 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Block until every target passed. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            let pending = self.pending();
            if pending <= 0 {
                assert_eq!(pending, 0, "suspend barrier underflow");
                return true;
            }

            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.pending() <= 0;
            }
        }
    }
}

/// Reusable counting barrier.
///
/// The count may go negative when threads [`pass`](Barrier::pass) before the
/// owner [`increment`](Barrier::increment)s it; waiters are released whenever it
/// reaches zero.
pub struct Barrier {
    count: Mutex<i32>,
    cond: Condvar,
}

impl Barrier {
    pub const fn new(count: i32) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn init(&self, count: i32) {
        *self.count.lock() = count;
    }

    pub fn count(&self) -> i32 {
        *self.count.lock()
    }

    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Add `delta` and wait for the count to reach zero. Returns `true` if the wait timed out.
    pub fn increment(&self, delta: i32, timeout: Option<Duration>) -> bool {
        let mut count = self.count.lock();
        *count += delta;
        if *count == 0 {
            self.cond.notify_all();
            return false;
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while *count != 0 {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut count, deadline).timed_out() {
                        return *count != 0;
                    }
                }
                None => self.cond.wait(&mut count),
            }
        }

        false
    }
}
