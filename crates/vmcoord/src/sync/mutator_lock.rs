//! The mutator lock.
//!
//! Every thread running managed code holds a share of this lock. A thread that
//! completed a suspend-all takes it exclusively, which guarantees no other thread
//! touches managed state until it is released again.
//!
//! Shares are acquired and released by thread state transitions that do not nest
//! lexically, so the raw lock API is used instead of guards.

use std::{
    cell::Cell,
    fmt::Write,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{
    lock_api::{RawRwLock as _, RawRwLockTimed},
    RawRwLock,
};

/// Owner ids up to this value are attached thread ids.
pub const MAX_THREAD_OWNER: u32 = u16::MAX as u32;

static NEXT_UNATTACHED_OWNER: AtomicU32 = AtomicU32::new(MAX_THREAD_OWNER + 1);

thread_local! {
    static UNATTACHED_OWNER: Cell<u32> = const { Cell::new(0) };
}

/// Owner id of the calling OS thread when it is not attached to the runtime.
///
/// Assigned on first use and distinct for every OS thread.
pub fn unattached_owner() -> u32 {
    UNATTACHED_OWNER.with(|owner| {
        if owner.get() == 0 {
            owner.set(NEXT_UNATTACHED_OWNER.fetch_add(1, Ordering::Relaxed));
        }
        owner.get()
    })
}

pub struct MutatorLock {
    raw: RawRwLock,
    shared_holders: AtomicUsize,
    exclusive_owner: AtomicU32,
}

impl MutatorLock {
    pub const fn new() -> Self {
        Self {
            raw: <RawRwLock as parking_lot::lock_api::RawRwLock>::INIT,
            shared_holders: AtomicUsize::new(0),
            exclusive_owner: AtomicU32::new(0),
        }
    }

    /// Take a share of the lock.
    ///
    /// Blocks while another thread holds the lock exclusively.
    pub fn shared_lock(&self) {
        self.raw.lock_shared();
        self.shared_holders.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a share taken with [`shared_lock`](Self::shared_lock).
    ///
    /// # Safety
    ///
    /// The caller must own a share of the lock.
    pub unsafe fn shared_unlock(&self) {
        self.shared_holders.fetch_sub(1, Ordering::AcqRel);
        self.raw.unlock_shared();
    }

    pub fn shared(&self) -> SharedMutatorGuard<'_> {
        self.shared_lock();
        SharedMutatorGuard { lock: self }
    }

    /// Take the lock exclusively, giving up after `timeout`.
    pub fn exclusive_lock_with_timeout(&self, owner: u32, timeout: Duration) -> bool {
        if self.raw.try_lock_exclusive_for(timeout) {
            self.exclusive_owner.store(owner, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn exclusive_lock(&self, owner: u32) {
        self.raw.lock_exclusive();
        self.exclusive_owner.store(owner, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must hold the lock exclusively.
    pub unsafe fn exclusive_unlock(&self) {
        self.exclusive_owner.store(0, Ordering::Release);
        self.raw.unlock_exclusive();
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.raw.is_locked_exclusive()
    }

    pub fn is_exclusive_held_by(&self, owner: u32) -> bool {
        self.is_exclusive_held() && self.exclusive_owner.load(Ordering::Acquire) == owner
    }

    pub fn shared_holders(&self) -> usize {
        self.shared_holders.load(Ordering::Acquire)
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let owner = self.exclusive_owner.load(Ordering::Acquire);
        let _ = write!(
            out,
            "MutatorLock exclusive={} owner={} shared_holders={}",
            self.is_exclusive_held(),
            match owner {
                0 => "none".to_owned(),
                id if id > MAX_THREAD_OWNER => format!("unattached#{}", id - MAX_THREAD_OWNER),
                id => id.to_string(),
            },
            self.shared_holders()
        );
        out
    }
}

impl Default for MutatorLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedMutatorGuard<'a> {
    lock: &'a MutatorLock,
}

impl Drop for SharedMutatorGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.shared_unlock() }
    }
}
