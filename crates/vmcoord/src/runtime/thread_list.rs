//! The list of attached threads and the protocols that stop them.
//!
//! Lock order: `list`, then the suspend count lock in [`Locks`], then per-thread
//! leaf locks. The mutator lock is taken exclusively only after every other thread
//! passed the suspend barrier.

use std::{
    fmt::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    fatal,
    runtime::{
        options::RuntimeOptions,
        retry::{retry_with_backoff, Attempt, RetryPolicy, RetryReason},
        roots::{ObjectRef, RootVisitor},
        threads::{
            Closure, ScopedThreadSuspension, SuspendReason, Thread, ThreadFlags, ThreadId, ThreadState,
        },
    },
    sync::{
        barrier::{Barrier, SuspendBarrier},
        locks::Locks,
        mutator_lock::unattached_owner,
    },
};

/// Notified around the exclusive section of [`ThreadList::flip_thread_roots`].
pub trait PauseListener {
    fn start_pause(&self);
    fn end_pause(&self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuspendStats {
    pub suspend_all_count: u64,
    pub total_pause: Duration,
    pub longest_pause: Duration,
}

impl SuspendStats {
    fn record(&mut self, pause: Duration) {
        self.suspend_all_count += 1;
        self.total_pause += pause;
        self.longest_pause = self.longest_pause.max(pause);
    }
}

struct ThreadIdBitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl ThreadIdBitmap {
    fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    fn alloc(&mut self) -> Option<ThreadId> {
        for (word_ix, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let ix = word_ix * 64 + bit;
            if ix >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            return Some(ThreadId(ix as u16 + 1));
        }
        None
    }

    fn release(&mut self, id: ThreadId) -> bool {
        if id.0 == 0 || id.0 as usize > self.capacity {
            fatal!("releasing thread id {} outside 1..={}", id.0, self.capacity);
        }
        let ix = id.0 as usize - 1;
        let mask = 1u64 << (ix % 64);
        let word = &mut self.words[ix / 64];
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }
}

struct ListState {
    threads: Vec<Arc<Thread>>,
    /// Threads inside [`ThreadList::unregister`].
    unregistering_count: u32,
    /// Threads between [`ThreadList::start_thread_birth`] and their registration.
    threads_being_born: u32,
}

impl ListState {
    fn contains(&self, thread: &Thread) -> bool {
        let ix = thread.index_in_thread_list();
        self.threads
            .get(ix)
            .is_some_and(|registered| std::ptr::eq(&**registered, thread))
    }

    fn others<'a>(&'a self, self_thread: Option<&'a Thread>) -> impl Iterator<Item = &'a Arc<Thread>> + 'a {
        self.threads
            .iter()
            .filter(move |thread| !is_same(thread, self_thread))
    }
}

fn is_same(thread: &Thread, other: Option<&Thread>) -> bool {
    other.is_some_and(|other| std::ptr::eq(thread, other))
}

/// Mutator lock owner id used for `thread`, or for the calling OS thread if it is
/// not attached.
pub(crate) fn owner_of(thread: Option<&Thread>) -> u32 {
    thread.map_or_else(unattached_owner, |thread| thread.id().0 as u32)
}

pub struct ThreadList {
    locks: Arc<Locks>,
    options: Arc<RuntimeOptions>,
    list: Mutex<ListState>,
    /// Signalled when a thread leaves the list.
    thread_exit_cond: Condvar,
    allocated_ids: Mutex<ThreadIdBitmap>,
    long_suspend: AtomicBool,
    shutting_down: AtomicBool,
    gc_marking: AtomicBool,
    /// Serializes users of the shared empty checkpoint barrier.
    empty_checkpoint_lock: Mutex<()>,
    stats: Mutex<SuspendStats>,
}

impl ThreadList {
    pub fn new(locks: Arc<Locks>, options: Arc<RuntimeOptions>) -> Self {
        Self {
            allocated_ids: Mutex::new(ThreadIdBitmap::new(options.max_thread_ids)),
            locks,
            options,
            list: Mutex::new(ListState {
                threads: Vec::new(),
                unregistering_count: 0,
                threads_being_born: 0,
            }),
            thread_exit_cond: Condvar::new(),
            long_suspend: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            gc_marking: AtomicBool::new(false),
            empty_checkpoint_lock: Mutex::new(()),
            stats: Mutex::new(SuspendStats::default()),
        }
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    fn suspend_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.options.max_suspend_retries, self.options.thread_suspend_sleep)
    }

    pub fn alloc_thread_id(&self) -> ThreadId {
        match self.allocated_ids.lock().alloc() {
            Some(id) => id,
            None => fatal!(
                "out of thread ids: all {} ids are in use",
                self.options.max_thread_ids
            ),
        }
    }

    pub fn release_thread_id(&self, id: ThreadId) {
        if !id.is_valid() || !self.allocated_ids.lock().release(id) {
            fatal!("releasing thread id {} that was not allocated", id);
        }
    }

    /// Announce a thread that is about to attach. Fails once shutdown started.
    pub fn start_thread_birth(&self) -> bool {
        let mut list = self.list.lock();
        if self.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        list.threads_being_born += 1;
        true
    }

    pub fn end_thread_birth(&self) {
        let mut list = self.list.lock();
        debug_assert!(list.threads_being_born > 0);
        list.threads_being_born -= 1;
        self.thread_exit_cond.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Value handed to threads registering from now on.
    pub fn set_gc_marking(&self, marking: bool) {
        let list = self.list.lock();
        self.gc_marking.store(marking, Ordering::Release);
        for thread in list.threads.iter() {
            thread.set_is_gc_marking(marking);
        }
    }

    pub fn register(&self, thread: &Arc<Thread>) {
        log::debug!(target: "vmcoord::threads", "ThreadList::register {}", thread);
        if thread.state().is_runnable() {
            fatal!("registering Runnable thread {}", thread.dump());
        }

        let mut list = self.list.lock();
        if list.contains(thread) {
            fatal!("thread registered twice: {}", thread.dump());
        }

        {
            // A thread attaching while the world is stopped starts out suspended.
            let guard = self.locks.lock_suspend_count();
            for _ in 0..guard.suspend_all_count {
                thread.increment_suspend_count(&guard, None, None, SuspendReason::Internal);
            }
        }

        thread.set_is_gc_marking(self.gc_marking.load(Ordering::Acquire));
        thread.set_index_in_thread_list(list.threads.len());
        list.threads.push(thread.clone());
    }

    /// Remove `thread` from the list once no suspend request holds it, and release its id.
    pub fn unregister(&self, thread: &Thread) {
        log::debug!(target: "vmcoord::threads", "ThreadList::unregister {}", thread);
        if thread.state().is_runnable() {
            fatal!("unregistering Runnable thread {}", thread.dump());
        }

        self.list.lock().unregistering_count += 1;

        let policy = RetryPolicy::new(usize::MAX, self.options.unregister_sleep)
            .with_timeout(self.options.thread_suspend_timeout);
        let removed = retry_with_backoff(policy, "ThreadList::unregister", |_| {
            let mut list = self.list.lock();
            if !list.contains(thread) {
                log::error!(target: "vmcoord::threads", "request to unregister unattached thread {}", thread);
                return Attempt::Done(false);
            }

            let _guard = self.locks.lock_suspend_count();
            if thread.is_suspended() {
                // let the requester finish with this thread first
                return Attempt::Retry(RetryReason::StillSuspended);
            }

            let ix = thread.index_in_thread_list();
            let removed = list.threads.swap_remove(ix);
            debug_assert!(std::ptr::eq(&*removed, thread));
            if let Some(moved) = list.threads.get(ix) {
                moved.set_index_in_thread_list(ix);
            }
            thread.set_index_in_thread_list(usize::MAX);
            Attempt::Done(true)
        });

        if removed {
            thread.set_state(ThreadState::Terminated);
            self.release_thread_id(thread.id());
        }

        let mut list = self.list.lock();
        list.unregistering_count -= 1;
        self.thread_exit_cond.notify_all();
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.list.lock().contains(thread)
    }

    pub fn size(&self) -> usize {
        self.list.lock().threads.len()
    }

    /// Snapshot of the registered threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.list.lock().threads.clone()
    }

    pub fn find_by_tid(&self, tid: u64) -> Option<Arc<Thread>> {
        self.list
            .lock()
            .threads
            .iter()
            .find(|thread| thread.tid() == tid)
            .cloned()
    }

    pub fn find_by_thread_id(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.list
            .lock()
            .threads
            .iter()
            .find(|thread| thread.id() == id)
            .cloned()
    }

    pub fn find_by_peer(&self, peer: ObjectRef) -> Option<Arc<Thread>> {
        self.list
            .lock()
            .threads
            .iter()
            .find(|thread| thread.peer() == Some(peer))
            .cloned()
    }

    /// Run `f` on every registered thread while holding the list lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Thread>)) {
        let list = self.list.lock();
        for thread in list.threads.iter() {
            f(thread);
        }
    }

    fn not_runnable_requester(&self, self_thread: Option<&Thread>, what: &str) {
        if let Some(thread) = self_thread {
            if thread.state().is_runnable() {
                fatal!("{what} called by Runnable thread {}", thread.dump());
            }
        }
    }

    /// Stop every thread but `self_thread` and take the mutator lock exclusively.
    pub fn suspend_all(&self, self_thread: Option<&Thread>, cause: &str, long_suspend: bool) {
        self.not_runnable_requester(self_thread, "SuspendAll");
        log::debug!(
            target: "vmcoord::threads",
            "{} SuspendAll for {} starting...",
            self_thread.map_or_else(|| "unattached".to_owned(), |thread| thread.to_string()),
            cause
        );

        let start = Instant::now();
        self.suspend_all_internal(self_thread, None, SuspendReason::Internal, cause);

        loop {
            if self.locks.mutator.exclusive_lock_with_timeout(
                owner_of(self_thread),
                self.options.thread_suspend_timeout,
            ) {
                break;
            }
            // racy read: a long suspend may still be winding down
            if !self.long_suspend.load(Ordering::Acquire) {
                fatal!(
                    "timed out waiting for the mutator lock during SuspendAll({cause}): {}\n{}",
                    self.locks.mutator.dump(),
                    self.dump()
                );
            }
        }

        self.long_suspend.store(long_suspend, Ordering::Release);

        let pause = start.elapsed();
        self.stats.lock().record(pause);
        if pause > self.options.long_thread_suspend_threshold {
            log::warn!(target: "vmcoord::threads", "Suspending all threads for {} took: {:?}", cause, pause);
        }

        if self.options.debug_locking {
            self.assert_other_threads_are_suspended(self_thread);
        }
        log::debug!(target: "vmcoord::threads", "SuspendAll for {} complete", cause);
    }

    /// Raise the suspend count of every thread but `self_thread` and `ignore` and
    /// wait until all of them left Runnable.
    fn suspend_all_internal(
        &self,
        self_thread: Option<&Thread>,
        ignore: Option<&Thread>,
        reason: SuspendReason,
        cause: &str,
    ) {
        let barrier = retry_with_backoff(self.suspend_retry_policy(), "SuspendAll", |_| {
            {
                let list = self.list.lock();
                let mut guard = self.locks.lock_suspend_count();
                let self_suspended = self_thread.is_some_and(|thread| thread.suspend_count() != 0);
                let in_flip = list.threads.iter().any(|thread| thread.has_flip_function());

                if guard.suspend_all_count == 0 && !self_suspended && !in_flip {
                    guard.suspend_all_count += 1;

                    let targets = list
                        .others(self_thread)
                        .filter(|thread| !is_same(thread, ignore))
                        .count();
                    let barrier = Arc::new(SuspendBarrier::new(targets as i32));

                    for thread in list
                        .others(self_thread)
                        .filter(|thread| !is_same(thread, ignore))
                    {
                        log::trace!(target: "vmcoord::threads", "requesting thread suspend: {}", thread);
                        thread.increment_suspend_count(&guard, Some(barrier.clone()), None, reason);
                        if thread.is_suspended() {
                            // Already stopped: pass the barrier on its behalf.
                            barrier.decrement();
                            thread.clear_suspend_all_barrier(&guard);
                        }
                    }
                    return Attempt::Done(barrier);
                }

                if self_suspended {
                    return Attempt::Retry(RetryReason::SelfSuspended);
                }
                if in_flip && guard.suspend_all_count == 0 {
                    return Attempt::Retry(RetryReason::FlipInProgress);
                }
            }

            let mut guard = self.locks.lock_suspend_count();
            if guard.suspend_all_count != 0 {
                self.locks.resume_cond.wait(&mut guard);
                return Attempt::Retry(RetryReason::SuspendAllInProgress);
            }
            Attempt::Retry(RetryReason::FlipInProgress)
        });

        if !barrier.wait(self.options.thread_suspend_timeout) {
            let list = self.list.lock();
            let mut message = format!(
                "timed out after {:?} waiting for {} threads to suspend for {cause}",
                self.options.thread_suspend_timeout,
                barrier.pending()
            );
            for thread in list.others(self_thread) {
                if !is_same(thread, ignore) && !thread.is_suspended() {
                    let _ = write!(message, "\n  Thread not suspended: {}", thread.dump());
                }
            }
            drop(list);
            fatal!("{message}");
        }
    }

    /// Undo [`suspend_all`](Self::suspend_all).
    pub fn resume_all(&self, self_thread: Option<&Thread>) {
        log::debug!(target: "vmcoord::threads", "ResumeAll starting");
        if self.options.debug_locking {
            self.assert_other_threads_are_suspended(self_thread);
        }

        self.long_suspend.store(false, Ordering::Release);
        if !self
            .locks
            .mutator
            .is_exclusive_held_by(owner_of(self_thread))
        {
            fatal!(
                "ResumeAll without holding the mutator lock: {}",
                self.locks.mutator.dump()
            );
        }
        unsafe { self.locks.mutator.exclusive_unlock() };

        let list = self.list.lock();
        let mut guard = self.locks.lock_suspend_count();
        if guard.suspend_all_count == 0 {
            fatal!("ResumeAll without a matching SuspendAll");
        }
        guard.suspend_all_count -= 1;
        for thread in list.others(self_thread) {
            thread.decrement_suspend_count(&guard, SuspendReason::Internal);
        }
        self.locks.broadcast_resume(&guard);
        log::debug!(target: "vmcoord::threads", "ResumeAll complete");
    }

    /// Release one suspension of `thread`. Returns `false` if it was not suspended.
    pub fn resume(&self, thread: &Thread, reason: SuspendReason) -> bool {
        log::debug!(target: "vmcoord::threads", "Resume({}) starting...", thread);
        let list = self.list.lock();
        let guard = self.locks.lock_suspend_count();
        if !thread.is_suspended() {
            log::error!(target: "vmcoord::threads", "Resume({}) thread not suspended", thread);
            return false;
        }
        if !list.contains(thread) {
            log::error!(target: "vmcoord::threads", "Resume({}) thread not within thread list", thread);
            return false;
        }
        thread.decrement_suspend_count(&guard, reason);
        self.locks.broadcast_resume(&guard);
        true
    }

    /// Suspend the thread with id `id`. Returns `None` if no such thread is registered.
    pub fn suspend_thread_by_thread_id(
        &self,
        self_thread: Option<&Thread>,
        id: ThreadId,
        reason: SuspendReason,
    ) -> Option<Arc<Thread>> {
        self.suspend_thread(self_thread, reason, &format!("thread id {id}"), |list| {
            list.threads.iter().find(|thread| thread.id() == id).cloned()
        })
    }

    /// Suspend the thread whose managed peer is `peer`.
    pub fn suspend_thread_by_peer(
        &self,
        self_thread: Option<&Thread>,
        peer: ObjectRef,
        reason: SuspendReason,
    ) -> Option<Arc<Thread>> {
        self.suspend_thread(self_thread, reason, &format!("peer {peer:?}"), |list| {
            list.threads
                .iter()
                .find(|thread| thread.peer() == Some(peer))
                .cloned()
        })
    }

    fn suspend_thread(
        &self,
        self_thread: Option<&Thread>,
        reason: SuspendReason,
        what: &str,
        lookup: impl Fn(&ListState) -> Option<Arc<Thread>>,
    ) -> Option<Arc<Thread>> {
        self.not_runnable_requester(self_thread, "SuspendThread");

        let requested = retry_with_backoff(self.suspend_retry_policy(), "SuspendThread", |_| {
            let list = self.list.lock();
            let Some(thread) = lookup(&list) else {
                log::warn!(target: "vmcoord::threads", "No such thread for suspend: {}", what);
                return Attempt::Done(None);
            };
            if is_same(&thread, self_thread) {
                fatal!("attempt to suspend the current thread {}", thread);
            }

            let guard = self.locks.lock_suspend_count();
            if self_thread.is_some_and(|current| current.suspend_count() != 0) {
                return Attempt::Retry(RetryReason::SelfSuspended);
            }
            if thread.has_flip_function() {
                return Attempt::Retry(RetryReason::TargetFlipping);
            }

            let barrier = Arc::new(SuspendBarrier::new(1));
            thread.increment_suspend_count(&guard, None, Some(barrier.clone()), reason);
            let already_suspended = thread.is_suspended();
            if already_suspended {
                thread.remove_suspend1_barrier(&guard, &barrier);
            }
            Attempt::Done(Some((thread, barrier, already_suspended)))
        });

        let (thread, barrier, already_suspended) = requested?;
        if !already_suspended && !barrier.wait(self.options.thread_suspend_timeout) {
            fatal!(
                "SuspendThread timed out after {:?}: {}",
                self.options.thread_suspend_timeout,
                thread.dump()
            );
        }
        log::debug!(target: "vmcoord::threads", "SuspendThread({}) complete", thread);
        Some(thread)
    }

    /// Run `checkpoint` on every thread, either at the thread's next safepoint or
    /// by the caller while the thread is held suspended.
    ///
    /// `callback` runs while the list lock is still held. Returns the number of
    /// times `checkpoint` runs.
    pub fn run_checkpoint(
        &self,
        self_thread: Option<&Thread>,
        checkpoint: Arc<dyn Closure>,
        callback: Option<&dyn Fn()>,
    ) -> usize {
        let mut suspended: Vec<Arc<Thread>> = Vec::new();
        let mut count = 0;
        {
            let list = self.list.lock();
            let guard = self.locks.lock_suspend_count();
            for thread in list.others(self_thread) {
                count += 1;
                let mut requested_suspend = false;
                loop {
                    if thread.request_checkpoint(&guard, checkpoint.clone()) {
                        if requested_suspend {
                            thread.decrement_suspend_count(&guard, SuspendReason::Internal);
                            requested_suspend = false;
                        }
                        break;
                    }

                    if thread.state().is_runnable() {
                        // spurious failure
                        continue;
                    }

                    if !requested_suspend {
                        thread.increment_suspend_count(&guard, None, None, SuspendReason::Internal);
                        requested_suspend = true;
                        if thread.is_suspended() {
                            break;
                        }
                        // raced to Runnable, request again
                    } else {
                        debug_assert!(thread.is_suspended());
                        break;
                    }
                }
                if requested_suspend {
                    suspended.push(thread.clone());
                }
            }

            if let Some(callback) = callback {
                callback();
            }
        }

        if let Some(current) = self_thread {
            count += 1;
            checkpoint.run(current);
        }

        for thread in suspended.iter() {
            thread.ensure_flip_function_started();
            checkpoint.run(thread);
            let guard = self.locks.lock_suspend_count();
            thread.decrement_suspend_count(&guard, SuspendReason::Internal);
        }

        let guard = self.locks.lock_suspend_count();
        self.locks.broadcast_resume(&guard);
        count
    }

    /// [`run_checkpoint`](Self::run_checkpoint) that returns once every thread ran `checkpoint`.
    pub fn run_checkpoint_and_wait(&self, self_thread: Option<&Thread>, checkpoint: Arc<dyn Closure>) -> usize {
        let barrier = Arc::new(Barrier::new(0));
        let wrapped: Arc<dyn Closure> = {
            let barrier = barrier.clone();
            Arc::new(move |thread: &Thread| {
                checkpoint.run(thread);
                barrier.pass();
            })
        };

        let count = self.run_checkpoint(self_thread, wrapped, None);
        let _suspension = self_thread
            .filter(|thread| thread.state().is_runnable())
            .map(|thread| ScopedThreadSuspension::new(thread, ThreadState::WaitingForCheckPointsToRun));

        if barrier.increment(count as i32, Some(self.options.checkpoint_timeout)) {
            fatal!(
                "timed out after {:?} waiting for {} threads to run a checkpoint\n{}",
                self.options.checkpoint_timeout,
                barrier.count(),
                self.dump()
            );
        }
        count
    }

    /// Make every Runnable thread pass a safepoint once.
    pub fn run_empty_checkpoint(&self, self_thread: Option<&Thread>) {
        let _serialized = self.empty_checkpoint_lock.lock();
        let barrier = &self.locks.empty_checkpoint_barrier;
        barrier.init(0);

        let mut count = 0;
        let mut runnable_ids = Vec::new();
        {
            let list = self.list.lock();
            let _guard = self.locks.lock_suspend_count();
            for thread in list.others(self_thread) {
                loop {
                    if thread.request_empty_checkpoint() {
                        count += 1;
                        runnable_ids.push(thread.id());
                        break;
                    }
                    if !thread.state().is_runnable() {
                        // not touching managed state
                        break;
                    }
                }
            }
        }

        if count == 0 {
            return;
        }

        self.locks.wakeups.wake_all();

        let mut first = true;
        let mut waited = Duration::ZERO;
        loop {
            let delta = if first { count } else { 0 };
            first = false;
            if !barrier.increment(delta, Some(self.options.empty_checkpoint_periodic_timeout)) {
                break;
            }

            waited += self.options.empty_checkpoint_periodic_timeout;
            if waited >= self.options.empty_checkpoint_total_timeout {
                let mut message = format!(
                    "empty checkpoint timed out after {:?}, {} threads did not respond",
                    waited,
                    barrier.count()
                );
                let list = self.list.lock();
                for thread in list.threads.iter() {
                    if runnable_ids.contains(&thread.id())
                        && thread.read_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST)
                    {
                        let _ = write!(message, "\n  Thread not responding: {}", thread.dump());
                    }
                }
                drop(list);
                fatal!("{message}");
            }
            self.locks.wakeups.wake_all();
        }
    }

    /// Stop the world, run `flip_callback` with the mutator lock held exclusively,
    /// install `flip_visitor` as every thread's flip function and resume threads
    /// as soon as their flip function has run.
    ///
    /// Returns the number of threads that got the flip function.
    pub fn flip_thread_roots(
        &self,
        self_thread: Option<&Thread>,
        flip_visitor: Arc<dyn Closure>,
        flip_callback: &dyn Fn(),
        pause_listener: Option<&dyn PauseListener>,
    ) -> usize {
        self.not_runnable_requester(self_thread, "FlipThreadRoots");

        let start = Instant::now();
        self.suspend_all_internal(self_thread, self_thread, SuspendReason::Internal, "thread flip");
        if let Some(listener) = pause_listener {
            listener.start_pause();
        }

        self.locks.mutator.exclusive_lock(owner_of(self_thread));
        flip_callback();
        unsafe { self.locks.mutator.exclusive_unlock() };
        self.stats.lock().record(start.elapsed());

        if let Some(listener) = pause_listener {
            listener.end_pause();
        }

        let mut runnable_count = 0;
        let mut other_threads = Vec::new();
        {
            let list = self.list.lock();
            let mut guard = self.locks.lock_suspend_count();
            guard.suspend_all_count -= 1;
            for thread in list.threads.iter() {
                // Every thread gets it, resumed threads may run it on behalf of others.
                thread.set_flip_function(flip_visitor.clone());
                if is_same(thread, self_thread) {
                    continue;
                }

                let waiting_to_run = thread.state() == ThreadState::WaitingForGcThreadFlip
                    || thread.is_transitioning_to_runnable();
                if waiting_to_run && thread.suspend_count() == 1 {
                    // resumes right after the broadcast and runs its own flip
                    thread.decrement_suspend_count(&guard, SuspendReason::Internal);
                    runnable_count += 1;
                } else {
                    other_threads.push(thread.clone());
                }
            }
            self.locks.broadcast_resume(&guard);
        }

        {
            let _shared = self.locks.mutator.shared();
            for thread in other_threads.iter() {
                thread.ensure_flip_function_started();
                debug_assert!(!thread.read_flag(ThreadFlags::PENDING_FLIP_FUNCTION));
            }
            if let Some(current) = self_thread {
                current.ensure_flip_function_started();
            }
        }

        {
            let guard = self.locks.lock_suspend_count();
            for thread in other_threads.iter() {
                thread.decrement_suspend_count(&guard, SuspendReason::Internal);
            }
            self.locks.broadcast_resume(&guard);
        }

        runnable_count + other_threads.len() + usize::from(self_thread.is_some())
    }

    /// Fatal unless every thread but `self_thread` is suspended.
    pub fn assert_other_threads_are_suspended(&self, self_thread: Option<&Thread>) {
        let list = self.list.lock();
        let guard = self.locks.lock_suspend_count();
        let unsuspended = list
            .others(self_thread)
            .find(|thread| !thread.is_suspended())
            .map(|thread| thread.dump());
        drop(guard);
        drop(list);
        if let Some(dump) = unsuspended {
            fatal!("Unsuspended thread: {dump}");
        }
    }

    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let list = self.list.lock();
        for thread in list.threads.iter() {
            thread.visit_roots(visitor);
        }
    }

    /// Visit roots of the threads that are already suspended, and of `self_thread`.
    pub fn visit_roots_for_suspended_threads(&self, self_thread: Option<&Thread>, visitor: &mut dyn RootVisitor) {
        let mut to_visit = Vec::new();
        {
            let list = self.list.lock();
            let guard = self.locks.lock_suspend_count();
            for thread in list.threads.iter() {
                thread.increment_suspend_count(&guard, None, None, SuspendReason::Internal);
                if is_same(thread, self_thread) || thread.is_suspended() {
                    to_visit.push(thread.clone());
                } else {
                    thread.decrement_suspend_count(&guard, SuspendReason::Internal);
                }
            }
        }

        // no locks held while visiting
        for thread in to_visit.iter() {
            thread.visit_roots(visitor);
        }

        let guard = self.locks.lock_suspend_count();
        for thread in to_visit.iter() {
            thread.decrement_suspend_count(&guard, SuspendReason::Internal);
        }
        self.locks.broadcast_resume(&guard);
    }

    /// Block until every other thread still attached is a daemon.
    pub fn wait_for_other_non_daemon_threads_to_exit(&self, self_thread: Option<&Thread>) {
        let mut list = self.list.lock();
        loop {
            let all_daemons = list
                .others(self_thread)
                .all(|thread| thread.is_daemon());
            if all_daemons && list.unregistering_count == 0 && list.threads_being_born == 0 {
                return;
            }
            self.thread_exit_cond.wait(&mut list);
        }
    }

    /// Park the remaining daemon threads for good.
    pub fn suspend_all_daemon_threads_for_shutdown(&self, self_thread: Option<&Thread>) {
        let mut daemons_left = 0;
        {
            let list = self.list.lock();
            let guard = self.locks.lock_suspend_count();
            for thread in list.others(self_thread) {
                if !thread.is_daemon() {
                    fatal!("non-daemon thread still attached at shutdown: {}", thread.dump());
                }
                thread.increment_suspend_count(&guard, None, None, SuspendReason::Internal);
                daemons_left += 1;
            }
        }

        if daemons_left == 0 {
            return;
        }

        let deadline = Instant::now() + self.options.daemon_shutdown_timeout;
        let mut have_complained = false;
        let mut all_suspended = false;
        while !all_suspended && Instant::now() < deadline {
            let mut found_running = false;
            self.for_each(|thread| {
                if !is_same(thread, self_thread) && thread.state().is_runnable() {
                    if !have_complained {
                        log::warn!(target: "vmcoord::threads", "daemon thread not yet suspended: {}", thread);
                        have_complained = true;
                    }
                    found_running = true;
                }
            });
            if found_running {
                std::thread::sleep(self.options.daemon_shutdown_poll);
            } else {
                all_suspended = true;
            }
        }

        if !all_suspended {
            log::warn!(target: "vmcoord::threads", "timed out suspending all daemon threads");
        }
        // Let "suspended" daemons quiesce.
        std::thread::sleep(self.options.daemon_sleep);
    }

    /// Stop accepting new threads, wait for non-daemon threads and park daemons.
    pub fn shut_down(&self, self_thread: Option<&Thread>) {
        log::debug!(target: "vmcoord::threads", "ThreadList shutting down");
        {
            let _list = self.list.lock();
            self.shutting_down.store(true, Ordering::Release);
        }
        self.wait_for_other_non_daemon_threads_to_exit(self_thread);
        self.suspend_all_daemon_threads_for_shutdown(self_thread);
    }

    pub fn stats(&self) -> SuspendStats {
        *self.stats.lock()
    }

    pub fn dump(&self) -> String {
        let list = self.list.lock();
        let suspend_all_count = self.locks.lock_suspend_count().suspend_all_count;
        let stats = self.stats();
        let mut out = format!(
            "ThreadList: {} threads, suspend_all_count={}, unregistering={}, being born={}\n  {}\n  suspend all histogram: count={} total={:?} longest={:?}",
            list.threads.len(),
            suspend_all_count,
            list.unregistering_count,
            list.threads_being_born,
            self.locks.mutator.dump(),
            stats.suspend_all_count,
            stats.total_pause,
            stats.longest_pause,
        );
        for thread in list.threads.iter() {
            let _ = write!(out, "\n  {}", thread.dump());
        }
        out
    }
}

/// Suspends every other thread for the scope of the guard.
///
/// A Runnable requester leaves Runnable first and comes back after the resume.
pub struct ScopedSuspendAll<'a> {
    list: &'a ThreadList,
    self_thread: Option<&'a Thread>,
    // dropped after the resume
    _suspension: Option<ScopedThreadSuspension<'a>>,
}

impl<'a> ScopedSuspendAll<'a> {
    pub fn new(list: &'a ThreadList, self_thread: Option<&'a Thread>, cause: &str) -> Self {
        let suspension = self_thread
            .filter(|thread| thread.state().is_runnable())
            .map(|thread| ScopedThreadSuspension::new(thread, ThreadState::Suspended));
        list.suspend_all(self_thread, cause, false);
        Self {
            list,
            self_thread,
            _suspension: suspension,
        }
    }
}

impl Drop for ScopedSuspendAll<'_> {
    fn drop(&mut self) {
        self.list.resume_all(self.self_thread);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        mock::{init_logging, test_options, MutatorThread},
        runtime::threads::ScopedObjectAccess,
        sync::Monitor,
    };

    fn new_list(options: RuntimeOptions) -> Arc<ThreadList> {
        init_logging();
        Arc::new(ThreadList::new(Arc::new(Locks::new()), Arc::new(options)))
    }

    fn spawn_n(list: &Arc<ThreadList>, n: usize) -> Vec<MutatorThread> {
        (0..n)
            .map(|i| MutatorThread::spawn(list, &format!("mutator-{i}"), false))
            .collect()
    }

    #[test]
    fn thread_ids_are_reused_after_release() {
        let list = new_list(test_options().with_max_thread_ids(2));
        let a = list.alloc_thread_id();
        let b = list.alloc_thread_id();
        assert_eq!((a, b), (ThreadId(1), ThreadId(2)));
        list.release_thread_id(a);
        assert_eq!(list.alloc_thread_id(), ThreadId(1));
    }

    #[test]
    #[should_panic(expected = "out of thread ids")]
    fn running_out_of_thread_ids_is_fatal() {
        let list = new_list(test_options().with_max_thread_ids(1));
        list.alloc_thread_id();
        list.alloc_thread_id();
    }

    #[test]
    fn register_and_unregister() {
        let list = new_list(test_options());
        let thread = Arc::new(Thread::new(list.alloc_thread_id(), "main", false, ObjectRef::new(0x40), list.locks().clone()));
        list.register(&thread);
        assert!(list.contains(&thread));
        assert_eq!(list.find_by_thread_id(thread.id()).map(|t| t.tid()), Some(thread.tid()));
        assert!(list.find_by_tid(thread.tid()).is_some());
        assert!(list.find_by_peer(ObjectRef::new(0x40).unwrap()).is_some());

        list.unregister(&thread);
        assert!(!list.contains(&thread));
        assert_eq!(list.size(), 0);
        assert_eq!(thread.state(), ThreadState::Terminated);
    }

    #[test]
    #[should_panic(expected = "thread registered twice")]
    fn double_register_is_fatal() {
        let list = new_list(test_options());
        let thread = Arc::new(Thread::new(list.alloc_thread_id(), "main", false, None, list.locks().clone()));
        list.register(&thread);
        list.register(&thread);
    }

    #[test]
    fn suspend_all_resume_all_scenario() {
        let list = new_list(test_options().with_debug_locking(true));
        let mutators = spawn_n(&list, 5);
        assert_eq!(list.size(), 5);

        list.suspend_all(None, "test", false);
        list.assert_other_threads_are_suspended(None);
        for mutator in mutators.iter() {
            assert!(mutator.thread().is_suspended());
        }
        list.resume_all(None);

        for mutator in mutators.iter() {
            assert!(mutator.wait_for_progress(Duration::from_secs(5)));
        }
        for mutator in mutators.iter() {
            assert_eq!(mutator.thread().suspend_count(), 0);
        }
        assert_eq!(list.stats().suspend_all_count, 1);
    }

    #[test]
    fn suspend_all_excludes_mutators() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 4);
        for mutator in mutators.iter() {
            assert!(mutator.wait_for_progress(Duration::from_secs(5)));
        }

        list.suspend_all(None, "exclusion", false);
        let before = mutators.iter().map(|m| m.progress()).collect::<Vec<_>>();
        std::thread::sleep(Duration::from_millis(20));
        let after = mutators.iter().map(|m| m.progress()).collect::<Vec<_>>();
        assert_eq!(before, after);
        assert_eq!(list.locks().mutator.shared_holders(), 0);
        list.resume_all(None);

        for mutator in mutators.iter() {
            assert!(mutator.wait_for_progress(Duration::from_secs(5)));
        }
    }

    #[test]
    fn thread_registered_during_suspend_all_starts_suspended() {
        let list = new_list(test_options());
        list.suspend_all(None, "attach", false);
        let thread = Arc::new(Thread::new(list.alloc_thread_id(), "late", false, None, list.locks().clone()));
        list.register(&thread);
        assert_eq!(thread.suspend_count(), 1);
        assert!(thread.is_suspended());
        list.resume_all(None);
        assert_eq!(thread.suspend_count(), 0);
        list.unregister(&thread);
    }

    #[test]
    fn targeted_suspend_and_resume() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 2);
        let target = mutators[1].thread().clone();

        let suspended = list
            .suspend_thread_by_thread_id(None, target.id(), SuspendReason::ForUserCode)
            .unwrap();
        assert!(Arc::ptr_eq(&suspended, &target));
        assert!(target.is_suspended());
        assert_eq!(target.user_code_suspend_count(), 1);
        assert!(mutators[0].wait_for_progress(Duration::from_secs(5)));

        assert!(list.resume(&target, SuspendReason::ForUserCode));
        assert!(!list.resume(&target, SuspendReason::ForUserCode));
        assert!(mutators[1].wait_for_progress(Duration::from_secs(5)));
        assert!(list
            .suspend_thread_by_thread_id(None, ThreadId(999), SuspendReason::Internal)
            .is_none());
    }

    #[test]
    fn suspend_by_peer() {
        let list = new_list(test_options());
        let mutator = MutatorThread::spawn_with_peer(&list, "peer", ObjectRef::new(0x1000));
        let thread = list
            .suspend_thread_by_peer(None, ObjectRef::new(0x1000).unwrap(), SuspendReason::Internal)
            .unwrap();
        assert!(thread.is_suspended());
        assert!(list.resume(&thread, SuspendReason::Internal));
        assert!(mutator.wait_for_progress(Duration::from_secs(5)));
    }

    #[test]
    fn suspend_counts_balance_across_paths() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 3);

        for _ in 0..3 {
            list.suspend_all(None, "balance", false);
            list.resume_all(None);
            let target = mutators[0].thread().id();
            list.suspend_thread_by_thread_id(None, target, SuspendReason::Internal)
                .unwrap();
            list.run_checkpoint_and_wait(None, Arc::new(|_: &Thread| {}));
            assert!(list.resume(mutators[0].thread(), SuspendReason::Internal));
        }

        for mutator in mutators.iter() {
            assert!(mutator.wait_for_progress(Duration::from_secs(5)));
            assert_eq!(mutator.thread().suspend_count(), 0);
        }
    }

    #[test]
    fn checkpoint_runs_once_per_thread() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 4);
        // one of them is held suspended by an unrelated party
        let held = mutators[2].thread().clone();
        list.suspend_thread_by_thread_id(None, held.id(), SuspendReason::Internal)
            .unwrap();

        let runs = Arc::new(Mutex::new(Vec::new()));
        let count = {
            let runs = runs.clone();
            list.run_checkpoint_and_wait(
                None,
                Arc::new(move |thread: &Thread| runs.lock().push(thread.id())),
            )
        };
        assert_eq!(count, 4);

        let mut runs = runs.lock().clone();
        runs.sort();
        let mut expected = mutators.iter().map(|m| m.thread().id()).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(runs, expected);

        assert!(held.is_suspended());
        assert!(list.resume(&held, SuspendReason::Internal));
    }

    #[test]
    fn checkpoint_callback_runs_under_lock() {
        let list = new_list(test_options());
        let _mutators = spawn_n(&list, 2);
        let called = AtomicUsize::new(0);
        let callback = || {
            called.fetch_add(1, Ordering::SeqCst);
        };
        list.run_checkpoint_and_wait(None, Arc::new(|_: &Thread| {}));
        let barrier = Arc::new(Barrier::new(0));
        let count = {
            let barrier = barrier.clone();
            list.run_checkpoint(
                None,
                Arc::new(move |_: &Thread| barrier.pass()),
                Some(&callback),
            )
        };
        assert!(!barrier.increment(count as i32, Some(Duration::from_secs(5))));
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_checkpoint_completes() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 3);
        for mutator in mutators.iter() {
            assert!(mutator.wait_for_progress(Duration::from_secs(5)));
        }
        list.run_empty_checkpoint(None);
        list.run_empty_checkpoint(None);
        for mutator in mutators.iter() {
            assert!(!mutator
                .thread()
                .read_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST));
        }
    }

    #[test]
    fn flip_runs_visitor_once_per_thread() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 3);
        for (i, mutator) in mutators.iter().enumerate() {
            mutator.thread().add_root(ObjectRef::new(0x100 * (i + 1)).unwrap());
        }

        let flipped = Arc::new(AtomicUsize::new(0));
        let callback_ran = AtomicUsize::new(0);
        let visitor: Arc<dyn Closure> = {
            let flipped = flipped.clone();
            Arc::new(move |thread: &Thread| {
                thread.visit_roots(&mut |root: &mut ObjectRef, _| {
                    *root = ObjectRef::new(root.raw() + 1).unwrap();
                });
                flipped.fetch_add(1, Ordering::SeqCst);
            })
        };

        let count = list.flip_thread_roots(
            None,
            visitor,
            &|| {
                callback_ran.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        assert_eq!(count, 3);
        assert_eq!(callback_ran.load(Ordering::SeqCst), 1);

        for mutator in mutators.iter() {
            assert!(mutator.wait_for_progress(Duration::from_secs(5)));
        }
        assert_eq!(flipped.load(Ordering::SeqCst), 3);
        for (i, mutator) in mutators.iter().enumerate() {
            assert_eq!(mutator.thread().roots(), vec![ObjectRef::new(0x100 * (i + 1) + 1).unwrap()]);
            assert!(!mutator.thread().has_flip_function());
        }
    }

    #[test]
    fn visit_roots_of_suspended_threads_only() {
        let list = new_list(test_options());
        let mutators = spawn_n(&list, 2);
        mutators[0].thread().add_root(ObjectRef::new(0x10).unwrap());
        mutators[1].thread().add_root(ObjectRef::new(0x20).unwrap());
        let held = mutators[1].thread().clone();
        list.suspend_thread_by_thread_id(None, held.id(), SuspendReason::Internal)
            .unwrap();

        let mut seen = Vec::new();
        list.visit_roots_for_suspended_threads(None, &mut |root: &mut ObjectRef, _| seen.push(*root));
        assert_eq!(seen, vec![ObjectRef::new(0x20).unwrap()]);
        assert_eq!(held.suspend_count(), 1);
        assert!(list.resume(&held, SuspendReason::Internal));

        let mut all = 0;
        list.visit_roots(&mut |_: &mut ObjectRef, _| all += 1);
        assert_eq!(all, 2);
    }

    #[test]
    #[should_panic(expected = "Thread not suspended")]
    fn unresponsive_thread_is_fatal() {
        let list = new_list(
            test_options()
                .with_thread_suspend_timeout(Duration::from_millis(100))
                .with_max_suspend_retries(10),
        );
        let _stuck = MutatorThread::spawn_stuck(&list, "stuck");
        list.suspend_all(None, "timeout", false);
    }

    #[test]
    #[should_panic(expected = "called by Runnable thread")]
    fn runnable_requester_is_fatal() {
        let list = new_list(test_options());
        let thread = Arc::new(Thread::new(list.alloc_thread_id(), "main", false, None, list.locks().clone()));
        list.register(&thread);
        let _soa = ScopedObjectAccess::new(&thread);
        list.suspend_all(Some(&thread), "self", false);
    }

    #[test]
    fn shutdown_waits_for_non_daemons_and_parks_daemons() {
        let list = new_list(test_options());
        let daemon = MutatorThread::spawn(&list, "daemon", true);
        let worker = MutatorThread::spawn(&list, "worker", false);
        assert!(daemon.wait_for_progress(Duration::from_secs(5)));

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(worker);
        });
        list.shut_down(None);
        stopper.join().unwrap();

        assert_eq!(list.size(), 1);
        assert!(daemon.thread().is_suspended());
        assert!(!list.start_thread_birth());
        assert!(list.dump().contains("daemon"));
        daemon.leak();
    }

    #[test]
    #[should_panic(expected = "Unsuspended thread")]
    fn running_thread_fails_suspension_assertion() {
        let list = new_list(test_options());
        let mutator = MutatorThread::spawn(&list, "running", false);
        assert!(mutator.wait_for_progress(Duration::from_secs(5)));
        list.assert_other_threads_are_suspended(None);
    }

    #[test]
    #[should_panic(expected = "outside 1..=2")]
    fn releasing_out_of_range_thread_id_is_fatal() {
        let list = new_list(test_options().with_max_thread_ids(2));
        list.release_thread_id(ThreadId(3));
    }

    #[test]
    fn resume_all_from_another_unattached_thread_is_fatal() {
        let list = new_list(test_options());
        list.suspend_all(None, "owner", false);

        let other = list.clone();
        let result = std::thread::spawn(move || other.resume_all(None)).join();
        assert!(result.is_err());
        assert!(list.locks().mutator.is_exclusive_held());

        list.resume_all(None);
        assert!(!list.locks().mutator.is_exclusive_held());
    }

    #[test]
    fn gc_marking_reaches_current_and_new_threads() {
        let list = new_list(test_options());
        let early = Arc::new(Thread::new(list.alloc_thread_id(), "early", false, None, list.locks().clone()));
        list.register(&early);
        assert!(!early.is_gc_marking());

        list.set_gc_marking(true);
        assert!(early.is_gc_marking());
        let late = Arc::new(Thread::new(list.alloc_thread_id(), "late", false, None, list.locks().clone()));
        list.register(&late);
        assert!(late.is_gc_marking());

        list.set_gc_marking(false);
        assert!(!early.is_gc_marking() && !late.is_gc_marking());
        list.unregister(&early);
        list.unregister(&late);
    }

    #[test]
    fn empty_checkpoint_wakes_runnable_waiter() {
        let list = new_list(
            test_options()
                .with_empty_checkpoint_periodic_timeout(Duration::from_secs(2))
                .with_empty_checkpoint_total_timeout(Duration::from_secs(20)),
        );
        let monitor = Monitor::new_registered(&list.locks().wakeups, false);
        let waiting = Arc::new(AtomicBool::new(false));

        let waiter = {
            let list = list.clone();
            let monitor = monitor.clone();
            let waiting = waiting.clone();
            std::thread::spawn(move || {
                let thread = Arc::new(Thread::new(list.alloc_thread_id(), "waiter", false, None, list.locks().clone()));
                list.register(&thread);
                thread.transition_from_suspended_to_runnable();
                let mut guard = monitor.lock_no_handshake();
                while !*guard {
                    waiting.store(true, Ordering::Release);
                    guard.wait_runnable(&thread);
                }
                drop(guard);
                thread.transition_from_runnable_to_suspended(ThreadState::Native);
                list.unregister(&thread);
            })
        };

        while !waiting.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        // the waiter released the monitor inside its wait
        drop(monitor.lock_no_handshake());

        let start = Instant::now();
        list.run_empty_checkpoint(None);
        assert!(start.elapsed() < Duration::from_secs(1));

        *monitor.lock_no_handshake() = true;
        monitor.notify_all();
        waiter.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "empty checkpoint timed out")]
    fn unresponsive_thread_fails_empty_checkpoint() {
        let list = new_list(
            test_options()
                .with_empty_checkpoint_periodic_timeout(Duration::from_millis(10))
                .with_empty_checkpoint_total_timeout(Duration::from_millis(50)),
        );
        let _stuck = MutatorThread::spawn_stuck(&list, "stuck");
        list.run_empty_checkpoint(None);
    }
}
