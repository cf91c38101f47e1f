use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    fatal,
    runtime::roots::{ObjectRef, RootInfo, RootKind, RootVisitor},
    sync::{
        barrier::SuspendBarrier,
        locks::{Locks, SuspendCountGuard},
    },
    utils::os_thread_id,
};

pub mod stack;

use stack::ManagedStack;

/// Small integer id of an attached thread. Id 0 is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ThreadId(pub u16);

impl ThreadId {
    pub const INVALID: ThreadId = ThreadId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread has exited.
    Terminated = 0,
    /// Thread is running managed code and holds a share of the mutator lock.
    Runnable = 1,
    TimedWaiting = 2,
    Sleeping = 3,
    /// Blocked on a monitor.
    Blocked = 4,
    /// Waiting on a monitor.
    Waiting = 5,
    WaitingForGcToComplete = 6,
    WaitingPerformingGc = 7,
    WaitingForCheckPointsToRun = 8,
    WaitingForDebuggerSuspension = 9,
    WaitingForGcThreadFlip = 10,
    /// Stopped at a suspend check.
    Suspended = 11,
    /// Thread is being attached.
    Starting = 12,
    /// Running native code; does not touch managed state.
    Native = 13,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Terminated,
            1 => ThreadState::Runnable,
            2 => ThreadState::TimedWaiting,
            3 => ThreadState::Sleeping,
            4 => ThreadState::Blocked,
            5 => ThreadState::Waiting,
            6 => ThreadState::WaitingForGcToComplete,
            7 => ThreadState::WaitingPerformingGc,
            8 => ThreadState::WaitingForCheckPointsToRun,
            9 => ThreadState::WaitingForDebuggerSuspension,
            10 => ThreadState::WaitingForGcThreadFlip,
            11 => ThreadState::Suspended,
            12 => ThreadState::Starting,
            13 => ThreadState::Native,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    pub fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Runnable)
    }
}

bitflags! {
    /// Request and status bits packed above the state byte of `state_and_flags`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Suspend count is non-zero.
        const SUSPEND_REQUEST = 1 << 8;
        /// A checkpoint closure is queued.
        const CHECKPOINT_REQUEST = 1 << 9;
        /// The thread must pass the empty checkpoint barrier.
        const EMPTY_CHECKPOINT_REQUEST = 1 << 10;
        /// A suspend barrier waits for this thread.
        const ACTIVE_SUSPEND_BARRIER = 1 << 11;
        /// A flip function was installed and not started yet.
        const PENDING_FLIP_FUNCTION = 1 << 12;
        /// Some thread is running this thread's flip function.
        const RUNNING_FLIP_FUNCTION = 1 << 13;
    }
}

const STATE_MASK: u32 = 0xff;

#[derive(Clone, Copy, PartialEq, Eq)]
struct StateAndFlags(u32);

impl StateAndFlags {
    fn new(state: ThreadState) -> Self {
        Self(state as u32)
    }

    fn state(self) -> ThreadState {
        ThreadState::from((self.0 & STATE_MASK) as u8)
    }

    fn flags(self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.0 & !STATE_MASK)
    }

    fn is_flag_set(self, flag: ThreadFlags) -> bool {
        self.flags().contains(flag)
    }

    fn is_any_of_flags_set(self, flags: ThreadFlags) -> bool {
        self.flags().intersects(flags)
    }

    fn with_state(self, state: ThreadState) -> Self {
        Self((self.0 & !STATE_MASK) | state as u32)
    }

    fn with_flag(self, flag: ThreadFlags) -> Self {
        Self(self.0 | flag.bits())
    }

    fn without_flag(self, flag: ThreadFlags) -> Self {
        Self(self.0 & !flag.bits())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SuspendReason {
    /// Suspension by the runtime itself (GC, instrumentation, ...).
    Internal,
    /// Suspension requested on behalf of user code, e.g. a debugger.
    ForUserCode,
}

/// Work that runs on behalf of a thread, either by the thread itself at a
/// safepoint or by another thread while it is suspended.
pub trait Closure: Send + Sync {
    fn run(&self, thread: &Thread);
}

impl<F: Fn(&Thread) + Send + Sync> Closure for F {
    fn run(&self, thread: &Thread) {
        self(thread)
    }
}

#[derive(Default)]
struct SuspendBarriers {
    suspend_all: Option<Arc<SuspendBarrier>>,
    suspend1: Vec<Arc<SuspendBarrier>>,
}

impl SuspendBarriers {
    fn is_empty(&self) -> bool {
        self.suspend_all.is_none() && self.suspend1.is_empty()
    }
}

pub struct Thread {
    id: ThreadId,
    tid: u64,
    name: String,
    daemon: bool,
    peer: Mutex<Option<ObjectRef>>,
    state_and_flags: AtomicU32,
    /// Modified only while holding the suspend count lock.
    suspend_count: AtomicI32,
    /// Part of `suspend_count` owed to user code suspensions.
    user_code_suspend_count: AtomicI32,
    /// Leaf lock, ordered after the suspend count lock.
    barriers: Mutex<SuspendBarriers>,
    checkpoints: Mutex<VecDeque<Arc<dyn Closure>>>,
    flip_function: Mutex<Option<Arc<dyn Closure>>>,
    flip_cond: Condvar,
    stack: Mutex<ManagedStack>,
    roots: Mutex<Vec<ObjectRef>>,
    deopt_check_required: AtomicBool,
    is_gc_marking: AtomicBool,
    force_interpreter_count: AtomicU32,
    transitioning_to_runnable: AtomicBool,
    index_in_thread_list: AtomicUsize,
    locks: Arc<Locks>,
}

impl Thread {
    /// Create a thread object for the calling OS thread. It starts in [`ThreadState::Native`].
    pub fn new(
        id: ThreadId,
        name: &str,
        daemon: bool,
        peer: Option<ObjectRef>,
        locks: Arc<Locks>,
    ) -> Self {
        Self {
            id,
            tid: os_thread_id(),
            name: name.to_owned(),
            daemon,
            peer: Mutex::new(peer),
            state_and_flags: AtomicU32::new(StateAndFlags::new(ThreadState::Native).0),
            suspend_count: AtomicI32::new(0),
            user_code_suspend_count: AtomicI32::new(0),
            barriers: Mutex::new(SuspendBarriers::default()),
            checkpoints: Mutex::new(VecDeque::new()),
            flip_function: Mutex::new(None),
            flip_cond: Condvar::new(),
            stack: Mutex::new(ManagedStack::new()),
            roots: Mutex::new(Vec::new()),
            deopt_check_required: AtomicBool::new(false),
            is_gc_marking: AtomicBool::new(false),
            force_interpreter_count: AtomicU32::new(0),
            transitioning_to_runnable: AtomicBool::new(false),
            index_in_thread_list: AtomicUsize::new(usize::MAX),
            locks,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// OS thread id of the thread that created this object.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn peer(&self) -> Option<ObjectRef> {
        *self.peer.lock()
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub(crate) fn set_index_in_thread_list(&self, ix: usize) {
        self.index_in_thread_list.store(ix, Ordering::Relaxed);
    }

    pub(crate) fn index_in_thread_list(&self) -> usize {
        self.index_in_thread_list.load(Ordering::Relaxed)
    }

    fn load(&self) -> StateAndFlags {
        StateAndFlags(self.state_and_flags.load(Ordering::Acquire))
    }

    fn cas_weak(&self, old: StateAndFlags, new: StateAndFlags) -> bool {
        self.state_and_flags
            .compare_exchange_weak(old.0, new.0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn state(&self) -> ThreadState {
        self.load().state()
    }

    pub fn flags(&self) -> ThreadFlags {
        self.load().flags()
    }

    pub fn read_flag(&self, flag: ThreadFlags) -> bool {
        self.load().is_flag_set(flag)
    }

    fn atomic_set_flag(&self, flag: ThreadFlags) {
        self.state_and_flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn atomic_clear_flag(&self, flag: ThreadFlags) {
        self.state_and_flags
            .fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Change between two non-Runnable states.
    pub fn set_state(&self, new_state: ThreadState) -> ThreadState {
        assert!(
            !new_state.is_runnable(),
            "use transition_from_suspended_to_runnable to become Runnable"
        );
        loop {
            let old = self.load();
            assert!(
                !old.state().is_runnable(),
                "thread {} must leave Runnable through a transition",
                self.id
            );
            if self.cas_weak(old, old.with_state(new_state)) {
                return old.state();
            }
        }
    }

    pub fn suspend_count(&self) -> i32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    pub fn user_code_suspend_count(&self) -> i32 {
        self.user_code_suspend_count.load(Ordering::Acquire)
    }

    /// Suspended means: not Runnable, and asked to stay that way.
    pub fn is_suspended(&self) -> bool {
        let state_and_flags = self.load();
        !state_and_flags.state().is_runnable()
            && state_and_flags.is_flag_set(ThreadFlags::SUSPEND_REQUEST)
    }

    pub fn is_transitioning_to_runnable(&self) -> bool {
        self.transitioning_to_runnable.load(Ordering::Acquire)
    }

    /// Request that this thread stops, optionally registering barriers it must pass.
    pub fn increment_suspend_count(
        &self,
        guard: &SuspendCountGuard<'_>,
        suspend_all_barrier: Option<Arc<SuspendBarrier>>,
        suspend1_barrier: Option<Arc<SuspendBarrier>>,
        reason: SuspendReason,
    ) {
        debug_assert!(self.locks.owns(guard));

        if reason == SuspendReason::ForUserCode {
            self.user_code_suspend_count
                .fetch_add(1, Ordering::AcqRel);
        }
        self.suspend_count.fetch_add(1, Ordering::AcqRel);

        let mut flags = ThreadFlags::SUSPEND_REQUEST;
        if suspend_all_barrier.is_some() || suspend1_barrier.is_some() {
            let mut barriers = self.barriers.lock();
            if let Some(barrier) = suspend_all_barrier {
                assert!(
                    barriers.suspend_all.is_none(),
                    "thread {} already has a suspend-all barrier",
                    self.id
                );
                barriers.suspend_all = Some(barrier);
            }
            if let Some(barrier) = suspend1_barrier {
                barriers.suspend1.push(barrier);
            }
            flags |= ThreadFlags::ACTIVE_SUSPEND_BARRIER;
        }
        self.atomic_set_flag(flags);
    }

    pub fn decrement_suspend_count(&self, guard: &SuspendCountGuard<'_>, reason: SuspendReason) {
        debug_assert!(self.locks.owns(guard));

        if self.suspend_count() <= 0 {
            fatal!("suspend count underflow for thread {}", self.dump());
        }
        if reason == SuspendReason::ForUserCode {
            if self.user_code_suspend_count() <= 0 {
                fatal!("user code suspend count underflow for thread {}", self.dump());
            }
            self.user_code_suspend_count
                .fetch_sub(1, Ordering::AcqRel);
        }

        if self.suspend_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.atomic_clear_flag(ThreadFlags::SUSPEND_REQUEST);
        }
    }

    /// Drop the suspend-all barrier after the requester passed it on our behalf.
    pub fn clear_suspend_all_barrier(&self, guard: &SuspendCountGuard<'_>) {
        debug_assert!(self.locks.owns(guard));
        let mut barriers = self.barriers.lock();
        barriers.suspend_all = None;
        if barriers.is_empty() {
            self.atomic_clear_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
        }
    }

    /// Drop `barrier` from our one-shot barriers without passing it.
    pub fn remove_suspend1_barrier(&self, guard: &SuspendCountGuard<'_>, barrier: &Arc<SuspendBarrier>) {
        debug_assert!(self.locks.owns(guard));
        let mut barriers = self.barriers.lock();
        barriers
            .suspend1
            .retain(|installed| !Arc::ptr_eq(installed, barrier));
        if barriers.is_empty() {
            self.atomic_clear_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
        }
    }

    pub fn has_active_suspend_barrier(&self) -> bool {
        !self.barriers.lock().is_empty()
    }

    /// Pass every barrier installed on this thread. Called once the thread is no longer Runnable.
    fn pass_active_suspend_barriers(&self) {
        let barriers = {
            let _guard = self.locks.lock_suspend_count();
            let mut installed = self.barriers.lock();
            let barriers = std::mem::take(&mut *installed);
            self.atomic_clear_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
            barriers
        };

        if let Some(barrier) = barriers.suspend_all {
            barrier.decrement();
        }
        for barrier in barriers.suspend1 {
            barrier.decrement();
        }
    }

    /// Queue `function` to run at this thread's next safepoint.
    ///
    /// Fails unless the thread is Runnable.
    pub fn request_checkpoint(&self, guard: &SuspendCountGuard<'_>, function: Arc<dyn Closure>) -> bool {
        debug_assert!(self.locks.owns(guard));
        let old = self.load();
        if !old.state().is_runnable() {
            return false;
        }

        let new = old.with_flag(ThreadFlags::CHECKPOINT_REQUEST);
        if !self.cas_weak(old, new) {
            return false;
        }

        // The thread takes the suspend count lock before dequeuing.
        self.checkpoints.lock().push_back(function);
        true
    }

    pub fn request_empty_checkpoint(&self) -> bool {
        let old = self.load();
        if !old.state().is_runnable() {
            return false;
        }
        self.cas_weak(old, old.with_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST))
    }

    fn run_checkpoint_function(&self) {
        let checkpoint = {
            let _guard = self.locks.lock_suspend_count();
            let mut queue = self.checkpoints.lock();
            let checkpoint = queue.pop_front();
            if queue.is_empty() {
                self.atomic_clear_flag(ThreadFlags::CHECKPOINT_REQUEST);
            }
            checkpoint
        };

        if let Some(checkpoint) = checkpoint {
            log::trace!(target: "vmcoord::threads", "thread {} runs checkpoint", self.id);
            checkpoint.run(self);
        }
    }

    fn run_empty_checkpoint(&self) {
        self.atomic_clear_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST);
        self.locks.empty_checkpoint_barrier.pass();
    }

    /// Answer a pending empty checkpoint while blocked in Runnable state.
    pub fn check_empty_checkpoint_from_wait(&self) {
        let state_and_flags = self.load();
        if state_and_flags.state().is_runnable()
            && state_and_flags.is_flag_set(ThreadFlags::EMPTY_CHECKPOINT_REQUEST)
        {
            self.run_empty_checkpoint();
        }
    }

    /// Safepoint poll. Must be called by the thread itself while Runnable.
    pub fn check_suspend(&self) {
        loop {
            let state_and_flags = self.load();
            if state_and_flags.is_flag_set(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if state_and_flags.is_flag_set(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else if state_and_flags.is_flag_set(ThreadFlags::SUSPEND_REQUEST) {
                self.full_suspend_check();
            } else {
                break;
            }
        }
    }

    /// Stop in [`ThreadState::Suspended`] until every suspend request is released.
    pub fn full_suspend_check(&self) {
        let _suspension = ScopedThreadSuspension::new(self, ThreadState::Suspended);
    }

    /// Leave Runnable, running pending checkpoints first, and release the share
    /// of the mutator lock.
    pub fn transition_from_runnable_to_suspended(&self, new_state: ThreadState) {
        debug_assert!(!new_state.is_runnable());
        loop {
            let old = self.load();
            if !old.state().is_runnable() {
                fatal!(
                    "thread {} leaves Runnable while in state {:?}",
                    self.id,
                    old.state()
                );
            }

            if old.is_flag_set(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
                continue;
            }

            if old.is_flag_set(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
                continue;
            }

            if self.cas_weak(old, old.with_state(new_state)) {
                break;
            }
        }

        unsafe { self.locks.mutator.shared_unlock() };

        if self.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
            self.pass_active_suspend_barriers();
        }
    }

    /// Become Runnable without blocking. Fails if any request is pending.
    pub fn try_transition_to_runnable(&self) -> bool {
        let old = self.load();
        if old.state().is_runnable() {
            return true;
        }
        let blocking = ThreadFlags::all();
        if old.is_any_of_flags_set(blocking) {
            return false;
        }
        if self.cas_weak(old, old.with_state(ThreadState::Runnable)) {
            self.locks.mutator.shared_lock();
            true
        } else {
            false
        }
    }

    /// Become Runnable, waiting while a suspend request is pending. Returns the previous state.
    pub fn transition_from_suspended_to_runnable(&self) -> ThreadState {
        let old_state = self.state();
        debug_assert!(!old_state.is_runnable());

        let checked = ThreadFlags::all();
        loop {
            let old = self.load();
            if !old.is_any_of_flags_set(checked) {
                if self.cas_weak(old, old.with_state(ThreadState::Runnable)) {
                    self.locks.mutator.shared_lock();
                    break;
                }
            } else if old.is_flag_set(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
                self.pass_active_suspend_barriers();
            } else if old.is_any_of_flags_set(
                ThreadFlags::CHECKPOINT_REQUEST | ThreadFlags::EMPTY_CHECKPOINT_REQUEST,
            ) {
                fatal!(
                    "transitioning to Runnable with checkpoint flags {:?}, thread {}",
                    old.flags(),
                    self.id
                );
            } else if old.is_flag_set(ThreadFlags::SUSPEND_REQUEST) {
                let mut guard = self.locks.lock_suspend_count();
                self.transitioning_to_runnable
                    .store(true, Ordering::Release);
                while self.read_flag(ThreadFlags::SUSPEND_REQUEST) {
                    self.locks.resume_cond.wait(&mut guard);
                }
                self.transitioning_to_runnable
                    .store(false, Ordering::Release);
            } else if old.is_flag_set(ThreadFlags::RUNNING_FLIP_FUNCTION) {
                self.wait_for_flip_function();
            } else {
                debug_assert!(old.is_flag_set(ThreadFlags::PENDING_FLIP_FUNCTION));
                // Nobody else runs the flip function of a thread that is not suspended.
                let new = old
                    .with_state(ThreadState::Runnable)
                    .without_flag(ThreadFlags::PENDING_FLIP_FUNCTION)
                    .with_flag(ThreadFlags::RUNNING_FLIP_FUNCTION);
                if self.cas_weak(old, new) {
                    self.locks.mutator.shared_lock();
                    self.run_flip_function();
                    break;
                }
            }
        }

        old_state
    }

    /// Install the root flip closure. The thread or another thread runs it exactly once.
    pub fn set_flip_function(&self, function: Arc<dyn Closure>) {
        let mut slot = self.flip_function.lock();
        assert!(slot.is_none(), "thread {} already has a flip function", self.id);
        *slot = Some(function);
        self.atomic_set_flag(ThreadFlags::PENDING_FLIP_FUNCTION);
    }

    pub fn has_flip_function(&self) -> bool {
        self.load().is_any_of_flags_set(
            ThreadFlags::PENDING_FLIP_FUNCTION | ThreadFlags::RUNNING_FLIP_FUNCTION,
        )
    }

    /// Claim and run a pending flip function on this thread's behalf.
    ///
    /// Returns `false` if there was nothing to run. Waits if another thread is
    /// already running it.
    pub fn ensure_flip_function_started(&self) -> bool {
        loop {
            let old = self.load();
            if old.is_flag_set(ThreadFlags::RUNNING_FLIP_FUNCTION) {
                self.wait_for_flip_function();
                return false;
            }
            if !old.is_flag_set(ThreadFlags::PENDING_FLIP_FUNCTION) {
                return false;
            }
            let new = old
                .without_flag(ThreadFlags::PENDING_FLIP_FUNCTION)
                .with_flag(ThreadFlags::RUNNING_FLIP_FUNCTION);
            if self.cas_weak(old, new) {
                self.run_flip_function();
                return true;
            }
        }
    }

    fn run_flip_function(&self) {
        let function = self.flip_function.lock().take();
        if let Some(function) = function {
            function.run(self);
        }

        let _slot = self.flip_function.lock();
        self.atomic_clear_flag(ThreadFlags::RUNNING_FLIP_FUNCTION);
        self.flip_cond.notify_all();
    }

    pub fn wait_for_flip_function(&self) {
        let mut slot = self.flip_function.lock();
        while self.read_flag(ThreadFlags::RUNNING_FLIP_FUNCTION) {
            self.flip_cond.wait(&mut slot);
        }
    }

    pub fn stack(&self) -> MutexGuard<'_, ManagedStack> {
        self.stack.lock()
    }

    pub fn add_root(&self, root: ObjectRef) {
        self.roots.lock().push(root);
    }

    pub fn roots(&self) -> Vec<ObjectRef> {
        self.roots.lock().clone()
    }

    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        if let Some(peer) = self.peer.lock().as_mut() {
            visitor.visit_root(
                peer,
                RootInfo {
                    kind: RootKind::ThreadObject,
                    thread: self.id,
                },
            );
        }
        for root in self.roots.lock().iter_mut() {
            visitor.visit_root(
                root,
                RootInfo {
                    kind: RootKind::ThreadLocal,
                    thread: self.id,
                },
            );
        }
    }

    pub fn is_deopt_check_required(&self) -> bool {
        self.deopt_check_required.load(Ordering::Acquire)
    }

    pub fn set_deopt_check_required(&self, value: bool) {
        self.deopt_check_required.store(value, Ordering::Release);
    }

    /// Whether the concurrent collector is marking; copied from the thread list on register.
    pub fn is_gc_marking(&self) -> bool {
        self.is_gc_marking.load(Ordering::Acquire)
    }

    pub fn set_is_gc_marking(&self, value: bool) {
        self.is_gc_marking.store(value, Ordering::Release);
    }

    pub fn is_force_interpreter(&self) -> bool {
        self.force_interpreter_count.load(Ordering::Acquire) != 0
    }

    pub fn increment_force_interpreter_count(&self) -> u32 {
        self.force_interpreter_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decrement_force_interpreter_count(&self) -> u32 {
        let prev = self.force_interpreter_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "force interpreter count underflow on thread {}", self.id);
        prev - 1
    }

    pub fn dump(&self) -> String {
        let state_and_flags = self.load();
        format!(
            "\"{}\"{} id={} tid={} state={:?} flags={:?} suspend_count={} user_code_suspend_count={} stack_depth={}",
            self.name,
            if self.daemon { " daemon" } else { "" },
            self.id,
            self.tid,
            state_and_flags.state(),
            state_and_flags.flags(),
            self.suspend_count(),
            self.user_code_suspend_count(),
            self.stack.try_lock().map_or(0, |stack| stack.depth()),
        )
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread[{},\"{}\"]", self.id, self.name)
    }
}

/// Leaves Runnable for the scope of the guard.
pub struct ScopedThreadSuspension<'a> {
    thread: &'a Thread,
}

impl<'a> ScopedThreadSuspension<'a> {
    pub fn new(thread: &'a Thread, state: ThreadState) -> Self {
        thread.transition_from_runnable_to_suspended(state);
        Self { thread }
    }
}

impl Drop for ScopedThreadSuspension<'_> {
    fn drop(&mut self) {
        self.thread.transition_from_suspended_to_runnable();
    }
}

/// Becomes Runnable for the scope of the guard and restores the previous state after.
pub struct ScopedObjectAccess<'a> {
    thread: &'a Thread,
    old_state: ThreadState,
}

impl<'a> ScopedObjectAccess<'a> {
    pub fn new(thread: &'a Thread) -> Self {
        let old_state = thread.transition_from_suspended_to_runnable();
        Self { thread, old_state }
    }
}

impl Drop for ScopedObjectAccess<'_> {
    fn drop(&mut self) {
        self.thread
            .transition_from_runnable_to_suspended(self.old_state);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, thread, time::Duration};

    use super::*;

    fn new_thread(locks: &Arc<Locks>, id: u16) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId(id), "test", false, None, locks.clone()))
    }

    #[test]
    fn state_word_packing() {
        let word = StateAndFlags::new(ThreadState::Native)
            .with_flag(ThreadFlags::SUSPEND_REQUEST)
            .with_state(ThreadState::Runnable);
        assert_eq!(word.state(), ThreadState::Runnable);
        assert!(word.is_flag_set(ThreadFlags::SUSPEND_REQUEST));
        assert!(!word
            .without_flag(ThreadFlags::SUSPEND_REQUEST)
            .is_flag_set(ThreadFlags::SUSPEND_REQUEST));
    }

    #[test]
    fn runnable_holds_mutator_share() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);
        assert_eq!(thread.state(), ThreadState::Native);

        {
            let _soa = ScopedObjectAccess::new(&thread);
            assert_eq!(thread.state(), ThreadState::Runnable);
            assert_eq!(locks.mutator.shared_holders(), 1);
        }
        assert_eq!(thread.state(), ThreadState::Native);
        assert_eq!(locks.mutator.shared_holders(), 0);
    }

    #[test]
    fn suspend_count_controls_suspend_request() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);

        let guard = locks.lock_suspend_count();
        thread.increment_suspend_count(&guard, None, None, SuspendReason::Internal);
        thread.increment_suspend_count(&guard, None, None, SuspendReason::ForUserCode);
        assert!(thread.is_suspended());
        assert_eq!(thread.suspend_count(), 2);
        assert_eq!(thread.user_code_suspend_count(), 1);

        thread.decrement_suspend_count(&guard, SuspendReason::ForUserCode);
        assert!(thread.is_suspended());
        thread.decrement_suspend_count(&guard, SuspendReason::Internal);
        assert!(!thread.is_suspended());
        assert!(!thread.read_flag(ThreadFlags::SUSPEND_REQUEST));
    }

    #[test]
    #[should_panic(expected = "suspend count underflow")]
    fn suspend_count_underflow_is_fatal() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);
        let guard = locks.lock_suspend_count();
        thread.decrement_suspend_count(&guard, SuspendReason::Internal);
    }

    #[test]
    fn checkpoint_runs_before_leaving_runnable() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);
        let ran = Arc::new(AtomicUsize::new(0));

        let _soa = ScopedObjectAccess::new(&thread);
        {
            let guard = locks.lock_suspend_count();
            let ran = ran.clone();
            assert!(thread.request_checkpoint(
                &guard,
                Arc::new(move |_: &Thread| {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
            ));
        }

        {
            let _suspension = ScopedThreadSuspension::new(&thread, ThreadState::Native);
            assert_eq!(ran.load(Ordering::SeqCst), 1);
            // not Runnable: checkpoints are refused
            let guard = locks.lock_suspend_count();
            assert!(!thread.request_checkpoint(&guard, Arc::new(|_: &Thread| {})));
        }
        assert!(!thread.read_flag(ThreadFlags::CHECKPOINT_REQUEST));
    }

    #[test]
    fn suspended_thread_passes_barrier_and_waits_for_resume() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);
        let barrier = Arc::new(SuspendBarrier::new(1));

        let worker = {
            let thread = thread.clone();
            thread::spawn(move || {
                let _soa = ScopedObjectAccess::new(&thread);
                loop {
                    thread.check_suspend();
                    if thread.read_flag(ThreadFlags::SUSPEND_REQUEST) {
                        continue;
                    }
                    if thread.peer().is_some() {
                        break;
                    }
                    thread::yield_now();
                }
            })
        };

        // wait until the worker is Runnable
        while thread.state() != ThreadState::Runnable {
            thread::yield_now();
        }

        {
            let guard = locks.lock_suspend_count();
            thread.increment_suspend_count(&guard, None, Some(barrier.clone()), SuspendReason::Internal);
        }
        assert!(barrier.wait(Duration::from_secs(10)));
        assert!(thread.is_suspended());
        assert!(!thread.has_active_suspend_barrier());

        *thread.peer.lock() = ObjectRef::new(0x10);
        {
            let guard = locks.lock_suspend_count();
            thread.decrement_suspend_count(&guard, SuspendReason::Internal);
            locks.broadcast_resume(&guard);
        }
        worker.join().unwrap();
    }

    #[test]
    fn flip_function_runs_once() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            thread.set_flip_function(Arc::new(move |_: &Thread| {
                runs.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(thread.has_flip_function());
        assert!(thread.ensure_flip_function_started());
        assert!(!thread.ensure_flip_function_started());
        assert!(!thread.has_flip_function());

        thread.set_flip_function(Arc::new({
            let runs = runs.clone();
            move |_: &Thread| {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        }));
        // the thread runs its own flip when becoming Runnable
        let _soa = ScopedObjectAccess::new(&thread);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!thread.has_flip_function());
    }

    #[test]
    fn suspend_all_barrier_stays_until_cleared() {
        let locks = Arc::new(Locks::new());
        let thread = new_thread(&locks, 1);
        let barrier = Arc::new(SuspendBarrier::new(1));

        let guard = locks.lock_suspend_count();
        thread.increment_suspend_count(&guard, Some(barrier.clone()), None, SuspendReason::Internal);
        assert!(thread.has_active_suspend_barrier());
        assert!(thread.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER));

        // the requester passes the barrier for a thread that is already stopped
        barrier.decrement();
        thread.clear_suspend_all_barrier(&guard);
        assert!(!thread.has_active_suspend_barrier());
        assert!(!thread.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER));
        assert!(barrier.wait(Duration::from_millis(10)));
        thread.decrement_suspend_count(&guard, SuspendReason::Internal);
    }
}
