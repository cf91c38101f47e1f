//! Instrumentation listeners and the table events are dispatched through.
//!
//! Registration replaces the whole table; dispatch works on a snapshot, so a
//! listener removed while an event is being delivered is still called for that
//! event but never for a later one.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::runtime::{class_linker::Method, roots::ObjectRef, threads::Thread};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct InstrumentationEvents: u32 {
        const METHOD_ENTERED = 0x1;
        const METHOD_EXITED = 0x2;
        const METHOD_UNWIND = 0x4;
        const DEX_PC_MOVED = 0x8;
        const FIELD_READ = 0x10;
        const FIELD_WRITTEN = 0x20;
        const EXCEPTION_THROWN = 0x40;
        const BRANCH = 0x80;
        const WATCHED_FRAME_POP = 0x200;
        const EXCEPTION_HANDLED = 0x400;
    }
}

/// Dex pc reported when the exact location is unknown.
pub const NO_DEX_PC: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FieldId(pub u32);

/// A value flowing through a method return or a field write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventValue {
    Void,
    Primitive(u64),
    Reference(Option<ObjectRef>),
}

/// Receives instrumentation events. Every callback defaults to doing nothing, so a
/// listener only implements the events it registered for.
#[allow(unused_variables)]
pub trait InstrumentationListener: Send + Sync {
    fn method_entered(&self, thread: &Thread, method: &Method) {}

    fn method_exited(&self, thread: &Thread, method: &Method, return_value: EventValue) {}

    /// A frame of `method` was popped by an exception.
    fn method_unwind(&self, thread: &Thread, method: &Method, dex_pc: u32) {}

    fn dex_pc_moved(&self, thread: &Thread, this: Option<ObjectRef>, method: &Method, new_dex_pc: u32) {}

    fn field_read(&self, thread: &Thread, this: Option<ObjectRef>, method: &Method, dex_pc: u32, field: FieldId) {}

    fn field_written(
        &self,
        thread: &Thread,
        this: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
        value: EventValue,
    ) {
    }

    fn exception_thrown(&self, thread: &Thread, exception: ObjectRef) {}

    fn exception_handled(&self, thread: &Thread, exception: ObjectRef) {}

    fn branch(&self, thread: &Thread, method: &Method, dex_pc: u32, offset: i32) {}

    /// A frame that a debugger asked to watch is about to be popped.
    fn watched_frame_pop(&self, thread: &Thread, method: &Method, depth: usize) {}
}

const EVENT_SLOTS: usize = 11;

fn slot(event: InstrumentationEvents) -> usize {
    event.bits().trailing_zeros() as usize
}

fn same_listener(a: &Arc<dyn InstrumentationListener>, b: &Arc<dyn InstrumentationListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Clone, Default)]
pub struct ListenerSnapshot {
    lists: [Vec<Arc<dyn InstrumentationListener>>; EVENT_SLOTS],
}

impl ListenerSnapshot {
    /// Listeners of a single event kind, in registration order.
    pub fn listeners(&self, event: InstrumentationEvents) -> &[Arc<dyn InstrumentationListener>] {
        debug_assert_eq!(event.bits().count_ones(), 1);
        &self.lists[slot(event)]
    }

    fn events(&self) -> InstrumentationEvents {
        InstrumentationEvents::all()
            .iter()
            .filter(|event| !self.lists[slot(*event)].is_empty())
            .fold(InstrumentationEvents::empty(), |acc, event| acc | event)
    }
}

/// Copy-on-write table of listeners per event kind.
pub struct ListenerTable {
    snapshot: RwLock<Arc<ListenerSnapshot>>,
    /// Events with at least one listener, readable without the lock.
    present: AtomicU32,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(ListenerSnapshot::default())),
            present: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<ListenerSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn has(&self, event: InstrumentationEvents) -> bool {
        InstrumentationEvents::from_bits_retain(self.present.load(Ordering::Acquire)).intersects(event)
    }

    pub fn events(&self) -> InstrumentationEvents {
        InstrumentationEvents::from_bits_retain(self.present.load(Ordering::Acquire))
    }

    pub fn add(&self, listener: Arc<dyn InstrumentationListener>, events: InstrumentationEvents) {
        self.update(|snapshot| {
            for event in events.iter() {
                snapshot.lists[slot(event)].push(listener.clone());
            }
        });
    }

    /// Remove `listener` from the lists of `events`. Lists it was never added to are
    /// left alone.
    pub fn remove(&self, listener: &Arc<dyn InstrumentationListener>, events: InstrumentationEvents) {
        self.update(|snapshot| {
            for event in events.iter() {
                let list = &mut snapshot.lists[slot(event)];
                if let Some(ix) = list.iter().position(|l| same_listener(l, listener)) {
                    list.remove(ix);
                }
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut ListenerSnapshot)) {
        let mut current = self.snapshot.write();
        let mut next = ListenerSnapshot::clone(&current);
        f(&mut next);
        self.present.store(next.events().bits(), Ordering::Release);
        *current = Arc::new(next);
    }
}

impl Default for ListenerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl InstrumentationListener for Nop {}

    #[test]
    fn add_and_remove_track_present_events() {
        let table = ListenerTable::new();
        let a: Arc<dyn InstrumentationListener> = Arc::new(Nop);
        let b: Arc<dyn InstrumentationListener> = Arc::new(Nop);

        table.add(
            a.clone(),
            InstrumentationEvents::METHOD_ENTERED | InstrumentationEvents::METHOD_EXITED,
        );
        table.add(b.clone(), InstrumentationEvents::METHOD_ENTERED);
        assert!(table.has(InstrumentationEvents::METHOD_EXITED));
        assert!(!table.has(InstrumentationEvents::DEX_PC_MOVED));
        assert_eq!(
            table
                .snapshot()
                .listeners(InstrumentationEvents::METHOD_ENTERED)
                .len(),
            2
        );

        table.remove(&a, InstrumentationEvents::all());
        assert!(!table.has(InstrumentationEvents::METHOD_EXITED));
        assert!(table.has(InstrumentationEvents::METHOD_ENTERED));
        let snapshot = table.snapshot();
        let entered = snapshot.listeners(InstrumentationEvents::METHOD_ENTERED);
        assert_eq!(entered.len(), 1);
        assert!(same_listener(&entered[0], &b));
    }

    #[test]
    fn snapshot_survives_removal() {
        let table = ListenerTable::new();
        let a: Arc<dyn InstrumentationListener> = Arc::new(Nop);
        table.add(a.clone(), InstrumentationEvents::BRANCH);

        let before = table.snapshot();
        table.remove(&a, InstrumentationEvents::BRANCH);
        assert_eq!(before.listeners(InstrumentationEvents::BRANCH).len(), 1);
        assert!(table
            .snapshot()
            .listeners(InstrumentationEvents::BRANCH)
            .is_empty());
        assert_eq!(table.events(), InstrumentationEvents::empty());
    }

    #[test]
    fn slots_cover_every_event() {
        for event in InstrumentationEvents::all().iter() {
            assert!(slot(event) < EVENT_SLOTS);
        }
    }
}
