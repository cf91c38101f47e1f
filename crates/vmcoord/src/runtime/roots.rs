use std::{fmt, num::NonZeroUsize};

use super::threads::ThreadId;

/// Opaque reference to a managed object. The coordination core never looks inside.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    pub const fn new(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    pub const fn raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.raw())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RootKind {
    /// The managed peer of a thread.
    ThreadObject,
    /// A reference held in thread-local storage or a frame.
    ThreadLocal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RootInfo {
    pub kind: RootKind,
    pub thread: ThreadId,
}

/// GC callback invoked on every root. Visitors may update the reference in place.
pub trait RootVisitor {
    fn visit_root(&mut self, root: &mut ObjectRef, info: RootInfo);
}

impl<F: FnMut(&mut ObjectRef, RootInfo)> RootVisitor for F {
    fn visit_root(&mut self, root: &mut ObjectRef, info: RootInfo) {
        self(root, info)
    }
}
