//! Compiled code as seen by the coordination core.
//!
//! The JIT and ahead-of-time compilers are external; this module only models
//! entrypoints and answers "whose code is this pc" style queries.

use std::{collections::BTreeMap, fmt};

use dashmap::DashMap;
use parking_lot::RwLock;

use super::class_linker::MethodId;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CodeAddr(pub usize);

/// Where a method dispatches to when invoked.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Entrypoint {
    /// Not set up yet.
    None,
    /// Run the method in the switch interpreter.
    InterpreterBridge,
    /// Stub calling native methods without compiled glue.
    GenericJniStub,
    /// Resolves the callee (and initializes its class) on first call.
    ResolutionStub,
    /// Fast template interpreter.
    Nterp,
    /// Fast template interpreter that checks class initialization on entry.
    NterpWithClinit,
    /// Dispatches proxy methods to their handler.
    ProxyInvokeHandler,
    /// Ahead-of-time or JIT compiled code.
    Compiled(CodeAddr),
}

impl Entrypoint {
    pub fn is_compiled(&self) -> bool {
        matches!(self, Entrypoint::Compiled(_))
    }

    pub fn can_handle_initialization_check(&self) -> bool {
        matches!(
            self,
            Entrypoint::ResolutionStub
                | Entrypoint::InterpreterBridge
                | Entrypoint::GenericJniStub
                | Entrypoint::NterpWithClinit
        )
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entrypoint::None => f.write_str("null"),
            Entrypoint::InterpreterBridge => f.write_str("interpreter"),
            Entrypoint::GenericJniStub => f.write_str("generic jni"),
            Entrypoint::ResolutionStub => f.write_str("resolution"),
            Entrypoint::Nterp => f.write_str("nterp"),
            Entrypoint::NterpWithClinit => f.write_str("nterp with clinit"),
            Entrypoint::ProxyInvokeHandler => f.write_str("proxy"),
            Entrypoint::Compiled(addr) => write!(f, "compiled {:#x}", addr.0),
        }
    }
}

/// Per-frame metadata of compiled code.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MethodHeader {
    /// The frame reserves a slot for the "should deoptimize" flag.
    pub has_should_deoptimize_flag: bool,
    pub is_nterp: bool,
    /// Compiled with entry/exit hook support.
    pub debuggable: bool,
    /// Frames of this code can be deoptimized at any call site.
    pub deoptimizable: bool,
}

/// Queries about compiled code answered by the code generation subsystem.
pub trait CodeCache: Send + Sync {
    /// Whether `pc` points into JIT compiled code.
    fn contains_pc(&self, pc: CodeAddr) -> bool;

    fn header_for(&self, pc: CodeAddr) -> Option<MethodHeader>;

    /// JIT code compiled before the method was first invoked.
    fn saved_entry_point_of_precompiled(&self, method: MethodId) -> Option<CodeAddr>;

    /// Whether a frame stopped at `pc` can be deoptimized asynchronously.
    fn is_async_deoptimizeable(&self, pc: CodeAddr) -> bool {
        self.header_for(pc)
            .is_some_and(|header| header.deoptimizable || header.debuggable)
    }
}

struct CodeRegion {
    end: usize,
    header: MethodHeader,
    jit: bool,
}

/// Address-range registry of compiled code.
#[derive(Default)]
pub struct CodeRegistry {
    regions: RwLock<BTreeMap<usize, CodeRegion>>,
    precompiled: DashMap<MethodId, CodeAddr>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, start: CodeAddr, size: usize, header: MethodHeader, jit: bool) {
        self.regions.write().insert(
            start.0,
            CodeRegion {
                end: start.0 + size,
                header,
                jit,
            },
        );
    }

    pub fn unregister(&self, start: CodeAddr) {
        self.regions.write().remove(&start.0);
    }

    pub fn set_precompiled(&self, method: MethodId, code: CodeAddr) {
        self.precompiled.insert(method, code);
    }

    fn lookup<R>(&self, pc: CodeAddr, f: impl FnOnce(&CodeRegion) -> R) -> Option<R> {
        let regions = self.regions.read();
        let (_, region) = regions.range(..=pc.0).next_back()?;
        (pc.0 < region.end).then(|| f(region))
    }
}

impl CodeCache for CodeRegistry {
    fn contains_pc(&self, pc: CodeAddr) -> bool {
        self.lookup(pc, |region| region.jit).unwrap_or(false)
    }

    fn header_for(&self, pc: CodeAddr) -> Option<MethodHeader> {
        self.lookup(pc, |region| region.header)
    }

    fn saved_entry_point_of_precompiled(&self, method: MethodId) -> Option<CodeAddr> {
        self.precompiled.get(&method).map(|code| *code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_lookup() {
        let registry = CodeRegistry::new();
        let header = MethodHeader {
            has_should_deoptimize_flag: true,
            debuggable: true,
            ..Default::default()
        };
        registry.register(CodeAddr(0x1000), 0x100, header, true);
        registry.register(CodeAddr(0x2000), 0x10, MethodHeader::default(), false);

        assert!(registry.contains_pc(CodeAddr(0x1000)));
        assert!(registry.contains_pc(CodeAddr(0x10ff)));
        assert!(!registry.contains_pc(CodeAddr(0x1100)));
        assert!(!registry.contains_pc(CodeAddr(0x2004)));
        assert_eq!(registry.header_for(CodeAddr(0x1010)), Some(header));
        assert_eq!(registry.header_for(CodeAddr(0x0fff)), None);
        assert!(registry.is_async_deoptimizeable(CodeAddr(0x1010)));
        assert!(!registry.is_async_deoptimizeable(CodeAddr(0x2004)));

        registry.unregister(CodeAddr(0x1000));
        assert!(!registry.contains_pc(CodeAddr(0x1010)));
    }
}
