//! Loaded classes and methods, reduced to what instrumentation needs: identity,
//! access flags and a mutable entrypoint.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::code::{CodeAddr, Entrypoint};

/// Registry-assigned method handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MethodId(pub u32);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const STATIC = 0x0008;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const CONSTRUCTOR = 0x0001_0000;
        /// Copied default method with conflicting implementations.
        const DEFAULT_CONFLICT = 0x0100_0000;
        const OBSOLETE = 0x0004_0000;
        /// Proxy class method dispatching to an invocation handler.
        const PROXY = 0x1000_0000;
        /// Runtime-internal method without bytecode (e.g. resolution or callee-save methods).
        const RUNTIME = 0x2000_0000;
    }
}

pub const PROXY_CLASS_DESCRIPTOR: &str = "Ljava/lang/reflect/Proxy;";

pub struct Method {
    id: MethodId,
    name: String,
    class_descriptor: String,
    flags: AccessFlags,
    aot_code: Option<CodeAddr>,
    needs_clinit_check: AtomicBool,
    class_verified: AtomicBool,
    entrypoint: Mutex<Entrypoint>,
}

impl Method {
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(AccessFlags::NATIVE)
    }

    pub fn is_proxy(&self) -> bool {
        self.flags.contains(AccessFlags::PROXY)
    }

    pub fn is_runtime_method(&self) -> bool {
        self.flags.contains(AccessFlags::RUNTIME)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    pub fn is_constructor(&self) -> bool {
        self.flags.contains(AccessFlags::CONSTRUCTOR)
    }

    pub fn is_obsolete(&self) -> bool {
        self.flags.contains(AccessFlags::OBSOLETE)
    }

    pub fn is_invokable(&self) -> bool {
        !self
            .flags
            .intersects(AccessFlags::ABSTRACT | AccessFlags::DEFAULT_CONFLICT)
    }

    /// `Proxy.<init>`, which always runs in the interpreter.
    pub fn is_proxy_init(&self) -> bool {
        self.is_constructor() && !self.is_static() && self.class_descriptor == PROXY_CLASS_DESCRIPTOR
    }

    pub fn aot_code(&self) -> Option<CodeAddr> {
        self.aot_code
    }

    pub fn still_needs_clinit_check(&self) -> bool {
        self.needs_clinit_check.load(Ordering::Acquire)
    }

    pub fn is_declaring_class_verified(&self) -> bool {
        self.class_verified.load(Ordering::Acquire)
    }

    pub fn entry_point(&self) -> Entrypoint {
        *self.entrypoint.lock()
    }

    pub fn set_entry_point(&self, entrypoint: Entrypoint) {
        *self.entrypoint.lock() = entrypoint;
    }

    pub fn pretty_name(&self) -> String {
        let descriptor = self.class_descriptor.as_str();
        let class = descriptor
            .strip_prefix('L')
            .and_then(|d| d.strip_suffix(';'))
            .unwrap_or(descriptor)
            .replace('/', ".");
        format!("{}.{}", class, self.name)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.pretty_name())
            .field("flags", &self.flags)
            .field("entrypoint", &self.entry_point())
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ClassStatus {
    /// Loaded but not yet linked.
    NotReady = 0,
    Resolved = 1,
    Verified = 2,
    Initialized = 3,
    Erroneous = 4,
}

impl From<u8> for ClassStatus {
    fn from(value: u8) -> ClassStatus {
        match value {
            0 => ClassStatus::NotReady,
            1 => ClassStatus::Resolved,
            2 => ClassStatus::Verified,
            3 => ClassStatus::Initialized,
            4 => ClassStatus::Erroneous,
            _ => unreachable!(),
        }
    }
}

pub struct Class {
    descriptor: String,
    status: AtomicU8,
    methods: Vec<Arc<Method>>,
}

impl Class {
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn status(&self) -> ClassStatus {
        ClassStatus::from(self.status.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status(),
            ClassStatus::Resolved | ClassStatus::Verified | ClassStatus::Initialized
        )
    }

    pub fn is_erroneous(&self) -> bool {
        self.status() == ClassStatus::Erroneous
    }

    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }
}

/// The class loading subsystem as seen by instrumentation.
pub trait ClassLinker: Send + Sync {
    /// Call `visitor` on every loaded class until it returns `false`.
    fn visit_classes(&self, visitor: &mut dyn FnMut(&Class) -> bool);

    fn find_method(&self, id: MethodId) -> Option<Arc<Method>>;
}

/// Description of a method to define through [`ClassTable::define_class`].
#[derive(Clone, Debug)]
pub struct MethodSpec {
    pub name: String,
    pub flags: AccessFlags,
    pub aot_code: Option<CodeAddr>,
}

impl MethodSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            flags: AccessFlags::empty(),
            aot_code: None,
        }
    }

    pub fn with_flags(mut self, flags: AccessFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_aot_code(mut self, code: CodeAddr) -> Self {
        self.aot_code = Some(code);
        self
    }
}

/// In-memory [`ClassLinker`].
#[derive(Default)]
pub struct ClassTable {
    classes: RwLock<Vec<Arc<Class>>>,
    methods: DashMap<MethodId, Arc<Method>>,
    next_method_id: AtomicU32,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_class(&self, descriptor: &str, status: ClassStatus, methods: &[MethodSpec]) -> Arc<Class> {
        let initialized = status == ClassStatus::Initialized;
        let verified = matches!(status, ClassStatus::Verified | ClassStatus::Initialized);
        let methods = methods
            .iter()
            .map(|spec| {
                let id = MethodId(self.next_method_id.fetch_add(1, Ordering::Relaxed) + 1);
                let needs_clinit_check = !initialized
                    && spec.flags.contains(AccessFlags::STATIC)
                    && !spec.flags.contains(AccessFlags::CONSTRUCTOR);
                let method = Arc::new(Method {
                    id,
                    name: spec.name.clone(),
                    class_descriptor: descriptor.to_owned(),
                    flags: spec.flags,
                    aot_code: spec.aot_code,
                    needs_clinit_check: AtomicBool::new(needs_clinit_check),
                    class_verified: AtomicBool::new(verified),
                    entrypoint: Mutex::new(Entrypoint::None),
                });
                self.methods.insert(id, method.clone());
                method
            })
            .collect();

        let class = Arc::new(Class {
            descriptor: descriptor.to_owned(),
            status: AtomicU8::new(status as u8),
            methods,
        });
        self.classes.write().push(class.clone());
        class
    }

    /// Mark `class` initialized. Callers re-run entrypoint selection afterwards.
    pub fn initialize_class(&self, class: &Class) {
        for method in class.methods() {
            method.needs_clinit_check.store(false, Ordering::Release);
            method.class_verified.store(true, Ordering::Release);
        }
        class
            .status
            .store(ClassStatus::Initialized as u8, Ordering::Release);
    }

    pub fn set_status(&self, class: &Class, status: ClassStatus) {
        class.status.store(status as u8, Ordering::Release);
    }

    pub fn class_count(&self) -> usize {
        self.classes.read().len()
    }
}

impl ClassLinker for ClassTable {
    fn visit_classes(&self, visitor: &mut dyn FnMut(&Class) -> bool) {
        // snapshot so visitors may define classes
        let classes = self.classes.read().clone();
        for class in classes.iter() {
            if !visitor(class) {
                break;
            }
        }
    }

    fn find_method(&self, id: MethodId) -> Option<Arc<Method>> {
        self.methods.get(&id).map(|method| method.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_visit() {
        let table = ClassTable::new();
        let class = table.define_class(
            "Lcom/example/Foo;",
            ClassStatus::Verified,
            &[
                MethodSpec::new("run"),
                MethodSpec::new("create").with_flags(AccessFlags::STATIC),
                MethodSpec::new("call").with_flags(AccessFlags::ABSTRACT),
            ],
        );

        let run = &class.methods()[0];
        let create = &class.methods()[1];
        assert_eq!(run.pretty_name(), "com.example.Foo.run");
        assert!(!run.still_needs_clinit_check());
        assert!(create.still_needs_clinit_check());
        assert!(!class.methods()[2].is_invokable());
        assert!(table.find_method(create.id()).is_some());

        table.initialize_class(&class);
        assert!(!create.still_needs_clinit_check());
        assert_eq!(class.status(), ClassStatus::Initialized);

        let mut seen = 0;
        table.visit_classes(&mut |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn proxy_init_detection() {
        let table = ClassTable::new();
        let proxy = table.define_class(
            PROXY_CLASS_DESCRIPTOR,
            ClassStatus::Initialized,
            &[MethodSpec::new("<init>").with_flags(AccessFlags::CONSTRUCTOR)],
        );
        assert!(proxy.methods()[0].is_proxy_init());
    }
}
