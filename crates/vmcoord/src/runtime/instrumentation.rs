//! Method entrypoint selection, stack instrumentation and deoptimization.
//!
//! Clients request an [`InstrumentationLevel`] under a key; the strongest request
//! wins. Changing the effective level rewrites the entrypoint of every loaded
//! method and instruments the stacks of every thread, with all other threads
//! suspended. Every mutating entry point takes the mutator lock exclusively on its
//! own unless the caller already holds it, so several changes can be batched
//! under one [`ScopedSuspendAll`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use dashmap::DashSet;
use parking_lot::Mutex;

use crate::{
    fatal,
    runtime::{
        class_linker::{Class, ClassLinker, Method, MethodId},
        code::{CodeAddr, CodeCache, Entrypoint, MethodHeader},
        options::RuntimeOptions,
        roots::ObjectRef,
        thread_list::{owner_of, ScopedSuspendAll, ThreadList},
        threads::{
            stack::{DeoptFlags, Frame, FrameAction, FrameKind},
            Thread,
        },
    },
};

pub mod listeners;

use listeners::{EventValue, FieldId, InstrumentationEvents, InstrumentationListener, ListenerTable, NO_DEX_PC};

macro_rules! vlog {
    ($instr: expr, $($arg: tt)+) => {
        log::log!(target: "vmcoord::instrumentation", $instr.verbose_level(), $($arg)+)
    };
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum InstrumentationLevel {
    /// Optimal entrypoints, no stack instrumentation.
    Nothing = 0,
    /// Every method runs code that calls the entry and exit hooks.
    EntryExitHooks = 1,
    /// Every method runs in the interpreter.
    WithInterpreter = 2,
}

impl From<u8> for InstrumentationLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => InstrumentationLevel::Nothing,
            1 => InstrumentationLevel::EntryExitHooks,
            2 => InstrumentationLevel::WithInterpreter,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for InstrumentationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstrumentationLevel::Nothing => "InstrumentNothing",
            InstrumentationLevel::EntryExitHooks => "InstrumentWithEntryExitHooks",
            InstrumentationLevel::WithInterpreter => "InstrumentWithInterpreter",
        })
    }
}

/// Listeners for these events need the switch interpreter.
const SLOW_INTERPRETER_EVENTS: InstrumentationEvents = InstrumentationEvents::FIELD_READ
    .union(InstrumentationEvents::FIELD_WRITTEN)
    .union(InstrumentationEvents::WATCHED_FRAME_POP)
    .union(InstrumentationEvents::EXCEPTION_HANDLED);

pub struct Instrumentation {
    thread_list: Arc<ThreadList>,
    class_linker: Arc<dyn ClassLinker>,
    code_cache: Arc<dyn CodeCache>,
    options: Arc<RuntimeOptions>,
    level: AtomicU8,
    requested_levels: Mutex<BTreeMap<String, InstrumentationLevel>>,
    deoptimized_methods: DashSet<MethodId>,
    /// Instrumented frames may be on some stack; returns must check their caller.
    run_exit_hooks: AtomicBool,
    forced_interpret_only: AtomicBool,
    java_debuggable: AtomicBool,
    /// Number of level switches, each of them a full entrypoint and stack rewrite.
    install_count: AtomicU64,
    listeners: ListenerTable,
}

impl Instrumentation {
    pub fn new(
        thread_list: Arc<ThreadList>,
        class_linker: Arc<dyn ClassLinker>,
        code_cache: Arc<dyn CodeCache>,
        options: Arc<RuntimeOptions>,
    ) -> Self {
        Self {
            forced_interpret_only: AtomicBool::new(options.forced_interpret_only),
            java_debuggable: AtomicBool::new(options.java_debuggable),
            thread_list,
            class_linker,
            code_cache,
            options,
            level: AtomicU8::new(InstrumentationLevel::Nothing as u8),
            requested_levels: Mutex::new(BTreeMap::new()),
            deoptimized_methods: DashSet::new(),
            run_exit_hooks: AtomicBool::new(false),
            install_count: AtomicU64::new(0),
            listeners: ListenerTable::new(),
        }
    }

    fn verbose_level(&self) -> log::Level {
        if self.options.verbose_instrumentation {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    fn assert_exclusive(&self, what: &str) {
        if !self.thread_list.locks().mutator.is_exclusive_held() {
            fatal!(
                "{what} without the mutator lock held exclusively: {}",
                self.thread_list.locks().mutator.dump()
            );
        }
    }

    /// Run `f` with every other thread suspended.
    fn with_exclusive<R>(&self, self_thread: Option<&Thread>, cause: &str, f: impl FnOnce() -> R) -> R {
        if self
            .thread_list
            .locks()
            .mutator
            .is_exclusive_held_by(owner_of(self_thread))
        {
            return f();
        }
        let _ssa = ScopedSuspendAll::new(&self.thread_list, self_thread, cause);
        f()
    }

    pub fn current_level(&self) -> InstrumentationLevel {
        InstrumentationLevel::from(self.level.load(Ordering::Acquire))
    }

    pub fn entry_exit_stubs_installed(&self) -> bool {
        self.current_level() >= InstrumentationLevel::EntryExitHooks
    }

    pub fn interpreter_stubs_installed(&self) -> bool {
        self.current_level() >= InstrumentationLevel::WithInterpreter
    }

    pub fn is_forced_interpret_only(&self) -> bool {
        self.forced_interpret_only.load(Ordering::Relaxed)
    }

    /// Run everything in the interpreter from now on. Methods pick this up when their
    /// entrypoints are next initialized.
    pub fn force_interpret_only(&self) {
        self.forced_interpret_only.store(true, Ordering::Relaxed);
    }

    pub fn is_java_debuggable(&self) -> bool {
        self.java_debuggable.load(Ordering::Relaxed)
    }

    pub fn interpret_only(&self) -> bool {
        self.is_forced_interpret_only() || self.interpreter_stubs_installed()
    }

    pub fn interpret_only_method(&self, method: &Method) -> bool {
        !method.is_native() && (self.interpret_only() || self.is_deoptimized(method))
    }

    pub fn run_exit_hooks(&self) -> bool {
        self.run_exit_hooks.load(Ordering::Acquire)
    }

    pub fn install_count(&self) -> u64 {
        self.install_count.load(Ordering::Relaxed)
    }

    pub fn is_deoptimized(&self, method: &Method) -> bool {
        self.deoptimized_methods.contains(&method.id())
    }

    pub fn is_deoptimized_methods_empty(&self) -> bool {
        self.deoptimized_methods.is_empty()
    }

    pub fn needs_dex_pc_events(&self, method: &Method, thread: &Thread) -> bool {
        (self.interpret_only_method(method) || thread.is_force_interpreter()) && self.has_dex_pc_listeners()
    }

    pub fn needs_slow_interpreter_for_listeners(&self) -> bool {
        self.listeners.has(SLOW_INTERPRETER_EVENTS)
    }

    // Entrypoint selection

    /// Debuggable runtimes never run ahead-of-time code.
    fn can_use_aot_code(&self) -> bool {
        !self.is_java_debuggable()
    }

    fn can_runtime_use_nterp(&self) -> bool {
        self.options.can_use_nterp
            && !self.is_java_debuggable()
            && !self.entry_exit_stubs_installed()
            && !self.interpret_only()
            && !self.needs_slow_interpreter_for_listeners()
    }

    fn can_use_nterp(&self, method: &Method) -> bool {
        self.can_runtime_use_nterp()
            && !method.is_native()
            && !method.is_proxy()
            && method.is_declaring_class_verified()
    }

    fn optimized_code_for(&self, method: &Method) -> Entrypoint {
        debug_assert!(!self.interpret_only_method(method));
        if !method.is_invokable() {
            fatal!("no code for non-invokable method {}", method.pretty_name());
        }
        if method.is_proxy() {
            return Entrypoint::ProxyInvokeHandler;
        }
        if let Some(code) = method.aot_code().filter(|_| self.can_use_aot_code()) {
            return Entrypoint::Compiled(code);
        }
        if let Some(code) = self.code_cache.saved_entry_point_of_precompiled(method.id()) {
            return Entrypoint::Compiled(code);
        }
        if self.can_use_nterp(method) {
            return Entrypoint::Nterp;
        }
        default_entrypoint(method)
    }

    /// Whether `code` reports method entry and exit events itself.
    pub fn code_supports_entry_exit_hooks(&self, code: Entrypoint, method: &Method) -> bool {
        if method.is_proxy_init() {
            return true;
        }
        match code {
            Entrypoint::InterpreterBridge | Entrypoint::ResolutionStub | Entrypoint::GenericJniStub => true,
            Entrypoint::Compiled(pc) if self.code_cache.contains_pc(pc) => self
                .code_cache
                .header_for(pc)
                .is_some_and(|header| header.debuggable),
            _ => false,
        }
    }

    /// Whether a compiled frame with `header` reports method exit events.
    pub fn method_supports_exit_events(&self, method: &Method, header: Option<MethodHeader>) -> bool {
        match header {
            // stubs without metadata; generic jni reports exits
            None => method.is_native(),
            Some(header) if header.is_nterp => false,
            Some(header) => header.debuggable,
        }
    }

    fn update_entry_points(&self, method: &Method, code: Entrypoint) {
        debug_assert!(
            !method.still_needs_clinit_check() || code.can_handle_initialization_check(),
            "{} needs an initialization check, got {}",
            method.pretty_name(),
            self.entry_point_string(code)
        );
        debug_assert!(
            !self.entry_exit_stubs_installed() || self.code_supports_entry_exit_hooks(code, method),
            "{} would bypass entry/exit hooks with {}",
            method.pretty_name(),
            self.entry_point_string(code)
        );
        if method.entry_point() != code {
            method.set_entry_point(code);
        }
    }

    /// Pick the first entrypoint of a newly linked method.
    pub fn initialize_methods_code(&self, method: &Method, aot_code: Option<CodeAddr>) {
        if !method.is_invokable() {
            self.update_entry_points(method, Entrypoint::InterpreterBridge);
            return;
        }

        if self.entry_exit_stubs_installed() || self.is_forced_interpret_only() || self.is_deoptimized(method) {
            self.update_entry_points(method, default_entrypoint(method));
            return;
        }

        if method.still_needs_clinit_check() {
            if aot_code.is_some() || method.is_native() || self.can_use_nterp(method) {
                if cfg!(debug_assertions) && self.can_use_nterp(method) {
                    self.update_entry_points(method, Entrypoint::NterpWithClinit);
                } else {
                    self.update_entry_points(method, Entrypoint::ResolutionStub);
                }
            } else {
                self.update_entry_points(method, Entrypoint::InterpreterBridge);
            }
            return;
        }

        if let Some(code) = aot_code.filter(|_| self.can_use_aot_code()) {
            self.update_entry_points(method, Entrypoint::Compiled(code));
            return;
        }

        if self.can_use_nterp(method) {
            self.update_entry_points(method, Entrypoint::Nterp);
            return;
        }

        self.update_entry_points(method, default_entrypoint(method));
    }

    pub fn install_stubs_for_method(&self, method: &Method) {
        if !method.is_invokable() || method.is_proxy() || method.is_proxy_init() {
            return;
        }

        if self.interpret_only_method(method) {
            self.update_entry_points(method, Entrypoint::InterpreterBridge);
            return;
        }

        if self.entry_exit_stubs_installed() {
            if !self.code_supports_entry_exit_hooks(method.entry_point(), method) {
                self.update_entry_points(method, default_entrypoint(method));
            }
            return;
        }

        // restoring after instrumentation
        if method.still_needs_clinit_check() {
            self.update_entry_points(method, Entrypoint::ResolutionStub);
            return;
        }
        self.update_entry_points(method, self.optimized_code_for(method));
    }

    /// Unresolved and erroneous classes keep their entrypoints.
    pub fn install_stubs_for_class(&self, class: &Class) {
        if !class.is_resolved() || class.is_erroneous() {
            return;
        }
        for method in class.methods() {
            self.install_stubs_for_method(method);
        }
    }

    fn install_stubs_for_all_classes(&self) {
        self.class_linker.visit_classes(&mut |class| {
            self.install_stubs_for_class(class);
            true
        });
    }

    /// Switch to debuggable mode: drop ahead-of-time code from every entrypoint.
    pub fn update_entrypoints_for_debuggable(&self, self_thread: Option<&Thread>) {
        self.with_exclusive(self_thread, "UpdateEntrypointsForDebuggable", || {
            self.java_debuggable.store(true, Ordering::Relaxed);
            self.install_stubs_for_all_classes();
        });
    }

    /// Publish new code for `method`, unless instrumentation needs it elsewhere.
    pub fn update_methods_code(&self, method: &Method, new_code: Entrypoint) {
        if !self.entry_exit_stubs_installed() {
            debug_assert!(!self.is_deoptimized(method));
            self.update_entry_points(method, new_code);
            return;
        }

        if new_code == Entrypoint::InterpreterBridge {
            self.update_entry_points(method, new_code);
            return;
        }

        if self.is_deoptimized(method) {
            vlog!(self, "keeping {} deoptimized", method.pretty_name());
            return;
        }

        if !self.code_supports_entry_exit_hooks(new_code, method) {
            vlog!(
                self,
                "not installing {} for {}: no entry/exit hooks",
                self.entry_point_string(new_code),
                method.pretty_name()
            );
            return;
        }

        self.update_entry_points(method, new_code);
    }

    /// JIT code for a native method. The method may be about to be unloaded.
    pub fn update_native_methods_code_to_jit_code(&self, method: &Method, new_code: Entrypoint) {
        if self.entry_exit_stubs_installed() && !self.code_supports_entry_exit_hooks(new_code, method) {
            return;
        }
        self.update_entry_points(method, new_code);
    }

    /// Code to run for a call to `method`, resolving stubs to real code.
    pub fn get_code_for_invoke(&self, method: &Method) -> Entrypoint {
        debug_assert!(!method.is_proxy(), "{}", method.pretty_name());
        let code = method.entry_point();
        if !matches!(
            code,
            Entrypoint::None | Entrypoint::ResolutionStub | Entrypoint::InterpreterBridge
        ) {
            return code;
        }
        if self.interpret_only_method(method) {
            return Entrypoint::InterpreterBridge;
        }
        self.optimized_code_for(method)
    }

    /// Like [`get_code_for_invoke`](Self::get_code_for_invoke) but never bypasses
    /// installed entry/exit hooks.
    pub fn get_maybe_instrumented_code_for_invoke(&self, method: &Method) -> Entrypoint {
        let code = self.get_code_for_invoke(method);
        if self.entry_exit_stubs_installed() && !self.code_supports_entry_exit_hooks(code, method) {
            return default_entrypoint(method);
        }
        code
    }

    pub fn entry_point_string(&self, code: Entrypoint) -> &'static str {
        match code {
            Entrypoint::InterpreterBridge => "interpreter",
            Entrypoint::ResolutionStub => "resolution",
            Entrypoint::Compiled(pc) if self.code_cache.contains_pc(pc) => "jit",
            Entrypoint::Nterp => "nterp",
            Entrypoint::NterpWithClinit => "nterp with clinit",
            Entrypoint::GenericJniStub => "generic jni",
            Entrypoint::Compiled(_) => "oat",
            Entrypoint::None | Entrypoint::ProxyInvokeHandler => "unknown",
        }
    }

    // Levels

    fn requested_level(&self) -> InstrumentationLevel {
        self.requested_levels
            .lock()
            .values()
            .copied()
            .max()
            .unwrap_or(InstrumentationLevel::Nothing)
    }

    /// Record the level `key` needs and switch to the strongest requested level.
    pub fn configure_stubs(&self, self_thread: Option<&Thread>, key: &str, desired_level: InstrumentationLevel) {
        {
            let mut requested = self.requested_levels.lock();
            if desired_level == InstrumentationLevel::Nothing {
                requested.remove(key);
            } else {
                requested.insert(key.to_owned(), desired_level);
            }
        }
        self.update_stubs(self_thread);
    }

    pub fn update_stubs(&self, self_thread: Option<&Thread>) {
        if self.requested_level() == self.current_level() {
            return;
        }

        self.with_exclusive(self_thread, "UpdateStubs", || {
            let requested = self.requested_level();
            if requested == self.current_level() {
                return;
            }
            vlog!(self, "instrumentation level {} -> {}", self.current_level(), requested);
            self.level.store(requested as u8, Ordering::Release);
            self.install_count.fetch_add(1, Ordering::Relaxed);
            self.install_stubs_for_all_classes();
            if requested > InstrumentationLevel::Nothing {
                self.instrument_all_thread_stacks(false);
            } else {
                self.maybe_restore_instrumentation_stack();
            }
        });
    }

    pub fn enable_entry_exit_hooks(&self, self_thread: Option<&Thread>, key: &str) {
        debug_assert!(self.is_java_debuggable());
        self.configure_stubs(self_thread, key, InstrumentationLevel::EntryExitHooks);
    }

    pub fn enable_method_tracing(&self, self_thread: Option<&Thread>, key: &str, needs_interpreter: bool) {
        let level = if needs_interpreter {
            InstrumentationLevel::WithInterpreter
        } else {
            InstrumentationLevel::EntryExitHooks
        };
        self.configure_stubs(self_thread, key, level);
    }

    pub fn disable_method_tracing(&self, self_thread: Option<&Thread>, key: &str) {
        self.configure_stubs(self_thread, key, InstrumentationLevel::Nothing);
    }

    pub fn deoptimize_everything(&self, self_thread: Option<&Thread>, key: &str) {
        self.configure_stubs(self_thread, key, InstrumentationLevel::WithInterpreter);
    }

    pub fn undeoptimize_everything(&self, self_thread: Option<&Thread>, key: &str) {
        if !self.interpreter_stubs_installed() {
            fatal!("UndeoptimizeEverything({key}) without interpreter stubs installed");
        }
        self.configure_stubs(self_thread, key, InstrumentationLevel::Nothing);
    }

    // Stacks

    fn frame_method(&self, frame: &Frame) -> Option<Arc<Method>> {
        frame
            .method
            .and_then(|id| self.class_linker.find_method(id))
    }

    fn frame_supports_exit_events(&self, frame: &Frame, method: &Method) -> bool {
        match frame.kind {
            FrameKind::Shadow { .. } => true,
            FrameKind::Quick { header } => self.method_supports_exit_events(method, header),
        }
    }

    /// Request deoptimization checks on every compiled frame of `thread` and report
    /// entry events for frames that are already running. `force_deopt` marks the
    /// frames for unconditional deoptimization.
    pub fn instrument_thread_stack(&self, thread: &Thread, force_deopt: bool) {
        self.run_exit_hooks.store(true, Ordering::Release);
        vlog!(self, "installing exit stubs in {}", thread);

        let mut stack_methods = Vec::new();
        let mut needs_deopt_check = false;
        thread.stack().walk(|desc| {
            let Some(method) = self.frame_method(desc.frame) else {
                return FrameAction::Continue;
            };
            if method.is_runtime_method() {
                return FrameAction::Continue;
            }

            if desc.frame.is_shadow() {
                let notify = self.needs_dex_pc_events(&method, thread);
                stack_methods.push(method);
                return FrameAction::SetDexPcEvents(notify);
            }

            if self.method_supports_exit_events(&method, desc.frame.header()) {
                stack_methods.push(method);
            }

            if desc.frame.has_should_deoptimize_flag() {
                let mut flags = DeoptFlags::CHECK_CALLER_FOR_DEOPT;
                if force_deopt {
                    needs_deopt_check = true;
                    flags |= DeoptFlags::FORCE_DEOPT_FOR_REDEFINITION;
                }
                return FrameAction::Mark(flags);
            }
            FrameAction::Continue
        });

        if needs_deopt_check {
            thread.set_deopt_check_required(true);
        }

        if self.should_notify_method_enter_exit_events() {
            // outermost first
            for method in stack_methods.iter().rev() {
                self.method_enter_event(thread, method);
            }
        }
    }

    pub fn instrument_all_thread_stacks(&self, force_deopt: bool) {
        self.run_exit_hooks.store(true, Ordering::Release);
        for thread in self.thread_list.threads() {
            self.instrument_thread_stack(&thread, force_deopt);
        }
    }

    /// Force every compiled frame on every stack to deoptimize, e.g. after a redefinition.
    pub fn deoptimize_all_thread_frames(&self, self_thread: Option<&Thread>) {
        self.with_exclusive(self_thread, "DeoptimizeAllThreadFrames", || {
            self.instrument_all_thread_stacks(true);
        });
    }

    /// Recompute dex pc notifications of the interpreter frames of `thread`.
    pub fn update_needs_dex_pc_events_on_stack(&self, thread: &Thread) {
        vlog!(self, "updating dex pc move events on {}", thread);
        thread.stack().walk(|desc| {
            if !desc.frame.is_shadow() {
                return FrameAction::Continue;
            }
            match self.frame_method(desc.frame) {
                Some(method) => FrameAction::SetDexPcEvents(self.needs_dex_pc_events(&method, thread)),
                None => FrameAction::Continue,
            }
        });
    }

    fn has_frames_needing_force_deopt(&self, thread: &Thread) -> bool {
        let mut found = false;
        thread.stack().walk(|desc| {
            if desc.frame.has_should_deoptimize_flag()
                && desc
                    .frame
                    .deopt_flags
                    .contains(DeoptFlags::FORCE_DEOPT_FOR_REDEFINITION)
            {
                found = true;
                return FrameAction::Stop;
            }
            FrameAction::Continue
        });
        debug_assert!(!found || thread.is_deopt_check_required());
        found
    }

    fn restore_stack(&self, thread: &Thread) {
        vlog!(self, "restoring stack of {}", thread);
        debug_assert!(!thread.is_deopt_check_required());
        thread.stack().walk(|desc| {
            if desc.frame.has_should_deoptimize_flag() {
                FrameAction::Clear(DeoptFlags::CHECK_CALLER_FOR_DEOPT)
            } else {
                FrameAction::Continue
            }
        });
    }

    /// Drop stack instrumentation once nothing needs it any more.
    ///
    /// Every thread is checked for frames that still need a forced deoptimization
    /// before any stack is touched.
    pub fn maybe_restore_instrumentation_stack(&self) {
        self.assert_exclusive("MaybeRestoreInstrumentationStack");
        if !self.is_deoptimized_methods_empty() {
            return;
        }

        let threads = self.thread_list.threads();
        let mut no_remaining_deopts = true;
        for thread in threads.iter() {
            let has_force_deopt_frames = self.has_frames_needing_force_deopt(thread);
            if !has_force_deopt_frames {
                thread.set_deopt_check_required(false);
            }
            no_remaining_deopts &= !thread.is_force_interpreter() && !has_force_deopt_frames;
        }

        if no_remaining_deopts {
            for thread in threads.iter() {
                self.restore_stack(thread);
            }
            self.run_exit_hooks.store(false, Ordering::Release);
        }
    }

    // Deoptimization

    fn check_deoptimizable(&self, method: &Method, what: &str) {
        if method.is_native() {
            fatal!("{what} of native method {}", method.pretty_name());
        }
        if method.is_proxy() {
            fatal!("{what} of proxy method {}", method.pretty_name());
        }
        if !method.is_invokable() {
            fatal!("{what} of non-invokable method {}", method.pretty_name());
        }
    }

    /// Make `method` run in the interpreter.
    pub fn deoptimize(&self, self_thread: Option<&Thread>, method: &Method) {
        self.check_deoptimizable(method, "Deoptimize");
        self.with_exclusive(self_thread, "Deoptimize", || {
            if !self.deoptimized_methods.insert(method.id()) {
                fatal!("Method {} is already deoptimized", method.pretty_name());
            }
            vlog!(self, "deoptimized {}", method.pretty_name());

            if !self.interpreter_stubs_installed() {
                self.update_entry_points(method, Entrypoint::InterpreterBridge);
                // callers still in compiled code check on return whether they must follow
                self.instrument_all_thread_stacks(false);
            }
        });
    }

    pub fn undeoptimize(&self, self_thread: Option<&Thread>, method: &Method) {
        self.check_deoptimizable(method, "Undeoptimize");
        self.with_exclusive(self_thread, "Undeoptimize", || {
            if self.deoptimized_methods.remove(&method.id()).is_none() {
                fatal!("Method {} is not deoptimized", method.pretty_name());
            }
            vlog!(self, "undeoptimized {}", method.pretty_name());
            self.restore_after_undeoptimize(method);
        });
    }

    fn restore_after_undeoptimize(&self, method: &Method) {
        if self.interpreter_stubs_installed() || method.is_obsolete() {
            return;
        }

        if self.interpret_only_method(method) {
            self.update_entry_points(method, Entrypoint::InterpreterBridge);
        } else if method.still_needs_clinit_check() {
            self.update_entry_points(method, Entrypoint::ResolutionStub);
        } else {
            self.update_entry_points(method, self.get_maybe_instrumented_code_for_invoke(method));
        }

        if !self.entry_exit_stubs_installed() {
            self.maybe_restore_instrumentation_stack();
        }
    }

    /// Drop the level of `key` and undeoptimize every deoptimized method.
    pub fn disable_deoptimization(&self, self_thread: Option<&Thread>, key: &str) {
        self.with_exclusive(self_thread, "DisableDeoptimization", || {
            self.configure_stubs(self_thread, key, InstrumentationLevel::Nothing);
            loop {
                let Some(id) = self.deoptimized_methods.iter().next().map(|id| *id) else {
                    break;
                };
                self.deoptimized_methods.remove(&id);
                if let Some(method) = self.class_linker.find_method(id) {
                    self.restore_after_undeoptimize(&method);
                }
            }
        });
    }

    pub fn needs_slow_interpreter_for_method(&self, thread: &Thread, method: Option<&Method>) -> bool {
        method.is_some_and(|method| {
            self.interpreter_stubs_installed()
                || self.is_deoptimized(method)
                || thread.is_force_interpreter()
                || method.is_obsolete()
        })
    }

    /// Whether the compiled frame `caller` must continue in the interpreter when the
    /// frame above it returns.
    pub fn should_deoptimize_caller(&self, thread: &Thread, caller: &Frame) -> bool {
        if !self.run_exit_hooks() || caller.is_shadow() {
            return false;
        }
        let Some(method) = self.frame_method(caller) else {
            return false;
        };
        if method.is_native() || method.is_runtime_method() {
            return false;
        }

        let mut needs_deopt = self.needs_slow_interpreter_for_method(thread, Some(&method));
        if self.is_java_debuggable()
            && !needs_deopt
            && thread.is_deopt_check_required()
            && caller.has_should_deoptimize_flag()
            && caller
                .deopt_flags
                .contains(DeoptFlags::FORCE_DEOPT_FOR_REDEFINITION)
        {
            needs_deopt = true;
        }

        if needs_deopt && !self.code_cache.is_async_deoptimizeable(caller.pc) {
            log::warn!(
                target: "vmcoord::instrumentation",
                "Got a deoptimization request on un-deoptimizable method {}",
                method.pretty_name()
            );
            return false;
        }
        needs_deopt
    }

    // Invocation

    /// Enter `method` on `thread`: resolve its code, push its frame and report the
    /// entry if that code reports entries.
    pub fn invoke(&self, thread: &Thread, method: &Method) -> Entrypoint {
        let mut code = method.entry_point();
        if matches!(code, Entrypoint::None | Entrypoint::ResolutionStub) {
            code = self.get_maybe_instrumented_code_for_invoke(method);
            if !method.still_needs_clinit_check() {
                self.update_entry_points(method, code);
            }
        }

        let frame = match code {
            Entrypoint::Compiled(pc) => Frame::compiled(
                method.id(),
                pc,
                self.code_cache.header_for(pc).unwrap_or_default(),
            ),
            _ if method.is_native() => Frame {
                method: Some(method.id()),
                kind: FrameKind::Quick { header: None },
                deopt_flags: DeoptFlags::empty(),
                pc: CodeAddr(0),
            },
            _ => Frame {
                kind: FrameKind::Shadow {
                    notify_dex_pc_move: self.needs_dex_pc_events(method, thread),
                },
                ..Frame::interpreted(method.id())
            },
        };
        thread.stack().push(frame);

        if !method.is_runtime_method() && self.code_supports_entry_exit_hooks(code, method) {
            self.method_enter_event(thread, method);
        }
        code
    }

    /// Pop the innermost frame of `thread`, report the exit and deoptimize the caller
    /// if needed. Returns whether the caller now runs in the interpreter.
    pub fn return_from(&self, thread: &Thread, value: EventValue) -> bool {
        let (frame, caller) = {
            let mut stack = thread.stack();
            let Some(frame) = stack.pop() else {
                fatal!("return on empty stack of {}", thread);
            };
            (frame, stack.top().copied())
        };

        if let Some(method) = self.frame_method(&frame) {
            if !method.is_runtime_method() && self.frame_supports_exit_events(&frame, &method) {
                self.method_exit_event(thread, &method, value);
            }
        }

        let Some(caller) = caller else {
            return false;
        };
        if !self.should_deoptimize_caller(thread, &caller) {
            return false;
        }

        let notify = self
            .frame_method(&caller)
            .is_some_and(|method| self.needs_dex_pc_events(&method, thread));
        let mut stack = thread.stack();
        match stack.top_mut() {
            Some(top) if *top == caller => {
                vlog!(self, "deoptimizing caller {:?} on {}", caller.method, thread);
                *top = Frame {
                    kind: FrameKind::Shadow {
                        notify_dex_pc_move: notify,
                    },
                    deopt_flags: DeoptFlags::empty(),
                    pc: CodeAddr(0),
                    ..*top
                };
                true
            }
            _ => false,
        }
    }

    /// Pop `frames` frames of `thread` for an exception, reporting unwind events.
    /// Returns the number of frames popped.
    pub fn unwind(&self, thread: &Thread, frames: usize) -> usize {
        let mut popped = 0;
        while popped < frames {
            let Some(frame) = thread.stack().pop() else {
                break;
            };
            popped += 1;
            let Some(method) = self.frame_method(&frame) else {
                continue;
            };
            if method.is_runtime_method() {
                continue;
            }
            vlog!(self, "popping for unwind {}", method.pretty_name());
            self.method_unwind_event(thread, &method, NO_DEX_PC);
        }
        popped
    }

    // Listeners

    pub fn add_listener(
        &self,
        self_thread: Option<&Thread>,
        listener: Arc<dyn InstrumentationListener>,
        events: InstrumentationEvents,
    ) {
        self.with_exclusive(self_thread, "AddListener", || {
            self.listeners.add(listener, events);
            if events.contains(InstrumentationEvents::DEX_PC_MOVED) {
                for thread in self.thread_list.threads() {
                    self.update_needs_dex_pc_events_on_stack(&thread);
                }
            }
        });
    }

    pub fn remove_listener(
        &self,
        self_thread: Option<&Thread>,
        listener: &Arc<dyn InstrumentationListener>,
        events: InstrumentationEvents,
    ) {
        self.with_exclusive(self_thread, "RemoveListener", || {
            self.listeners.remove(listener, events);
            if events.contains(InstrumentationEvents::DEX_PC_MOVED) {
                for thread in self.thread_list.threads() {
                    self.update_needs_dex_pc_events_on_stack(&thread);
                }
            }
        });
    }

    pub fn has_listeners(&self, events: InstrumentationEvents) -> bool {
        self.listeners.has(events)
    }

    pub fn has_method_entry_listeners(&self) -> bool {
        self.listeners.has(InstrumentationEvents::METHOD_ENTERED)
    }

    pub fn has_method_exit_listeners(&self) -> bool {
        self.listeners.has(InstrumentationEvents::METHOD_EXITED)
    }

    pub fn has_dex_pc_listeners(&self) -> bool {
        self.listeners.has(InstrumentationEvents::DEX_PC_MOVED)
    }

    pub fn should_notify_method_enter_exit_events(&self) -> bool {
        (self.has_method_entry_listeners() || self.has_method_exit_listeners())
            && !self.interpreter_stubs_installed()
    }

    fn dispatch(&self, event: InstrumentationEvents, f: impl Fn(&dyn InstrumentationListener)) {
        if !self.listeners.has(event) {
            return;
        }
        let snapshot = self.listeners.snapshot();
        for listener in snapshot.listeners(event) {
            f(listener.as_ref());
        }
    }

    pub fn method_enter_event(&self, thread: &Thread, method: &Method) {
        debug_assert!(!method.is_runtime_method());
        self.dispatch(InstrumentationEvents::METHOD_ENTERED, |l| {
            l.method_entered(thread, method)
        });
    }

    pub fn method_exit_event(&self, thread: &Thread, method: &Method, return_value: EventValue) {
        self.dispatch(InstrumentationEvents::METHOD_EXITED, |l| {
            l.method_exited(thread, method, return_value)
        });
    }

    pub fn method_unwind_event(&self, thread: &Thread, method: &Method, dex_pc: u32) {
        self.dispatch(InstrumentationEvents::METHOD_UNWIND, |l| {
            l.method_unwind(thread, method, dex_pc)
        });
    }

    pub fn dex_pc_moved_event(&self, thread: &Thread, this: Option<ObjectRef>, method: &Method, dex_pc: u32) {
        self.dispatch(InstrumentationEvents::DEX_PC_MOVED, |l| {
            l.dex_pc_moved(thread, this, method, dex_pc)
        });
    }

    pub fn field_read_event(
        &self,
        thread: &Thread,
        this: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
    ) {
        self.dispatch(InstrumentationEvents::FIELD_READ, |l| {
            l.field_read(thread, this, method, dex_pc, field)
        });
    }

    pub fn field_write_event(
        &self,
        thread: &Thread,
        this: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
        value: EventValue,
    ) {
        self.dispatch(InstrumentationEvents::FIELD_WRITTEN, |l| {
            l.field_written(thread, this, method, dex_pc, field, value)
        });
    }

    pub fn exception_thrown_event(&self, thread: &Thread, exception: ObjectRef) {
        self.dispatch(InstrumentationEvents::EXCEPTION_THROWN, |l| {
            l.exception_thrown(thread, exception)
        });
    }

    pub fn exception_handled_event(&self, thread: &Thread, exception: ObjectRef) {
        self.dispatch(InstrumentationEvents::EXCEPTION_HANDLED, |l| {
            l.exception_handled(thread, exception)
        });
    }

    pub fn branch_event(&self, thread: &Thread, method: &Method, dex_pc: u32, offset: i32) {
        self.dispatch(InstrumentationEvents::BRANCH, |l| {
            l.branch(thread, method, dex_pc, offset)
        });
    }

    pub fn watched_frame_pop_event(&self, thread: &Thread, method: &Method, depth: usize) {
        self.dispatch(InstrumentationEvents::WATCHED_FRAME_POP, |l| {
            l.watched_frame_pop(thread, method, depth)
        });
    }

    pub fn dump(&self) -> String {
        format!(
            "Instrumentation: level={} requested={:?} deoptimized={} run_exit_hooks={} listeners={:?}",
            self.current_level(),
            self.requested_levels.lock(),
            self.deoptimized_methods.len(),
            self.run_exit_hooks(),
            self.listeners.events()
        )
    }
}

/// Interpreter bridge, or the generic JNI stub for native methods.
fn default_entrypoint(method: &Method) -> Entrypoint {
    if method.is_native() {
        Entrypoint::GenericJniStub
    } else {
        Entrypoint::InterpreterBridge
    }
}
