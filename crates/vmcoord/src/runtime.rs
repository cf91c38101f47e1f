use std::sync::Arc;

use crate::{
    fatal,
    runtime::{
        class_linker::{ClassLinker, ClassTable},
        code::{CodeCache, CodeRegistry},
        instrumentation::Instrumentation,
        options::{OptionsError, RuntimeOptions},
        roots::ObjectRef,
        thread_list::ThreadList,
        threads::Thread,
        trace::Tracer,
    },
    sync::locks::Locks,
    utils::set_abort_on_fatal,
};

pub mod class_linker;
pub mod code;
pub mod instrumentation;
pub mod options;
pub mod retry;
pub mod roots;
pub mod thread_list;
pub mod threads;
pub mod trace;

pub use thread_list::ScopedSuspendAll;

/// Thread registry, instrumentation and tracing of one runtime instance.
pub struct Runtime {
    options: Arc<RuntimeOptions>,
    locks: Arc<Locks>,
    thread_list: Arc<ThreadList>,
    class_linker: Arc<dyn ClassLinker>,
    code_cache: Arc<dyn CodeCache>,
    instrumentation: Arc<Instrumentation>,
    tracer: Tracer,
}

impl Runtime {
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn thread_list(&self) -> &Arc<ThreadList> {
        &self.thread_list
    }

    pub fn class_linker(&self) -> &Arc<dyn ClassLinker> {
        &self.class_linker
    }

    pub fn code_cache(&self) -> &Arc<dyn CodeCache> {
        &self.code_cache
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Suspend every other thread until the returned guard is dropped.
    pub fn suspend_all<'a>(&'a self, self_thread: Option<&'a Thread>, cause: &str) -> ScopedSuspendAll<'a> {
        ScopedSuspendAll::new(&self.thread_list, self_thread, cause)
    }

    /// Attach the calling OS thread. The thread starts out in `Native`.
    ///
    /// Returns `None` once shutdown has started.
    pub fn attach_current_thread(&self, name: &str, daemon: bool, peer: Option<ObjectRef>) -> Option<Arc<Thread>> {
        if !self.thread_list.start_thread_birth() {
            log::warn!(target: "vmcoord::threads", "refusing to attach {name:?}: runtime is shutting down");
            return None;
        }
        let thread = Arc::new(Thread::new(
            self.thread_list.alloc_thread_id(),
            name,
            daemon,
            peer,
            self.locks.clone(),
        ));
        self.thread_list.register(&thread);
        self.thread_list.end_thread_birth();
        log::debug!(target: "vmcoord::threads", "attached {}", thread);
        Some(thread)
    }

    pub fn detach_current_thread(&self, thread: &Thread) {
        if thread.state().is_runnable() {
            fatal!("detaching Runnable thread {}", thread.dump());
        }
        self.tracer.store_exiting_thread_info(thread);
        self.thread_list.unregister(thread);
    }

    /// Stop tracing, wait for non-daemon threads and park the daemons.
    pub fn shut_down(&self, self_thread: Option<&Thread>) {
        self.tracer.shutdown(self_thread);
        self.thread_list.shut_down(self_thread);
    }

    pub fn dump(&self) -> String {
        format!("{}\n{}", self.thread_list.dump(), self.instrumentation.dump())
    }
}

pub struct RuntimeBuilder {
    options: RuntimeOptions,
    class_linker: Option<Arc<dyn ClassLinker>>,
    code_cache: Option<Arc<dyn CodeCache>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            options: RuntimeOptions::default(),
            class_linker: None,
            code_cache: None,
        }
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn class_linker(mut self, class_linker: Arc<dyn ClassLinker>) -> Self {
        self.class_linker = Some(class_linker);
        self
    }

    pub fn code_cache(mut self, code_cache: Arc<dyn CodeCache>) -> Self {
        self.code_cache = Some(code_cache);
        self
    }

    pub fn build(self) -> Result<Arc<Runtime>, OptionsError> {
        self.options.validate()?;
        set_abort_on_fatal(self.options.abort_on_fatal);

        let options = Arc::new(self.options);
        let locks = Arc::new(Locks::new());
        let thread_list = Arc::new(ThreadList::new(locks.clone(), options.clone()));
        let class_linker = self
            .class_linker
            .unwrap_or_else(|| Arc::new(ClassTable::new()));
        let code_cache = self
            .code_cache
            .unwrap_or_else(|| Arc::new(CodeRegistry::new()));
        let instrumentation = Arc::new(Instrumentation::new(
            thread_list.clone(),
            class_linker.clone(),
            code_cache.clone(),
            options.clone(),
        ));
        let tracer = Tracer::new(thread_list.clone(), instrumentation.clone(), class_linker.clone());

        log::debug!(target: "vmcoord::runtime", "runtime created: {:?}", options);
        Ok(Arc::new(Runtime {
            options,
            locks,
            thread_list,
            class_linker,
            code_cache,
            instrumentation,
            tracer,
        }))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{init_logging, test_options},
        runtime::{threads::ThreadState, trace::TraceMode},
    };

    #[test]
    fn attach_detach() {
        init_logging();
        let runtime = RuntimeBuilder::new().options(test_options()).build().unwrap();
        let thread = runtime.attach_current_thread("main", false, None).unwrap();
        assert_eq!(thread.state(), ThreadState::Native);
        assert!(runtime.thread_list().contains(&thread));

        runtime.detach_current_thread(&thread);
        assert!(!runtime.thread_list().contains(&thread));
        assert_eq!(thread.state(), ThreadState::Terminated);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let err = RuntimeBuilder::new()
            .options(RuntimeOptions::default().with_max_thread_ids(0))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, OptionsError::Invalid { name: "max_thread_ids", .. }));
    }

    #[test]
    fn no_attach_after_shutdown() {
        init_logging();
        let runtime = RuntimeBuilder::new().options(test_options()).build().unwrap();
        runtime.shut_down(None);
        assert!(runtime.attach_current_thread("late", false, None).is_none());
    }

    #[test]
    fn exiting_threads_show_up_in_trace() {
        init_logging();
        let runtime = RuntimeBuilder::new().options(test_options()).build().unwrap();
        runtime.tracer().start(None, TraceMode::MethodTracing).unwrap();

        let worker = {
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                let thread = runtime.attach_current_thread("short-lived", false, None).unwrap();
                let tid = thread.tid();
                runtime.detach_current_thread(&thread);
                tid
            })
        };
        let tid = worker.join().unwrap();

        let result = runtime.tracer().stop(None).unwrap();
        assert_eq!(result.threads.get(&tid).map(String::as_str), Some("short-lived"));
    }

    #[test]
    fn scoped_suspend_all_counts() {
        init_logging();
        let runtime = RuntimeBuilder::new().options(test_options()).build().unwrap();
        {
            let _ssa = runtime.suspend_all(None, "test");
            assert!(runtime.locks().mutator.is_exclusive_held());
        }
        assert!(!runtime.locks().mutator.is_exclusive_held());
        assert_eq!(runtime.thread_list().stats().suspend_all_count, 1);
        assert!(runtime.dump().contains("level=InstrumentNothing"));
    }
}
