//! Mock runtime pieces used in tests and by the demo driver.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use flume::{Receiver, Sender};

use crate::{
    fatal,
    runtime::{
        class_linker::{Class, ClassStatus, ClassTable, MethodSpec},
        code::{CodeAddr, CodeRegistry, MethodHeader},
        instrumentation::Instrumentation,
        options::RuntimeOptions,
        roots::ObjectRef,
        thread_list::ThreadList,
        threads::{ScopedThreadSuspension, Thread, ThreadState},
        Runtime, RuntimeBuilder,
    },
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Defaults with short shutdown waits.
pub fn test_options() -> RuntimeOptions {
    RuntimeOptions::default()
        .with_daemon_shutdown_timeout(Duration::from_millis(500))
        .with_daemon_sleep(Duration::from_millis(10))
}

/// Header of optimized code that can be deoptimized at any call site.
pub fn optimized_header(debuggable: bool) -> MethodHeader {
    MethodHeader {
        has_should_deoptimize_flag: true,
        is_nterp: false,
        debuggable,
        deoptimizable: true,
    }
}

type Job = Box<dyn FnOnce(&Thread) + Send>;

#[derive(Default)]
struct Control {
    progress: AtomicU64,
    stop: AtomicBool,
}

/// An attached OS thread that keeps polling for suspension while Runnable and
/// runs jobs sent through [`MutatorThread::execute`].
pub struct MutatorThread {
    thread: Arc<Thread>,
    control: Arc<Control>,
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl MutatorThread {
    pub fn spawn(list: &Arc<ThreadList>, name: &str, daemon: bool) -> Self {
        Self::start(list, name, daemon, None, false)
    }

    pub fn spawn_with_peer(list: &Arc<ThreadList>, name: &str, peer: Option<ObjectRef>) -> Self {
        Self::start(list, name, false, peer, false)
    }

    /// A thread that stays Runnable and never reaches a safepoint.
    pub fn spawn_stuck(list: &Arc<ThreadList>, name: &str) -> Self {
        Self::start(list, name, false, None, true)
    }

    fn start(list: &Arc<ThreadList>, name: &str, daemon: bool, peer: Option<ObjectRef>, stuck: bool) -> Self {
        let (attached, on_attach) = flume::bounded(1);
        let (jobs, pending) = flume::unbounded::<Job>();
        let control = Arc::new(Control::default());

        let handle = {
            let list = list.clone();
            let control = control.clone();
            let name = name.to_owned();
            std::thread::spawn(move || {
                if !list.start_thread_birth() {
                    fatal!("mutator {name} spawned during shutdown");
                }
                let thread = Arc::new(Thread::new(list.alloc_thread_id(), &name, daemon, peer, list.locks().clone()));
                list.register(&thread);
                list.end_thread_birth();
                let _ = attached.send(thread.clone());

                if stuck {
                    run_stuck(&thread, &control);
                } else {
                    run_mutator(&list, &thread, &control, &pending);
                }
            })
        };

        let Ok(thread) = on_attach.recv() else {
            fatal!("mutator {name} died before attaching");
        };
        Self {
            thread,
            control,
            jobs: Some(jobs),
            handle: Some(handle),
        }
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Number of safepoint polls so far.
    pub fn progress(&self) -> u64 {
        self.control.progress.load(Ordering::Acquire)
    }

    /// Whether the thread polls at least twice more within `timeout`.
    pub fn wait_for_progress(&self, timeout: Duration) -> bool {
        let start = self.progress();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.progress() >= start + 2 {
                return true;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        false
    }

    /// Run `f` on the thread while it is Runnable and wait for the result.
    pub fn execute<R: Send + 'static>(&self, f: impl FnOnce(&Thread) -> R + Send + 'static) -> R {
        let (result, on_result) = flume::bounded(1);
        if let Some(jobs) = self.jobs.as_ref() {
            let _ = jobs.send(Box::new(move |thread: &Thread| {
                let _ = result.send(f(thread));
            }));
        }
        match on_result.recv() {
            Ok(value) => value,
            Err(_) => fatal!("job on {} did not complete", self.thread),
        }
    }

    /// Give up on the thread without joining it, e.g. a daemon parked at shutdown.
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for MutatorThread {
    fn drop(&mut self) {
        self.control.stop.store(true, Ordering::Release);
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_mutator(list: &ThreadList, thread: &Thread, control: &Control, pending: &Receiver<Job>) {
    thread.transition_from_suspended_to_runnable();
    let mut polls = 0u64;
    while !control.stop.load(Ordering::Acquire) {
        while let Ok(job) = pending.try_recv() {
            job(thread);
        }
        control.progress.fetch_add(1, Ordering::AcqRel);
        thread.check_suspend();

        polls += 1;
        if polls % 64 == 0 {
            let _native = ScopedThreadSuspension::new(thread, ThreadState::Native);
            std::thread::sleep(Duration::from_micros(50));
        } else {
            std::thread::yield_now();
        }
    }
    thread.transition_from_runnable_to_suspended(ThreadState::Native);
    list.unregister(thread);
}

fn run_stuck(thread: &Thread, control: &Control) {
    thread.transition_from_suspended_to_runnable();
    while !control.stop.load(Ordering::Acquire) {
        control.progress.fetch_add(1, Ordering::AcqRel);
        std::thread::yield_now();
    }
}

/// A runtime over an in-memory class table and code registry.
pub struct MockVm {
    pub runtime: Arc<Runtime>,
    pub classes: Arc<ClassTable>,
    pub code: Arc<CodeRegistry>,
}

impl MockVm {
    pub fn new(options: RuntimeOptions) -> Self {
        init_logging();
        let classes = Arc::new(ClassTable::new());
        let code = Arc::new(CodeRegistry::new());
        let runtime = match RuntimeBuilder::new()
            .options(options)
            .class_linker(classes.clone())
            .code_cache(code.clone())
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => fatal!("mock runtime: {err}"),
        };
        Self {
            runtime,
            classes,
            code,
        }
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        self.runtime.instrumentation()
    }

    pub fn thread_list(&self) -> &Arc<ThreadList> {
        self.runtime.thread_list()
    }

    /// Define a class and pick the first entrypoint of each of its methods.
    pub fn define_class(&self, descriptor: &str, status: ClassStatus, methods: &[MethodSpec]) -> Arc<Class> {
        let class = self.classes.define_class(descriptor, status, methods);
        for method in class.methods() {
            self.instrumentation()
                .initialize_methods_code(method, method.aot_code());
        }
        class
    }

    /// Register 256 bytes of code at `start`.
    pub fn compiled_code(&self, start: usize, header: MethodHeader, jit: bool) -> CodeAddr {
        self.code.register(CodeAddr(start), 0x100, header, jit);
        CodeAddr(start)
    }

    pub fn spawn(&self, name: &str) -> MutatorThread {
        MutatorThread::spawn(self.thread_list(), name, false)
    }
}
