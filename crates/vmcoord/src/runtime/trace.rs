//! Method tracing client of [`Instrumentation`].
//!
//! Method tracing listens for entry, exit and unwind events. Sampling instead runs a
//! checkpoint on every thread at a fixed interval and turns the difference between
//! two samples of a stack into entry and exit records. Records are collected in
//! memory and handed out by [`Tracer::stop`].

use std::{
    collections::BTreeMap,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::runtime::{
    class_linker::{ClassLinker, Method, MethodId},
    instrumentation::{
        listeners::{EventValue, InstrumentationEvents, InstrumentationListener},
        Instrumentation,
    },
    thread_list::{ScopedSuspendAll, ThreadList},
    threads::{Thread, ThreadId},
};

/// Key under which tracing requests its instrumentation level.
pub const TRACER_INSTRUMENTATION_KEY: &str = "Tracer";

const TRACE_EVENTS: InstrumentationEvents = InstrumentationEvents::METHOD_ENTERED
    .union(InstrumentationEvents::METHOD_EXITED)
    .union(InstrumentationEvents::METHOD_UNWIND);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("trace already in progress")]
    AlreadyRunning,
    #[error("no trace currently running")]
    NotRunning,
    #[error("invalid sampling interval: {0:?}")]
    InvalidInterval(Duration),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceMode {
    MethodTracing,
    Sampling { interval: Duration },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TracingMode {
    Inactive,
    MethodTracingActive,
    SampleProfilingActive,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceAction {
    Enter,
    Exit,
    Unwind,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TraceRecord {
    pub thread: ThreadId,
    pub method: MethodId,
    pub action: TraceAction,
    /// Time since the trace started.
    pub timestamp: Duration,
}

#[derive(Debug)]
pub struct TraceResult {
    pub mode: TraceMode,
    pub elapsed: Duration,
    pub records: Vec<TraceRecord>,
    /// Names of the threads seen by the trace, including those that exited, by OS tid.
    pub threads: BTreeMap<u64, String>,
}

impl TraceResult {
    /// Print the records with method names, one per line.
    pub fn dump(&self, class_linker: &dyn ClassLinker) -> String {
        let mut out = format!(
            "*trace mode={:?} elapsed={:?} records={}\n",
            self.mode,
            self.elapsed,
            self.records.len()
        );
        for (tid, name) in self.threads.iter() {
            out.push_str(&format!("{tid}\t{name}\n"));
        }
        for record in self.records.iter() {
            let name = class_linker
                .find_method(record.method)
                .map_or_else(|| format!("{:?}", record.method), |m| m.pretty_name());
            out.push_str(&format!(
                "{}\t{:?}\t{:>10}us\t{}\n",
                record.thread,
                record.action,
                record.timestamp.as_micros(),
                name
            ));
        }
        out
    }
}

/// Forwards method events to the record channel.
struct TraceSink {
    start: Instant,
    sender: Sender<TraceRecord>,
}

impl TraceSink {
    fn record(&self, thread: &Thread, method: MethodId, action: TraceAction) {
        // receiver lives as long as the trace
        let _ = self.sender.send(TraceRecord {
            thread: thread.id(),
            method,
            action,
            timestamp: self.start.elapsed(),
        });
    }
}

impl InstrumentationListener for TraceSink {
    fn method_entered(&self, thread: &Thread, method: &Method) {
        self.record(thread, method.id(), TraceAction::Enter);
    }

    fn method_exited(&self, thread: &Thread, method: &Method, _return_value: EventValue) {
        self.record(thread, method.id(), TraceAction::Exit);
    }

    fn method_unwind(&self, thread: &Thread, method: &Method, _dex_pc: u32) {
        self.record(thread, method.id(), TraceAction::Unwind);
    }
}

/// Split two samples of a stack, both innermost first, into the methods that
/// returned (innermost first) and the methods that were entered (outermost first).
fn diff_samples(old: &[MethodId], new: &[MethodId]) -> (Vec<MethodId>, Vec<MethodId>) {
    let common = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let exited = old[..old.len() - common].to_vec();
    let entered = new[..new.len() - common].iter().rev().copied().collect();
    (exited, entered)
}

struct Sampler {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct ActiveTrace {
    mode: TraceMode,
    start: Instant,
    records: Receiver<TraceRecord>,
    sink: Arc<TraceSink>,
    sampler: Option<Sampler>,
    /// Last stack sample per thread, innermost first.
    samples: Arc<DashMap<ThreadId, Vec<MethodId>>>,
    exited_threads: BTreeMap<u64, String>,
}

pub struct Tracer {
    thread_list: Arc<ThreadList>,
    instrumentation: Arc<Instrumentation>,
    class_linker: Arc<dyn ClassLinker>,
    active: Mutex<Option<ActiveTrace>>,
}

impl Tracer {
    pub fn new(
        thread_list: Arc<ThreadList>,
        instrumentation: Arc<Instrumentation>,
        class_linker: Arc<dyn ClassLinker>,
    ) -> Self {
        Self {
            thread_list,
            instrumentation,
            class_linker,
            active: Mutex::new(None),
        }
    }

    pub fn start(&self, self_thread: Option<&Thread>, mode: TraceMode) -> Result<(), TraceError> {
        if self.active.lock().is_some() {
            log::error!(target: "vmcoord::trace", "Trace already in progress, ignoring this request");
            return Err(TraceError::AlreadyRunning);
        }
        if let TraceMode::Sampling { interval } = mode {
            if interval.is_zero() {
                log::error!(target: "vmcoord::trace", "Invalid sampling interval: {:?}", interval);
                return Err(TraceError::InvalidInterval(interval));
            }
        }

        let _ssa = ScopedSuspendAll::new(&self.thread_list, self_thread, "Trace::Start");
        let mut active = self.active.lock();
        if active.is_some() {
            log::error!(target: "vmcoord::trace", "Trace already in progress, ignoring this request");
            return Err(TraceError::AlreadyRunning);
        }

        let start = Instant::now();
        let (sender, records) = flume::unbounded();
        let sink = Arc::new(TraceSink { start, sender });
        let samples = Arc::new(DashMap::new());

        let sampler = match mode {
            TraceMode::Sampling { interval } => Some(self.spawn_sampler(interval, sink.clone(), samples.clone())),
            TraceMode::MethodTracing => {
                self.instrumentation
                    .add_listener(self_thread, sink.clone(), TRACE_EVENTS);
                self.instrumentation
                    .enable_method_tracing(self_thread, TRACER_INSTRUMENTATION_KEY, false);
                None
            }
        };

        log::info!(target: "vmcoord::trace", "tracing started: {:?}", mode);
        *active = Some(ActiveTrace {
            mode,
            start,
            records,
            sink,
            sampler,
            samples,
            exited_threads: BTreeMap::new(),
        });
        Ok(())
    }

    fn spawn_sampler(
        &self,
        interval: Duration,
        sink: Arc<TraceSink>,
        samples: Arc<DashMap<ThreadId, Vec<MethodId>>>,
    ) -> Sampler {
        let (stop, stopped) = flume::bounded::<()>(1);
        let thread_list = self.thread_list.clone();
        let class_linker = self.class_linker.clone();

        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => (),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let sink = sink.clone();
            let samples = samples.clone();
            let class_linker = class_linker.clone();
            thread_list.run_checkpoint_and_wait(
                None,
                Arc::new(move |thread: &Thread| {
                    let stack = thread
                        .stack()
                        .frames()
                        .filter_map(|frame| frame.method)
                        .filter(|id| {
                            class_linker
                                .find_method(*id)
                                .is_some_and(|method| !method.is_runtime_method())
                        })
                        .collect::<Vec<_>>();

                    let old = samples.insert(thread.id(), stack.clone()).unwrap_or_default();
                    let (exited, entered) = diff_samples(&old, &stack);
                    for method in exited {
                        sink.record(thread, method, TraceAction::Exit);
                    }
                    for method in entered {
                        sink.record(thread, method, TraceAction::Enter);
                    }
                }),
            );
        });

        Sampler { stop, handle }
    }

    /// Stop the running trace and return what it recorded.
    pub fn stop(&self, self_thread: Option<&Thread>) -> Result<TraceResult, TraceError> {
        let Some(active) = self.active.lock().take() else {
            log::error!(target: "vmcoord::trace", "Trace stop requested, but no trace currently running");
            return Err(TraceError::NotRunning);
        };

        if let Some(sampler) = active.sampler {
            let _ = sampler.stop.send(());
            if sampler.handle.join().is_err() {
                log::error!(target: "vmcoord::trace", "sampling thread panicked");
            }
        }

        {
            let _ssa = ScopedSuspendAll::new(&self.thread_list, self_thread, "Trace::Stop");
            match active.mode {
                TraceMode::Sampling { .. } => active.samples.clear(),
                TraceMode::MethodTracing => {
                    let listener: Arc<dyn InstrumentationListener> = active.sink.clone();
                    self.instrumentation
                        .remove_listener(self_thread, &listener, TRACE_EVENTS);
                    self.instrumentation
                        .disable_method_tracing(self_thread, TRACER_INSTRUMENTATION_KEY);
                }
            }
        }

        let mut threads = active.exited_threads;
        for thread in self.thread_list.threads() {
            threads.insert(thread.tid(), thread.name().to_owned());
        }

        let result = TraceResult {
            mode: active.mode,
            elapsed: active.start.elapsed(),
            records: active.records.try_iter().collect(),
            threads,
        };
        log::info!(
            target: "vmcoord::trace",
            "tracing stopped: {} records in {:?}",
            result.records.len(),
            result.elapsed
        );
        Ok(result)
    }

    pub fn method_tracing_mode(&self) -> TracingMode {
        match self.active.lock().as_ref().map(|active| active.mode) {
            None => TracingMode::Inactive,
            Some(TraceMode::MethodTracing) => TracingMode::MethodTracingActive,
            Some(TraceMode::Sampling { .. }) => TracingMode::SampleProfilingActive,
        }
    }

    /// Remember the name of a detaching thread for the trace summary.
    pub fn store_exiting_thread_info(&self, thread: &Thread) {
        if let Some(active) = self.active.lock().as_mut() {
            active
                .exited_threads
                .insert(thread.tid(), thread.name().to_owned());
        }
    }

    /// Stop a running trace, dropping its records.
    pub fn shutdown(&self, self_thread: Option<&Thread>) {
        if self.method_tracing_mode() != TracingMode::Inactive {
            let _ = self.stop(self_thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        mock::{MockVm, test_options},
        runtime::{
            class_linker::{ClassStatus, MethodSpec},
            instrumentation::InstrumentationLevel,
        },
    };

    #[test]
    fn sample_diff() {
        let (a, b, c, d) = (MethodId(1), MethodId(2), MethodId(3), MethodId(4));
        let (exited, entered) = diff_samples(&[c, b, a], &[d, b, a]);
        assert_eq!(exited, vec![c]);
        assert_eq!(entered, vec![d]);

        let (exited, entered) = diff_samples(&[], &[c, b, a]);
        assert!(exited.is_empty());
        assert_eq!(entered, vec![a, b, c]);

        let (exited, entered) = diff_samples(&[b, a], &[b, a]);
        assert!(exited.is_empty() && entered.is_empty());
    }

    #[test]
    fn start_stop_errors() {
        let vm = MockVm::new(test_options());
        let tracer = vm.runtime.tracer();

        assert_eq!(tracer.stop(None).unwrap_err(), TraceError::NotRunning);
        assert_eq!(
            tracer
                .start(None, TraceMode::Sampling { interval: Duration::ZERO })
                .unwrap_err(),
            TraceError::InvalidInterval(Duration::ZERO)
        );

        tracer.start(None, TraceMode::MethodTracing).unwrap();
        assert_eq!(tracer.method_tracing_mode(), TracingMode::MethodTracingActive);
        assert_eq!(
            tracer.start(None, TraceMode::MethodTracing).unwrap_err(),
            TraceError::AlreadyRunning
        );
        tracer.stop(None).unwrap();
        assert_eq!(tracer.method_tracing_mode(), TracingMode::Inactive);
    }

    #[test]
    fn method_tracing_records_calls() {
        let vm = MockVm::new(test_options());
        let class = vm.define_class(
            "Lcom/example/Traced;",
            ClassStatus::Initialized,
            &[MethodSpec::new("run")],
        );
        let run = class.methods()[0].clone();
        let instrumentation = vm.runtime.instrumentation();
        let tracer = vm.runtime.tracer();

        tracer.start(None, TraceMode::MethodTracing).unwrap();
        assert_eq!(instrumentation.current_level(), InstrumentationLevel::EntryExitHooks);

        let mutator = vm.spawn("traced");
        let id = mutator.thread().id();
        let runtime = vm.runtime.clone();
        mutator.execute(move |thread| {
            runtime.instrumentation().invoke(thread, &run);
            runtime
                .instrumentation()
                .return_from(thread, EventValue::Void);
        });

        let result = tracer.stop(None).unwrap();
        assert_eq!(instrumentation.current_level(), InstrumentationLevel::Nothing);
        let actions = result
            .records
            .iter()
            .filter(|record| record.thread == id)
            .map(|record| (record.method, record.action))
            .collect::<Vec<_>>();
        let run = class.methods()[0].id();
        assert_eq!(actions, vec![(run, TraceAction::Enter), (run, TraceAction::Exit)]);
        assert!(result.threads.values().any(|name| name == "traced"));
    }

    #[test]
    fn sampling_sees_running_frames() {
        let vm = MockVm::new(test_options());
        let class = vm.define_class(
            "Lcom/example/Sampled;",
            ClassStatus::Initialized,
            &[MethodSpec::new("outer"), MethodSpec::new("inner")],
        );
        let outer = class.methods()[0].clone();
        let inner = class.methods()[1].clone();
        let mutator = vm.spawn("sampled");
        let runtime = vm.runtime.clone();
        mutator.execute(move |thread| {
            runtime.instrumentation().invoke(thread, &outer);
            runtime.instrumentation().invoke(thread, &inner);
        });

        let tracer = vm.runtime.tracer();
        tracer
            .start(None, TraceMode::Sampling { interval: Duration::from_millis(1) })
            .unwrap();
        assert_eq!(tracer.method_tracing_mode(), TracingMode::SampleProfilingActive);
        std::thread::sleep(Duration::from_millis(50));
        let result = tracer.stop(None).unwrap();

        let id = mutator.thread().id();
        let entered = result
            .records
            .iter()
            .filter(|record| record.thread == id && record.action == TraceAction::Enter)
            .map(|record| record.method)
            .collect::<Vec<_>>();
        assert_eq!(entered, vec![class.methods()[0].id(), class.methods()[1].id()]);
    }
}
