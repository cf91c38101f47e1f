use std::sync::Arc;

use vmcoord::{
    mock::{optimized_header, MockVm},
    runtime::{
        class_linker::{ClassStatus, MethodSpec},
        instrumentation::listeners::EventValue,
        options::RuntimeOptions,
        threads::Thread,
        trace::TraceMode,
    },
};

fn main() {
    env_logger::init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("usage: vmcoord [THREADS] [--vmcoord:<option>=<value>...]\n\noptions:\n{}", RuntimeOptions::help());
        return;
    }

    let options = match RuntimeOptions::from_args("vmcoord", args.iter().cloned(), std::env::vars()) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("vmcoord: {err}\n\noptions:\n{}", RuntimeOptions::help());
            std::process::exit(2);
        }
    };
    let threads = args
        .iter()
        .find(|arg| !arg.starts_with("--"))
        .and_then(|arg| arg.parse::<usize>().ok())
        .unwrap_or(4);

    let vm = MockVm::new(options);
    let code = vm.compiled_code(0x10_000, optimized_header(false), false);
    let class = vm.define_class(
        "Lcom/example/Demo;",
        ClassStatus::Initialized,
        &[
            MethodSpec::new("main"),
            MethodSpec::new("work").with_aot_code(code),
        ],
    );
    let main_method = class.methods()[0].clone();
    let work = class.methods()[1].clone();

    let mutators = (0..threads)
        .map(|i| vm.spawn(&format!("demo-{i}")))
        .collect::<Vec<_>>();
    for mutator in mutators.iter() {
        let runtime = vm.runtime.clone();
        let (main_method, work) = (main_method.clone(), work.clone());
        mutator.execute(move |thread: &Thread| {
            runtime.instrumentation().invoke(thread, &main_method);
            runtime.instrumentation().invoke(thread, &work);
        });
    }

    for round in 0..16 {
        let _ssa = vm.runtime.suspend_all(None, "demo");
        vm.thread_list().assert_other_threads_are_suspended(None);
        log::debug!("suspend-all round {round} holds {} threads", vm.thread_list().size());
    }
    let ran = vm
        .thread_list()
        .run_checkpoint_and_wait(None, Arc::new(|_: &Thread| {}));
    println!("checkpoint ran on {ran} threads");

    vm.instrumentation().deoptimize(None, &work);
    let marked = mutators
        .iter()
        .map(|mutator| {
            mutator
                .thread()
                .stack()
                .frames()
                .filter(|frame| !frame.deopt_flags.is_empty())
                .count()
        })
        .sum::<usize>();
    println!("deoptimized {}: {marked} frames marked", work.pretty_name());
    vm.instrumentation().undeoptimize(None, &work);

    if let Err(err) = vm.runtime.tracer().start(None, TraceMode::MethodTracing) {
        eprintln!("vmcoord: {err}");
        std::process::exit(1);
    }
    for mutator in mutators.iter() {
        let runtime = vm.runtime.clone();
        mutator.execute(move |thread: &Thread| {
            let instrumentation = runtime.instrumentation();
            instrumentation.return_from(thread, EventValue::Void);
            instrumentation.return_from(thread, EventValue::Void);
        });
    }
    match vm.runtime.tracer().stop(None) {
        Ok(result) => print!("{}", result.dump(vm.runtime.class_linker().as_ref())),
        Err(err) => eprintln!("vmcoord: {err}"),
    }

    let stats = vm.thread_list().stats();
    println!(
        "suspend-all: count={} total={:?} longest={:?}",
        stats.suspend_all_count, stats.total_pause, stats.longest_pause
    );
    println!("{}", vm.runtime.dump());

    drop(mutators);
    vm.runtime.shut_down(None);
}
