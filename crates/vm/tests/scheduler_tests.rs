//! Scheduler integration tests
//!
//! Each test drives the scheduler with a small scripted interpreter. The
//! scripts keep their per-process state in the interpreter, keyed by
//! process id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use isle_vm::natives::process_queue_get_message;
use isle_vm::{
    Interpreter, Interruption, Port, Process, ProcessHandle, ProcessId, ProcessState, Program, ProgramBuilder, RuntimeConfig,
    Scheduler, SignalKind, Value,
};

fn program_with(workers: usize, configure: impl FnOnce(&mut RuntimeConfig)) -> Arc<Program> {
    let mut config = RuntimeConfig::default();
    config.scheduler.workers = workers;
    config.scheduler.idle_timeout_ms = 2;
    configure(&mut config);
    let mut builder = ProgramBuilder::new(config).unwrap();
    let main = builder.define_function(0, vec![0; 16], vec![]).unwrap();
    builder.add_static_method(main);
    builder.set_entry(main, 0);
    builder.build()
}

fn program(workers: usize) -> Arc<Program> {
    program_with(workers, |_| {})
}

fn is_main(process: &Process, scheduler: &Scheduler) -> bool {
    scheduler.program().main_process() == Some(process.id())
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Spawning
// ============================================================================

struct FanOut {
    children: usize,
    finished: AtomicUsize,
}

impl Interpreter for FanOut {
    fn run(&self, process: &mut Process, scheduler: &Scheduler) -> Interruption {
        if is_main(process, scheduler) {
            let entry = scheduler.program().static_method_at(0).unwrap();
            for _ in 0..self.children {
                scheduler.spawn(Some(process.handle()), entry, &[]).unwrap();
            }
            return Interruption::Terminate;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Interruption::Terminate
    }
}

#[test]
fn test_main_waits_for_all_children() {
    let interpreter = Arc::new(FanOut {
        children: 64,
        finished: AtomicUsize::new(0),
    });
    let scheduler = Scheduler::new(program(4), interpreter.clone());
    assert_eq!(scheduler.run_main().unwrap(), SignalKind::Terminated);
    assert_eq!(interpreter.finished.load(Ordering::SeqCst), 64);
    assert!(scheduler.program().registry().is_empty());
    assert_eq!(scheduler.slices(), 65);
}

// ============================================================================
// Messaging
// ============================================================================

/// Main and one child pass a counter back and forth until it reaches
/// `rounds`.
struct PingPong {
    rounds: i64,
    ports: Mutex<HashMap<ProcessId, Arc<Port>>>,
    main_port: Mutex<Option<Arc<Port>>>,
    child_port: Mutex<Option<Arc<Port>>>,
    last: Mutex<i64>,
}

impl PingPong {
    fn port_of(&self, process: &mut Process) -> Arc<Port> {
        self.ports
            .lock()
            .entry(process.id())
            .or_insert_with(|| process.new_port().unwrap())
            .clone()
    }
}

impl Interpreter for PingPong {
    fn run(&self, process: &mut Process, scheduler: &Scheduler) -> Interruption {
        let main = is_main(process, scheduler);
        let own = self.port_of(process);
        if main && self.main_port.lock().is_none() {
            *self.main_port.lock() = Some(own);
            let entry = scheduler.program().static_method_at(0).unwrap();
            scheduler.spawn(Some(process.handle()), entry, &[]).unwrap();
            return Interruption::Sleep;
        }
        if !main && self.child_port.lock().is_none() {
            *self.child_port.lock() = Some(own);
            let main_port = self.main_port.lock().clone().unwrap();
            scheduler.send(process, &main_port, Value::Smi(0)).unwrap();
            return Interruption::Sleep;
        }

        let peer = if main {
            self.child_port.lock().clone().unwrap()
        } else {
            self.main_port.lock().clone().unwrap()
        };
        loop {
            if process.mailbox_mut().is_empty() {
                return Interruption::Sleep;
            }
            let Value::Smi(count) = process_queue_get_message(process).unwrap() else {
                return Interruption::UncaughtException;
            };
            if count < 0 {
                return Interruption::Terminate;
            }
            *self.last.lock() = count;
            if main && count >= self.rounds {
                scheduler.send(process, &peer, Value::Smi(-1)).unwrap();
                return Interruption::Terminate;
            }
            scheduler.send(process, &peer, Value::Smi(count + 1)).unwrap();
        }
    }
}

#[test]
fn test_ping_pong() {
    let interpreter = Arc::new(PingPong {
        rounds: 100,
        ports: Mutex::new(HashMap::new()),
        main_port: Mutex::new(None),
        child_port: Mutex::new(None),
        last: Mutex::new(0),
    });
    let scheduler = Scheduler::new(program(2), interpreter.clone());
    assert_eq!(scheduler.run_main().unwrap(), SignalKind::Terminated);
    assert_eq!(*interpreter.last.lock(), 100);
    assert!(scheduler.program().registry().is_empty());
}

/// Main links to a child that throws once the link is in place; the link
/// signal kills main.
struct LinkedFailure {
    linked: AtomicBool,
}

impl Interpreter for LinkedFailure {
    fn run(&self, process: &mut Process, scheduler: &Scheduler) -> Interruption {
        if !is_main(process, scheduler) {
            return if self.linked.load(Ordering::SeqCst) {
                Interruption::UncaughtException
            } else {
                Interruption::Yield
            };
        }
        let entry = scheduler.program().static_method_at(0).unwrap();
        let child = scheduler.spawn(Some(process.handle()), entry, &[]).unwrap();
        if let Some(child) = scheduler.program().registry().get(child) {
            let child = child.lock().handle().clone();
            ProcessHandle::link(process.handle(), &child);
        }
        self.linked.store(true, Ordering::SeqCst);
        Interruption::Sleep
    }
}

#[test]
fn test_linked_failure_kills_main() {
    let interpreter = Arc::new(LinkedFailure {
        linked: AtomicBool::new(false),
    });
    let scheduler = Scheduler::new(program(2), interpreter);
    assert_eq!(scheduler.run_main().unwrap(), SignalKind::UnhandledSignal);
    assert!(scheduler.program().registry().is_empty());
}

// ============================================================================
// Debugging
// ============================================================================

struct StopOnce {
    stopped: AtomicBool,
}

impl Interpreter for StopOnce {
    fn run(&self, _process: &mut Process, _scheduler: &Scheduler) -> Interruption {
        if self.stopped.swap(true, Ordering::SeqCst) {
            Interruption::Terminate
        } else {
            Interruption::Breakpoint
        }
    }
}

#[test]
fn test_breakpoint_parks_until_resumed() {
    let scheduler = Scheduler::new(
        program(1),
        Arc::new(StopOnce {
            stopped: AtomicBool::new(false),
        }),
    );
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || scheduler.run_main())
    };

    let program = Arc::clone(scheduler.program());
    wait_for("main to start", || program.main_process().is_some());
    let main = program.main_process().unwrap();
    let handle = program.registry().get(main).unwrap().lock().handle().clone();
    wait_for("breakpoint", || handle.state() == ProcessState::Breakpoint);

    // Parked processes are not scheduled.
    let slices = scheduler.slices();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(scheduler.slices(), slices);

    scheduler.resume_from_breakpoint(main).unwrap();
    assert_eq!(runner.join().unwrap().unwrap(), SignalKind::Terminated);
    assert!(scheduler.resume_from_breakpoint(main).is_err());
}

// ============================================================================
// Stop the world
// ============================================================================

/// Main yields until told to stop, checking that its innermost frame
/// always resolves to the entry function.
struct Spinner {
    stop: AtomicBool,
    resolved: AtomicUsize,
    unresolved: AtomicUsize,
}

impl Interpreter for Spinner {
    fn run(&self, process: &mut Process, scheduler: &Scheduler) -> Interruption {
        let entry = scheduler.program().static_method_at(0);
        match process.frames().first() {
            Some(&(function, _)) if Some(function) == entry => self.resolved.fetch_add(1, Ordering::SeqCst),
            _ => self.unresolved.fetch_add(1, Ordering::SeqCst),
        };
        if self.stop.load(Ordering::SeqCst) {
            Interruption::Terminate
        } else {
            Interruption::Yield
        }
    }
}

#[test]
fn test_program_collection_while_running() {
    let interpreter = Arc::new(Spinner {
        stop: AtomicBool::new(false),
        resolved: AtomicUsize::new(0),
        unresolved: AtomicUsize::new(0),
    });
    let program = program_with(2, |config| config.flags.validate_heaps = true);
    let scheduler = Scheduler::new(program, interpreter.clone());
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || scheduler.run_main())
    };

    wait_for("main to run", || scheduler.slices() > 0);
    for _ in 0..5 {
        scheduler.collect_program_garbage().unwrap();
        scheduler.collect_shared_garbage().unwrap();
    }
    assert_eq!(scheduler.program().program_gc_count(), 5);
    interpreter.stop.store(true, Ordering::SeqCst);

    assert_eq!(runner.join().unwrap().unwrap(), SignalKind::Terminated);
    assert!(interpreter.resolved.load(Ordering::SeqCst) > 0);
    assert_eq!(interpreter.unresolved.load(Ordering::SeqCst), 0);
}

/// Main spins with a growing stack check until the profiler has ticked.
struct Profiled {
    ticks: AtomicUsize,
}

impl Interpreter for Profiled {
    fn run(&self, process: &mut Process, _scheduler: &Scheduler) -> Interruption {
        thread::sleep(Duration::from_millis(2));
        if !process.handle().stack_limit().pending().is_empty() && process.handle_stack_overflow(0).is_err() {
            return Interruption::UncaughtException;
        }
        let ticks = process.handle().profile_ticks();
        self.ticks.store(ticks, Ordering::SeqCst);
        if ticks > 0 {
            Interruption::Terminate
        } else {
            Interruption::Yield
        }
    }
}

#[test]
fn test_profiler_ticks_running_process() {
    let program = program_with(1, |config| {
        config.flags.profile = true;
        config.scheduler.profile_interval_us = 500;
    });
    let interpreter = Arc::new(Profiled {
        ticks: AtomicUsize::new(0),
    });
    let scheduler = Scheduler::new(program, interpreter.clone());
    assert_eq!(scheduler.run_main().unwrap(), SignalKind::Terminated);
    assert!(interpreter.ticks.load(Ordering::SeqCst) > 0);
}
