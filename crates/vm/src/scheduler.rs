//! Multi-threaded process scheduler.
//!
//! # Design
//!
//! Worker threads each own a [`ThreadState`] with a local run queue. New
//! and woken processes go through a global [`Injector`]; an idle worker
//! drains its own queue, then the injector, then steals from other workers.
//!
//! A process runs until the [`Interpreter`] returns an [`Interruption`]. The
//! interpreter only gives control back at a stack check, so every return
//! value is an explicit suspension point.
//!
//! Collections of the shared and program heaps need every process stopped.
//! Workers hold the world lock for reading while a process runs; a
//! collection preempts running processes and then takes it for writing.
//!
//! # Usage
//!
//! ```ignore
//! let program = builder.build();
//! let scheduler = Scheduler::new(program, Arc::new(MyInterpreter));
//! let exit = scheduler.run_main()?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Failure, RuntimeError};
use crate::natives;
use crate::object::{Address, Value};
use crate::port::Port;
use crate::process::{Process, ProcessState};
use crate::program::{ProcessId, ProcessRef, Program};
use crate::signal::{ProcessHandle, SignalKind};
use crate::thread_state::ThreadState;

/// Why the interpreter gave control back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interruption {
    /// The time slice is used up.
    Yield,
    /// A stack check saw a preempt request.
    Interrupt,
    /// Waiting for a message.
    Sleep,
    /// Stopped at a breakpoint or after a step.
    Breakpoint,
    /// Finished normally.
    Terminate,
    UncaughtException,
    CompileTimeError,
}

impl Interruption {
    /// Exit kind for interruptions that end the process.
    pub fn exit_kind(self) -> Option<SignalKind> {
        match self {
            Interruption::Terminate => Some(SignalKind::Terminated),
            Interruption::UncaughtException => Some(SignalKind::UncaughtException),
            Interruption::CompileTimeError => Some(SignalKind::CompileTimeError),
            Interruption::Yield | Interruption::Interrupt | Interruption::Sleep | Interruption::Breakpoint => None,
        }
    }
}

/// Runs bytecode of one process until the next suspension point.
pub trait Interpreter: Send + Sync {
    fn run(&self, process: &mut Process, scheduler: &Scheduler) -> Interruption;
}

pub struct Scheduler {
    program: Arc<Program>,
    interpreter: Arc<dyn Interpreter>,
    injector: Injector<ProcessRef>,
    threads: Vec<Arc<ThreadState>>,
    /// Handles of processes inside a time slice.
    running: Mutex<HashMap<ProcessId, Arc<ProcessHandle>>>,
    world: RwLock<()>,
    shutdown: AtomicBool,
    done: Mutex<bool>,
    done_signal: Condvar,
    failure: Mutex<Option<RuntimeError>>,
    slices: AtomicUsize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.threads.len())
            .field("running", &self.running.lock().len())
            .field("slices", &self.slices.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler {
    pub fn new(program: Arc<Program>, interpreter: Arc<dyn Interpreter>) -> Arc<Self> {
        let workers = program.config().scheduler.worker_count();
        let threads = (0..workers).map(ThreadState::new).collect();
        Arc::new(Self {
            program,
            interpreter,
            injector: Injector::new(),
            threads,
            running: Mutex::new(HashMap::new()),
            world: RwLock::new(()),
            shutdown: AtomicBool::new(false),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
            failure: Mutex::new(None),
            slices: AtomicUsize::new(0),
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn threads(&self) -> &[Arc<ThreadState>] {
        &self.threads
    }

    /// Number of time slices run so far.
    pub fn slices(&self) -> usize {
        self.slices.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Make a process runnable.
    pub fn enqueue(&self, process: ProcessRef) {
        self.injector.push(process);
        for thread in &self.threads {
            thread.notify();
        }
    }

    /// Move a sleeping process back to a run queue. Returns whether it was
    /// sleeping.
    pub fn wake(&self, handle: &ProcessHandle) -> bool {
        if !handle.change_state(ProcessState::Sleeping, ProcessState::Ready) {
            return false;
        }
        match self.program.registry().get(handle.id()) {
            Some(process) => {
                log::trace!("woke process {}", handle.id());
                self.enqueue(process);
                true
            }
            None => false,
        }
    }

    /// Wake every sleeping process with a queued message or signal. Must be
    /// called without holding a process lock.
    pub fn wake_pending(&self) -> usize {
        let mut woken = 0;
        for process in self.program.registry().snapshot() {
            let handle = process.lock().handle().clone();
            if (handle.has_signal() || !handle.inbox().is_empty()) && self.wake(&handle) {
                woken += 1;
            }
        }
        woken
    }

    /// Continue a process parked at a breakpoint.
    pub fn resume_from_breakpoint(&self, id: ProcessId) -> Result<(), RuntimeError> {
        let process = self
            .program
            .registry()
            .get(id)
            .ok_or(RuntimeError::ProcessNotFound(id))?;
        {
            let mut guard = process.lock();
            if !guard
                .handle()
                .change_state(ProcessState::Breakpoint, ProcessState::Ready)
            {
                return Err(RuntimeError::invariant(format!("process {} is not at a breakpoint", id)));
            }
            guard.debug_info_mut().clear_current_breakpoint();
        }
        self.enqueue(process);
        Ok(())
    }

    fn find_work(&self, thread: &ThreadState) -> Option<ProcessRef> {
        if let Some(process) = thread.dequeue() {
            return Some(process);
        }
        loop {
            match self.injector.steal() {
                Steal::Success(process) => return Some(process),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        self.threads
            .iter()
            .filter(|other| other.id() != thread.id())
            .find_map(|other| other.dequeue())
    }

    // ------------------------------------------------------------------
    // Process creation and messaging
    // ------------------------------------------------------------------

    /// Spawn a process that runs `entry` with `arguments` and queue it.
    pub fn spawn(
        &self,
        parent: Option<&Arc<ProcessHandle>>,
        entry: Address,
        arguments: &[Value],
    ) -> Result<ProcessId, RuntimeError> {
        let process = self.program.spawn_process(parent)?;
        let id = {
            let mut guard = process.lock();
            guard.setup_entry(entry, arguments)?;
            guard.handle().set_state(ProcessState::Ready);
            guard.id()
        };
        self.enqueue(process);
        Ok(id)
    }

    /// Send `value` from `sender` to `port` and wake the receiver.
    pub fn send(&self, sender: &Process, port: &Arc<Port>, value: Value) -> Result<bool, Failure> {
        let Some(receiver) = natives::port_send(sender, port, value)? else {
            return Ok(false);
        };
        self.wake(&receiver);
        Ok(true)
    }

    /// Send the exit value of `sender` to `port` and wake the receiver.
    /// The sender must terminate afterwards.
    pub fn send_exit(&self, sender: &mut Process, port: &Arc<Port>, value: Value) -> bool {
        let sent = natives::port_send_exit(sender, port, value);
        if let Some(owner) = port.owner() {
            self.wake(&owner);
        }
        sent
    }

    // ------------------------------------------------------------------
    // Stop the world
    // ------------------------------------------------------------------

    /// Run `f` while no process is running. Must not be called from inside
    /// a time slice.
    pub fn with_program_stopped<R>(&self, f: impl FnOnce() -> R) -> R {
        for handle in self.running.lock().values() {
            handle.preempt();
        }
        let _world = self.world.write();
        f()
    }

    pub fn collect_shared_garbage(&self) -> Result<(), RuntimeError> {
        self.with_program_stopped(|| self.program.collect_shared_garbage())
    }

    pub fn collect_program_garbage(&self) -> Result<(), RuntimeError> {
        self.with_program_stopped(|| self.program.collect_program_garbage(&self.threads))
    }

    fn collect_shared_garbage_if_needed(&self) {
        if !self.program.shared_heap().needs_garbage_collection() {
            return;
        }
        let result = self.with_program_stopped(|| {
            // Another worker may have collected while we waited.
            if self.program.shared_heap().needs_garbage_collection() {
                self.program.collect_shared_garbage()
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            self.fail(err);
        }
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Run the program's main process and everything it spawns. Returns
    /// how the main process ended.
    pub fn run_main(self: &Arc<Self>) -> Result<SignalKind, RuntimeError> {
        let main = self.program.spawn_process_for_main()?;
        self.enqueue(main);

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.threads.len() + 1);
        for thread in &self.threads {
            let scheduler = Arc::clone(self);
            let thread = Arc::clone(thread);
            let handle = thread::Builder::new()
                .name(format!("isle-worker-{}", thread.id()))
                .spawn(move || scheduler.worker_loop(thread))
                .map_err(|err| RuntimeError::invariant(format!("failed to spawn worker: {}", err)))?;
            workers.push(handle);
        }
        if self.program.flags().profile {
            let scheduler = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("isle-profiler".to_string())
                .spawn(move || scheduler.profiler_loop())
                .map_err(|err| RuntimeError::invariant(format!("failed to spawn profiler: {}", err)))?;
            workers.push(handle);
        }

        {
            let mut done = self.done.lock();
            while !*done {
                self.done_signal.wait(&mut done);
            }
        }
        self.shutdown.store(true, Ordering::Release);
        for thread in &self.threads {
            thread.notify();
        }
        for worker in workers {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
        self.program.tear_down();

        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        self.program
            .exit_kind()
            .ok_or_else(|| RuntimeError::invariant("main process ended without an exit kind"))
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.done_signal.notify_all();
    }

    /// Stop the program with `err`. Invariant violations abort the VM.
    fn fail(&self, err: RuntimeError) {
        if err.is_fatal() {
            self.program.platform().abort(&err.to_string());
        }
        log::error!("scheduler stopping: {}", err);
        self.failure.lock().get_or_insert(err);
        self.finish();
    }

    fn worker_loop(&self, thread: Arc<ThreadState>) {
        let idle = Duration::from_millis(self.program.config().scheduler.idle_timeout_ms);
        log::debug!("worker {} started", thread.id());
        while !self.shutdown.load(Ordering::Acquire) {
            match self.find_work(&thread) {
                Some(process) => self.run_slice(&thread, process),
                None => {
                    thread.wait_idle(idle);
                }
            }
            self.collect_shared_garbage_if_needed();
        }
        log::debug!("worker {} stopped after {} processes", thread.id(), thread.processes_run());
    }

    fn profiler_loop(&self) {
        let interval = Duration::from_micros(self.program.config().scheduler.profile_interval_us);
        while !self.shutdown.load(Ordering::Acquire) {
            thread::sleep(interval);
            for handle in self.running.lock().values() {
                handle.profile();
            }
        }
    }

    /// Run one time slice of `process_ref` on `thread`.
    fn run_slice(&self, thread: &Arc<ThreadState>, process_ref: ProcessRef) {
        let world = self.world.read();
        let mut process = process_ref.lock();
        let handle = process.handle().clone();
        if !handle.change_state(ProcessState::Ready, ProcessState::Running) {
            // Queued twice, or terminated while queued.
            return;
        }
        self.slices.fetch_add(1, Ordering::Relaxed);
        self.running.lock().insert(handle.id(), handle.clone());
        process.attach_thread(Arc::clone(thread));

        let outcome = match handle.take_signal() {
            Some(signal) if signal.kind() != SignalKind::Terminated => {
                log::debug!(
                    "process {} killed by {:?} from process {}",
                    handle.id(),
                    signal.kind(),
                    signal.handle().id()
                );
                Err(SignalKind::UnhandledSignal)
            }
            _ => Ok(self.interpreter.run(&mut process, self)),
        };

        process.detach_thread();
        self.running.lock().remove(&handle.id());

        let exit = match outcome {
            Err(kind) => Some(kind),
            Ok(interruption) => interruption.exit_kind().or_else(|| {
                self.suspend(&handle, &process_ref, thread, interruption);
                None
            }),
        };
        drop(process);
        drop(world);

        if let Some(kind) = exit {
            self.terminate(&handle, &process_ref, kind);
        }
    }

    fn suspend(&self, handle: &ProcessHandle, process: &ProcessRef, thread: &ThreadState, interruption: Interruption) {
        match interruption {
            Interruption::Yield | Interruption::Interrupt => {
                handle.set_state(ProcessState::Ready);
                thread.enqueue(Arc::clone(process));
            }
            Interruption::Sleep => {
                handle.set_state(ProcessState::Sleeping);
                let pending = handle.has_signal() || !handle.inbox().is_empty();
                if pending && handle.change_state(ProcessState::Sleeping, ProcessState::Ready) {
                    thread.enqueue(Arc::clone(process));
                }
            }
            Interruption::Breakpoint => {
                log::debug!("process {} stopped at a breakpoint", handle.id());
                handle.set_state(ProcessState::Breakpoint);
            }
            Interruption::Terminate | Interruption::UncaughtException | Interruption::CompileTimeError => {}
        }
    }

    fn terminate(&self, handle: &ProcessHandle, process: &ProcessRef, kind: SignalKind) {
        let state = match kind {
            SignalKind::UncaughtException => ProcessState::UncaughtException,
            SignalKind::CompileTimeError => ProcessState::CompileTimeError,
            _ => ProcessState::Terminated,
        };
        handle.set_state(state);
        log::debug!("process {} terminated: {:?}", handle.id(), kind);
        let deleted = self.program.schedule_process_for_deletion(process, kind);
        self.wake_pending();

        let main_gone = self
            .program
            .main_process()
            .is_some_and(|main| self.program.registry().get(main).is_none());
        if deleted && main_gone {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::program::ProgramBuilder;

    struct CountDown {
        slices: AtomicUsize,
        limit: usize,
    }

    impl Interpreter for CountDown {
        fn run(&self, _process: &mut Process, _scheduler: &Scheduler) -> Interruption {
            if self.slices.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
                Interruption::Terminate
            } else {
                Interruption::Yield
            }
        }
    }

    fn program(workers: usize) -> Arc<Program> {
        let mut config = RuntimeConfig::default();
        config.scheduler.workers = workers;
        config.scheduler.idle_timeout_ms = 5;
        let mut builder = ProgramBuilder::new(config).unwrap();
        let main = builder.define_function(0, vec![0; 8], vec![]).unwrap();
        builder.set_entry(main, 0);
        builder.build()
    }

    #[test]
    fn test_main_runs_until_terminated() {
        let interpreter = Arc::new(CountDown {
            slices: AtomicUsize::new(0),
            limit: 5,
        });
        let scheduler = Scheduler::new(program(2), interpreter.clone());
        assert_eq!(scheduler.run_main().unwrap(), SignalKind::Terminated);
        assert_eq!(interpreter.slices.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.slices(), 5);
        assert!(scheduler.program().registry().is_empty());
    }

    #[test]
    fn test_uncaught_exception_is_exit_kind() {
        struct Throw;
        impl Interpreter for Throw {
            fn run(&self, _process: &mut Process, _scheduler: &Scheduler) -> Interruption {
                Interruption::UncaughtException
            }
        }
        let scheduler = Scheduler::new(program(1), Arc::new(Throw));
        assert_eq!(scheduler.run_main().unwrap(), SignalKind::UncaughtException);
    }

    #[test]
    fn test_interruption_exit_kinds() {
        assert_eq!(Interruption::Terminate.exit_kind(), Some(SignalKind::Terminated));
        assert_eq!(Interruption::CompileTimeError.exit_kind(), Some(SignalKind::CompileTimeError));
        assert_eq!(Interruption::Yield.exit_kind(), None);
        assert_eq!(Interruption::Sleep.exit_kind(), None);
    }
}
