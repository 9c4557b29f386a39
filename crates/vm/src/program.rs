//! The program: immutable code and classes shared by every process.
//!
//! # Design
//!
//! A [`Program`] owns three kinds of memory:
//!
//! - the program heap (classes, functions, constants), behind an `RwLock`
//!   that is only taken for writing by the program collector;
//! - the [`SharedHeap`] of immutable objects created by processes;
//! - the [`ProcessRegistry`], the one list of live processes.
//!
//! Nothing here is a global. The scheduler, the collectors, and the
//! processes all reach the program through an `Arc<Program>`.
//!
//! # Collections that stop the world
//!
//! Both [`Program::collect_shared_garbage`] and
//! [`Program::collect_program_garbage`] lock every process. They must only
//! run while no process is executing: either from the scheduler after it
//! stopped all workers, or from a thread that runs no processes at all.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::bytecode::{Selector, SelectorKind, NO_SUCH_METHOD_TRAMPOLINE_ID};
use crate::collector::{PointerVisitor, ScavengeVisitor};
use crate::config::{Flags, RuntimeConfig};
use crate::error::RuntimeError;
use crate::heap::{Heap, SharedHeap};
use crate::object::{Address, ClassObject, FunctionObject, HeapObject, Intrinsic, Value};
use crate::platform::{HostPlatform, Platform};
use crate::process::{Process, ProcessState};
use crate::signal::{ProcessHandle, SignalKind};
use crate::space::{NoAllocationFailureScope, Space};
use crate::thread_state::ThreadState;
use crate::validator;

/// The program heap never asks for a collection by running out of budget.
const PROGRAM_HEAP_BUDGET: usize = 1 << 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How processes are shared between the registry and the workers.
pub type ProcessRef = Arc<Mutex<Process>>;

// ============================================================================
// Roots
// ============================================================================

/// Every program heap address the runtime knows by name.
#[derive(Debug, Clone, Default)]
pub struct ProgramRoots {
    pub meta_class: Address,
    pub object_class: Address,
    pub null_class: Address,
    pub bool_class: Address,
    pub array_class: Address,
    pub byte_array_class: Address,
    pub one_byte_string_class: Address,
    pub two_byte_string_class: Address,
    pub double_class: Address,
    pub large_integer_class: Address,
    pub boxed_class: Address,
    pub stack_class: Address,
    pub coroutine_class: Address,
    pub function_class: Address,
    pub foreign_memory_class: Address,
    pub process_class: Address,
    pub process_death_class: Address,
    pub channel_class: Address,

    pub null_object: Address,
    pub true_object: Address,
    pub false_object: Address,
    pub no_such_method_trampoline: Address,

    pub classes: Vec<Address>,
    pub constants: Vec<Value>,
    pub static_methods: Vec<Address>,
    /// Initial values of the static fields, copied into every process.
    pub static_fields: Vec<Value>,
    pub entry: Option<Address>,
    pub main_arity: usize,
}

impl ProgramRoots {
    pub fn null(&self) -> Value {
        Value::Ref(self.null_object)
    }

    pub fn visit_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for slot in [
            &mut self.meta_class,
            &mut self.object_class,
            &mut self.null_class,
            &mut self.bool_class,
            &mut self.array_class,
            &mut self.byte_array_class,
            &mut self.one_byte_string_class,
            &mut self.two_byte_string_class,
            &mut self.double_class,
            &mut self.large_integer_class,
            &mut self.boxed_class,
            &mut self.stack_class,
            &mut self.coroutine_class,
            &mut self.function_class,
            &mut self.foreign_memory_class,
            &mut self.process_class,
            &mut self.process_death_class,
            &mut self.channel_class,
            &mut self.null_object,
            &mut self.true_object,
            &mut self.false_object,
            &mut self.no_such_method_trampoline,
        ] {
            visitor.visit_address(slot);
        }
        for class in &mut self.classes {
            visitor.visit_address(class);
        }
        visitor.visit_block(&mut self.constants);
        for method in &mut self.static_methods {
            visitor.visit_address(method);
        }
        visitor.visit_block(&mut self.static_fields);
        if let Some(entry) = self.entry.as_mut() {
            visitor.visit_address(entry);
        }
    }
}

/// Resolve `selector` on `class` by walking the superclass chain.
pub fn lookup_method_in(heap: &Heap, class: Address, selector: Selector) -> Option<Address> {
    let mut current = class;
    loop {
        let class_object = heap.object(current)?.as_class()?;
        let methods = class_object
            .methods
            .as_address()
            .and_then(|methods| heap.object(methods))
            .and_then(HeapObject::values);
        if let Some(methods) = methods {
            let key = selector.raw() as i64;
            let (mut low, mut high) = (0, methods.len() / 2);
            while low < high {
                let mid = (low + high) / 2;
                match methods[2 * mid].as_smi().unwrap_or(i64::MAX).cmp(&key) {
                    std::cmp::Ordering::Less => low = mid + 1,
                    std::cmp::Ordering::Greater => high = mid,
                    std::cmp::Ordering::Equal => return methods[2 * mid + 1].as_address(),
                }
            }
        }
        current = class_object.super_class.as_address()?;
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The list of live processes, guarded by one mutex.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: Mutex<BTreeMap<ProcessId, ProcessRef>>,
}

impl ProcessRegistry {
    pub fn insert(&self, id: ProcessId, process: ProcessRef) {
        self.processes.lock().insert(id, process);
    }

    pub fn remove(&self, id: ProcessId) -> Option<ProcessRef> {
        self.processes.lock().remove(&id)
    }

    pub fn get(&self, id: ProcessId) -> Option<ProcessRef> {
        self.processes.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// Every registered process, in id order.
    pub fn snapshot(&self) -> Vec<ProcessRef> {
        self.processes.lock().values().cloned().collect()
    }

    fn drain(&self) -> Vec<ProcessRef> {
        std::mem::take(&mut *self.processes.lock()).into_values().collect()
    }
}

// ============================================================================
// Program
// ============================================================================

pub struct Program {
    config: RuntimeConfig,
    platform: Arc<dyn Platform>,
    heap: RwLock<Heap>,
    roots: RwLock<ProgramRoots>,
    shared_heap: SharedHeap,
    registry: ProcessRegistry,
    random: Mutex<fastrand::Rng>,
    next_process_id: AtomicU64,
    main_process: Mutex<Option<ProcessId>>,
    exit_kind: Mutex<Option<SignalKind>>,
    program_gc_count: AtomicU64,
    shared_gc_count: AtomicU64,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("processes", &self.registry.len())
            .field("exit_kind", &self.exit_kind())
            .finish()
    }
}

impl Program {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn flags(&self) -> &Flags {
        &self.config.flags
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn roots(&self) -> RwLockReadGuard<'_, ProgramRoots> {
        self.roots.read()
    }

    pub fn heap(&self) -> RwLockReadGuard<'_, Heap> {
        self.heap.read()
    }

    pub fn shared_heap(&self) -> &SharedHeap {
        &self.shared_heap
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Largest stack a process may grow to, in slots.
    pub fn max_stack_slots(&self) -> usize {
        self.config
            .gc
            .max_stack_slots
            .unwrap_or_else(|| self.platform.max_stack_size_in_words())
    }

    /// A seed for a new process's random generator.
    pub fn next_random_seed(&self) -> u64 {
        self.random.lock().u64(..)
    }

    pub fn exit_kind(&self) -> Option<SignalKind> {
        *self.exit_kind.lock()
    }

    pub fn main_process(&self) -> Option<ProcessId> {
        *self.main_process.lock()
    }

    pub fn program_gc_count(&self) -> u64 {
        self.program_gc_count.load(Ordering::Relaxed)
    }

    pub fn shared_gc_count(&self) -> u64 {
        self.shared_gc_count.load(Ordering::Relaxed)
    }

    pub fn lookup_method(&self, class: Address, selector: Selector) -> Option<Address> {
        lookup_method_in(&self.heap.read(), class, selector)
    }

    /// The function whose bytecodes contain `bcp`.
    pub fn function_containing(&self, bcp: Address) -> Option<Address> {
        function_containing_in(&self.heap.read(), bcp)
    }

    pub fn function_arity(&self, function: Address) -> Option<usize> {
        Some(self.heap.read().object(function)?.as_function()?.arity)
    }

    pub fn static_method_at(&self, index: usize) -> Option<Address> {
        self.roots.read().static_methods.get(index).copied()
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Create a process and register it. A child counts towards its
    /// parent's triangle count until it is deleted.
    pub fn spawn_process(self: &Arc<Self>, parent: Option<&Arc<ProcessHandle>>) -> Result<ProcessRef, RuntimeError> {
        let id = ProcessId(self.next_process_id.fetch_add(1, Ordering::Relaxed));
        let handle = ProcessHandle::new(id, parent.cloned());
        let process = Process::new(self.clone(), handle)?;
        if let Some(parent) = parent {
            parent.increment_triangle_count();
        }
        let process = Arc::new(Mutex::new(process));
        self.registry.insert(id, process.clone());
        log::trace!("spawned process {} (parent {:?})", id, parent.map(|p| p.id()));
        Ok(process)
    }

    /// Spawn the main process with its entry frame in place, ready to run.
    pub fn spawn_process_for_main(self: &Arc<Self>) -> Result<ProcessRef, RuntimeError> {
        if self.flags().print_program_statistics {
            self.print_statistics();
        }
        let (entry, arity, null) = {
            let roots = self.roots.read();
            let entry = roots
                .entry
                .ok_or_else(|| RuntimeError::Config("program has no entry function".into()))?;
            (entry, roots.main_arity, roots.null())
        };
        let process = self.spawn_process(None)?;
        {
            let mut guard = process.lock();
            guard.setup_entry(entry, &vec![null; arity])?;
            guard.handle().set_state(ProcessState::Ready);
            *self.main_process.lock() = Some(guard.id());
        }
        Ok(process)
    }

    /// Clean up a terminated process and delete it once it has no live
    /// children, continuing with ancestors whose last child this was.
    /// Returns whether `process` itself was deleted.
    pub fn schedule_process_for_deletion(&self, process: &ProcessRef, kind: SignalKind) -> bool {
        let mut current = {
            let mut guard = process.lock();
            guard.handle().set_state(ProcessState::WaitingForChildren);
            guard.cleanup(kind);
            if guard.handle().parent().is_none() {
                *self.exit_kind.lock() = Some(kind);
            }
            guard.handle().clone()
        };
        let mut deleted = false;
        loop {
            if current.decrement_triangle_count() > 0 {
                return deleted;
            }
            deleted = true;
            let parent = current.parent().cloned();
            if let Some(removed) = self.registry.remove(current.id()) {
                removed.lock().handle().set_state(ProcessState::Terminated);
                if self.flags().gc_on_delete {
                    self.shared_heap.request_collection();
                }
            }
            log::trace!("deleted process {}", current.id());
            match parent {
                Some(parent) => current = parent,
                None => return true,
            }
        }
    }

    /// Tear down every remaining process. Used at program exit.
    pub fn tear_down(&self) {
        for process in self.registry.drain() {
            let mut guard = process.lock();
            if guard.handle().is_alive() {
                guard.cleanup(SignalKind::Killed);
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared heap collection
    // ------------------------------------------------------------------

    /// Scavenge the shared heap. Roots are every process's roots plus the
    /// store buffer entries pointing into immutable space.
    pub fn collect_shared_garbage(&self) -> Result<(), RuntimeError> {
        let processes = self.registry.snapshot();
        let mut guards: Vec<MutexGuard<'_, Process>> = processes.iter().map(|p| p.lock()).collect();
        for process in guards.iter_mut() {
            process.release_immutable_heap();
            process.take_child_heaps();
        }

        let mut shared = self.shared_heap.lock();
        let used_before = shared.used();
        let mut to = Space::new(used_before / 10);
        let copied = {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(shared.space_mut(), &mut scope);
            for process in guards.iter_mut() {
                process.visit_shared_roots(&mut visitor);
            }
            visitor.complete_scavenge();
            visitor.copied_bytes()
        };
        shared.process_weak_pointers();
        shared.replace_space(to);
        let live = shared.used() + shared.foreign_memory();
        drop(shared);
        self.shared_heap.update_limit_after_gc(live);
        let count = self.shared_gc_count.fetch_add(1, Ordering::Relaxed) + 1;

        log::debug!(
            "shared gc #{}: {} -> {} bytes ({} copied)",
            count,
            used_before,
            live,
            copied
        );
        if self.config.gc.debug {
            eprintln!("[GC] Shared collection #{} complete, {} bytes live", count, live);
        }
        if self.flags().validate_heaps {
            validator::validate_program_heaps(self, &mut guards)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Program heap collection
    // ------------------------------------------------------------------

    /// Collect every process heap, chain its stacks, and cook them, so no
    /// frame holds a raw bytecode pointer while the program heap moves.
    pub fn prepare_program_gc(&self, processes: &mut [MutexGuard<'_, Process>]) -> Result<(), RuntimeError> {
        for process in processes.iter_mut() {
            process.release_immutable_heap();
            let stacks = process.collect_garbage_and_chain_stacks()?;
            process.cook_stacks(stacks)?;
        }
        Ok(())
    }

    /// Scavenge the program heap.
    pub fn perform_program_gc(&self, processes: &mut [MutexGuard<'_, Process>]) -> Result<(), RuntimeError> {
        let mut heap = self.heap.write();
        let mut roots = self.roots.write();
        let used_before = heap.used();
        let mut to = Space::with_budget(used_before / 10, PROGRAM_HEAP_BUDGET);
        {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(heap.space_mut(), &mut scope);
            roots.visit_pointers(&mut visitor);
            {
                let mut shared = self.shared_heap.lock();
                for (_, object) in shared.space_mut().iter_mut() {
                    object.visit_pointers(&mut visitor);
                }
            }
            for process in processes.iter_mut() {
                process.visit_program_pointers(&mut visitor);
            }
            visitor.complete_scavenge();
        }
        heap.process_weak_pointers();
        heap.replace_space(to);
        let count = self.program_gc_count.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("program gc #{}: {} -> {} bytes", count, used_before, heap.used());
        if self.config.gc.debug {
            eprintln!("[GC] Program collection #{} complete, {} bytes live", count, heap.used());
        }
        Ok(())
    }

    /// Undo [`prepare_program_gc`](Self::prepare_program_gc), re-index
    /// breakpoints, and drop every cached lookup.
    pub fn finish_program_gc(
        &self,
        processes: &mut [MutexGuard<'_, Process>],
        threads: &[Arc<ThreadState>],
    ) -> Result<(), RuntimeError> {
        for process in processes.iter_mut() {
            process.uncook_and_unchain_stacks()?;
            process.update_breakpoints();
        }
        for thread in threads {
            thread.clear_lookup_cache();
        }
        if self.flags().validate_heaps {
            validator::validate_program_heaps(self, processes)?;
        }
        if self.flags().print_program_statistics {
            self.print_statistics();
        }
        Ok(())
    }

    pub fn collect_program_garbage(&self, threads: &[Arc<ThreadState>]) -> Result<(), RuntimeError> {
        let processes = self.registry.snapshot();
        let mut guards: Vec<MutexGuard<'_, Process>> = processes.iter().map(|p| p.lock()).collect();
        self.prepare_program_gc(&mut guards)?;
        self.perform_program_gc(&mut guards)?;
        self.finish_program_gc(&mut guards, threads)
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> ProgramStatistics {
        let heap = self.heap.read();
        let mut stats = ProgramStatistics {
            program_heap_used: heap.used(),
            program_heap_size: heap.size(),
            shared_heap_used: self.shared_heap.used(),
            processes: self.registry.len(),
            ..ProgramStatistics::default()
        };
        for (_, object) in heap.space().iter() {
            if object.as_class().is_some() {
                stats.classes += 1;
            } else if let Some(function) = object.as_function() {
                stats.functions += 1;
                stats.bytecode_bytes += function.bytecodes.len();
            }
            stats.objects += 1;
        }
        stats
    }

    pub fn print_statistics(&self) {
        let stats = self.statistics();
        log::info!(
            "program: {} objects ({} classes, {} functions, {} bytecode bytes), heap {}/{} bytes, shared {} bytes, {} processes",
            stats.objects,
            stats.classes,
            stats.functions,
            stats.bytecode_bytes,
            stats.program_heap_used,
            stats.program_heap_size,
            stats.shared_heap_used,
            stats.processes
        );
    }
}

pub(crate) fn function_containing_in(heap: &Heap, bcp: Address) -> Option<Address> {
    let start = heap.space().find_object_containing(bcp)?;
    heap.object(start)?.as_function().map(|_| start)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStatistics {
    pub objects: usize,
    pub classes: usize,
    pub functions: usize,
    pub bytecode_bytes: usize,
    pub program_heap_used: usize,
    pub program_heap_size: usize,
    pub shared_heap_used: usize,
    pub processes: usize,
}

// ============================================================================
// Builder
// ============================================================================

/// Builds a program image: the core classes first, then whatever the
/// loader defines on top.
pub struct ProgramBuilder {
    config: RuntimeConfig,
    platform: Arc<dyn Platform>,
    heap: Heap,
    roots: ProgramRoots,
    seed: Option<u64>,
}

impl ProgramBuilder {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let heap = Heap::new(config.gc.program_heap_initial_bytes, PROGRAM_HEAP_BUDGET);
        let mut builder = Self {
            config,
            platform: Arc::new(HostPlatform::new()),
            heap,
            roots: ProgramRoots::default(),
            seed: None,
        };
        builder.bootstrap()?;
        Ok(builder)
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// Fix the seed of the program's random generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn roots(&self) -> &ProgramRoots {
        &self.roots
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn bootstrap(&mut self) -> Result<(), RuntimeError> {
        let meta = self.allocate_class(Address(0), Value::Empty, 0)?;
        if let Some(object) = self.heap.object_mut(meta) {
            object.class = meta;
        }
        self.roots.meta_class = meta;

        let object_class = self.allocate_class(meta, Value::Empty, 0)?;
        self.roots.object_class = object_class;
        let base = Value::Ref(object_class);
        self.roots.array_class = self.allocate_class(meta, base, 0)?;

        self.roots.null_class = self.allocate_class(meta, base, 0)?;
        self.roots.bool_class = self.allocate_class(meta, base, 0)?;
        self.roots.byte_array_class = self.allocate_class(meta, base, 0)?;
        self.roots.one_byte_string_class = self.allocate_class(meta, base, 0)?;
        self.roots.two_byte_string_class = self.allocate_class(meta, base, 0)?;
        self.roots.double_class = self.allocate_class(meta, base, 0)?;
        self.roots.large_integer_class = self.allocate_class(meta, base, 0)?;
        self.roots.boxed_class = self.allocate_class(meta, base, 0)?;
        self.roots.stack_class = self.allocate_class(meta, base, 0)?;
        self.roots.coroutine_class = self.allocate_class(meta, base, 2)?;
        self.roots.function_class = self.allocate_class(meta, base, 0)?;
        self.roots.foreign_memory_class = self.allocate_class(meta, base, 2)?;
        self.roots.process_class = self.allocate_class(meta, base, 1)?;
        self.roots.process_death_class = self.allocate_class(meta, base, 2)?;
        self.roots.channel_class = self.allocate_class(meta, base, 1)?;

        self.roots.null_object = self.bootstrap_instance(self.roots.null_class)?;
        self.roots.true_object = self.bootstrap_instance(self.roots.bool_class)?;
        self.roots.false_object = self.bootstrap_instance(self.roots.bool_class)?;

        let trampoline = self.define_function(0, vec![crate::bytecode::Opcode::MethodEnd as u8; 5], vec![])?;
        self.roots.no_such_method_trampoline = trampoline;
        let selector = Selector::encode(NO_SUCH_METHOD_TRAMPOLINE_ID, SelectorKind::Method, 0);
        self.set_methods(object_class, &[(selector, trampoline)])?;
        Ok(())
    }

    fn allocate_class(&mut self, meta: Address, super_class: Value, instance_fields: usize) -> Result<Address, RuntimeError> {
        let class = ClassObject {
            id: self.roots.classes.len() as i32,
            super_class,
            methods: Value::Empty,
            instance_fields,
        };
        let address = self
            .heap
            .create_class(meta, class)
            .map_err(|_| RuntimeError::AllocationFailed { what: "class" })?;
        self.roots.classes.push(address);
        Ok(address)
    }

    fn bootstrap_instance(&mut self, class: Address) -> Result<Address, RuntimeError> {
        self.heap
            .create_instance(class, 0, Value::Empty, true)
            .map_err(|_| RuntimeError::AllocationFailed { what: "instance" })
    }

    /// Define a class. `super_class` defaults to the object class.
    pub fn define_class(
        &mut self,
        super_class: Option<Address>,
        instance_fields: usize,
        methods: &[(Selector, Address)],
    ) -> Result<Address, RuntimeError> {
        let super_class = Value::Ref(super_class.unwrap_or(self.roots.object_class));
        let class = self.allocate_class(self.roots.meta_class, super_class, instance_fields)?;
        self.set_methods(class, methods)?;
        Ok(class)
    }

    /// Replace the method table of `class`.
    pub fn set_methods(&mut self, class: Address, methods: &[(Selector, Address)]) -> Result<(), RuntimeError> {
        let mut sorted = methods.to_vec();
        sorted.sort_by_key(|(selector, _)| selector.raw());
        let values = sorted
            .into_iter()
            .flat_map(|(selector, function)| [Value::Smi(selector.raw() as i64), Value::Ref(function)])
            .collect();
        let table = self
            .heap
            .create_array_from(self.roots.array_class, values, true)
            .map_err(|_| RuntimeError::AllocationFailed { what: "method table" })?;
        let class_object = self
            .heap
            .object_mut(class)
            .and_then(HeapObject::as_class_mut)
            .ok_or_else(|| RuntimeError::invariant(format!("{} is not a class", class)))?;
        class_object.methods = Value::Ref(table);
        Ok(())
    }

    pub fn define_function(&mut self, arity: usize, bytecodes: Vec<u8>, literals: Vec<Value>) -> Result<Address, RuntimeError> {
        self.define_function_with_intrinsic(arity, bytecodes, literals, None)
    }

    pub fn define_function_with_intrinsic(
        &mut self,
        arity: usize,
        bytecodes: Vec<u8>,
        literals: Vec<Value>,
        intrinsic: Option<Intrinsic>,
    ) -> Result<Address, RuntimeError> {
        let function = FunctionObject {
            arity,
            bytecodes,
            literals,
            intrinsic,
        };
        self.heap
            .create_function(self.roots.function_class, function)
            .map_err(|_| RuntimeError::AllocationFailed { what: "function" })
    }

    /// A string constant in the program heap.
    pub fn define_string(&mut self, text: &str) -> Result<Address, RuntimeError> {
        self.heap
            .create_one_byte_string(self.roots.one_byte_string_class, text.as_bytes().to_vec())
            .map_err(|_| RuntimeError::AllocationFailed { what: "string" })
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.roots.constants.push(value);
        self.roots.constants.len() - 1
    }

    pub fn add_static_method(&mut self, function: Address) -> usize {
        self.roots.static_methods.push(function);
        self.roots.static_methods.len() - 1
    }

    pub fn add_static_field(&mut self, initial: Value) -> usize {
        self.roots.static_fields.push(initial);
        self.roots.static_fields.len() - 1
    }

    pub fn set_entry(&mut self, function: Address, arity: usize) {
        self.roots.entry = Some(function);
        self.roots.main_arity = arity;
    }

    pub fn build(self) -> Arc<Program> {
        let random = match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let shared_heap = SharedHeap::new(&self.config.gc);
        Arc::new(Program {
            platform: self.platform,
            heap: RwLock::new(self.heap),
            roots: RwLock::new(self.roots),
            shared_heap,
            registry: ProcessRegistry::default(),
            random: Mutex::new(random),
            next_process_id: AtomicU64::new(1),
            main_process: Mutex::new(None),
            exit_kind: Mutex::new(None),
            program_gc_count: AtomicU64::new(0),
            shared_gc_count: AtomicU64::new(0),
            config: self.config,
        })
    }
}
