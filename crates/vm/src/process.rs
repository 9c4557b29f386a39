//! Lightweight isolated processes.
//!
//! # Design
//!
//! A [`Process`] owns its mutable heap, the store buffer for that heap, a
//! mailbox, and its ports. It borrows a private part of the shared heap
//! while it runs and gives it back when it stops, so immutable allocation
//! never takes a lock.
//!
//! The parts of a process other threads may touch (stack limit word,
//! signal slot, inbox, links) live in its
//! [`ProcessHandle`](crate::signal::ProcessHandle).
//!
//! Execution state is a coroutine object `[stack, caller]` in the process
//! heap. While suspended, the current stack holds the interpreter registers
//! at its top (see [`crate::stack`]).
//!
//! # Collection
//!
//! [`Process::collect_mutable_garbage`] collects the process heap only.
//! Roots are the coroutine (visited first, so the current stack heads the
//! stack chain), the statics, the pending exception, the breakpoint
//! coroutines, and the mailbox. By default the heap is scavenged; with the
//! `mark-sweep` feature it is marked and swept in place. Either collector
//! can also be requested explicitly with a [`CollectorKind`].

use std::fmt;
use std::sync::Arc;

use num_enum::TryFromPrimitive;

use crate::bytecode::{decode_invoke, InvokeTarget, Selector, SelectorKind, NO_SUCH_METHOD_TRAMPOLINE_ID};
use crate::collector::{CollectorKind, PointerVisitor};
use crate::debug::{BreakpointId, DebugInfo, NO_BREAKPOINT_ID};
use crate::error::{Failure, RuntimeError};
use crate::heap::{Finalizer, Heap};
use crate::lookup_cache::{LookupCache, LookupEntry, LookupTag};
use crate::mailbox::{ChildHeap, Mailbox, MessageKind};
use crate::object::{Address, FunctionObject, HeapObject, ObjectBody, StackObject, Value};
use crate::port::{cleanup_ports, Port};
use crate::program::{function_containing_in, lookup_method_in, ProcessId, Program};
use crate::signal::{ProcessHandle, Signal, SignalKind};
use crate::stack::{self, Frame, FRAME_HEADER_SLOTS, GUARANTEED_FRAME_SIZE, INITIAL_STACK_SIZE};
use crate::stack_limit::{InterruptFlags, StackLimitState};
use crate::space::Space;
use crate::store_buffer::StoreBuffer;
use crate::thread_state::ThreadState;

/// Process execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ProcessState {
    /// Waiting for a message; not in any run queue.
    Sleeping = 0,
    /// In a run queue.
    Ready,
    Running,
    /// Gave up its time slice and is about to be requeued.
    Yielding,
    /// Stopped at a breakpoint.
    Breakpoint,
    CompileTimeError,
    UncaughtException,
    Terminated,
    /// Terminated, but children are still alive.
    WaitingForChildren,
}

impl ProcessState {
    pub fn from_u8(value: u8) -> ProcessState {
        ProcessState::try_from(value).unwrap_or(ProcessState::Terminated)
    }
}

/// Outcome of a failed stack check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackCheckResult {
    /// Check again and carry on.
    Continue,
    /// The process was preempted.
    Interrupt,
    /// A debugger asked the process to stop.
    DebugInterrupt,
    /// The stack cannot grow any further.
    Overflow,
}

/// Heap usage of one process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub process_used: usize,
    pub process_size: usize,
    pub immutable_used: usize,
    pub foreign_memory: usize,
    pub store_buffer_entries: usize,
}

pub struct Process {
    handle: Arc<ProcessHandle>,
    program: Arc<Program>,
    heap: Heap,
    immutable_heap: Option<Heap>,
    store_buffer: StoreBuffer,
    coroutine: Value,
    statics: Value,
    exception: Value,
    mailbox: Mailbox,
    ports: Vec<Arc<Port>>,
    random: fastrand::Rng,
    errno_cache: i32,
    debug_info: Option<DebugInfo>,
    cooked_stacks: Vec<Vec<usize>>,
    thread_state: Option<Arc<ThreadState>>,
    gc_count: usize,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.handle.id())
            .field("state", &self.handle.state())
            .field("heap_used", &self.heap.used())
            .field("ports", &self.ports.len())
            .finish()
    }
}

impl Process {
    /// Create a process with its statics initialized from the program. The
    /// process has no stack until [`setup_execution_stack`] runs.
    ///
    /// [`setup_execution_stack`]: Process::setup_execution_stack
    pub fn new(program: Arc<Program>, handle: Arc<ProcessHandle>) -> Result<Self, RuntimeError> {
        let gc = &program.config().gc;
        let mut heap = Heap::new(gc.process_heap_initial_bytes, gc.process_heap_budget_bytes);
        let (array_class, initial_statics, null) = {
            let roots = program.roots();
            (roots.array_class, roots.static_fields.clone(), roots.null())
        };
        let statics = heap
            .create_array_from(array_class, initial_statics, false)
            .map_err(|_| RuntimeError::AllocationFailed { what: "statics" })?;
        let random = fastrand::Rng::with_seed(program.next_random_seed());
        let mailbox = Mailbox::new(handle.inbox().clone());
        Ok(Self {
            handle,
            program,
            heap,
            immutable_heap: None,
            store_buffer: StoreBuffer::new(),
            coroutine: null,
            statics: Value::Ref(statics),
            exception: null,
            mailbox,
            ports: Vec::new(),
            random,
            errno_cache: 0,
            debug_info: None,
            cooked_stacks: Vec::new(),
            thread_state: None,
            gc_count: 0,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> ProcessId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn immutable_heap(&self) -> Option<&Heap> {
        self.immutable_heap.as_ref()
    }

    pub fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    pub fn mailbox_mut(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    pub fn random(&mut self) -> &mut fastrand::Rng {
        &mut self.random
    }

    pub fn coroutine(&self) -> Value {
        self.coroutine
    }

    pub fn statics(&self) -> Value {
        self.statics
    }

    pub fn exception(&self) -> Value {
        self.exception
    }

    pub fn set_exception(&mut self, exception: Value) {
        self.exception = exception;
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }

    /// Debug state, created on first use.
    pub fn debug_info_mut(&mut self) -> &mut DebugInfo {
        self.debug_info.get_or_insert_with(DebugInfo::new)
    }

    pub fn gc_count(&self) -> usize {
        self.gc_count
    }

    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            process_used: self.heap.used(),
            process_size: self.heap.size(),
            immutable_used: self.immutable_heap.as_ref().map_or(0, Heap::used),
            foreign_memory: self.heap.foreign_memory(),
            store_buffer_entries: self.store_buffer.len(),
        }
    }

    fn null(&self) -> Value {
        self.program.roots().null()
    }

    // ------------------------------------------------------------------
    // Execution stack
    // ------------------------------------------------------------------

    /// Create the initial stack and the coroutine that owns it.
    pub fn setup_execution_stack(&mut self) -> Result<(), RuntimeError> {
        let (stack_class, coroutine_class, null) = {
            let roots = self.program.roots();
            (roots.stack_class, roots.coroutine_class, roots.null())
        };
        let stack = self
            .heap
            .create_stack(stack_class, INITIAL_STACK_SIZE)
            .map_err(|_| RuntimeError::AllocationFailed { what: "stack" })?;
        let coroutine = self
            .heap
            .create_instance(coroutine_class, 2, null, false)
            .map_err(|_| RuntimeError::AllocationFailed { what: "coroutine" })?;
        if let Some(fields) = self.heap.object_mut(coroutine).and_then(HeapObject::values_mut) {
            fields[0] = Value::Ref(stack);
        }
        self.store_buffer.insert(stack);
        self.update_coroutine(coroutine);
        Ok(())
    }

    /// Create the execution stack with `arguments` pushed and an entry
    /// frame for `entry` on top, ready for the first time slice.
    pub fn setup_entry(&mut self, entry: Address, arguments: &[Value]) -> Result<(), RuntimeError> {
        self.setup_execution_stack()?;
        let bcp = FunctionObject::bytecode_address_for(entry, 0);
        self.with_stack_mut(|stack| {
            for &argument in arguments {
                stack.push(argument);
            }
            stack::setup_entry_frame(stack, arguments.len(), bcp);
        })
    }

    /// Switch to `coroutine`, whose stack becomes the current stack.
    pub fn update_coroutine(&mut self, coroutine: Address) {
        self.coroutine = Value::Ref(coroutine);
        if let Some(stack) = self.stack_address() {
            self.store_buffer.insert(stack);
        }
        self.update_stack_limit();
    }

    /// Address of the current stack.
    pub fn stack_address(&self) -> Option<Address> {
        let coroutine = self.coroutine.as_address()?;
        self.heap.object(coroutine)?.values()?.first()?.as_address()
    }

    pub fn stack(&self) -> Option<&StackObject> {
        self.heap.object(self.stack_address()?)?.as_stack()
    }

    /// Run `f` on the current stack.
    pub fn with_stack_mut<R>(&mut self, f: impl FnOnce(&mut StackObject) -> R) -> Result<R, RuntimeError> {
        let address = self
            .stack_address()
            .ok_or_else(|| RuntimeError::invariant(format!("process {} has no stack", self.id())))?;
        let stack = self
            .heap
            .object_mut(address)
            .and_then(HeapObject::as_stack_mut)
            .ok_or_else(|| RuntimeError::invariant(format!("{} is not a stack", address)))?;
        Ok(f(stack))
    }

    /// Install the real stack limit. Has no effect while interrupts are
    /// pending.
    pub fn update_stack_limit(&self) {
        self.handle
            .stack_limit()
            .update_limit(GUARANTEED_FRAME_SIZE + FRAME_HEADER_SLOTS);
    }

    /// Called when a stack check fails. Services one pending interrupt if
    /// there is one; otherwise grows the stack so `extra` more slots fit.
    pub fn handle_stack_overflow(&mut self, extra: usize) -> Result<StackCheckResult, RuntimeError> {
        let limit = self.handle.stack_limit();
        if let StackLimitState::Interrupted(flags) = limit.load() {
            let Some(flag) = flags.highest_priority() else {
                // Interrupted with nothing pending: install the real limit
                // and grow only if the stack is still short.
                self.update_stack_limit();
                let top = self
                    .stack()
                    .map(|stack| stack.top)
                    .ok_or_else(|| RuntimeError::invariant(format!("process {} has no stack", self.id())))?;
                if self.handle.stack_limit().check(top.saturating_sub(extra)) {
                    return Ok(StackCheckResult::Continue);
                }
                return self.grow_stack(extra);
            };
            limit.clear_interrupt(flag);
            self.update_stack_limit();
            return Ok(if flag == InterruptFlags::PREEMPT {
                StackCheckResult::Interrupt
            } else if flag == InterruptFlags::DEBUG_INTERRUPT {
                StackCheckResult::DebugInterrupt
            } else {
                self.handle.record_profile_tick();
                StackCheckResult::Continue
            });
        }
        self.grow_stack(extra)
    }

    /// Replace the current stack with one that has room for `extra` more
    /// slots, keeping every frame.
    fn grow_stack(&mut self, extra: usize) -> Result<StackCheckResult, RuntimeError> {
        let length = self
            .stack()
            .map(StackObject::length)
            .ok_or_else(|| RuntimeError::invariant(format!("process {} has no stack", self.id())))?;
        let new_length = stack::grown_length(length, extra);
        let maximum = self.program.max_stack_slots();
        if new_length > maximum {
            log::debug!(
                "process {}: stack of {} slots cannot grow to {} (maximum {})",
                self.id(),
                length,
                new_length,
                maximum
            );
            return Ok(StackCheckResult::Overflow);
        }

        let stack_class = self.program.roots().stack_class;
        let new_stack = match self.heap.create_stack(stack_class, new_length) {
            Ok(address) => address,
            Err(_) => {
                self.collect_mutable_garbage()?;
                match self.heap.create_stack(stack_class, new_length) {
                    Ok(address) => address,
                    Err(_) => return Ok(StackCheckResult::Overflow),
                }
            }
        };

        // Collection may have moved the old stack.
        let old_stack = self
            .stack_address()
            .ok_or_else(|| RuntimeError::invariant("stack vanished while growing"))?;
        let old = self
            .heap
            .space_mut()
            .take_object(old_stack)
            .ok_or_else(|| RuntimeError::invariant(format!("stack {} not in heap", old_stack)))?;
        if let (Some(from), Some(to)) = (
            old.as_stack(),
            self.heap.object_mut(new_stack).and_then(HeapObject::as_stack_mut),
        ) {
            stack::copy_live_region(from, to);
        }
        self.heap.space_mut().restore_object(old_stack, old);

        if let Some(coroutine) = self.coroutine.as_address() {
            if let Some(fields) = self.heap.object_mut(coroutine).and_then(HeapObject::values_mut) {
                fields[0] = Value::Ref(new_stack);
            }
        }
        self.store_buffer.insert(new_stack);
        self.update_stack_limit();
        log::trace!("process {}: stack grew {} -> {} slots", self.id(), length, new_length);
        Ok(StackCheckResult::Continue)
    }

    /// Call `function` from the current frame with `arguments`, running the
    /// stack check first. Returns the result of the last check; the call
    /// is only made on `Continue`.
    pub fn invoke(&mut self, function: Address, arguments: &[Value]) -> Result<StackCheckResult, RuntimeError> {
        let needed = arguments.len() + 2 * FRAME_HEADER_SLOTS;
        loop {
            let top = self
                .stack()
                .map(|stack| stack.top)
                .ok_or_else(|| RuntimeError::invariant(format!("process {} has no stack", self.id())))?;
            if self.handle.stack_limit().check(top.saturating_sub(needed)) {
                break;
            }
            match self.handle_stack_overflow(needed)? {
                StackCheckResult::Continue => {}
                StackCheckResult::Overflow => {
                    return Err(RuntimeError::StackOverflow {
                        requested: self.stack().map_or(0, StackObject::length) + needed,
                        maximum: self.program.max_stack_slots(),
                    })
                }
                other => return Ok(other),
            }
        }
        let bcp = FunctionObject::bytecode_address_for(function, 0);
        self.with_stack_mut(|stack| stack::push_frame(stack, bcp, arguments))?
            .ok_or_else(|| RuntimeError::invariant("stack is not suspended"))?;
        Ok(StackCheckResult::Continue)
    }

    /// Return `result` from the innermost frame, dropping the `arity`
    /// arguments its caller pushed. Returns false when the innermost frame
    /// was the entry frame; the stack is left untouched then.
    pub fn return_from_frame(&mut self, arity: usize, result: Value) -> Result<bool, RuntimeError> {
        self.with_stack_mut(|stack| {
            let callee = stack.get(stack.top).as_frame()?;
            let caller_frame = stack.get(callee).as_frame()?;
            let caller_bcp = stack.get(callee + 1).as_code()?;
            let operand_top = callee + FRAME_HEADER_SLOTS + arity;
            while stack.top < operand_top {
                stack.pop();
            }
            stack.push(result);
            stack::suspend(stack, caller_frame, caller_bcp);
            Some(())
        })
        .map(|returned| returned.is_some())
    }

    /// Live slots of the current stack below the saved registers.
    pub fn current_stack_height(&self) -> usize {
        self.stack()
            .map_or(0, |stack| stack.length().saturating_sub(stack.top + FRAME_HEADER_SLOTS))
    }

    pub fn frame_count(&self) -> usize {
        self.stack().map_or(0, stack::frame_count)
    }

    /// `(function, bytecode index)` of every frame, innermost first.
    pub fn frames(&self) -> Vec<(Address, usize)> {
        let Some(stack) = self.stack() else {
            return Vec::new();
        };
        let program_heap = self.program.heap();
        let mut frame = Frame::new(stack);
        let mut frames = Vec::new();
        while frame.move_previous() {
            if let Some(bcp) = frame.bytecode_pointer().as_code() {
                if let Some(function) = function_containing_in(&program_heap, bcp) {
                    frames.push((function, FunctionObject::bytecode_index_of(function, bcp)));
                }
            }
        }
        frames
    }

    /// Locals and operands of frame `n`, counted from the innermost.
    pub fn frame_locals(&self, n: usize) -> Option<Vec<Value>> {
        let stack = self.stack()?;
        let mut frame = Frame::new(stack);
        for _ in 0..=n {
            if !frame.move_previous() {
                return None;
            }
        }
        Some(frame.locals().to_vec())
    }

    // ------------------------------------------------------------------
    // Process heap collection
    // ------------------------------------------------------------------

    pub fn collect_mutable_garbage(&mut self) -> Result<(), RuntimeError> {
        self.collect_mutable_garbage_with(CollectorKind::configured())
    }

    /// Collect the process heap with a specific collector, regardless of
    /// the `mark-sweep` feature.
    pub fn collect_mutable_garbage_with(&mut self, kind: CollectorKind) -> Result<(), RuntimeError> {
        self.collect_mutable(kind, false).map(|_| ())
    }

    /// Collect and link every live stack through its `next` slot, current
    /// stack first. Returns the number of stacks.
    pub fn collect_garbage_and_chain_stacks(&mut self) -> Result<usize, RuntimeError> {
        self.collect_garbage_and_chain_stacks_with(CollectorKind::configured())
    }

    pub fn collect_garbage_and_chain_stacks_with(&mut self, kind: CollectorKind) -> Result<usize, RuntimeError> {
        self.collect_mutable(kind, true)
    }

    /// Merge the heaps carried by queued `Exit` messages.
    pub fn take_child_heaps(&mut self) -> usize {
        self.mailbox
            .merge_all_child_heaps(&mut self.heap, &mut self.store_buffer)
    }

    /// Merge the heap carried by the current message, if any.
    pub fn merge_current_child_heap(&mut self) -> bool {
        self.mailbox
            .merge_current_child_heap(&mut self.heap, &mut self.store_buffer)
    }

    fn collect_mutable(&mut self, kind: CollectorKind, chain_stacks: bool) -> Result<usize, RuntimeError> {
        self.take_child_heaps();
        let used_before = self.heap.used();
        let stacks = match kind {
            CollectorKind::Scavenge => self.scavenge(chain_stacks),
            CollectorKind::MarkSweep => self.mark_sweep(chain_stacks),
        };
        self.finish_mutable_collection(used_before);
        Ok(stacks)
    }

    fn scavenge(&mut self, chain_stacks: bool) -> usize {
        use crate::collector::ScavengeVisitor;
        use crate::space::NoAllocationFailureScope;

        let used_before = self.heap.used();
        let program = self.program.clone();
        let budget = program.config().gc.process_heap_budget_bytes;
        let program_heap = program.heap();

        let Process {
            heap,
            store_buffer,
            coroutine,
            statics,
            exception,
            mailbox,
            ports,
            debug_info,
            ..
        } = self;

        let mut to = Space::with_budget(used_before / 10, budget);
        let mut rebuilt = StoreBuffer::new();
        let stacks = {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(heap.space_mut(), &mut scope);
            if chain_stacks {
                visitor = visitor.with_stack_chaining();
            }
            visitor.visit(coroutine);
            if let Some(mut current) = coroutine
                .as_address()
                .and_then(|c| visitor.to_space().object(c))
                .and_then(HeapObject::values)
                .and_then(|fields| fields.first().copied())
            {
                visitor.visit(&mut current);
            }
            visitor.visit(statics);
            visitor.visit(exception);
            if let Some(debug_info) = debug_info.as_mut() {
                debug_info.visit_process_pointers(&mut visitor);
            }
            mailbox.visit_pointers(&mut visitor);
            visitor.complete_scavenge_mutable(program_heap.space(), &mut rebuilt);
            if chain_stacks {
                visitor.chain_copied_stacks()
            } else {
                0
            }
        };
        store_buffer.replace_after_mutable_gc(rebuilt);
        heap.process_weak_pointers();
        cleanup_ports(ports, heap.space());
        heap.replace_space(to);
        stacks
    }

    fn mark_sweep(&mut self, chain_stacks: bool) -> usize {
        use crate::mark_sweep::{sweep, MarkingVisitor};

        let program = self.program.clone();
        let program_heap = program.heap();

        let Process {
            heap,
            store_buffer,
            coroutine,
            statics,
            exception,
            mailbox,
            ports,
            debug_info,
            ..
        } = self;

        let stacks = {
            let mut visitor = MarkingVisitor::new(heap.space_mut());
            if chain_stacks {
                visitor = visitor.with_stack_chaining();
            }
            if let Some(mut current) = coroutine
                .as_address()
                .and_then(|c| visitor.space_mut().object(c))
                .and_then(HeapObject::values)
                .and_then(|fields| fields.first().copied())
            {
                visitor.visit(&mut current);
            }
            visitor.visit(coroutine);
            visitor.process();
            visitor.visit(statics);
            visitor.visit(exception);
            if let Some(debug_info) = debug_info.as_mut() {
                debug_info.visit_process_pointers(&mut visitor);
            }
            mailbox.visit_pointers(&mut visitor);
            visitor.process();
            if chain_stacks {
                visitor.chain_marked_stacks()
            } else {
                0
            }
        };
        heap.process_weak_pointers();
        cleanup_ports(ports, heap.space());
        let stats = sweep(heap.space_mut());
        log::trace!(
            "swept {} objects ({} bytes), {} live",
            stats.freed_objects,
            stats.freed_bytes,
            stats.live_objects
        );

        // Nothing moved, so only survivors that still point out can stay.
        let mut rebuilt = StoreBuffer::new();
        for object in store_buffer.iter() {
            let keep = heap.object(object).is_some_and(|o| {
                let mut outside = false;
                o.for_each_pointer(|target| {
                    if points_outside(heap.space(), program_heap.space(), target) {
                        outside = true;
                    }
                });
                outside || o.is_stack()
            });
            if keep {
                rebuilt.insert(object);
            }
        }
        store_buffer.replace_after_mutable_gc(rebuilt);
        stacks
    }

    fn finish_mutable_collection(&mut self, used_before: usize) {
        let foreign = self.heap.foreign_memory();
        self.heap.space_mut().adjust_allocation_budget(foreign);
        self.update_stack_limit();
        self.gc_count += 1;

        let used_after = self.heap.used();
        log::debug!(
            "process {} gc #{}: {} -> {} bytes",
            self.id(),
            self.gc_count,
            used_before,
            used_after
        );
        if self.program.config().gc.debug {
            eprintln!(
                "[GC] Process {} collection #{} complete, {} -> {} bytes",
                self.id(),
                self.gc_count,
                used_before,
                used_after
            );
        }
        if self.program.flags().print_heap_statistics {
            let usage = self.usage();
            log::info!(
                "process {} heap: {}/{} bytes, {} foreign, {} store buffer entries",
                self.id(),
                usage.process_used,
                usage.process_size,
                usage.foreign_memory,
                usage.store_buffer_entries
            );
        }
    }

    // ------------------------------------------------------------------
    // Program heap collection support
    // ------------------------------------------------------------------

    /// Replace raw bytecode pointers in all `stacks` chained stacks with
    /// function references. The chain must start at the current stack.
    pub fn cook_stacks(&mut self, stacks: usize) -> Result<(), RuntimeError> {
        let program = self.program.clone();
        let program_heap = program.heap();
        let mut cooked = Vec::with_capacity(stacks);
        let mut next = if stacks > 0 { self.stack_address() } else { None };
        while let Some(address) = next {
            let stack = self
                .heap
                .object_mut(address)
                .and_then(HeapObject::as_stack_mut)
                .ok_or_else(|| RuntimeError::invariant(format!("{} in stack chain is not a stack", address)))?;
            cooked.push(stack::cook_stack(stack, |bcp| {
                function_containing_in(&program_heap, bcp)
            })?);
            next = stack.next.as_address();
        }
        if cooked.len() != stacks {
            return Err(RuntimeError::invariant(format!(
                "process {}: chained {} stacks but cooked {}",
                self.id(),
                stacks,
                cooked.len()
            )));
        }
        self.cooked_stacks = cooked;
        Ok(())
    }

    /// Inverse of [`cook_stacks`](Self::cook_stacks); also clears the chain.
    pub fn uncook_and_unchain_stacks(&mut self) -> Result<(), RuntimeError> {
        let cooked = std::mem::take(&mut self.cooked_stacks);
        let mut next = if cooked.is_empty() { None } else { self.stack_address() };
        let mut deltas = cooked.iter();
        while let Some(address) = next {
            let stack = self
                .heap
                .object_mut(address)
                .and_then(HeapObject::as_stack_mut)
                .ok_or_else(|| RuntimeError::invariant(format!("{} in stack chain is not a stack", address)))?;
            let frame_deltas = deltas
                .next()
                .ok_or_else(|| RuntimeError::invariant("stack chain longer than cooked stacks"))?;
            stack::uncook_stack(stack, frame_deltas)?;
            next = stack.next.as_address();
            stack.next = Value::Smi(0);
        }
        Ok(())
    }

    /// Visit every reference this process holds into the program heap.
    pub fn visit_program_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for (_, object) in self.heap.space_mut().iter_mut() {
            object.visit_pointers(visitor);
        }
        if let Some(part) = self.immutable_heap.as_mut() {
            for (_, object) in part.space_mut().iter_mut() {
                object.visit_pointers(visitor);
            }
        }
        visitor.visit(&mut self.coroutine);
        visitor.visit(&mut self.statics);
        visitor.visit(&mut self.exception);
        self.mailbox.visit_pointers(visitor);
        if let Some(debug_info) = self.debug_info.as_mut() {
            debug_info.visit_program_pointers(visitor);
        }
    }

    pub fn update_breakpoints(&mut self) {
        if let Some(debug_info) = self.debug_info.as_mut() {
            debug_info.update_breakpoints();
        }
    }

    // ------------------------------------------------------------------
    // Shared heap collection support
    // ------------------------------------------------------------------

    /// Visit the roots and every store buffer slot pointing out of the
    /// process heap.
    pub fn visit_shared_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.coroutine);
        visitor.visit(&mut self.statics);
        visitor.visit(&mut self.exception);
        self.mailbox.visit_pointers(visitor);
        self.store_buffer
            .iterate_pointers_to_immutable_space(self.heap.space_mut(), visitor);
    }

    /// Borrow a private part of the shared heap for immutable allocation.
    pub fn acquire_immutable_heap(&mut self) {
        if self.immutable_heap.is_none() {
            self.immutable_heap = Some(self.program.shared_heap().acquire_part());
        }
    }

    /// Give the private part back to the shared heap.
    pub fn release_immutable_heap(&mut self) {
        if let Some(part) = self.immutable_heap.take() {
            self.program.shared_heap().release_part(part);
        }
    }

    fn immutable_part(&mut self) -> &mut Heap {
        let program = &self.program;
        self.immutable_heap
            .get_or_insert_with(|| program.shared_heap().acquire_part())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Run `allocate`; on `RetryAfterGc` collect whichever heap ran out and
    /// try once more.
    pub fn allocate_with_retry<T>(
        &mut self,
        what: &'static str,
        mut allocate: impl FnMut(&mut Process) -> Result<T, Failure>,
    ) -> Result<T, RuntimeError> {
        match allocate(self) {
            Err(Failure::RetryAfterGc) => {}
            other => return other.map_err(RuntimeError::from),
        }
        let part_exhausted = self
            .immutable_heap
            .as_ref()
            .is_some_and(Heap::needs_garbage_collection);
        if part_exhausted {
            self.release_immutable_heap();
            self.program.shared_heap().request_collection();
            self.acquire_immutable_heap();
        }
        if !part_exhausted || self.heap.needs_garbage_collection() {
            self.collect_mutable_garbage()?;
        }
        match allocate(self) {
            Err(Failure::RetryAfterGc) => Err(RuntimeError::AllocationFailed { what }),
            other => other.map_err(RuntimeError::from),
        }
    }

    /// Record `object` if any of its slots point into the shared heap.
    fn record_outside_pointers(&mut self, object: Address) {
        let program_heap = self.program.heap();
        let heap = &self.heap;
        let outside = heap.object(object).is_some_and(|o| {
            o.values().is_some_and(|values| {
                values
                    .iter()
                    .any(|v| matches!(v, Value::Ref(a) if points_outside(heap.space(), program_heap.space(), *a)))
            })
        });
        drop(program_heap);
        if outside {
            self.store_buffer.insert(object);
        }
    }

    pub fn new_array(&mut self, length: usize) -> Result<Address, Failure> {
        let (class, null) = {
            let roots = self.program.roots();
            (roots.array_class, roots.null())
        };
        self.heap.create_array(class, length, null)
    }

    /// An array holding `values`. Immutable arrays may not reference the
    /// process heap.
    pub fn new_array_from(&mut self, values: Vec<Value>, immutable: bool) -> Result<Address, Failure> {
        let class = self.program.roots().array_class;
        if immutable {
            if values.iter().any(|v| matches!(v, Value::Ref(a) if self.heap.includes(*a))) {
                return Err(Failure::WrongArgumentType);
            }
            return self.immutable_part().create_array_from(class, values, true);
        }
        let array = self.heap.create_array_from(class, values, false)?;
        self.record_outside_pointers(array);
        Ok(array)
    }

    pub fn new_byte_array(&mut self, length: usize) -> Result<Address, Failure> {
        let class = self.program.roots().byte_array_class;
        self.immutable_part().create_byte_array(class, length)
    }

    pub fn new_instance(&mut self, class: Address, immutable: bool) -> Result<Address, Failure> {
        let null = self.null();
        let fields = {
            let program_heap = self.program.heap();
            program_heap
                .object(class)
                .and_then(HeapObject::as_class)
                .map(|c| c.instance_fields)
                .ok_or(Failure::WrongArgumentType)?
        };
        if immutable {
            self.immutable_part().create_instance(class, fields, null, true)
        } else {
            self.heap.create_instance(class, fields, null, false)
        }
    }

    /// An instance of `class` holding `fields`. Immutable instances may not
    /// reference the process heap.
    pub fn new_instance_from(&mut self, class: Address, fields: Vec<Value>, immutable: bool) -> Result<Address, Failure> {
        if immutable {
            if fields.iter().any(|v| matches!(v, Value::Ref(a) if self.heap.includes(*a))) {
                return Err(Failure::WrongArgumentType);
            }
            return self
                .immutable_part()
                .allocate(HeapObject::immutable(class, ObjectBody::Instance(fields)));
        }
        let instance = self.heap.allocate(HeapObject::new(class, ObjectBody::Instance(fields)))?;
        self.record_outside_pointers(instance);
        Ok(instance)
    }

    pub fn new_double(&mut self, value: f64) -> Result<Address, Failure> {
        let class = self.program.roots().double_class;
        self.immutable_part().create_double(class, value)
    }

    /// A small integer when `value` fits, otherwise a large integer.
    pub fn new_integer(&mut self, value: i64) -> Result<Value, Failure> {
        if Value::is_valid_smi(value) {
            return Ok(Value::Smi(value));
        }
        let class = self.program.roots().large_integer_class;
        self.immutable_part()
            .create_large_integer(class, value)
            .map(Value::Ref)
    }

    pub fn new_one_byte_string(&mut self, bytes: Vec<u8>) -> Result<Address, Failure> {
        let class = self.program.roots().one_byte_string_class;
        self.immutable_part().create_one_byte_string(class, bytes)
    }

    pub fn new_two_byte_string(&mut self, units: Vec<u16>) -> Result<Address, Failure> {
        let class = self.program.roots().two_byte_string_class;
        self.immutable_part().create_two_byte_string(class, units)
    }

    /// A box around `value`. Boxes of process heap objects stay in the
    /// process heap.
    pub fn new_boxed(&mut self, value: Value) -> Result<Address, Failure> {
        let class = self.program.roots().boxed_class;
        match value {
            Value::Ref(address) if self.heap.includes(address) => {
                self.heap.allocate(HeapObject::new(class, ObjectBody::Boxed(value)))
            }
            _ => self.immutable_part().create_boxed(class, value),
        }
    }

    pub fn new_stack(&mut self, length: usize) -> Result<Address, Failure> {
        let class = self.program.roots().stack_class;
        let stack = self.heap.create_stack(class, length)?;
        self.store_buffer.insert(stack);
        Ok(stack)
    }

    /// A channel object and a port delivering to it.
    pub fn new_port(&mut self) -> Result<Arc<Port>, Failure> {
        let (class, null) = {
            let roots = self.program.roots();
            (roots.channel_class, roots.null())
        };
        let channel = self.heap.create_instance(class, 1, null, false)?;
        let port = Port::new(self.handle.clone(), channel);
        self.ports.push(port.clone());
        Ok(port)
    }

    /// Read field `index` of an object in any heap this process can see.
    pub fn field(&self, object: Address, index: usize) -> Option<Value> {
        if let Some(found) = self
            .heap
            .object(object)
            .or_else(|| self.immutable_heap.as_ref()?.object(object))
        {
            return found.values()?.get(index).copied();
        }
        if let Some(value) = self
            .program
            .shared_heap()
            .lock()
            .object(object)
            .and_then(|o| o.values()?.get(index).copied())
        {
            return Some(value);
        }
        self.program.heap().object(object)?.values()?.get(index).copied()
    }

    /// Store into a mutable process heap object, recording it in the store
    /// buffer when `value` points into the shared heap.
    pub fn store_field(&mut self, object: Address, index: usize, value: Value) -> Result<(), Failure> {
        let target = self.heap.object_mut(object).ok_or(Failure::IllegalState)?;
        if target.immutable {
            return Err(Failure::IllegalState);
        }
        let slot = target
            .values_mut()
            .ok_or(Failure::WrongArgumentType)?
            .get_mut(index)
            .ok_or(Failure::IndexOutOfBounds)?;
        *slot = value;
        if let Value::Ref(address) = value {
            if points_outside(self.heap.space(), self.program.heap().space(), address) {
                self.store_buffer.insert(object);
            }
        }
        Ok(())
    }

    pub fn static_field(&self, index: usize) -> Option<Value> {
        self.field(self.statics.as_address()?, index)
    }

    pub fn set_static_field(&mut self, index: usize, value: Value) -> Result<(), Failure> {
        let statics = self.statics.as_address().ok_or(Failure::IllegalState)?;
        self.store_field(statics, index, value)
    }

    pub fn register_finalizer(&mut self, object: Address, finalizer: Finalizer) -> Result<(), Failure> {
        if self.heap.includes(object) {
            self.heap.register_finalizer(object, finalizer);
            return Ok(());
        }
        match self.immutable_heap.as_mut() {
            Some(part) if part.includes(object) => {
                part.register_finalizer(object, finalizer);
                Ok(())
            }
            _ => Err(Failure::WrongArgumentType),
        }
    }

    // ------------------------------------------------------------------
    // Method lookup
    // ------------------------------------------------------------------

    pub fn attach_thread(&mut self, thread: Arc<ThreadState>) {
        self.thread_state = Some(thread);
        self.acquire_immutable_heap();
    }

    pub fn detach_thread(&mut self) -> Option<Arc<ThreadState>> {
        self.release_immutable_heap();
        self.thread_state.take()
    }

    pub fn thread_state(&self) -> Option<&Arc<ThreadState>> {
        self.thread_state.as_ref()
    }

    /// Run `f` on the lookup cache of the thread running this process.
    pub fn take_lookup_cache<R>(&self, f: impl FnOnce(&mut LookupCache) -> R) -> Result<R, RuntimeError> {
        let thread = self
            .thread_state
            .as_ref()
            .ok_or_else(|| RuntimeError::invariant(format!("process {} is not running", self.id())))?;
        Ok(thread.with_lookup_cache(f))
    }

    pub fn lookup_entry(&self, class: Address, selector: Selector) -> Result<LookupEntry, RuntimeError> {
        self.take_lookup_cache(|cache| {
            cache.lookup_or_resolve(class, selector, || self.lookup_entry_slow(class, selector))
        })?
    }

    /// Resolve without the cache. Unknown selectors resolve to the
    /// no-such-method trampoline.
    pub fn lookup_entry_slow(&self, class: Address, selector: Selector) -> Result<LookupEntry, RuntimeError> {
        let program_heap = self.program.heap();
        let (target, tag) = match lookup_method_in(&program_heap, class, selector) {
            Some(target) => {
                let tag = program_heap
                    .object(target)
                    .and_then(HeapObject::as_function)
                    .and_then(|f| f.intrinsic)
                    .map_or(LookupTag::Method, LookupTag::Intrinsic);
                (target, tag)
            }
            None => {
                let trampoline = Selector::encode(NO_SUCH_METHOD_TRAMPOLINE_ID, SelectorKind::Method, 0);
                let target = lookup_method_in(&program_heap, class, trampoline).ok_or_else(|| {
                    RuntimeError::invariant(format!("class {} has no no-such-method trampoline", class))
                })?;
                (target, LookupTag::NoSuchMethod)
            }
        };
        Ok(LookupEntry {
            class,
            selector,
            target,
            tag,
        })
    }

    // ------------------------------------------------------------------
    // Signals, messages and termination
    // ------------------------------------------------------------------

    pub fn send_signal(&self, signal: Arc<Signal>) -> bool {
        self.handle.send_signal(signal)
    }

    /// Send the final value of this process to `port`. The process heap
    /// travels with the message when `value` points into it. Afterwards
    /// the process has an empty heap and must terminate.
    pub fn send_exit(&mut self, port: &Arc<Port>, value: Value) -> bool {
        let gc = &self.program.config().gc;
        let empty = Heap::new(0, gc.process_heap_budget_bytes);
        let heap = std::mem::replace(&mut self.heap, empty);
        let store_buffer = std::mem::take(&mut self.store_buffer);
        let null = self.null();
        self.coroutine = null;
        self.statics = null;
        self.exception = null;
        let carried = match value {
            Value::Ref(address) if heap.includes(address) => Some(ChildHeap { heap, store_buffer }),
            _ => None,
        };
        port.send(MessageKind::Exit { heap: carried, value }).is_some()
    }

    /// Detach the process from everything that may outlive it: close its
    /// ports, and tell linked and monitoring processes it died.
    pub fn cleanup(&mut self, kind: SignalKind) {
        for port in self.ports.drain(..) {
            port.owner_process_terminating();
        }
        self.handle.owner_process_terminating();
        let linked = ProcessHandle::notify_linked_processes(&self.handle, kind);
        let monitors = ProcessHandle::notify_monitors(&self.handle, kind);
        self.release_immutable_heap();
        log::trace!(
            "process {} cleaned up ({:?}): {} linked, {} monitors notified",
            self.id(),
            kind,
            linked,
            monitors
        );
    }

    // ------------------------------------------------------------------
    // Debugging
    // ------------------------------------------------------------------

    fn suspended_location(&self) -> Result<(Address, Address, usize), RuntimeError> {
        let stack = self
            .stack()
            .ok_or_else(|| RuntimeError::invariant(format!("process {} has no stack", self.id())))?;
        let bcp = stack
            .get(stack.top + 1)
            .as_code()
            .ok_or_else(|| RuntimeError::invariant("process is not suspended"))?;
        let function = self
            .program
            .function_containing(bcp)
            .ok_or_else(|| RuntimeError::invariant(format!("no function contains bytecode {}", bcp)))?;
        Ok((bcp, function, FunctionObject::bytecode_index_of(function, bcp)))
    }

    /// Stop at the next instruction of the current frame. For an invoke
    /// that is the instruction after it, once the callee has returned;
    /// anything else just steps one instruction.
    pub fn prepare_step_over(&mut self) -> Result<BreakpointId, RuntimeError> {
        let (_, function, index) = self.suspended_location()?;
        let decoded = {
            let program_heap = self.program.heap();
            let code = program_heap
                .object(function)
                .and_then(HeapObject::as_function)
                .ok_or_else(|| RuntimeError::invariant(format!("{} is not a function", function)))?;
            match decode_invoke(&code.bytecodes, index) {
                None => None,
                Some((opcode, target)) => {
                    let callee_arity = |callee: Option<Address>| {
                        callee
                            .and_then(|c| program_heap.object(c))
                            .and_then(HeapObject::as_function)
                            .map(|f| f.arity as i64)
                            .ok_or_else(|| RuntimeError::invariant("invoke of a non-function"))
                    };
                    let stack_diff = match target {
                        InvokeTarget::Selector(selector) => -(selector.arity() as i64),
                        InvokeTarget::StaticMethod(i) => 1 - callee_arity(self.program.static_method_at(i))?,
                        InvokeTarget::Literal(i) => {
                            1 - callee_arity(code.literals.get(i).and_then(|v| v.as_address()))?
                        }
                    };
                    Some((opcode, stack_diff))
                }
            }
        };

        let coroutine = self.coroutine.as_address();
        let height = self.current_stack_height() as i64;
        let debug_info = self.debug_info_mut();
        match decoded {
            Some((opcode, stack_diff)) => {
                let expected = usize::try_from(height + stack_diff)
                    .map_err(|_| RuntimeError::invariant("negative stack height after invoke"))?;
                Ok(debug_info.set_conditional_breakpoint(
                    function,
                    index + opcode.size(),
                    true,
                    coroutine,
                    Some(expected),
                ))
            }
            None => {
                debug_info.set_stepping();
                Ok(NO_BREAKPOINT_ID)
            }
        }
    }

    /// Stop in the caller right after the current frame returns.
    pub fn prepare_step_out(&mut self) -> Result<BreakpointId, RuntimeError> {
        let (_, function, _) = self.suspended_location()?;
        let arity = self
            .program
            .function_arity(function)
            .ok_or_else(|| RuntimeError::invariant(format!("{} is not a function", function)))?;
        let (height, caller_bcp) = {
            let stack = self
                .stack()
                .ok_or_else(|| RuntimeError::invariant("process has no stack"))?;
            let mut frame = Frame::new(stack);
            if !frame.move_previous() {
                return Err(RuntimeError::invariant("no frame to step out of"));
            }
            let frame_pointer = frame
                .frame_pointer()
                .ok_or_else(|| RuntimeError::invariant("innermost frame has no frame pointer"))?;
            let frame_bottom = frame_pointer + 1;
            let expected_operand_top = frame_bottom + arity;
            let height = stack.length().saturating_sub(expected_operand_top);
            let caller_bcp = if frame.move_previous() {
                frame.bytecode_pointer().as_code()
            } else {
                None
            };
            (height, caller_bcp)
        };
        let coroutine = self.coroutine.as_address();
        let Some(caller_bcp) = caller_bcp else {
            self.debug_info_mut().set_stepping();
            return Ok(NO_BREAKPOINT_ID);
        };
        let caller = self
            .program
            .function_containing(caller_bcp)
            .ok_or_else(|| RuntimeError::invariant(format!("no function contains bytecode {}", caller_bcp)))?;
        let index = FunctionObject::bytecode_index_of(caller, caller_bcp);
        Ok(self
            .debug_info_mut()
            .set_conditional_breakpoint(caller, index, true, coroutine, Some(height)))
    }

    // ------------------------------------------------------------------
    // errno
    // ------------------------------------------------------------------

    /// Save the thread's errno after a native call.
    pub fn store_errno(&mut self) {
        self.errno_cache = self.program.platform().errno();
    }

    /// Put the saved errno back before the process reads it.
    pub fn restore_errno(&self) {
        self.program.platform().set_errno(self.errno_cache);
    }

    pub fn errno(&self) -> i32 {
        self.errno_cache
    }
}

/// Whether `target` lies outside both the process space and the program
/// space, which leaves the shared heap. Only such slots go in the store
/// buffer.
fn points_outside(process_space: &Space, program_space: &Space, target: Address) -> bool {
    !process_space.includes(target) && !program_space.includes(target)
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.handle.is_alive() {
            self.cleanup(SignalKind::Killed);
        }
        for port in self.ports.drain(..) {
            port.owner_process_terminating();
        }
        self.release_immutable_heap();
    }
}
