//! Heaps: a space plus weak pointer bookkeeping.
//!
//! Every process owns one mutable [`Heap`]. Immutable objects (numbers,
//! strings, boxed values, and anything allocated as immutable) go to the
//! [`SharedHeap`]. A running process allocates them into a private part of
//! the shared heap that is merged back when the process stops running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::config::GcConfig;
use crate::error::Failure;
use crate::object::{
    Address, ClassObject, FunctionObject, HeapObject, ObjectBody, StackObject, Value,
};
use crate::signal::ProcessHandle;
use crate::space::Space;

// ============================================================================
// Foreign memory
// ============================================================================

/// Native buffers handed to the VM as raw (address, length) pairs.
pub struct ForeignMemory;

impl ForeignMemory {
    /// Allocate a zeroed buffer and give up ownership of it.
    pub fn allocate(length: usize) -> usize {
        let buffer = vec![0u8; length].into_boxed_slice();
        Box::into_raw(buffer) as *mut u8 as usize
    }

    /// Free a buffer produced by [`ForeignMemory::allocate`].
    ///
    /// # Safety
    /// `address` and `length` must come from one `allocate` call and the
    /// buffer must not have been freed already.
    pub unsafe fn free(address: usize, length: usize) {
        let slice = std::ptr::slice_from_raw_parts_mut(address as *mut u8, length);
        drop(Box::from_raw(slice));
    }
}

// ============================================================================
// Weak pointers
// ============================================================================

/// What happens when a weakly held object dies.
#[derive(Debug)]
pub enum Finalizer {
    /// The object is a foreign memory instance: `[Smi(address), Smi(length)]`.
    /// The buffer is freed.
    ForeignMemory,
    /// The object wraps a process handle. The reference is released.
    ProcessHandle(Arc<ProcessHandle>),
}

#[derive(Debug)]
pub struct WeakPointer {
    pub object: Address,
    pub finalizer: Finalizer,
}

// ============================================================================
// Heap
// ============================================================================

/// A space plus the weak pointers registered on objects inside it.
#[derive(Debug)]
pub struct Heap {
    space: Space,
    weak_pointers: Vec<WeakPointer>,
    foreign_memory: usize,
}

impl Heap {
    pub fn new(initial_size: usize, budget: usize) -> Self {
        Self::from_space(Space::with_budget(initial_size, budget))
    }

    pub fn from_space(space: Space) -> Self {
        Self {
            space,
            weak_pointers: Vec::new(),
            foreign_memory: 0,
        }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    /// Install the to-space of a finished collection, returning the old one.
    pub fn replace_space(&mut self, space: Space) -> Space {
        std::mem::replace(&mut self.space, space)
    }

    pub fn includes(&self, address: Address) -> bool {
        self.space.includes(address)
    }

    pub fn object(&self, address: Address) -> Option<&HeapObject> {
        self.space.object(address)
    }

    pub fn object_mut(&mut self, address: Address) -> Option<&mut HeapObject> {
        self.space.object_mut(address)
    }

    pub fn used(&self) -> usize {
        self.space.used()
    }

    pub fn size(&self) -> usize {
        self.space.size()
    }

    pub fn foreign_memory(&self) -> usize {
        self.foreign_memory
    }

    pub fn needs_garbage_collection(&self) -> bool {
        self.space.needs_garbage_collection()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub fn allocate(&mut self, object: HeapObject) -> Result<Address, Failure> {
        self.space.allocate(object).ok_or(Failure::RetryAfterGc)
    }

    fn allocate_body(&mut self, class: Address, body: ObjectBody, immutable: bool) -> Result<Address, Failure> {
        let object = if immutable {
            HeapObject::immutable(class, body)
        } else {
            HeapObject::new(class, body)
        };
        self.allocate(object)
    }

    pub fn create_instance(
        &mut self,
        class: Address,
        fields: usize,
        init: Value,
        immutable: bool,
    ) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Instance(vec![init; fields]), immutable)
    }

    pub fn create_array(&mut self, class: Address, length: usize, init: Value) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Array(vec![init; length]), false)
    }

    pub fn create_array_from(&mut self, class: Address, values: Vec<Value>, immutable: bool) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Array(values), immutable)
    }

    pub fn create_byte_array(&mut self, class: Address, length: usize) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::ByteArray(vec![0; length]), true)
    }

    pub fn create_one_byte_string(&mut self, class: Address, bytes: Vec<u8>) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::OneByteString(bytes), true)
    }

    pub fn create_two_byte_string(&mut self, class: Address, units: Vec<u16>) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::TwoByteString(units), true)
    }

    pub fn create_double(&mut self, class: Address, value: f64) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Double(value), true)
    }

    pub fn create_large_integer(&mut self, class: Address, value: i64) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::LargeInteger(value), true)
    }

    pub fn create_boxed(&mut self, class: Address, value: Value) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Boxed(value), true)
    }

    pub fn create_stack(&mut self, class: Address, length: usize) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Stack(StackObject::new(length)), false)
    }

    pub fn create_class(&mut self, meta_class: Address, class: ClassObject) -> Result<Address, Failure> {
        self.allocate_body(meta_class, ObjectBody::Class(class), true)
    }

    pub fn create_function(&mut self, class: Address, function: FunctionObject) -> Result<Address, Failure> {
        self.allocate_body(class, ObjectBody::Function(function), true)
    }

    /// Undo the allocation of a temporary integer if it is still the last
    /// object in the heap.
    pub fn try_dealloc_integer(&mut self, address: Address) -> bool {
        match self.space.object(address) {
            Some(object) if object.as_large_integer().is_some() => self.space.try_dealloc(address),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Weak pointers and foreign memory
    // ------------------------------------------------------------------

    pub fn register_finalizer(&mut self, object: Address, finalizer: Finalizer) {
        debug_assert!(self.space.includes(object));
        self.weak_pointers.push(WeakPointer { object, finalizer });
    }

    /// Drop the registration for `object`. Returns whether one existed.
    pub fn unregister_finalizer(&mut self, object: Address) -> bool {
        let before = self.weak_pointers.len();
        self.weak_pointers.retain(|weak| weak.object != object);
        before != self.weak_pointers.len()
    }

    pub fn weak_pointer_count(&self) -> usize {
        self.weak_pointers.len()
    }

    /// Run after marking or copying and before the space is swept or
    /// replaced. Survivors carry a forwarding address (copied) or a mark
    /// bit (marked); registrations on anything else are finalized.
    pub fn process_weak_pointers(&mut self) {
        let weak_pointers = std::mem::take(&mut self.weak_pointers);
        for mut weak in weak_pointers {
            let survivor = match self.space.object(weak.object) {
                Some(object) => match object.forwarding_address() {
                    Some(to) => {
                        weak.object = to;
                        true
                    }
                    None => object.is_marked(),
                },
                None => true,
            };
            if survivor {
                self.weak_pointers.push(weak);
            } else {
                self.finalize(weak);
            }
        }
    }

    fn finalize(&mut self, weak: WeakPointer) {
        match weak.finalizer {
            Finalizer::ForeignMemory => {
                let fields = self
                    .space
                    .object(weak.object)
                    .and_then(HeapObject::values)
                    .and_then(|values| Some((values.first()?.as_smi(), values.get(1)?.as_smi())));
                if let Some((Some(address), Some(length))) = fields {
                    // SAFETY: foreign memory instances are only created from
                    // buffers handed out by ForeignMemory::allocate, and the
                    // finalizer is the single owner of the buffer.
                    unsafe { ForeignMemory::free(address as usize, length as usize) };
                    self.freed_foreign_memory(length as usize);
                }
            }
            Finalizer::ProcessHandle(handle) => drop(handle),
        }
    }

    pub fn allocated_foreign_memory(&mut self, size: usize) {
        self.foreign_memory += size;
        self.space.charge_budget(size as isize);
    }

    pub fn freed_foreign_memory(&mut self, size: usize) {
        self.foreign_memory = self.foreign_memory.saturating_sub(size);
        self.space.charge_budget(-(size as isize));
    }

    /// Take over all objects and registrations of `other`. Its foreign
    /// memory is charged to this heap's budget.
    pub fn merge(&mut self, mut other: Heap) {
        let space = std::mem::replace(&mut other.space, Space::new(0));
        self.space.prepend_space(space);
        self.weak_pointers.append(&mut other.weak_pointers);
        let foreign = std::mem::take(&mut other.foreign_memory);
        self.foreign_memory += foreign;
        self.space.charge_budget(foreign as isize);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Every object dies with the heap.
        for weak in std::mem::take(&mut self.weak_pointers) {
            self.finalize(weak);
        }
    }
}

// ============================================================================
// Shared heap
// ============================================================================

/// The program-wide heap of immutable objects.
pub struct SharedHeap {
    heap: Mutex<Heap>,
    part_budget: usize,
    limit: AtomicUsize,
    minimum_limit: usize,
    pressure: AtomicBool,
}

impl SharedHeap {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            heap: Mutex::new(Heap::new(0, config.shared_heap_limit_bytes)),
            part_budget: config.shared_heap_part_bytes,
            limit: AtomicUsize::new(config.shared_heap_limit_bytes),
            minimum_limit: config.shared_heap_limit_bytes,
            pressure: AtomicBool::new(false),
        }
    }

    /// A private part for a process that is about to run.
    pub fn acquire_part(&self) -> Heap {
        Heap::new(self.part_budget.min(crate::space::default_chunk_size(0)), self.part_budget)
    }

    /// Merge a part back. Sets the pressure flag once the heap has grown
    /// past its limit.
    pub fn release_part(&self, part: Heap) {
        let mut heap = self.heap.lock();
        heap.merge(part);
        if heap.used() + heap.foreign_memory() > self.limit.load(Ordering::Relaxed) {
            self.pressure.store(true, Ordering::Release);
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    pub fn needs_garbage_collection(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }

    /// Ask for a shared collection at the next opportunity.
    pub fn request_collection(&self) {
        self.pressure.store(true, Ordering::Release);
    }

    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }

    /// Recompute the limit from the live size after a collection.
    pub fn update_limit_after_gc(&self, live: usize) {
        let limit = (live * 2).max(self.minimum_limit);
        self.limit.store(limit, Ordering::Relaxed);
        self.pressure.store(false, Ordering::Release);
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }
}
