//! Scavenging (copying) collector.
//!
//! # Design
//!
//! Live objects are copied from a from-space into a fresh to-space. The
//! first copy of an object leaves a forwarding address in the original, so
//! visiting the same slot twice (or two slots referring to one object)
//! always yields a single copy.
//!
//! Copying is breadth-first: every copied object is queued, and
//! [`ScavengeVisitor::complete_scavenge`] scans queued objects in copy order
//! until the queue is empty.
//!
//! The to-space must be wrapped in a
//! [`NoAllocationFailureScope`](crate::space::NoAllocationFailureScope) so it
//! grows instead of failing.
//!
//! # Usage
//!
//! ```ignore
//! let mut to = Space::new(from.used() / 10);
//! let mut to_scope = NoAllocationFailureScope::new(&mut to);
//! let mut visitor = ScavengeVisitor::new(&mut from, &mut to_scope);
//! roots.visit_pointers(&mut visitor);
//! visitor.complete_scavenge();
//! ```

use std::collections::VecDeque;

use crate::object::{Address, Value};
use crate::space::Space;
use crate::store_buffer::StoreBuffer;

/// Which collector runs on process heaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorKind {
    Scavenge,
    MarkSweep,
}

impl CollectorKind {
    /// The collector picked by the `mark-sweep` feature.
    pub const fn configured() -> Self {
        if cfg!(feature = "mark-sweep") {
            CollectorKind::MarkSweep
        } else {
            CollectorKind::Scavenge
        }
    }
}

/// Visitor over reference slots.
pub trait PointerVisitor {
    /// Visit one address slot. The visitor may overwrite it.
    fn visit_address(&mut self, slot: &mut Address);

    fn visit(&mut self, value: &mut Value) {
        if let Value::Ref(address) = value {
            self.visit_address(address);
        }
    }

    fn visit_block(&mut self, values: &mut [Value]) {
        for value in values {
            self.visit(value);
        }
    }
}

/// Copies from-space objects reachable from visited slots into to-space.
pub struct ScavengeVisitor<'a> {
    from: &'a mut Space,
    to: &'a mut Space,
    worklist: VecDeque<Address>,
    copied_objects: usize,
    copied_bytes: usize,
    chain_stacks: bool,
    stacks: Vec<Address>,
}

impl<'a> ScavengeVisitor<'a> {
    pub fn new(from: &'a mut Space, to: &'a mut Space) -> Self {
        Self {
            from,
            to,
            worklist: VecDeque::new(),
            copied_objects: 0,
            copied_bytes: 0,
            chain_stacks: false,
            stacks: Vec::new(),
        }
    }

    /// Remember every copied stack so they can be chained afterwards. The
    /// first stack copied becomes the head of the chain.
    pub fn with_stack_chaining(mut self) -> Self {
        self.chain_stacks = true;
        self
    }

    pub fn copied_objects(&self) -> usize {
        self.copied_objects
    }

    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    /// Read access to the space being evacuated.
    pub fn from_space(&self) -> &Space {
        self.from
    }

    /// Mutable access to the space being evacuated, for roots that live
    /// inside from-space objects.
    pub fn from_space_mut(&mut self) -> &mut Space {
        self.from
    }

    pub fn to_space(&self) -> &Space {
        self.to
    }

    fn forward(&mut self, address: Address) -> Address {
        let object = match self.from.object_mut(address) {
            Some(object) => object,
            None => panic!("dangling reference {} during scavenge", address),
        };
        if let Some(to) = object.forwarding_address() {
            return to;
        }
        let copy = object.clone_for_copy();
        let size = copy.size();
        let is_stack = copy.is_stack();
        let to = match self.to.allocate(copy) {
            Some(to) => to,
            None => panic!("to-space allocation failed outside a no-failure scope"),
        };
        object.set_forwarding_address(to);

        self.copied_objects += 1;
        self.copied_bytes += size;
        if is_stack && self.chain_stacks {
            self.stacks.push(to);
        }
        self.worklist.push_back(to);
        to
    }

    /// Scan copied objects until no uncopied reachable object remains.
    pub fn complete_scavenge(&mut self) {
        while let Some(address) = self.worklist.pop_front() {
            self.scan(address);
        }
    }

    /// Like [`complete_scavenge`](Self::complete_scavenge) for a process heap.
    /// Also rebuilds the store buffer: every copied stack, and every copied
    /// object with a reference outside both the to-space and the program
    /// space, is recorded.
    pub fn complete_scavenge_mutable(&mut self, program_space: &Space, store_buffer: &mut StoreBuffer) {
        while let Some(address) = self.worklist.pop_front() {
            self.scan(address);
            let Some(object) = self.to.object(address) else {
                continue;
            };
            let mut points_to_immutable = false;
            object.for_each_pointer(|target| {
                if !self.to.includes(target) && !program_space.includes(target) {
                    points_to_immutable = true;
                }
            });
            if points_to_immutable || object.is_stack() {
                store_buffer.insert(address);
            }
        }
    }

    fn scan(&mut self, address: Address) {
        let Some(mut object) = self.to.take_object(address) else {
            return;
        };
        object.visit_pointers(self);
        self.to.restore_object(address, object);
    }

    /// Link all copied stacks through their `next` slots, head first, and
    /// return how many there are. The last stack's `next` is `Smi(0)`.
    pub fn chain_copied_stacks(&mut self) -> usize {
        let stacks = std::mem::take(&mut self.stacks);
        for (i, &address) in stacks.iter().enumerate() {
            let next = stacks.get(i + 1).map_or(Value::Smi(0), |&a| Value::Ref(a));
            if let Some(stack) = self.to.object_mut(address).and_then(|o| o.as_stack_mut()) {
                stack.next = next;
            }
        }
        stacks.len()
    }
}

impl PointerVisitor for ScavengeVisitor<'_> {
    fn visit_address(&mut self, slot: &mut Address) {
        if self.from.includes(*slot) {
            *slot = self.forward(*slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjectBody, StackObject};
    use crate::space::NoAllocationFailureScope;

    const CLASS: Address = Address(0x8);

    fn array(space: &mut Space, values: Vec<Value>) -> Address {
        space
            .allocate(HeapObject::new(CLASS, ObjectBody::Array(values)))
            .unwrap()
    }

    fn values(space: &Space, address: Address) -> Vec<Value> {
        space.object(address).unwrap().values().unwrap().to_vec()
    }

    #[test]
    fn test_shared_object_copied_once() {
        let mut from = Space::new(4096);
        let shared = array(&mut from, vec![Value::Smi(42)]);
        let left = array(&mut from, vec![Value::Ref(shared)]);
        let right = array(&mut from, vec![Value::Ref(shared)]);
        let _garbage = array(&mut from, vec![Value::Smi(0); 8]);

        let mut roots = [Value::Ref(left), Value::Ref(right), Value::Ref(shared)];
        let mut to = Space::new(0);
        {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(&mut from, &mut scope);
            visitor.visit_block(&mut roots);
            visitor.complete_scavenge();
            assert_eq!(visitor.copied_objects(), 3);
        }

        let new_shared = roots[2].as_address().unwrap();
        let via_left = values(&to, roots[0].as_address().unwrap())[0];
        let via_right = values(&to, roots[1].as_address().unwrap())[0];
        assert_eq!(via_left, Value::Ref(new_shared));
        assert_eq!(via_right, Value::Ref(new_shared));
        assert_eq!(values(&to, new_shared), vec![Value::Smi(42)]);
        assert_eq!(to.object_count(), 3);
    }

    #[test]
    fn test_revisiting_slot_is_idempotent() {
        let mut from = Space::new(4096);
        let object = array(&mut from, vec![]);
        let mut slot = Value::Ref(object);
        let mut to = Space::new(0);
        let mut scope = NoAllocationFailureScope::new(&mut to);
        let mut visitor = ScavengeVisitor::new(&mut from, &mut scope);
        visitor.visit(&mut slot);
        let first = slot;
        visitor.visit(&mut slot);
        assert_eq!(slot, first);
        assert_eq!(visitor.copied_objects(), 1);
    }

    #[test]
    fn test_cycles_and_breadth_first_order() {
        let mut from = Space::new(4096);
        let a = array(&mut from, vec![Value::Empty, Value::Empty]);
        let b = array(&mut from, vec![Value::Ref(a)]);
        let c = array(&mut from, vec![Value::Ref(a)]);
        let d = array(&mut from, vec![]);
        from.object_mut(a).unwrap().values_mut().unwrap()[0] = Value::Ref(b);
        from.object_mut(a).unwrap().values_mut().unwrap()[1] = Value::Ref(c);
        from.object_mut(b).unwrap().values_mut().unwrap()[0] = Value::Ref(d);

        let mut root = Value::Ref(a);
        let mut to = Space::new(0);
        {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(&mut from, &mut scope);
            visitor.visit(&mut root);
            visitor.complete_scavenge();
        }

        // a, then its children b and c, then b's child d.
        let order = to.addresses();
        let new_a = root.as_address().unwrap();
        let a_values = values(&to, new_a);
        assert_eq!(order[0], new_a);
        assert_eq!(Value::Ref(order[1]), a_values[0]);
        assert_eq!(Value::Ref(order[2]), a_values[1]);
        assert_eq!(values(&to, order[1])[0], Value::Ref(order[3]));
        assert_eq!(values(&to, order[2])[0], Value::Ref(new_a));
    }

    #[test]
    fn test_mutable_completion_records_outside_pointers() {
        let mut program = Space::new(4096);
        let class = array(&mut program, vec![]);
        let mut from = Space::new(4096);
        let outside = Address(0x7f00_0000);
        let holder = from
            .allocate(HeapObject::new(class, ObjectBody::Array(vec![Value::Ref(outside)])))
            .unwrap();
        let plain = from
            .allocate(HeapObject::new(class, ObjectBody::Array(vec![Value::Smi(1)])))
            .unwrap();
        let stack = from
            .allocate(HeapObject::new(class, ObjectBody::Stack(StackObject::new(4))))
            .unwrap();

        let mut roots = [Value::Ref(holder), Value::Ref(plain), Value::Ref(stack)];
        let mut to = Space::new(0);
        let mut buffer = StoreBuffer::new();
        {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(&mut from, &mut scope);
            visitor.visit_block(&mut roots);
            visitor.complete_scavenge_mutable(&program, &mut buffer);
        }
        assert!(buffer.contains(roots[0].as_address().unwrap()));
        assert!(!buffer.contains(roots[1].as_address().unwrap()));
        assert!(buffer.contains(roots[2].as_address().unwrap()));
    }

    #[test]
    fn test_stack_chaining() {
        let mut from = Space::new(4096);
        let first = from
            .allocate(HeapObject::new(CLASS, ObjectBody::Stack(StackObject::new(2))))
            .unwrap();
        let second = from
            .allocate(HeapObject::new(CLASS, ObjectBody::Stack(StackObject::new(2))))
            .unwrap();
        let mut roots = [Value::Ref(first), Value::Ref(second)];
        let mut to = Space::new(0);
        let count;
        {
            let mut scope = NoAllocationFailureScope::new(&mut to);
            let mut visitor = ScavengeVisitor::new(&mut from, &mut scope).with_stack_chaining();
            visitor.visit_block(&mut roots);
            visitor.complete_scavenge();
            count = visitor.chain_copied_stacks();
        }
        assert_eq!(count, 2);
        let head = to.object(roots[0].as_address().unwrap()).unwrap().as_stack().unwrap();
        assert_eq!(head.next, roots[1]);
        let tail = to.object(roots[1].as_address().unwrap()).unwrap().as_stack().unwrap();
        assert_eq!(tail.next, Value::Smi(0));
    }
}
