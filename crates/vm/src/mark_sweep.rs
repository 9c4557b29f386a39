//! Mark-sweep collector.
//!
//! Marking uses an explicit, bounded [`MarkingStack`] instead of recursion.
//! When the stack overflows, the object is still marked but not pushed; the
//! marker then rescans marked objects for unmarked children until no
//! overflow remains. Sweeping removes unmarked objects and rebuilds the free
//! list, which coalesces adjacent dead regions.
//!
//! Weak pointers must be processed between marking and sweeping, while the
//! mark bits are still set.

use smallvec::SmallVec;

use crate::collector::PointerVisitor;
use crate::object::{Address, Value};
use crate::space::Space;

/// Default number of entries before the marking stack overflows.
pub const MARKING_STACK_CAPACITY: usize = 4 * 1024;

/// Explicit stack of marked objects whose children are not yet marked.
#[derive(Debug)]
pub struct MarkingStack {
    entries: Vec<Address>,
    capacity: usize,
    overflowed: bool,
}

impl Default for MarkingStack {
    fn default() -> Self {
        Self::with_capacity(MARKING_STACK_CAPACITY)
    }
}

impl MarkingStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(MARKING_STACK_CAPACITY)),
            capacity,
            overflowed: false,
        }
    }

    pub fn push(&mut self, address: Address) {
        if self.entries.len() == self.capacity {
            self.overflowed = true;
        } else {
            self.entries.push(address);
        }
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.entries.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }
}

/// Marks objects of one space reachable from the visited slots.
pub struct MarkingVisitor<'a> {
    space: &'a mut Space,
    stack: MarkingStack,
    marked_objects: usize,
    chain_stacks: bool,
    stacks: Vec<Address>,
}

impl<'a> MarkingVisitor<'a> {
    pub fn new(space: &'a mut Space) -> Self {
        Self::with_stack(space, MarkingStack::default())
    }

    pub fn with_stack(space: &'a mut Space, stack: MarkingStack) -> Self {
        Self {
            space,
            stack,
            marked_objects: 0,
            chain_stacks: false,
            stacks: Vec::new(),
        }
    }

    pub fn with_stack_chaining(mut self) -> Self {
        self.chain_stacks = true;
        self
    }

    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    pub fn space_mut(&mut self) -> &mut Space {
        self.space
    }

    fn mark(&mut self, address: Address) {
        let Some(object) = self.space.object_mut(address) else {
            return;
        };
        if object.is_marked() {
            return;
        }
        object.set_mark();
        let is_stack = object.is_stack();
        self.marked_objects += 1;
        if is_stack && self.chain_stacks {
            self.stacks.push(address);
        }
        self.stack.push(address);
    }

    fn mark_children(&mut self, address: Address) {
        let mut children: SmallVec<[Address; 16]> = SmallVec::new();
        if let Some(object) = self.space.object(address) {
            object.for_each_pointer(|target| children.push(target));
        }
        for child in children {
            if self.space.includes(child) {
                self.mark(child);
            }
        }
    }

    /// Drain the marking stack, recovering from overflow by rescanning.
    pub fn process(&mut self) {
        loop {
            while let Some(address) = self.stack.pop() {
                self.mark_children(address);
            }
            if !self.stack.take_overflow() {
                break;
            }
            let marked: Vec<Address> = self
                .space
                .iter()
                .filter(|(_, object)| object.is_marked())
                .map(|(address, _)| address)
                .collect();
            for address in marked {
                self.mark_children(address);
                while let Some(address) = self.stack.pop() {
                    self.mark_children(address);
                }
            }
        }
    }

    /// Link every marked stack through `next`, first marked first. Returns
    /// the number of stacks.
    pub fn chain_marked_stacks(&mut self) -> usize {
        let stacks = std::mem::take(&mut self.stacks);
        for (i, &address) in stacks.iter().enumerate() {
            let next = stacks.get(i + 1).map_or(Value::Smi(0), |&a| Value::Ref(a));
            if let Some(stack) = self.space.object_mut(address).and_then(|o| o.as_stack_mut()) {
                stack.next = next;
            }
        }
        stacks.len()
    }
}

impl PointerVisitor for MarkingVisitor<'_> {
    fn visit_address(&mut self, slot: &mut Address) {
        if self.space.includes(*slot) {
            self.mark(*slot);
        }
    }
}

/// Outcome of a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub live_objects: usize,
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

/// Remove unmarked objects, clear marks on survivors, and rebuild the free
/// list.
pub fn sweep(space: &mut Space) -> SweepStats {
    let mut stats = SweepStats::default();
    let mut dead = Vec::new();
    for (address, object) in space.iter_mut() {
        if object.is_marked() {
            object.clear_mark();
            stats.live_objects += 1;
        } else {
            dead.push(address);
        }
    }
    for address in dead {
        if let Some(object) = space.remove_object(address) {
            stats.freed_objects += 1;
            stats.freed_bytes += object.size();
        }
    }
    space.rebuild_free_list();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjectBody, StackObject};

    const CLASS: Address = Address(0x8);

    fn array(space: &mut Space, values: Vec<Value>) -> Address {
        space
            .allocate(HeapObject::new(CLASS, ObjectBody::Array(values)))
            .unwrap()
    }

    #[test]
    fn test_mark_and_sweep_keeps_reachable() {
        let mut space = Space::new(4096);
        let leaf = array(&mut space, vec![Value::Smi(1)]);
        let root = array(&mut space, vec![Value::Ref(leaf)]);
        let dead = array(&mut space, vec![Value::Ref(leaf)]);

        let mut slot = Value::Ref(root);
        {
            let mut visitor = MarkingVisitor::new(&mut space);
            visitor.visit(&mut slot);
            visitor.process();
            assert_eq!(visitor.marked_objects(), 2);
        }
        let stats = sweep(&mut space);

        assert_eq!(stats.live_objects, 2);
        assert_eq!(stats.freed_objects, 1);
        assert!(space.object(dead).is_none());
        assert!(!space.object(root).unwrap().is_marked());
        assert_eq!(slot, Value::Ref(root));
    }

    #[test]
    fn test_deep_chain_with_tiny_marking_stack() {
        let mut space = Space::new(64 * 1024);
        let mut next = Value::Smi(0);
        let mut all = Vec::new();
        for _ in 0..500 {
            let address = array(&mut space, vec![next, next]);
            all.push(address);
            next = Value::Ref(address);
        }

        let mut slot = next;
        {
            let mut visitor = MarkingVisitor::with_stack(&mut space, MarkingStack::with_capacity(2));
            visitor.visit(&mut slot);
            visitor.process();
            assert_eq!(visitor.marked_objects(), 500);
        }
        let stats = sweep(&mut space);
        assert_eq!(stats.freed_objects, 0);
        assert!(all.iter().all(|a| space.object(*a).is_some()));
    }

    #[test]
    fn test_overflow_recovery_marks_grandchildren() {
        let mut space = Space::new(64 * 1024);
        let mut children = Vec::new();
        let mut grandchildren = Vec::new();
        for i in 0..64 {
            let grandchild = array(&mut space, vec![Value::Smi(i)]);
            grandchildren.push(grandchild);
            children.push(Value::Ref(array(&mut space, vec![Value::Ref(grandchild)])));
        }
        let root = array(&mut space, children);

        let mut slot = Value::Ref(root);
        {
            let mut visitor = MarkingVisitor::with_stack(&mut space, MarkingStack::with_capacity(4));
            visitor.visit(&mut slot);
            visitor.process();
            assert_eq!(visitor.marked_objects(), 129);
        }
        assert_eq!(sweep(&mut space).freed_objects, 0);
        assert!(grandchildren.iter().all(|g| space.object(*g).is_some()));
    }

    #[test]
    fn test_freed_memory_is_reused() {
        let mut space = Space::new(4096);
        let first = array(&mut space, vec![Value::Smi(0); 4]);
        let keep = array(&mut space, vec![]);
        let mut slot = Value::Ref(keep);
        {
            let mut visitor = MarkingVisitor::new(&mut space);
            visitor.visit(&mut slot);
            visitor.process();
        }
        sweep(&mut space);
        let reused = array(&mut space, vec![Value::Smi(0); 4]);
        assert_eq!(reused, first);
    }

    #[test]
    fn test_marked_stacks_are_chained() {
        let mut space = Space::new(4096);
        let a = space
            .allocate(HeapObject::new(CLASS, ObjectBody::Stack(StackObject::new(2))))
            .unwrap();
        let b = space
            .allocate(HeapObject::new(CLASS, ObjectBody::Stack(StackObject::new(2))))
            .unwrap();
        let mut roots = [Value::Ref(a), Value::Ref(b)];
        let mut visitor = MarkingVisitor::new(&mut space).with_stack_chaining();
        visitor.visit_block(&mut roots);
        visitor.process();
        assert_eq!(visitor.chain_marked_stacks(), 2);
        drop(visitor);
        assert_eq!(space.object(a).unwrap().as_stack().unwrap().next, Value::Ref(b));
    }
}
