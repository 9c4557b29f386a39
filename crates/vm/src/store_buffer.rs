//! Remembered set for pointers from a process heap into the shared heap.
//!
//! A process collection never scans the shared heap, and a shared
//! collection never scans whole process heaps. The store buffer records the
//! mutable objects that may hold references into immutable space so the
//! shared collector can find and update exactly those slots.
//!
//! Stacks are always recorded because the interpreter writes stack slots
//! without a barrier.

use crate::collector::PointerVisitor;
use crate::object::Address;
use crate::space::Space;

#[derive(Debug, Default)]
pub struct StoreBuffer {
    objects: Vec<Address>,
}

impl StoreBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `object`. Repeated inserts of the most recent entry are
    /// skipped; other duplicates are removed by [`StoreBuffer::compact`].
    pub fn insert(&mut self, object: Address) {
        if self.objects.last() != Some(&object) {
            self.objects.push(object);
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, object: Address) -> bool {
        self.objects.contains(&object)
    }

    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.objects.iter().copied()
    }

    pub fn compact(&mut self) {
        self.objects.sort_unstable();
        self.objects.dedup();
    }

    /// Install the buffer rebuilt by a process collection.
    pub fn replace_after_mutable_gc(&mut self, rebuilt: StoreBuffer) {
        self.objects = rebuilt.objects;
    }

    /// Absorb the entries of a merged child heap.
    pub fn merge(&mut self, other: StoreBuffer) {
        self.objects.extend(other.objects);
    }

    /// Visit every slot of a recorded object that points outside `space`.
    /// Entries no longer in `space` are dropped.
    pub fn iterate_pointers_to_immutable_space(
        &mut self,
        space: &mut Space,
        visitor: &mut dyn PointerVisitor,
    ) {
        self.compact();
        self.objects.retain(|&address| space.includes(address));
        for &address in &self.objects {
            let Some(mut object) = space.take_object(address) else {
                continue;
            };
            object.visit_value_pointers(&mut OutsideSpace {
                space,
                inner: &mut *visitor,
            });
            space.restore_object(address, object);
        }
    }
}

struct OutsideSpace<'a> {
    space: &'a Space,
    inner: &'a mut dyn PointerVisitor,
}

impl PointerVisitor for OutsideSpace<'_> {
    fn visit_address(&mut self, slot: &mut Address) {
        if !self.space.includes(*slot) {
            self.inner.visit_address(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjectBody, Value};

    struct Rewrite {
        from: Address,
        to: Address,
        seen: Vec<Address>,
    }

    impl PointerVisitor for Rewrite {
        fn visit_address(&mut self, slot: &mut Address) {
            self.seen.push(*slot);
            if *slot == self.from {
                *slot = self.to;
            }
        }
    }

    #[test]
    fn test_insert_skips_immediate_repeat() {
        let mut buffer = StoreBuffer::new();
        buffer.insert(Address(0x10));
        buffer.insert(Address(0x10));
        buffer.insert(Address(0x20));
        buffer.insert(Address(0x10));
        assert_eq!(buffer.len(), 3);
        buffer.compact();
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_only_outside_pointers_are_visited() {
        let mut space = Space::new(4096);
        let local = space
            .allocate(HeapObject::new(Address(0x8), ObjectBody::Array(vec![])))
            .unwrap();
        let shared = Address(0x7000_0000);
        let holder = space
            .allocate(HeapObject::new(
                Address(0x8),
                ObjectBody::Array(vec![Value::Ref(local), Value::Ref(shared), Value::Smi(1)]),
            ))
            .unwrap();

        let mut buffer = StoreBuffer::new();
        buffer.insert(holder);
        let mut rewrite = Rewrite {
            from: shared,
            to: Address(0x7100_0000),
            seen: vec![],
        };
        buffer.iterate_pointers_to_immutable_space(&mut space, &mut rewrite);

        assert_eq!(rewrite.seen, vec![shared]);
        let values = space.object(holder).unwrap().values().unwrap();
        assert_eq!(values[1], Value::Ref(Address(0x7100_0000)));
        assert_eq!(values[0], Value::Ref(local));
    }
}
