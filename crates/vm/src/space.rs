//! Allocation arenas.
//!
//! A [`Space`] is a list of [`Chunk`]s. Each chunk owns a disjoint range of
//! the VM-wide address space; ranges are handed out by a global bump
//! allocator and never reused, so `includes` is exclusive across every space
//! alive at the same time.
//!
//! Allocation first reuses the free list (filled by the mark-sweep
//! collector), then bumps the newest chunk, and finally adds a chunk. Adding a chunk
//! is refused once the allocation budget is spent, which is how a heap asks
//! for a collection. Inside a [`NoAllocationFailureScope`] the budget is
//! ignored; collectors use that for their to-spaces.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::PAGE_SIZE;
use crate::object::{Address, HeapObject};

/// First address handed out. Keeps `Address(0)` free as a null.
const FIRST_CHUNK_BASE: usize = 0x10_0000;

static NEXT_CHUNK_BASE: AtomicUsize = AtomicUsize::new(FIRST_CHUNK_BASE);

const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 256 * 1024;

fn round_up_to_page(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE
}

/// Reserve a fresh address range of `size` bytes. A guard page separates
/// consecutive ranges.
fn reserve_range(size: usize) -> Address {
    Address(NEXT_CHUNK_BASE.fetch_add(size + PAGE_SIZE, Ordering::Relaxed))
}

/// A contiguous address range holding objects.
#[derive(Debug)]
pub struct Chunk {
    base: Address,
    limit: Address,
    top: Address,
    objects: BTreeMap<Address, HeapObject>,
}

impl Chunk {
    fn new(size: usize) -> Self {
        let size = round_up_to_page(size);
        let base = reserve_range(size);
        Self {
            base,
            limit: base.offset(size),
            top: base,
            objects: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn size(&self) -> usize {
        self.limit.raw() - self.base.raw()
    }

    pub fn includes(&self, address: Address) -> bool {
        self.base <= address && address < self.limit
    }

    fn try_bump(&mut self, size: usize) -> Option<Address> {
        if self.top.raw() + size > self.limit.raw() {
            return None;
        }
        let address = self.top;
        self.top = self.top.offset(size);
        Some(address)
    }
}

/// First-fit list of free regions inside chunks.
#[derive(Debug, Default)]
struct FreeList {
    regions: Vec<(Address, usize)>,
}

impl FreeList {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        let index = self.regions.iter().position(|&(_, free)| free >= size)?;
        let (start, free) = self.regions[index];
        if free == size {
            self.regions.swap_remove(index);
        } else {
            self.regions[index] = (start.offset(size), free - size);
        }
        Some(start)
    }

    fn total(&self) -> usize {
        self.regions.iter().map(|&(_, size)| size).sum()
    }
}

/// Chunk size for a heap currently `heap_size` bytes large.
pub fn default_chunk_size(heap_size: usize) -> usize {
    round_up_to_page((heap_size / 5).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE))
}

/// A chunked allocation arena.
#[derive(Debug)]
pub struct Space {
    chunks: Vec<Chunk>,
    free_list: FreeList,
    used: usize,
    allocation_budget: isize,
    minimum_budget: usize,
    no_allocation_failure_depth: usize,
}

impl Space {
    /// Create a space whose first chunk holds `initial_size` bytes. The
    /// allocation budget starts at the same size.
    pub fn new(initial_size: usize) -> Self {
        Self::with_budget(initial_size, initial_size.max(MIN_CHUNK_SIZE))
    }

    pub fn with_budget(initial_size: usize, budget: usize) -> Self {
        let mut space = Self {
            chunks: Vec::new(),
            free_list: FreeList::default(),
            used: 0,
            allocation_budget: budget as isize,
            minimum_budget: budget,
            no_allocation_failure_depth: 0,
        };
        if initial_size > 0 {
            space.chunks.push(Chunk::new(initial_size));
        }
        space
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Place `object` in the space. `None` means the budget is spent and a
    /// collection should run before retrying.
    pub fn allocate(&mut self, object: HeapObject) -> Option<Address> {
        let size = object.size();
        let address = self.allocate_raw(size)?;
        self.insert(address, object);
        Some(address)
    }

    fn allocate_raw(&mut self, size: usize) -> Option<Address> {
        let reused = self.free_list.allocate(size);
        let address = match reused.or_else(|| self.chunks.last_mut()?.try_bump(size)) {
            Some(address) => address,
            None => {
                if self.needs_garbage_collection() && !self.in_no_allocation_failure_scope() {
                    return None;
                }
                let mut chunk = Chunk::new(default_chunk_size(self.size()).max(size));
                let address = chunk.try_bump(size)?;
                self.chunks.push(chunk);
                address
            }
        };
        self.used += size;
        self.allocation_budget -= size as isize;
        Some(address)
    }

    fn insert(&mut self, address: Address, object: HeapObject) {
        if let Some(chunk) = self.chunk_for_mut(address) {
            chunk.objects.insert(address, object);
        }
    }

    /// Give back the most recent allocation if `address` is it.
    pub fn try_dealloc(&mut self, address: Address) -> bool {
        let Some(chunk) = self.chunks.last_mut() else {
            return false;
        };
        let size = match chunk.objects.get(&address) {
            Some(object) => object.size(),
            None => return false,
        };
        if address.offset(size) != chunk.top {
            return false;
        }
        chunk.objects.remove(&address);
        chunk.top = address;
        self.used -= size;
        self.allocation_budget += size as isize;
        true
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    pub fn needs_garbage_collection(&self) -> bool {
        self.allocation_budget <= 0
    }

    pub fn allocation_budget(&self) -> isize {
        self.allocation_budget
    }

    /// Reset the budget after a collection. The space may allocate as much
    /// again as is live now, plus whatever is held outside it.
    pub fn adjust_allocation_budget(&mut self, used_outside_space: usize) {
        let budget = (self.used + used_outside_space).max(self.minimum_budget);
        self.allocation_budget = budget as isize;
    }

    /// Charge or credit bytes held outside the space, such as foreign memory.
    pub fn charge_budget(&mut self, bytes: isize) {
        self.allocation_budget -= bytes;
    }

    pub fn in_no_allocation_failure_scope(&self) -> bool {
        self.no_allocation_failure_depth > 0
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn includes(&self, address: Address) -> bool {
        self.chunks.iter().any(|chunk| chunk.includes(address))
    }

    fn chunk_for(&self, address: Address) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.includes(address))
    }

    fn chunk_for_mut(&mut self, address: Address) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|chunk| chunk.includes(address))
    }

    pub fn object(&self, address: Address) -> Option<&HeapObject> {
        self.chunk_for(address)?.objects.get(&address)
    }

    pub fn object_mut(&mut self, address: Address) -> Option<&mut HeapObject> {
        self.chunk_for_mut(address)?.objects.get_mut(&address)
    }

    /// Temporarily remove an object so it can be scanned while the space is
    /// mutated. Pair with [`Space::restore_object`].
    pub fn take_object(&mut self, address: Address) -> Option<HeapObject> {
        self.chunk_for_mut(address)?.objects.remove(&address)
    }

    pub fn restore_object(&mut self, address: Address, object: HeapObject) {
        self.insert(address, object);
    }

    /// Drop an object for good. Its memory becomes free once the free list
    /// is rebuilt.
    pub fn remove_object(&mut self, address: Address) -> Option<HeapObject> {
        let object = self.chunk_for_mut(address)?.objects.remove(&address)?;
        self.used -= object.size();
        Some(object)
    }

    /// Start address of the object whose extent covers `address`.
    pub fn find_object_containing(&self, address: Address) -> Option<Address> {
        let chunk = self.chunk_for(address)?;
        let (&start, object) = chunk.objects.range(..=address).next_back()?;
        (address.raw() < start.raw() + object.size()).then_some(start)
    }

    /// Bytes occupied by objects.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes reserved by chunks.
    pub fn size(&self) -> usize {
        self.chunks.iter().map(Chunk::size).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_list.total()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.objects.is_empty())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn object_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.objects.len()).sum()
    }

    /// Objects in chunk order, ascending addresses within a chunk.
    pub fn iter(&self) -> impl Iterator<Item = (Address, &HeapObject)> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.objects.iter().map(|(a, o)| (*a, o)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Address, &mut HeapObject)> {
        self.chunks
            .iter_mut()
            .flat_map(|chunk| chunk.objects.iter_mut().map(|(a, o)| (*a, o)))
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.iter().map(|(address, _)| address).collect()
    }

    // ------------------------------------------------------------------
    // Whole-space operations
    // ------------------------------------------------------------------

    /// Take over all chunks of `other`, placing them before ours.
    pub fn prepend_space(&mut self, other: Space) {
        let Space {
            mut chunks,
            free_list,
            used,
            ..
        } = other;
        chunks.append(&mut self.chunks);
        self.chunks = chunks;
        self.free_list.regions.extend(free_list.regions);
        self.used += used;
    }

    /// Recompute the free list from the gaps between live objects. Adjacent
    /// dead regions coalesce because only live objects bound a gap. A gap at
    /// the end of a chunk lowers its bump pointer instead.
    pub fn rebuild_free_list(&mut self) {
        self.free_list.regions.clear();
        for chunk in &mut self.chunks {
            let mut cursor = chunk.base;
            for (&address, object) in &chunk.objects {
                if address > cursor {
                    self.free_list
                        .regions
                        .push((cursor, address.raw() - cursor.raw()));
                }
                cursor = address.offset(object.size());
            }
            chunk.top = cursor;
        }
    }
}

/// Lets a space grow past its budget while the guard lives.
pub struct NoAllocationFailureScope<'a> {
    space: &'a mut Space,
}

impl<'a> NoAllocationFailureScope<'a> {
    pub fn new(space: &'a mut Space) -> Self {
        space.no_allocation_failure_depth += 1;
        Self { space }
    }
}

impl Drop for NoAllocationFailureScope<'_> {
    fn drop(&mut self) {
        self.space.no_allocation_failure_depth -= 1;
    }
}

impl Deref for NoAllocationFailureScope<'_> {
    type Target = Space;

    fn deref(&self) -> &Space {
        self.space
    }
}

impl DerefMut for NoAllocationFailureScope<'_> {
    fn deref_mut(&mut self) -> &mut Space {
        self.space
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectBody, Value};

    fn array(len: usize) -> HeapObject {
        HeapObject::new(Address(0x8), ObjectBody::Array(vec![Value::Smi(0); len]))
    }

    #[test]
    fn test_bump_allocation_is_sequential() {
        let mut space = Space::new(4096);
        let a = space.allocate(array(1)).unwrap();
        let b = space.allocate(array(1)).unwrap();
        assert_eq!(b.raw() - a.raw(), array(1).size());
        assert_eq!(space.used(), 2 * array(1).size());
        assert!(space.includes(a) && space.includes(b));
    }

    #[test]
    fn test_includes_is_exclusive_between_spaces() {
        let mut first = Space::new(4096);
        let mut second = Space::new(4096);
        let a = first.allocate(array(2)).unwrap();
        let b = second.allocate(array(2)).unwrap();
        assert!(first.includes(a) && !second.includes(a));
        assert!(second.includes(b) && !first.includes(b));
    }

    #[test]
    fn test_budget_exhaustion_requests_gc() {
        let mut space = Space::with_budget(4096, 4096);
        let mut allocated = 0;
        while space.allocate(array(30)).is_some() {
            allocated += 1;
            assert!(allocated < 1000, "budget never ran out");
        }
        assert!(space.needs_garbage_collection());

        // A no-failure scope grows the space regardless.
        let mut scope = NoAllocationFailureScope::new(&mut space);
        assert!(scope.allocate(array(30)).is_some());
        drop(scope);
        assert!(space.allocate(array(600)).is_none());
    }

    #[test]
    fn test_try_dealloc_only_rewinds_last_object() {
        let mut space = Space::new(4096);
        let a = space.allocate(array(1)).unwrap();
        let b = space.allocate(array(1)).unwrap();
        assert!(!space.try_dealloc(a));
        assert!(space.try_dealloc(b));
        let c = space.allocate(array(1)).unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn test_rebuild_free_list_coalesces_neighbours() {
        let mut space = Space::new(4096);
        let a = space.allocate(array(2)).unwrap();
        let b = space.allocate(array(2)).unwrap();
        let c = space.allocate(array(2)).unwrap();
        let _d = space.allocate(array(2)).unwrap();
        space.remove_object(b);
        space.remove_object(c);
        space.rebuild_free_list();
        assert_eq!(space.free_bytes(), 2 * array(2).size());

        // A larger object fits the coalesced gap.
        let e = space.allocate(array(6)).unwrap();
        assert_eq!(e, b);
        assert!(space.object(a).is_some());
    }

    #[test]
    fn test_find_object_containing() {
        let mut space = Space::new(4096);
        let a = space.allocate(array(4)).unwrap();
        assert_eq!(space.find_object_containing(a.offset(17)), Some(a));
        assert_eq!(space.find_object_containing(a.offset(array(4).size())), None);
    }

    #[test]
    fn test_prepend_space_moves_objects() {
        let mut space = Space::new(4096);
        let mut other = Space::new(4096);
        let a = space.allocate(array(1)).unwrap();
        let b = other.allocate(array(1)).unwrap();
        space.prepend_space(other);
        assert!(space.includes(a) && space.includes(b));
        assert_eq!(space.object_count(), 2);
        assert_eq!(space.addresses()[0], b);
    }

    #[test]
    fn test_default_chunk_size_clamped() {
        assert_eq!(default_chunk_size(0), 4 * 1024);
        assert_eq!(default_chunk_size(100 * 1024 * 1024), 256 * 1024);
        assert_eq!(default_chunk_size(100 * 1024) % PAGE_SIZE, 0);
    }
}
