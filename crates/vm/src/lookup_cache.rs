//! Two-level method lookup cache.
//!
//! Keyed by (class, selector). The primary table is direct mapped; an entry
//! evicted from it is demoted into the smaller secondary table instead of
//! being dropped. Entries are pure functions of the program, so a cache can
//! be cleared at any time, and must be whenever the program heap moves.

use crate::bytecode::Selector;
use crate::object::{Address, Intrinsic};

pub const PRIMARY_SIZE: usize = 1024;
pub const SECONDARY_SIZE: usize = 256;

/// How the resolved target should be invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupTag {
    /// The class has no such method; the target is the trampoline.
    NoSuchMethod,
    Method,
    Intrinsic(Intrinsic),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupEntry {
    pub class: Address,
    pub selector: Selector,
    pub target: Address,
    pub tag: LookupTag,
}

impl LookupEntry {
    fn matches(&self, class: Address, selector: Selector) -> bool {
        self.class == class && self.selector == selector
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LookupCacheStats {
    pub primary_hits: usize,
    pub secondary_hits: usize,
    pub misses: usize,
}

pub struct LookupCache {
    primary: Box<[Option<LookupEntry>]>,
    secondary: Box<[Option<LookupEntry>]>,
    stats: LookupCacheStats,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

fn hash(class: Address, selector: Selector) -> usize {
    (class.raw() >> 3) ^ (selector.raw() as u32 as usize)
}

impl LookupCache {
    pub fn new() -> Self {
        Self {
            primary: vec![None; PRIMARY_SIZE].into_boxed_slice(),
            secondary: vec![None; SECONDARY_SIZE].into_boxed_slice(),
            stats: LookupCacheStats::default(),
        }
    }

    pub fn primary_index(class: Address, selector: Selector) -> usize {
        hash(class, selector) & (PRIMARY_SIZE - 1)
    }

    pub fn secondary_index(class: Address, selector: Selector) -> usize {
        (hash(class, selector) >> 2) & (SECONDARY_SIZE - 1)
    }

    /// Fast path: the primary entry, if it matches.
    pub fn lookup_primary(&mut self, class: Address, selector: Selector) -> Option<LookupEntry> {
        let entry = self.primary[Self::primary_index(class, selector)]
            .filter(|entry| entry.matches(class, selector))?;
        self.stats.primary_hits += 1;
        Some(entry)
    }

    pub fn lookup_secondary(&mut self, class: Address, selector: Selector) -> Option<LookupEntry> {
        let entry = self.secondary[Self::secondary_index(class, selector)]
            .filter(|entry| entry.matches(class, selector))?;
        self.stats.secondary_hits += 1;
        Some(entry)
    }

    /// Install `entry` as primary, demoting whatever occupied its slot.
    pub fn install_primary(&mut self, entry: LookupEntry) {
        self.stats.misses += 1;
        let index = Self::primary_index(entry.class, entry.selector);
        if let Some(evicted) = self.primary[index].replace(entry) {
            let slot = Self::secondary_index(evicted.class, evicted.selector);
            self.secondary[slot] = Some(evicted);
        }
    }

    /// Look up `(class, selector)`, calling `resolve` on a miss in both
    /// levels.
    pub fn lookup_or_resolve<E>(
        &mut self,
        class: Address,
        selector: Selector,
        resolve: impl FnOnce() -> Result<LookupEntry, E>,
    ) -> Result<LookupEntry, E> {
        if let Some(entry) = self.lookup_primary(class, selector) {
            return Ok(entry);
        }
        if let Some(entry) = self.lookup_secondary(class, selector) {
            return Ok(entry);
        }
        let entry = resolve()?;
        self.install_primary(entry);
        Ok(entry)
    }

    pub fn clear(&mut self) {
        self.primary.iter_mut().for_each(|entry| *entry = None);
        self.secondary.iter_mut().for_each(|entry| *entry = None);
    }

    pub fn stats(&self) -> LookupCacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{SelectorKind, NO_SUCH_METHOD_TRAMPOLINE_ID};

    fn entry(class: usize, selector: Selector, target: usize) -> LookupEntry {
        LookupEntry {
            class: Address(class),
            selector,
            target: Address(target),
            tag: LookupTag::Method,
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let mut cache = LookupCache::new();
        let selector = Selector::encode(3, SelectorKind::Method, 1);
        let resolved = cache
            .lookup_or_resolve::<()>(Address(0x1000), selector, || Ok(entry(0x1000, selector, 0x5000)))
            .unwrap();
        assert_eq!(resolved.target, Address(0x5000));
        let again = cache
            .lookup_or_resolve::<()>(Address(0x1000), selector, || panic!("should hit"))
            .unwrap();
        assert_eq!(again, resolved);
        assert_eq!(cache.stats().primary_hits, 1);
    }

    #[test]
    fn test_evicted_entry_is_demoted() {
        let mut cache = LookupCache::new();
        let a = Selector::encode(1, SelectorKind::Method, 0);
        // Same primary slot: the hash differs by a multiple of the table size.
        let class_a = 0x1000;
        let class_b = class_a ^ (PRIMARY_SIZE << 3);
        assert_eq!(
            LookupCache::primary_index(Address(class_a), a),
            LookupCache::primary_index(Address(class_b), a)
        );
        cache.install_primary(entry(class_a, a, 0x10));
        cache.install_primary(entry(class_b, a, 0x20));

        assert!(cache.lookup_primary(Address(class_a), a).is_none());
        assert_eq!(cache.lookup_secondary(Address(class_a), a).unwrap().target, Address(0x10));
        assert_eq!(cache.lookup_primary(Address(class_b), a).unwrap().target, Address(0x20));
    }

    #[test]
    fn test_random_lookups_agree_with_dispatch() {
        use crate::config::RuntimeConfig;
        use crate::program::{lookup_method_in, ProgramBuilder};

        const CLASSES: usize = 48;
        const SELECTORS: i32 = 64;
        let mut rng = fastrand::Rng::with_seed(0x10c4);
        let selectors: Vec<Selector> = (1..=SELECTORS)
            .map(|id| Selector::encode(id, SelectorKind::Method, (id % 3) as usize))
            .collect();

        let mut builder = ProgramBuilder::new(RuntimeConfig::default()).unwrap().with_seed(3);
        let functions: Vec<Address> = (0..16)
            .map(|_| builder.define_function(0, vec![0; 4], vec![]).unwrap())
            .collect();
        let mut classes: Vec<Address> = Vec::with_capacity(CLASSES);
        for _ in 0..CLASSES {
            let methods: Vec<(Selector, Address)> = selectors
                .iter()
                .filter_map(|&selector| {
                    (rng.u8(..4) == 0).then(|| (selector, functions[rng.usize(..functions.len())]))
                })
                .collect();
            let super_class = if classes.is_empty() || rng.bool() {
                None
            } else {
                Some(classes[rng.usize(..classes.len())])
            };
            classes.push(builder.define_class(super_class, 0, &methods).unwrap());
        }
        let program = builder.build();
        let heap = program.heap();
        let trampoline_selector = Selector::encode(NO_SUCH_METHOD_TRAMPOLINE_ID, SelectorKind::Method, 0);
        let dispatch = |class: Address, selector: Selector| match lookup_method_in(&heap, class, selector) {
            Some(target) => (target, LookupTag::Method),
            None => (
                lookup_method_in(&heap, class, trampoline_selector).unwrap(),
                LookupTag::NoSuchMethod,
            ),
        };

        // More keys than both tables hold, so entries keep getting evicted
        // and demoted.
        assert!(CLASSES * SELECTORS as usize > PRIMARY_SIZE + SECONDARY_SIZE);
        let mut cache = LookupCache::new();
        let lookups = 5000;
        for _ in 0..lookups {
            let class = classes[rng.usize(..classes.len())];
            let selector = selectors[rng.usize(..selectors.len())];
            let found = cache
                .lookup_or_resolve::<()>(class, selector, || {
                    let (target, tag) = dispatch(class, selector);
                    Ok(LookupEntry {
                        class,
                        selector,
                        target,
                        tag,
                    })
                })
                .unwrap();
            assert_eq!(found.class, class);
            assert_eq!(found.selector, selector);
            assert_eq!((found.target, found.tag), dispatch(class, selector));
        }
        let stats = cache.stats();
        assert_eq!(stats.primary_hits + stats.secondary_hits + stats.misses, lookups);
        assert!(stats.primary_hits > 0);
        assert!(stats.secondary_hits > 0);
    }

    #[test]
    fn test_clear() {
        let mut cache = LookupCache::new();
        let a = Selector::encode(1, SelectorKind::Getter, 0);
        cache.install_primary(entry(0x40, a, 0x10));
        cache.clear();
        assert!(cache.lookup_primary(Address(0x40), a).is_none());
    }
}
