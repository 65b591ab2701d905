//! Per-material cache of compiled programs.
//!
//! Each material has one protected default slot, written only when the
//! engine regenerates its own program, and [`CUSTOM_SLOTS`] rotating slots
//! for user-submitted sources. Custom slots are overwritten in write order,
//! so the most recently written `CUSTOM_SLOTS` user programs always survive.
//! Use order plays no part in eviction.

use std::collections::HashMap;

use shaderlink_core::{MaterialId, RenderEngine, ShaderSource, ShaderlinkResult};

/// Number of rotating slots for user-submitted programs.
pub const CUSTOM_SLOTS: usize = 2;

/// A compiled program together with the exact source it was built from.
#[derive(Debug, Clone)]
pub struct CacheEntry<P> {
    pub source: ShaderSource,
    pub program: P,
}

/// Lookup counters of one material.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct MaterialSlots<P> {
    default: Option<CacheEntry<P>>,
    custom: [Option<CacheEntry<P>>; CUSTOM_SLOTS],
    next_custom: usize,
    stats: CacheStats,
}

impl<P> MaterialSlots<P> {
    fn new() -> Self {
        Self {
            default: None,
            custom: std::array::from_fn(|_| None),
            next_custom: 0,
            stats: CacheStats::default(),
        }
    }

    fn entries(&self) -> impl Iterator<Item = &CacheEntry<P>> {
        self.default.iter().chain(self.custom.iter().flatten())
    }
}

pub struct ProgramCache<P> {
    materials: HashMap<MaterialId, MaterialSlots<P>>,
}

impl<P: Clone> ProgramCache<P> {
    pub fn new() -> Self {
        Self {
            materials: HashMap::new(),
        }
    }

    /// Find a cached program built from exactly `source`.
    pub fn lookup(&mut self, material: MaterialId, source: &ShaderSource) -> Option<P> {
        let slots = self.materials.entry(material).or_insert_with(MaterialSlots::new);
        let found = slots
            .entries()
            .find(|entry| entry.source == *source)
            .map(|entry| entry.program.clone());
        match found {
            Some(_) => slots.stats.hits += 1,
            None => slots.stats.misses += 1,
        }
        found
    }

    /// True when `source` is cached for `material`. Does not touch the stats.
    pub fn contains(&self, material: MaterialId, source: &ShaderSource) -> bool {
        self.materials
            .get(&material)
            .is_some_and(|slots| slots.entries().any(|entry| entry.source == *source))
    }

    /// Replace the engine-authored program of `material`.
    pub fn store_default(&mut self, material: MaterialId, program: P, source: ShaderSource) {
        let slots = self.materials.entry(material).or_insert_with(MaterialSlots::new);
        slots.default = Some(CacheEntry { source, program });
    }

    /// Store a user program in the next rotating slot, evicting its occupant.
    pub fn store_custom(&mut self, material: MaterialId, program: P, source: ShaderSource) {
        let slots = self.materials.entry(material).or_insert_with(MaterialSlots::new);
        let slot = slots.next_custom;
        if slots.custom[slot].is_some() {
            tracing::debug!("{}: evicting custom program slot {}", material, slot + 1);
        }
        slots.custom[slot] = Some(CacheEntry { source, program });
        slots.next_custom = (slot + 1) % CUSTOM_SLOTS;
    }

    pub fn default_entry(&self, material: MaterialId) -> Option<&CacheEntry<P>> {
        self.materials.get(&material)?.default.as_ref()
    }

    pub fn stats(&self, material: MaterialId) -> CacheStats {
        self.materials
            .get(&material)
            .map(|slots| slots.stats)
            .unwrap_or_default()
    }

    /// Make `program` the active program of `material`.
    pub fn bind<E>(&self, engine: &mut E, material: MaterialId, program: &P) -> ShaderlinkResult<()>
    where
        E: RenderEngine<Program = P>,
    {
        tracing::debug!("{}: binding program", material);
        engine.bind(material, program)
    }
}

impl<P: Clone> Default for ProgramCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: MaterialId = MaterialId(0);

    fn src(n: u32) -> ShaderSource {
        ShaderSource::new(format!("vertex {n}"), format!("fragment {n}"))
    }

    #[test]
    fn test_lookup_requires_exact_match_of_both_stages() {
        let mut cache = ProgramCache::new();
        cache.store_custom(M, 1u32, src(1));
        assert_eq!(cache.lookup(M, &src(1)), Some(1));
        assert_eq!(cache.lookup(M, &ShaderSource::new("vertex 1", "fragment 2")), None);
        assert_eq!(cache.lookup(M, &ShaderSource::new("vertex 1 ", "fragment 1")), None);
        assert_eq!(cache.stats(M), CacheStats { hits: 1, misses: 2 });
    }

    #[test]
    fn test_custom_slots_rotate_by_write_order() {
        let mut cache = ProgramCache::new();
        cache.store_custom(M, 1u32, src(1));
        cache.store_custom(M, 2, src(2));
        // Reading the oldest entry does not protect it from eviction.
        assert_eq!(cache.lookup(M, &src(1)), Some(1));
        cache.store_custom(M, 3, src(3));
        assert!(!cache.contains(M, &src(1)));
        assert!(cache.contains(M, &src(2)));
        assert!(cache.contains(M, &src(3)));
        cache.store_custom(M, 4, src(4));
        assert!(!cache.contains(M, &src(2)));
        assert!(cache.contains(M, &src(3)));
        assert!(cache.contains(M, &src(4)));
    }

    #[test]
    fn test_default_slot_survives_custom_writes() {
        let mut cache = ProgramCache::new();
        cache.store_default(M, 100u32, src(0));
        for n in 1..10 {
            cache.store_custom(M, n, src(n));
        }
        assert_eq!(cache.default_entry(M).map(|e| e.program), Some(100));
        assert_eq!(cache.lookup(M, &src(0)), Some(100));
    }

    #[test]
    fn test_store_default_replaces_previous_default() {
        let mut cache = ProgramCache::new();
        cache.store_default(M, 1u32, src(1));
        cache.store_default(M, 2, src(2));
        assert!(!cache.contains(M, &src(1)));
        assert_eq!(cache.default_entry(M).map(|e| e.source.clone()), Some(src(2)));
    }

    #[test]
    fn test_materials_are_isolated() {
        let mut cache = ProgramCache::new();
        cache.store_custom(MaterialId(0), 1u32, src(1));
        assert_eq!(cache.lookup(MaterialId(1), &src(1)), None);
        assert!(cache.default_entry(MaterialId(1)).is_none());
    }
}
