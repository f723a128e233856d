//! `RegionMap<V>`: a partial function from key-space regions to values.
//!
//! Stored as sorted, disjoint `(Span, V)` entries. The domain is the union of
//! the entry spans; [`RegionMap::mask`] restricts it, [`RegionMap::update`]
//! overwrites it on another map's domain, and [`RegionMap::transform`] maps
//! the values while keeping the domain.

use crate::error::Result;
use crate::region::{Region, Span};

#[derive(Debug, Clone)]
pub struct RegionMap<V> {
    /// Sorted by `span.lo`, pairwise disjoint, no empty spans.
    entries: Vec<(Span, V)>,
}

impl<V> Default for RegionMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RegionMap<V> {
    /// The map with empty domain.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn get_domain(&self) -> Region {
        Region::from_spans(self.entries.iter().map(|(s, _)| *s))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Span, &V)> {
        self.entries.iter().map(|(s, v)| (*s, v))
    }

    pub fn value_at(&self, key: u64) -> Option<&V> {
        self.entries
            .iter()
            .find(|(s, _)| s.contains(key))
            .map(|(_, v)| v)
    }

    /// Maps every value, keeping the domain.
    pub fn transform<U>(&self, f: impl Fn(&V) -> U) -> RegionMap<U> {
        RegionMap {
            entries: self.entries.iter().map(|(s, v)| (*s, f(v))).collect(),
        }
    }

    /// Fallible [`RegionMap::transform`]; the first failure aborts.
    pub fn try_transform<U>(&self, f: impl Fn(&V) -> Result<U>) -> Result<RegionMap<U>> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (span, value) in &self.entries {
            entries.push((*span, f(value)?));
        }
        Ok(RegionMap { entries })
    }
}

impl<V: Clone> RegionMap<V> {
    /// The constant map: `value` over every key of `region`.
    pub fn with_default(region: &Region, value: V) -> Self {
        Self {
            entries: region.spans().iter().map(|s| (*s, value.clone())).collect(),
        }
    }

    /// A single-span constant map, the common test and seed shape.
    pub fn over_range(lo: u64, hi: u64, value: V) -> Self {
        Self::with_default(&Region::range(lo, hi), value)
    }

    /// Restricts the domain to `region ∩ get_domain()`.
    pub fn mask(&self, region: &Region) -> Self {
        let mut entries = Vec::new();
        for (span, value) in &self.entries {
            for clip in region.spans() {
                if let Some(common) = span.intersect(clip) {
                    entries.push((common, value.clone()));
                }
            }
        }
        entries.sort_by_key(|(s, _)| s.lo);
        Self { entries }
    }

    /// Overwrites this map with `other` on `other.get_domain()`; the rest of
    /// this map's domain is untouched. The combined domain is the union.
    pub fn update(&mut self, other: RegionMap<V>) {
        let overwritten = other.get_domain();
        let mut entries: Vec<(Span, V)> = Vec::with_capacity(self.entries.len() + other.entries.len());
        for (span, value) in self.entries.drain(..) {
            let mut kept = Vec::new();
            super::subtract_span(span, overwritten.spans(), &mut kept);
            entries.extend(kept.into_iter().map(|s| (s, value.clone())));
        }
        entries.extend(other.entries);
        entries.sort_by_key(|(s, _)| s.lo);
        self.entries = entries;
    }
}

impl<V: PartialEq> RegionMap<V> {
    /// Entries with adjacent equal-valued spans coalesced; the canonical form
    /// used for equality.
    fn canonical(&self) -> Vec<(Span, &V)> {
        let mut out: Vec<(Span, &V)> = Vec::with_capacity(self.entries.len());
        for (span, value) in &self.entries {
            match out.last_mut() {
                Some((last, lv)) if last.hi == span.lo && *lv == value => last.hi = span.hi,
                _ => out.push((*span, value)),
            }
        }
        out
    }
}

/// Equality over the partial function, not the entry layout: two maps are
/// equal when they have the same domain and the same value at every key.
impl<V: PartialEq> PartialEq for RegionMap<V> {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl<V: Eq> Eq for RegionMap<V> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_domain() {
        let m = RegionMap::<u32>::new();
        assert!(m.is_empty());
        assert!(m.get_domain().is_empty());
    }

    #[test]
    fn test_with_default_covers_region() {
        let region = Region::from_spans([Span::new(0, 10), Span::new(20, 30)]);
        let m = RegionMap::with_default(&region, 7u32);
        assert_eq!(m.get_domain(), region);
        assert_eq!(m.value_at(5), Some(&7));
        assert_eq!(m.value_at(25), Some(&7));
        assert_eq!(m.value_at(15), None);
    }

    #[test]
    fn test_mask_restricts_domain() {
        let m = RegionMap::over_range(0, 100, 1u32);
        let masked = m.mask(&Region::range(40, 60));
        assert_eq!(masked.get_domain(), Region::range(40, 60));
        assert_eq!(masked.value_at(50), Some(&1));
        assert_eq!(masked.value_at(30), None);
    }

    #[test]
    fn test_update_overwrites_on_other_domain() {
        let mut m = RegionMap::over_range(0, 100, 1u32);
        m.update(RegionMap::over_range(40, 60, 2u32));
        assert_eq!(m.get_domain(), Region::range(0, 100));
        assert_eq!(m.value_at(10), Some(&1));
        assert_eq!(m.value_at(50), Some(&2));
        assert_eq!(m.value_at(90), Some(&1));
    }

    #[test]
    fn test_update_extends_domain() {
        let mut m = RegionMap::over_range(0, 10, 1u32);
        m.update(RegionMap::over_range(20, 30, 2u32));
        assert_eq!(
            m.get_domain(),
            Region::from_spans([Span::new(0, 10), Span::new(20, 30)])
        );
    }

    #[test]
    fn test_transform_keeps_domain() {
        let m = RegionMap::over_range(0, 10, 21u32);
        let doubled = m.transform(|v| v * 2);
        assert_eq!(doubled.get_domain(), Region::range(0, 10));
        assert_eq!(doubled.value_at(3), Some(&42));
    }

    #[test]
    fn test_equality_ignores_entry_splits() {
        let whole = RegionMap::over_range(0, 100, 9u32);
        let mut pieces = RegionMap::over_range(0, 40, 9u32);
        pieces.update(RegionMap::over_range(40, 100, 9u32));
        assert_eq!(whole, pieces);

        let mut differing = RegionMap::over_range(0, 40, 9u32);
        differing.update(RegionMap::over_range(40, 100, 8u32));
        assert_ne!(whole, differing);
    }

    #[test]
    fn test_mask_then_update_roundtrip() {
        let base = RegionMap::over_range(0, 100, 1u32);
        let mut rebuilt = RegionMap::new();
        rebuilt.update(base.mask(&Region::range(0, 50)));
        rebuilt.update(base.mask(&Region::range(50, 100)));
        assert_eq!(rebuilt, base);
    }
}
