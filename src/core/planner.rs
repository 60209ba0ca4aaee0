//! Look-ahead layer caching.
//!
//! A cheap preview pass over a coarsened extent records the exact order in
//! which distinct layer references will be resolved. Knowing the full
//! reference sequence in advance enables Belady's clairvoyant eviction
//! policy during the real pass: a retained layer is dropped the moment its
//! last scheduled future use has been consumed, so memory is bounded by
//! what is actually still needed. The cache is an at-most-one-fetch
//! optimization, never an approximation — a hit must be value-identical to
//! a fresh retrieval.

use rustc_hash::FxHashMap;

use crate::cube::Cube;

/// Canonical identity of a reference: kind plus path, independent of any
/// trailing transformation chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digest a reference into its canonical cache identity.
pub fn reference_digest(kind: &str, reference: &[String]) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_bytes());
    for segment in reference {
        hasher.update(b"\0");
        hasher.update(segment.as_bytes());
    }
    CacheKey(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// The ordered, duplicate-preserving list of layer identities observed
/// during a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSequence {
    entries: Vec<CacheKey>,
}

impl ReferenceSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: CacheKey) {
        self.entries.push(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CacheKey] {
        &self.entries
    }
}

/// What the resolver should do for one resource reference.
#[derive(Debug)]
pub enum CacheDecision {
    /// The retained cube, served without a retrieval.
    Hit(Cube),
    /// Retrieve fresh; store the result when `remaining_uses > 0`.
    Miss { remaining_uses: usize },
}

#[derive(Debug, Clone)]
struct CachedEntry {
    cube: Cube,
    remaining_uses: usize,
}

/// Cache keyed by reference identity, primed with the preview sequence.
///
/// A cursor tracks the position in the expected sequence. References that
/// arrive in the expected order use the look-ahead counts; out-of-order
/// references (possible only through data-dependent custom verbs) degrade
/// to plain misses and are never stored.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    sequence: Vec<CacheKey>,
    positions: FxHashMap<CacheKey, Vec<usize>>,
    cursor: usize,
    store: FxHashMap<CacheKey, CachedEntry>,
    hits: usize,
    misses: usize,
}

impl Cache {
    /// Build an empty cache scheduled by a preview reference sequence.
    pub fn from_sequence(sequence: ReferenceSequence) -> Self {
        let mut positions: FxHashMap<CacheKey, Vec<usize>> = FxHashMap::default();
        for (i, key) in sequence.entries.iter().enumerate() {
            positions.entry(key.clone()).or_default().push(i);
        }
        Self {
            sequence: sequence.entries,
            positions,
            cursor: 0,
            store: FxHashMap::default(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Number of cubes currently retained.
    pub fn retained(&self) -> usize {
        self.store.len()
    }

    /// Occurrences of `key` at or after the cursor.
    fn future_uses(&self, key: &CacheKey) -> usize {
        match self.positions.get(key) {
            Some(positions) => {
                let at = positions.partition_point(|&p| p < self.cursor);
                positions.len() - at
            }
            None => 0,
        }
    }

    /// Decide hit or miss for one resource resolution.
    ///
    /// On the expected path the cursor advances and the remaining-uses
    /// count is recomputed from the schedule; an entry whose count reaches
    /// zero is evicted as it is served. A divergent reference leaves the
    /// cursor in place and resolves fresh.
    pub fn decide(&mut self, key: &CacheKey) -> CacheDecision {
        let in_order = self.sequence.get(self.cursor) == Some(key);
        if !in_order {
            tracing::debug!(reference = %key, "cache sequence divergence, resolving fresh");
            self.misses += 1;
            return CacheDecision::Miss { remaining_uses: 0 };
        }
        self.cursor += 1;
        let remaining = self.future_uses(key);
        if let Some(entry) = self.store.get_mut(key) {
            self.hits += 1;
            let cube = entry.cube.clone();
            if remaining == 0 {
                self.store.remove(key);
                tracing::debug!(reference = %key, "cache hit, last use consumed, evicting");
            } else {
                entry.remaining_uses = remaining;
                tracing::debug!(reference = %key, remaining, "cache hit");
            }
            CacheDecision::Hit(cube)
        } else {
            self.misses += 1;
            tracing::debug!(reference = %key, remaining, "cache miss");
            CacheDecision::Miss { remaining_uses: remaining }
        }
    }

    /// Retain a freshly retrieved cube for its scheduled future uses.
    pub fn store(&mut self, key: CacheKey, cube: Cube, remaining_uses: usize) {
        if remaining_uses > 0 {
            self.store.insert(key, CachedEntry { cube, remaining_uses });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::{Coord, Cube, Dimension};

    fn key(name: &str) -> CacheKey {
        reference_digest("resource", &[name.to_string()])
    }

    fn cube(v: f64) -> Cube {
        Cube::new(
            vec![Dimension::new("time", vec![Coord::Time(0)])],
            vec![v],
        )
    }

    fn sequence(names: &[&str]) -> ReferenceSequence {
        let mut seq = ReferenceSequence::new();
        for n in names {
            seq.push(key(n));
        }
        seq
    }

    #[test]
    fn test_digest_is_stable_and_chain_independent() {
        let a = reference_digest("resource", &["appearance".to_string(), "colortype".to_string()]);
        let b = reference_digest("resource", &["appearance".to_string(), "colortype".to_string()]);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("blake3:"));
        let c = reference_digest("concept", &["appearance".to_string(), "colortype".to_string()]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_repeat_reference_fetches_once() {
        let mut cache = Cache::from_sequence(sequence(&["a", "a"]));
        match cache.decide(&key("a")) {
            CacheDecision::Miss { remaining_uses } => {
                assert_eq!(remaining_uses, 1);
                cache.store(key("a"), cube(1.0), remaining_uses);
            }
            other => panic!("expected miss, got {other:?}"),
        }
        match cache.decide(&key("a")) {
            CacheDecision::Hit(c) => assert_eq!(c.values()[0], 1.0),
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        // Last scheduled use consumed: nothing stays retained.
        assert_eq!(cache.retained(), 0);
    }

    #[test]
    fn test_single_use_is_never_stored() {
        let mut cache = Cache::from_sequence(sequence(&["a", "b"]));
        match cache.decide(&key("a")) {
            CacheDecision::Miss { remaining_uses } => {
                assert_eq!(remaining_uses, 0);
                cache.store(key("a"), cube(1.0), remaining_uses);
            }
            other => panic!("expected miss, got {other:?}"),
        }
        assert_eq!(cache.retained(), 0);
    }

    #[test]
    fn test_belady_keeps_entry_until_last_use() {
        let mut cache = Cache::from_sequence(sequence(&["a", "b", "a", "a"]));
        if let CacheDecision::Miss { remaining_uses } = cache.decide(&key("a")) {
            cache.store(key("a"), cube(1.0), remaining_uses);
        }
        if let CacheDecision::Miss { remaining_uses } = cache.decide(&key("b")) {
            cache.store(key("b"), cube(2.0), remaining_uses);
        }
        assert_eq!(cache.retained(), 1); // only "a" has future uses
        assert!(matches!(cache.decide(&key("a")), CacheDecision::Hit(_)));
        assert_eq!(cache.retained(), 1); // one more use scheduled
        assert!(matches!(cache.decide(&key("a")), CacheDecision::Hit(_)));
        assert_eq!(cache.retained(), 0); // evicted on last use
        assert_eq!(cache.hits(), 2);
    }

    #[test]
    fn test_divergent_reference_is_plain_miss() {
        let mut cache = Cache::from_sequence(sequence(&["a", "b"]));
        if let CacheDecision::Miss { remaining_uses } = cache.decide(&key("a")) {
            cache.store(key("a"), cube(1.0), remaining_uses);
        }
        // "c" was never previewed: fresh resolution, cursor unmoved.
        match cache.decide(&key("c")) {
            CacheDecision::Miss { remaining_uses } => assert_eq!(remaining_uses, 0),
            other => panic!("expected miss, got {other:?}"),
        }
        // The expected "b" still resolves in order afterwards.
        assert!(matches!(
            cache.decide(&key("b")),
            CacheDecision::Miss { remaining_uses: 0 }
        ));
    }

    #[test]
    fn test_sequence_records_duplicates_in_order() {
        let seq = sequence(&["a", "b", "a"]);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.entries()[0], seq.entries()[2]);
    }
}
