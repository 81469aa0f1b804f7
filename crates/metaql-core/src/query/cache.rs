//! Plan cache.
//!
//! Compiled plans are keyed by a fingerprint of the query's structure, not
//! its literal values, so queries of the same shape share one plan.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use metaql_proto::{Filter, FilterOperator, UnifiedQuery};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::driver::DriverKind;

use super::compiler::CompiledQuery;

/// Structural hash of a query.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFingerprint([u8; 32]);

impl QueryFingerprint {
    /// Fingerprint a query for a target driver kind.
    ///
    /// Covers the object, projection (sorted), filter shape (fields,
    /// operators and `in` list lengths), sort keys, the presence of paging,
    /// expanded fields, grouping and aggregations.
    pub fn from_query(query: &UnifiedQuery, target: DriverKind) -> Self {
        let mut hasher = ShapeHasher::default();

        hasher.write_str(&query.object);
        hasher.write_str(target.as_str());

        match &query.fields {
            Some(fields) => {
                let mut sorted: Vec<&str> = fields.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                sorted.dedup();
                hasher.write_tag(b'P');
                hasher.write_len(sorted.len());
                for field in sorted {
                    hasher.write_str(field);
                }
            }
            None => hasher.write_tag(b'*'),
        }

        match &query.filters {
            Some(filter) => hasher.write_filter(filter),
            None => hasher.write_tag(b'-'),
        }

        hasher.write_len(query.sort.len());
        for sort in &query.sort {
            hasher.write_str(&sort.field);
            hasher.write_tag(sort.order as u8);
        }

        hasher.write_tag(query.top.is_some() as u8);
        hasher.write_tag(query.skip.is_some() as u8);

        hasher.write_len(query.expand.len());
        for (field, spec) in &query.expand {
            hasher.write_str(field);
            match &spec.fields {
                Some(fields) => {
                    let mut sorted: Vec<&str> = fields.iter().map(String::as_str).collect();
                    sorted.sort_unstable();
                    hasher.write_len(sorted.len());
                    for f in sorted {
                        hasher.write_str(f);
                    }
                }
                None => hasher.write_tag(b'*'),
            }
            match &spec.filters {
                Some(filter) => hasher.write_filter(filter),
                None => hasher.write_tag(b'-'),
            }
        }

        hasher.write_len(query.group_by.len());
        for field in &query.group_by {
            hasher.write_str(field);
        }
        hasher.write_len(query.aggregate.len());
        for aggregation in &query.aggregate {
            hasher.write_str(aggregation.func.as_str());
            hasher.write_str(aggregation.field.as_deref().unwrap_or("*"));
            hasher.write_str(&aggregation.output_name());
        }

        Self(*hasher.inner.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryFingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Default)]
struct ShapeHasher {
    inner: blake3::Hasher,
}

impl ShapeHasher {
    fn write_tag(&mut self, tag: u8) {
        self.inner.update(&[tag]);
    }

    fn write_len(&mut self, len: usize) {
        self.inner.update(&(len as u64).to_le_bytes());
    }

    fn write_str(&mut self, s: &str) {
        self.write_len(s.len());
        self.inner.update(s.as_bytes());
    }

    fn write_filter(&mut self, filter: &Filter) {
        match filter {
            Filter::Condition(condition) => {
                self.write_tag(b'C');
                self.write_str(&condition.field);
                self.write_str(condition.operator.as_str());
                if matches!(condition.operator, FilterOperator::In | FilterOperator::NotIn) {
                    let len = condition.value.as_array().map(Vec::len).unwrap_or(0);
                    self.write_len(len);
                }
            }
            Filter::And(items) | Filter::Or(items) => {
                self.write_tag(if matches!(filter, Filter::And(_)) { b'&' } else { b'|' });
                self.write_len(items.len());
                for item in items {
                    self.write_filter(item);
                }
            }
        }
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Hit rate between 0.0 and 1.0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Bounded LRU cache of compiled plans.
///
/// Plans are dropped wholesale when the schema version moves.
pub struct PlanCache {
    plans: Mutex<LruCache<QueryFingerprint, Arc<CompiledQuery>>>,
    schema_version: AtomicU64,
    stats: CacheStats,
}

impl PlanCache {
    /// Create a cache holding at most `capacity` plans (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            plans: Mutex::new(LruCache::new(capacity)),
            schema_version: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Look up a plan, marking it most recently used.
    pub fn get(&self, fingerprint: &QueryFingerprint) -> Option<Arc<CompiledQuery>> {
        let found = self.plans.lock().get(fingerprint).cloned();
        match &found {
            Some(_) => {
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                trace!(fingerprint = %fingerprint.to_hex(), "plan cache hit");
            }
            None => {
                self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
                trace!(fingerprint = %fingerprint.to_hex(), "plan cache miss");
            }
        }
        found
    }

    /// Insert a plan, evicting the least recently used one when full.
    ///
    /// When another caller inserted the same shape first, that plan is kept
    /// and returned so every caller shares one instance.
    pub fn insert(&self, fingerprint: QueryFingerprint, plan: Arc<CompiledQuery>) -> Arc<CompiledQuery> {
        let mut plans = self.plans.lock();
        if let Some(existing) = plans.get(&fingerprint) {
            return Arc::clone(existing);
        }
        if let Some((evicted, _)) = plans.push(fingerprint, Arc::clone(&plan)) {
            if evicted != fingerprint {
                self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(evicted = %evicted.to_hex(), "plan cache eviction");
            }
        }
        plan
    }

    /// Clear the cache if `version` differs from the one plans were built for.
    pub fn sync_schema_version(&self, version: u64) {
        let previous = self.schema_version.swap(version, AtomicOrdering::SeqCst);
        if previous != version {
            let mut plans = self.plans.lock();
            if !plans.is_empty() {
                debug!(from = previous, to = version, dropped = plans.len(), "schema changed, clearing plan cache");
                plans.clear();
            }
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn capacity(&self) -> usize {
        self.plans.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.plans.lock().clear();
    }
}

impl fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("stats", &self.stats)
            .finish()
    }
}
