//! Evaluation result caching
//!
//! Results are keyed by a fingerprint of the formula text plus a fingerprint
//! of the scalar context values the formula was evaluated with. Entries expire
//! after a TTL; at capacity, expired entries are purged first and then the
//! oldest tenth of the cache is dropped. Dependency sets live in a
//! least-recently-used map holding at most `max_entries` formulas.

use crate::ast::Value;
use crate::cache::{CacheMetrics, CacheMetricsSnapshot};
use crate::config::CacheConfig;
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cached result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub timestamp: Duration,
    pub hit_count: u64,
    pub formula_fingerprint: String,
}

/// Stable fingerprint of a formula text
pub fn formula_fingerprint(formula: &str) -> String {
    short_digest(Sha256::digest(formula.as_bytes()))
}

/// Stable fingerprint of context values. Pairs are sorted by key; only
/// strings, numbers and booleans take part.
pub fn context_fingerprint<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let sorted: BTreeMap<&String, &Value> = values.into_iter().collect();
    let mut hasher = Sha256::new();
    for (key, value) in sorted {
        let encoded = match value {
            Value::String(s) => format!("s:{}", s),
            Value::Int(i) => format!("i:{}", i),
            Value::Float(f) => format!("f:{}", f),
            Value::Bool(b) => format!("b:{}", b),
            Value::Null => continue,
        };
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(encoded.as_bytes());
        hasher.update(b";");
    }
    short_digest(hasher.finalize())
}

/// Stable fingerprint of any serializable value, used to tell apart
/// dependency sets of one formula under different bindings
pub fn variant_fingerprint<T: Serialize>(value: &T) -> String {
    let encoded = serde_json::to_string(value).unwrap_or_default();
    short_digest(Sha256::digest(encoded.as_bytes()))
}

/// First 16 hex digits of a SHA-256 digest
fn short_digest(digest: impl std::fmt::LowerHex) -> String {
    let mut hex = format!("{:x}", digest);
    hex.truncate(16);
    hex
}

fn entry_key(formula_fp: &str, context_fp: &str) -> String {
    format!("{}:{}", formula_fp, context_fp)
}

/// TTL + bounded result cache with a companion dependency cache
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    dependencies: Mutex<LruCache<String, HashMap<String, BTreeSet<String>>>>,
    ttl: Duration,
    max_entries: usize,
    enabled: bool,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::default()))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dependencies: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            enabled: config.enabled,
            clock,
            metrics: CacheMetrics::default(),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dependencies(&self) -> MutexGuard<'_, LruCache<String, HashMap<String, BTreeSet<String>>>> {
        self.dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry, now: Duration) -> bool {
        now.saturating_sub(entry.timestamp) > self.ttl
    }

    /// Cached value, or `None` on a miss. Expired entries are removed here.
    pub fn get(&self, formula: &str, context_fp: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        let key = entry_key(&formula_fingerprint(formula), context_fp);
        let now = self.clock.now();
        let mut entries = self.lock_entries();

        match entries.get_mut(&key) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry.hit_count += 1;
                self.metrics.record_hit();
                return Some(entry.value.clone());
            }
            Some(_) => {
                entries.remove(&key);
                debug!(formula, "cached result expired");
            }
            None => {}
        }

        self.metrics.record_miss();
        None
    }

    /// Store a result, evicting first when the cache is full
    pub fn put(&self, formula: &str, context_fp: &str, value: Value) {
        if !self.enabled {
            return;
        }

        let formula_fp = formula_fingerprint(formula);
        let key = entry_key(&formula_fp, context_fp);
        let now = self.clock.now();
        let mut entries = self.lock_entries();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            self.evict(&mut entries, now);
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                timestamp: now,
                hit_count: 0,
                formula_fingerprint: formula_fp,
            },
        );
    }

    fn evict(&self, entries: &mut HashMap<String, CacheEntry>, now: Duration) {
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let mut evicted = before - entries.len();

        if entries.len() >= self.max_entries {
            let count = (entries.len() / 10).max(1);
            let mut by_age: Vec<(Duration, String)> = entries
                .iter()
                .map(|(key, entry)| (entry.timestamp, key.clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(count) {
                entries.remove(&key);
            }
            evicted += count;
            warn!(evicted = count, "result cache full; dropped oldest entries");
        }

        self.metrics.record_evictions(evicted as u64);
    }

    /// Remove every result and the dependency entry derived from `formula`.
    /// Returns the number of removed results.
    pub fn invalidate(&self, formula: &str) -> usize {
        let formula_fp = formula_fingerprint(formula);

        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.formula_fingerprint != formula_fp);
        let removed = before - entries.len();
        drop(entries);

        self.lock_dependencies().pop(&formula_fp);
        debug!(formula, removed, "invalidated cached results");
        removed
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
        self.lock_dependencies().clear();
    }

    /// Cached dependency set of a formula under one binding variant
    pub fn get_dependencies(&self, formula: &str, variant: &str) -> Option<BTreeSet<String>> {
        self.lock_dependencies()
            .get(&formula_fingerprint(formula))
            .and_then(|variants| variants.get(variant))
            .cloned()
    }

    pub fn put_dependencies(&self, formula: &str, variant: &str, dependencies: BTreeSet<String>) {
        let mut cached = self.lock_dependencies();
        let formula_fp = formula_fingerprint(formula);
        if let Some(variants) = cached.get_mut(&formula_fp) {
            variants.insert(variant.to_string(), dependencies);
            return;
        }
        let variants = HashMap::from([(variant.to_string(), dependencies)]);
        if let Some((_, dropped)) = cached.push(formula_fp, variants) {
            debug!(
                variants = dropped.len(),
                "dependency cache full; dropped least recent formula"
            );
        }
    }

    /// Number of formulas with cached dependency sets
    pub fn dependency_formulas(&self) -> usize {
        self.lock_dependencies().len()
    }

    /// Copy of the entry for `formula` under `context_fp`, expired or not
    pub fn entry(&self, formula: &str, context_fp: &str) -> Option<CacheEntry> {
        let key = entry_key(&formula_fingerprint(formula), context_fp);
        self.lock_entries().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache(ttl_secs: u64, max_entries: usize) -> (ResultCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            enabled: true,
            ttl_seconds: ttl_secs,
            max_entries,
        };
        (ResultCache::with_clock(&config, clock.clone()), clock)
    }

    #[test]
    fn test_hit_and_miss() {
        let (cache, _) = cache(60, 10);
        assert_eq!(cache.get("a + b", "ctx"), None);

        cache.put("a + b", "ctx", Value::Int(7));
        assert_eq!(cache.get("a + b", "ctx"), Some(Value::Int(7)));
        assert_eq!(cache.get("a + b", "other"), None);
        assert_eq!(cache.entry("a + b", "ctx").unwrap().hit_count, 1);

        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
    }

    #[test]
    fn test_ttl_expiry_removes_entry() {
        let (cache, clock) = cache(1, 10);
        cache.put("x", "ctx", Value::Int(1));
        assert_eq!(cache.len(), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("x", "ctx"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.metrics_snapshot().misses, 1);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let (cache, clock) = cache(3600, 10);
        for i in 0..10 {
            cache.put(&format!("f{}", i), "ctx", Value::Int(i));
            clock.advance(Duration::from_millis(10));
        }
        cache.put("f10", "ctx", Value::Int(10));

        assert!(cache.len() <= 10);
        assert_eq!(cache.get("f0", "ctx"), None);
        assert_eq!(cache.get("f1", "ctx"), Some(Value::Int(1)));
        assert_eq!(cache.get("f10", "ctx"), Some(Value::Int(10)));
        assert_eq!(cache.metrics_snapshot().evictions, 1);
    }

    #[test]
    fn test_expired_purged_before_oldest() {
        let (cache, clock) = cache(5, 3);
        cache.put("old", "ctx", Value::Int(0));
        clock.advance(Duration::from_secs(10));
        cache.put("b", "ctx", Value::Int(1));
        cache.put("c", "ctx", Value::Int(2));
        cache.put("d", "ctx", Value::Int(3));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("b", "ctx"), Some(Value::Int(1)));
    }

    #[test]
    fn test_invalidate_formula() {
        let (cache, _) = cache(60, 10);
        cache.put("a + b", "ctx1", Value::Int(1));
        cache.put("a + b", "ctx2", Value::Int(2));
        cache.put("c", "ctx1", Value::Int(3));
        cache.put_dependencies("a + b", "v1", BTreeSet::from(["a".to_string()]));
        cache.put_dependencies("a + b", "v2", BTreeSet::from(["b".to_string()]));
        cache.put_dependencies("c", "v1", BTreeSet::new());
        assert_eq!(
            cache.get_dependencies("a + b", "v2"),
            Some(BTreeSet::from(["b".to_string()]))
        );

        assert_eq!(cache.invalidate("a + b"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_dependencies("a + b", "v1"), None);
        assert_eq!(cache.get_dependencies("a + b", "v2"), None);
        assert_eq!(cache.get_dependencies("c", "v1"), Some(BTreeSet::new()));
        assert_eq!(cache.get("c", "ctx1"), Some(Value::Int(3)));
    }

    #[test]
    fn test_dependency_cache_is_bounded() {
        let (cache, _) = cache(60, 2);
        cache.put_dependencies("a", "v1", BTreeSet::from(["a".to_string()]));
        cache.put_dependencies("b", "v1", BTreeSet::from(["b".to_string()]));
        // touching `a` leaves `b` as the least recent formula
        assert!(cache.get_dependencies("a", "v1").is_some());
        cache.put_dependencies("a", "v2", BTreeSet::new());
        cache.put_dependencies("c", "v1", BTreeSet::from(["c".to_string()]));

        assert_eq!(cache.dependency_formulas(), 2);
        assert_eq!(cache.get_dependencies("b", "v1"), None);
        assert_eq!(cache.get_dependencies("a", "v2"), Some(BTreeSet::new()));
        assert_eq!(
            cache.get_dependencies("c", "v1"),
            Some(BTreeSet::from(["c".to_string()]))
        );
    }

    #[test]
    fn test_disabled_cache() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = ResultCache::new(&config);
        cache.put("x", "ctx", Value::Int(1));
        assert_eq!(cache.get("x", "ctx"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_context_fingerprint_is_order_independent_and_skips_null() {
        let a = HashMap::from([
            ("x".to_string(), Value::Int(1)),
            ("y".to_string(), Value::from("on")),
        ]);
        let mut b: Vec<(String, Value)> = vec![
            ("y".to_string(), Value::from("on")),
            ("x".to_string(), Value::Int(1)),
            ("z".to_string(), Value::Null),
        ];
        let fp_a = context_fingerprint(a.iter());
        let fp_b = context_fingerprint(b.iter().map(|(k, v)| (k, v)));
        assert_eq!(fp_a, fp_b);

        b[0].1 = Value::from("off");
        assert_ne!(fp_a, context_fingerprint(b.iter().map(|(k, v)| (k, v))));

        // Int and Float with the same numeric value are different contexts
        let int_ctx = HashMap::from([("x".to_string(), Value::Int(1))]);
        let float_ctx = HashMap::from([("x".to_string(), Value::Float(1.0))]);
        assert_ne!(context_fingerprint(&int_ctx), context_fingerprint(&float_ctx));
    }

    #[test]
    fn test_formula_fingerprint_is_stable() {
        assert_eq!(formula_fingerprint("a + b"), formula_fingerprint("a + b"));
        assert_ne!(formula_fingerprint("a + b"), formula_fingerprint("a+b"));
        assert_eq!(formula_fingerprint("x").len(), 16);
        assert!(formula_fingerprint("x").chars().all(|c| c.is_ascii_hexdigit()));
    }
}
