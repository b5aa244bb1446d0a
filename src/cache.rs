//! Parse caching to avoid re-parsing formulas
//!
//! This module provides an LRU cache for parse outcomes, keyed by the exact
//! formula text (no normalization). Failed parses are cached as well, so a
//! malformed formula is only ever parsed once while it stays resident.
//!
//! # Configuration
//!
//! Cache size can be configured via the `SYNEVAL_AST_CACHE_SIZE` environment
//! variable (see [`crate::config::EngineConfig::with_env_overrides`]).

use crate::ast::Expression;
use crate::error::EngineError;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of parsing one formula
pub type ParseOutcome = Result<Expression, EngineError>;

/// Cache metrics for observability
///
/// Tracks cache hits, misses, and evictions to help tune cache size
/// and understand cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of cache evictions
    pub evictions: AtomicU64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Calculate cache hit rate as a percentage (0.0 to 1.0)
    ///
    /// Returns 0.0 if no requests have been made yet.
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate()
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Clone the current metrics values (for reporting)
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache metrics at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetricsSnapshot {
    /// Calculate hit rate as a percentage (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total number of cache requests
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Thread-safe LRU cache for parsed formulas
///
/// The cache uses `Arc<ParseOutcome>` to allow cheap cloning of cached trees.
/// Two threads missing on the same formula both parse it; the second insert
/// simply replaces an identical outcome.
#[derive(Clone)]
pub struct AstCache {
    cache: Arc<Mutex<LruCache<String, Arc<ParseOutcome>>>>,
    metrics: Arc<CacheMetrics>,
    capacity: usize,
}

impl AstCache {
    /// Create a new cache with the specified capacity (clamped to at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let capacity_val = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity_val))),
            metrics: Arc::new(CacheMetrics::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<ParseOutcome>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a cached parse outcome or parse the formula if not cached
    ///
    /// - **Cache Hit**: returns the existing outcome (cheap Arc clone)
    /// - **Cache Miss**: runs `parse_fn` and stores its outcome, success or not
    pub fn get_or_parse<F>(&self, formula: &str, parse_fn: F) -> Arc<ParseOutcome>
    where
        F: FnOnce(&str) -> ParseOutcome,
    {
        {
            let mut cache = self.lock();
            if let Some(cached) = cache.get(formula) {
                self.metrics.record_hit();
                return Arc::clone(cached);
            }
        }

        // Parse outside the lock
        self.metrics.record_miss();
        let outcome = Arc::new(parse_fn(formula));

        {
            let mut cache = self.lock();
            if let Some((evicted, _)) = cache.push(formula.to_string(), Arc::clone(&outcome)) {
                if evicted != formula {
                    self.metrics.record_evictions(1);
                }
            }
        }

        outcome
    }

    /// Get a cached outcome without parsing
    pub fn get(&self, formula: &str) -> Option<Arc<ParseOutcome>> {
        self.lock().get(formula).cloned()
    }

    /// Drop one formula from the cache
    pub fn remove(&self, formula: &str) -> bool {
        self.lock().pop(formula).is_some()
    }

    /// Clear all cached outcomes
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Get cache metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Get a snapshot of current metrics
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get the number of cached formulas
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Get cache capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AstCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_AST_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_parser;
    use std::sync::atomic::AtomicUsize;

    fn parse(formula: &str) -> ParseOutcome {
        token_parser::parse(formula).map_err(|e| EngineError::from_syntax(formula, &e))
    }

    #[test]
    fn test_cache_hit() {
        let cache = AstCache::new(10);

        let first = cache.get_or_parse("a + b", parse);
        let second = cache.get_or_parse("a + b", parse);

        // Should return the same Arc (pointer equality)
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_ok());
    }

    #[test]
    fn test_key_is_exact_text() {
        let cache = AstCache::new(10);
        cache.get_or_parse("a + b", parse);
        cache.get_or_parse("a+b", parse);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_parse_is_cached() {
        let cache = AstCache::new(10);
        let calls = AtomicUsize::new(0);
        let counting = |f: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            parse(f)
        };

        let first = cache.get_or_parse("a +", counting);
        let second = cache.get_or_parse("a +", |f: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            parse(f)
        });

        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = AstCache::new(2);

        cache.get_or_parse("1", parse);
        cache.get_or_parse("2", parse);
        cache.get_or_parse("3", parse);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("1").is_none());
        assert!(cache.get("2").is_some());
        assert!(cache.get("3").is_some());
        assert_eq!(cache.metrics_snapshot().evictions, 1);
    }

    #[test]
    fn test_cache_clear_and_remove() {
        let cache = AstCache::new(10);
        cache.get_or_parse("x", parse);
        cache.get_or_parse("y", parse);

        assert!(cache.remove("x"));
        assert!(!cache.remove("x"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = AstCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_cache_metrics_hits_and_misses() {
        let cache = AstCache::new(10);

        cache.get_or_parse("a * 2", parse);
        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate(), 0.0);

        cache.get_or_parse("a * 2", parse);
        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate(), 0.5);

        cache.get_or_parse("a * 2", parse);
        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.total_requests(), 3);
        assert!((metrics.hit_rate() - 0.6666).abs() < 0.01);

        cache.metrics().reset();
        assert_eq!(cache.metrics_snapshot(), CacheMetricsSnapshot::default());
    }
}
