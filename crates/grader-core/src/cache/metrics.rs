//! Atomic counters for one cache layer.
//!
//! Counters are incremented silently at the call site. Call
//! [`CacheMetrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a batch).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lightweight atomic counters, no allocations, no locking.
///
/// One instance per `CacheLayer`; clones of the layer share it.
#[derive(Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheMetricsSnapshot {
    /// Fraction of lookups served from cache; `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn inc_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sets(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_errors", "counter incremented");
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event tagged with `site`.
    pub fn flush(&self, site: &str) {
        let s = self.snapshot();
        tracing::info!(
            metric = "cache.flush",
            site = %site,
            hits = s.hits,
            misses = s.misses,
            sets = s.sets,
            errors = s.errors,
            hit_rate = s.hit_rate(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = CacheMetrics::new();
        m.inc_hits();
        m.inc_misses();
        m.inc_misses();
        m.inc_sets();
        m.inc_errors();
        assert_eq!(
            m.snapshot(),
            CacheMetricsSnapshot {
                hits: 1,
                misses: 2,
                sets: 1,
                errors: 1
            }
        );
    }

    #[test]
    fn hit_rate_handles_no_lookups() {
        assert_eq!(CacheMetricsSnapshot::default().hit_rate(), 0.0);
        let s = CacheMetricsSnapshot {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(s.hit_rate(), 0.75);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = CacheMetrics::new();
        m.inc_hits();
        m.inc_errors();
        m.reset();
        assert_eq!(m.snapshot(), CacheMetricsSnapshot::default());
    }
}
