//! Plan memoization
//!
//! Fragment building and assembly are pure, so a plan is fully determined by
//! the serialized analysis input and the dialect. The serialized bytes are the
//! map key itself, so a hit always belongs to an identical input. Plans are
//! shared behind `Arc` and never mutated after insertion.
//!
//! The cache holds at most `capacity` plans; inserting past the cap evicts the
//! least recently used entry.

use super::{build_plan, ExecutionPlan};
use crate::config::AnalysisInput;
use crate::dialect::DialectId;
use crate::{Error, Result};
use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHasher};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default number of plans kept by [`PlanCache::new`]
pub const DEFAULT_PLAN_CAPACITY: usize = 64;

#[derive(Debug)]
struct CachedPlan {
    plan: Arc<ExecutionPlan>,
    last_used: AtomicU64,
}

/// Bounded concurrent cache of assembled plans keyed by serialized input
#[derive(Debug)]
pub struct PlanCache {
    plans: DashMap<Vec<u8>, CachedPlan, FxBuildHasher>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCache {
    /// Create an empty cache holding up to [`DEFAULT_PLAN_CAPACITY`] plans
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PLAN_CAPACITY)
    }

    /// Create an empty cache holding up to `capacity` plans (at least one)
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            plans: DashMap::with_hasher(FxBuildHasher),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn serialize(input: &AnalysisInput, dialect: DialectId) -> Result<Vec<u8>> {
        serde_json::to_vec(&(input, dialect))
            .map_err(|e| Error::config("analysis input", format!("not serializable: {e}")))
    }

    /// Fingerprint of an input and dialect, for logs and quick comparisons
    ///
    /// Lookups compare the full serialized input, not this digest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the input cannot be serialized
    pub fn key(input: &AnalysisInput, dialect: DialectId) -> Result<u64> {
        let bytes = Self::serialize(input, dialect)?;
        let mut hasher = FxHasher::default();
        hasher.write(&bytes);
        Ok(hasher.finish())
    }

    /// Return the cached plan or build, cache and return it
    ///
    /// # Errors
    ///
    /// Propagates planning errors; failed builds are not cached
    pub fn get_or_build(&self, input: &AnalysisInput, dialect: DialectId) -> Result<Arc<ExecutionPlan>> {
        let bytes = Self::serialize(input, dialect)?;
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.plans.get(&bytes) {
            entry.last_used.store(now, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&entry.plan));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let plan = Arc::new(build_plan(input, dialect)?);

        while self.plans.len() >= self.capacity && !self.plans.contains_key(&bytes) {
            if !self.evict_least_recent() {
                break;
            }
        }
        let entry = self.plans.entry(bytes).or_insert(CachedPlan {
            plan,
            last_used: AtomicU64::new(now),
        });
        Ok(Arc::clone(&entry.plan))
    }

    fn evict_least_recent(&self) -> bool {
        let oldest = self
            .plans
            .iter()
            .min_by_key(|entry| entry.value().last_used.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());
        let Some(key) = oldest else {
            return false;
        };
        if self.plans.remove(&key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(capacity = self.capacity, "evicted least recently used plan");
        }
        true
    }

    /// Number of cached plans
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Maximum number of cached plans
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lookups served from the cache
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to build a plan
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Plans dropped to stay within capacity
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop every cached plan
    pub fn clear(&self) {
        self.plans.clear();
    }
}
