use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::utils::Clock;

/// Per-key token bucket state. Owned by the counter store and mutated only
/// through the refill+consume protocol in the token-bucket algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub capacity: f64,
    /// Tokens added per millisecond (limit / window_ms)
    pub refill_rate: f64,
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A freshly seen key starts with a full bucket
    pub fn full(capacity: f64, refill_rate: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill_ms: now_ms,
        }
    }
}

/// Key-scoped atomic counter backend. Implementations must make the
/// increment and the decision to attach a TTL a single atomic unit, and
/// must surface backend failures as `StoreUnavailable` rather than
/// reporting a zero count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment an integer counter, initializing it to 1 and
    /// attaching `ttl` on first creation. Increments within the TTL must
    /// not reset it.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64>;

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>>;

    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

struct CounterEntry {
    count: u64,
    expires_at_ms: u64,
}

struct BucketEntry {
    state: BucketState,
    expires_at_ms: u64,
}

/// Process-local counter store backed by concurrent maps. The DashMap
/// entry API gives a per-key critical section, so increment and TTL
/// attachment happen as one atomic unit.
pub struct MemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
    buckets: DashMap<String, BucketEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Drop entries whose TTL has elapsed. Called from the housekeeping
    /// task; expired entries already read as absent, this just frees
    /// memory.
    pub fn prune_expired(&self) {
        let now = self.clock.now_ms();
        self.counters.retain(|_, entry| entry.expires_at_ms > now);
        self.buckets.retain(|_, entry| entry.expires_at_ms > now);
    }

    /// Number of live counter and bucket entries
    pub fn len(&self) -> usize {
        self.counters.len() + self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now_ms();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                expires_at_ms: now + ttl.as_millis() as u64,
            });

        // A dead entry behaves as absent: restart the count and re-arm
        // the TTL for the new epoch.
        if entry.expires_at_ms <= now {
            entry.count = 0;
            entry.expires_at_ms = now + ttl.as_millis() as u64;
        }

        entry.count += 1;
        Ok(entry.count)
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        let now = self.clock.now_ms();
        Ok(self
            .buckets
            .get(key)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.state.clone()))
    }

    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()> {
        let expires_at_ms = self.clock.now_ms() + ttl.as_millis() as u64;
        self.buckets.insert(
            key.to_string(),
            BucketEntry {
                state,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
