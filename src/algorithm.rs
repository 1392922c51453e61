use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::policy::Policy;
use crate::store::{BucketState, CounterStore};
use crate::utils::{bucket_key, window_key};

/// Closed set of quota algorithms, selected at gate construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FixedWindow,
    TokenBucket,
}

impl AlgorithmKind {
    pub fn build(self, store: Arc<dyn CounterStore>) -> Arc<dyn QuotaAlgorithm> {
        match self {
            AlgorithmKind::FixedWindow => Arc::new(FixedWindow::new(store)),
            AlgorithmKind::TokenBucket => Arc::new(TokenBucket::new(store)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmKind::FixedWindow => "fixed_window",
            AlgorithmKind::TokenBucket => "token_bucket",
        }
    }
}

/// Raw algorithm verdict, before the gate attaches policy metadata
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
}

/// Common contract for quota algorithms: one decision per call, state kept
/// in the counter store under keys scoped by client and policy.
#[async_trait]
pub trait QuotaAlgorithm: Send + Sync {
    async fn decide(&self, client_key: &str, policy: &Policy, now_ms: u64)
        -> Result<AlgorithmOutcome>;
}

/// Fixed-window counter: one atomic increment per decision against a key
/// that embeds the current window index. Expiry is delegated to the store
/// TTL, so window resets need no explicit cleanup. A client straddling a
/// boundary can legally see up to 2*limit - 1 requests across two windows.
pub struct FixedWindow {
    store: Arc<dyn CounterStore>,
}

impl FixedWindow {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QuotaAlgorithm for FixedWindow {
    async fn decide(
        &self,
        client_key: &str,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<AlgorithmOutcome> {
        let window_ms = policy.window_ms();
        let key = window_key(client_key, policy.id, now_ms, window_ms);

        let count = self
            .store
            .increment_with_expiry(&key, Duration::from_millis(window_ms))
            .await?;

        // Inclusive boundary: the limit-th request is still allowed
        let allowed = count <= policy.limit as u64;
        let remaining = (policy.limit as u64).saturating_sub(count);
        let retry_after_ms = if allowed {
            0
        } else {
            window_ms - now_ms % window_ms
        };

        Ok(AlgorithmOutcome {
            allowed,
            remaining,
            retry_after_ms,
        })
    }
}

/// Token bucket: continuous refill at limit/window tokens per millisecond,
/// burst capacity of burst_limit tokens. Buckets are created full so a
/// freshly seen client is not penalized. The per-key read-modify-write is
/// serialized through a lock registry; cross-process slack on a shared
/// remote backend is accepted.
pub struct TokenBucket {
    store: Arc<dyn CounterStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Keep bucket state around at least until an idle bucket would have
    /// refilled completely; after that it reads as full anyway.
    fn bucket_ttl(policy: &Policy) -> Duration {
        let window_ms = policy.window_ms();
        let refill_full_ms =
            (policy.burst_limit as u64).saturating_mul(window_ms) / policy.limit.max(1) as u64;
        Duration::from_millis(window_ms.max(refill_full_ms))
    }
}

#[async_trait]
impl QuotaAlgorithm for TokenBucket {
    async fn decide(
        &self,
        client_key: &str,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<AlgorithmOutcome> {
        let key = bucket_key(client_key, policy.id);

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.refill_and_consume(&key, policy, now_ms).await
        };

        // Bucket state expires through the store TTL; drop the lock entry
        // too once no other task holds it, so the registry stays bounded.
        drop(lock);
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }
}

impl TokenBucket {
    async fn refill_and_consume(
        &self,
        key: &str,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<AlgorithmOutcome> {
        let window_ms = policy.window_ms();
        let capacity = policy.burst_limit as f64;
        let refill_rate = policy.limit as f64 / window_ms as f64;

        let mut state = self
            .store
            .get_bucket(key)
            .await?
            .unwrap_or_else(|| BucketState::full(capacity, refill_rate, now_ms));

        // Policy edits apply to live buckets in place. Shrinking capacity
        // clamps tokens down; consumed history is never forgiven.
        if state.capacity != capacity || state.refill_rate != refill_rate {
            state.capacity = capacity;
            state.refill_rate = refill_rate;
            state.tokens = state.tokens.min(capacity);
        }

        // A clock reading behind the stored timestamp refills nothing
        let elapsed = now_ms.saturating_sub(state.last_refill_ms);
        state.tokens = (state.tokens + elapsed as f64 * state.refill_rate).min(state.capacity);
        state.last_refill_ms = now_ms;

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        }

        let remaining = state.tokens.floor() as u64;
        let retry_after_ms = if allowed {
            0
        } else {
            ((1.0 - state.tokens) / state.refill_rate).ceil() as u64
        };

        self.store
            .set_bucket(key, state, Self::bucket_ttl(policy))
            .await?;

        Ok(AlgorithmOutcome {
            allowed,
            remaining,
            retry_after_ms,
        })
    }
}
