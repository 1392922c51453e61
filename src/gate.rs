use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::algorithm::{AlgorithmKind, QuotaAlgorithm};
use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::policy::{Policy, PolicyStore};
use crate::store::CounterStore;
use crate::utils::Clock;

/// What the gate does when the counter store is unavailable. An explicit
/// deployment choice, not an implicit catch-and-continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

/// Admission decision plus advisory quota metadata for the caller's
/// response headers. `degraded` is set when the counter store failed and
/// the failure policy decided the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
    pub limit: u32,
    pub burst_limit: u32,
    pub burst_remaining: u64,
    pub degraded: bool,
}

/// Resolves the applicable policy for a request, runs the configured
/// algorithm against per-(client, policy) state, and translates store
/// failures into the configured failure policy. Algorithm-agnostic:
/// constructed over the `QuotaAlgorithm` contract.
pub struct EnforcementGate {
    policies: Arc<PolicyStore>,
    algorithm: Arc<dyn QuotaAlgorithm>,
    algorithm_kind: AlgorithmKind,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    metrics: Arc<Metrics>,
}

impl EnforcementGate {
    pub fn new(
        policies: Arc<PolicyStore>,
        algorithm_kind: AlgorithmKind,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            policies,
            algorithm: algorithm_kind.build(store),
            algorithm_kind,
            clock,
            failure_policy,
            metrics,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Decide whether a unit of work from `client_key` under `policy_id`
    /// may proceed. Unknown policies surface as `NotFound`; store failures
    /// never do — they resolve through the failure policy and are reported
    /// via logs and metrics.
    pub async fn decide(&self, client_key: &str, policy_id: u64) -> Result<Decision> {
        let policy = self.policies.get(policy_id).await?;
        let _timer = self.metrics.start_decision_timer();
        self.metrics.record_decision(self.algorithm_kind.as_str());

        match self
            .algorithm
            .decide(client_key, &policy, self.clock.now_ms())
            .await
        {
            Ok(outcome) => {
                if !outcome.allowed {
                    self.metrics.record_rejection("over_limit");
                }
                Ok(Decision {
                    allowed: outcome.allowed,
                    remaining: outcome.remaining,
                    retry_after_ms: outcome.retry_after_ms,
                    limit: policy.limit,
                    burst_limit: policy.burst_limit,
                    burst_remaining: outcome.remaining,
                    degraded: false,
                })
            }
            Err(EngineError::StoreUnavailable(reason)) => {
                warn!(
                    client_key,
                    policy_id,
                    %reason,
                    failure_policy = ?self.failure_policy,
                    "Counter store unavailable, applying failure policy"
                );
                self.metrics.record_store_error();

                let allowed = self.failure_policy == FailurePolicy::FailOpen;
                if !allowed {
                    self.metrics.record_rejection("fail_closed");
                }
                Ok(self.degraded_decision(&policy, allowed))
            }
            Err(e) => Err(e),
        }
    }

    fn degraded_decision(&self, policy: &Policy, allowed: bool) -> Decision {
        Decision {
            allowed,
            remaining: if allowed { policy.limit as u64 } else { 0 },
            retry_after_ms: if allowed { 0 } else { policy.window_ms() },
            limit: policy.limit,
            burst_limit: policy.burst_limit,
            burst_remaining: if allowed { policy.burst_limit as u64 } else { 0 },
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySpec;
    use crate::store::{BucketState, MemoryCounterStore};
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Counter store stub that always fails
    struct DownStore;

    #[async_trait]
    impl crate::store::CounterStore for DownStore {
        async fn increment_with_expiry(&self, _key: &str, _ttl: Duration) -> crate::error::Result<u64> {
            Err(EngineError::StoreUnavailable("backend down".to_string()))
        }

        async fn get_bucket(&self, _key: &str) -> crate::error::Result<Option<BucketState>> {
            Err(EngineError::StoreUnavailable("backend down".to_string()))
        }

        async fn set_bucket(
            &self,
            _key: &str,
            _state: BucketState,
            _ttl: Duration,
        ) -> crate::error::Result<()> {
            Err(EngineError::StoreUnavailable("backend down".to_string()))
        }

        async fn health_check(&self) -> crate::error::Result<()> {
            Err(EngineError::StoreUnavailable("backend down".to_string()))
        }
    }

    async fn seeded_policies() -> Arc<PolicyStore> {
        let policies = Arc::new(PolicyStore::new());
        policies
            .create(PolicySpec {
                name: "default".to_string(),
                limit: 3,
                window: "1m".to_string(),
                burst_limit: Some(3),
                burst_window: Some("10s".to_string()),
            })
            .await
            .unwrap();
        policies
    }

    fn gate_with(
        policies: Arc<PolicyStore>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
    ) -> EnforcementGate {
        EnforcementGate::new(
            policies,
            AlgorithmKind::FixedWindow,
            store,
            clock,
            failure_policy,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_gate_enforces_policy() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let gate = gate_with(seeded_policies().await, store, clock, FailurePolicy::FailOpen);

        for _ in 0..3 {
            let decision = gate.decide("client", 1).await.unwrap();
            assert!(decision.allowed);
            assert!(!decision.degraded);
            assert_eq!(decision.limit, 3);
        }
        let denied = gate.decide("client", 1).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn test_gate_unknown_policy_surfaces() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let gate = gate_with(seeded_policies().await, store, clock, FailurePolicy::FailOpen);

        let result = gate.decide("client", 404).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_gate_fails_open_on_store_error() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            seeded_policies().await,
            Arc::new(DownStore),
            clock,
            FailurePolicy::FailOpen,
        );

        let decision = gate.decide("client", 1).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_gate_fails_closed_on_store_error() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            seeded_policies().await,
            Arc::new(DownStore),
            clock,
            FailurePolicy::FailClosed,
        );

        let decision = gate.decide("client", 1).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert!(decision.retry_after_ms > 0);
    }
}
