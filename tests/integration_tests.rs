use std::sync::Arc;

use quotagate::{
    algorithm::AlgorithmKind,
    config::load_config_from_yaml,
    gate::{EnforcementGate, FailurePolicy},
    metrics::Metrics,
    policy::{PolicySpec, PolicyStore, PolicyUpdate},
    store::MemoryCounterStore,
    utils::ManualClock,
    EngineError,
};

fn spec(name: &str, limit: u32, window: &str, burst_limit: u32, burst_window: &str) -> PolicySpec {
    PolicySpec {
        name: name.to_string(),
        limit,
        window: window.to_string(),
        burst_limit: Some(burst_limit),
        burst_window: Some(burst_window.to_string()),
    }
}

struct Harness {
    gate: EnforcementGate,
    policies: Arc<PolicyStore>,
    clock: Arc<ManualClock>,
}

async fn harness(kind: AlgorithmKind, policy: PolicySpec) -> Harness {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let policies = Arc::new(PolicyStore::new());
    policies.create(policy).await.unwrap();

    let gate = EnforcementGate::new(
        policies.clone(),
        kind,
        store,
        clock.clone(),
        FailurePolicy::FailOpen,
        Arc::new(Metrics::new().unwrap()),
    );

    Harness {
        gate,
        policies,
        clock,
    }
}

#[tokio::test]
async fn fixed_window_allows_limit_then_denies() {
    let h = harness(
        AlgorithmKind::FixedWindow,
        spec("default", 5, "1m", 5, "10s"),
    )
    .await;

    for i in 1..=5 {
        let decision = h.gate.decide("10.0.0.1", 1).await.unwrap();
        assert!(decision.allowed, "request {} should pass", i);
    }
    let sixth = h.gate.decide("10.0.0.1", 1).await.unwrap();
    assert!(!sixth.allowed);

    // After the window elapses the client is admitted again
    h.clock.advance(60_000);
    assert!(h.gate.decide("10.0.0.1", 1).await.unwrap().allowed);
}

#[tokio::test]
async fn token_bucket_burst_then_sustained_rate() {
    let h = harness(
        AlgorithmKind::TokenBucket,
        spec("burst", 100, "1m", 150, "10s"),
    )
    .await;

    // Full initial allowance: the burst capacity is spendable immediately
    for i in 1..=150 {
        let decision = h.gate.decide("client", 1).await.unwrap();
        assert!(decision.allowed, "burst request {} should pass", i);
    }
    assert!(!h.gate.decide("client", 1).await.unwrap().allowed);

    // One window later the sustained rate has restored about `limit`
    h.clock.advance(60_000);
    let mut admitted = 0;
    while h.gate.decide("client", 1).await.unwrap().allowed {
        admitted += 1;
    }
    assert!((99..=101).contains(&admitted), "admitted {}", admitted);
}

#[tokio::test]
async fn decision_carries_advisory_quota_metadata() {
    let h = harness(
        AlgorithmKind::TokenBucket,
        spec("meta", 100, "1m", 150, "10s"),
    )
    .await;

    let decision = h.gate.decide("client", 1).await.unwrap();
    assert_eq!(decision.limit, 100);
    assert_eq!(decision.burst_limit, 150);
    assert_eq!(decision.remaining, 149);
    assert_eq!(decision.retry_after_ms, 0);
    assert!(!decision.degraded);
}

#[tokio::test]
async fn policy_update_rollback_round_trip() {
    let h = harness(
        AlgorithmKind::FixedWindow,
        spec("default", 100, "1m", 150, "10s"),
    )
    .await;

    let v1 = h.policies.get(1).await.unwrap();
    let v2 = h
        .policies
        .update(
            1,
            PolicyUpdate {
                limit: Some(200),
                burst_limit: Some(250),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let v3 = h
        .policies
        .update(
            1,
            PolicyUpdate {
                limit: Some(300),
                burst_limit: Some(350),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let rolled = h.policies.rollback(1, None).await.unwrap();

    // Rollback restores the snapshot taken before the most recent update
    assert!(rolled.same_fields(&v2));
    // Version strictly increases at every step, rollback included
    assert!(v1.version < v2.version);
    assert!(v2.version < v3.version);
    assert!(v3.version < rolled.version);
}

#[tokio::test]
async fn updated_limits_apply_to_live_buckets() {
    let h = harness(
        AlgorithmKind::TokenBucket,
        spec("default", 100, "1m", 100, "10s"),
    )
    .await;

    // Spend some of the allowance, then tighten the policy
    for _ in 0..60 {
        assert!(h.gate.decide("client", 1).await.unwrap().allowed);
    }
    h.policies
        .update(
            1,
            PolicyUpdate {
                limit: Some(10),
                burst_limit: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The shrunk capacity clamps the surviving tokens: only 10 remain at
    // most, not the 40 left under the old policy
    let mut admitted = 0;
    while h.gate.decide("client", 1).await.unwrap().allowed {
        admitted += 1;
    }
    assert!(admitted <= 10, "admitted {} after shrink", admitted);
}

#[tokio::test]
async fn invalid_create_leaves_no_record() {
    let h = harness(
        AlgorithmKind::FixedWindow,
        spec("default", 100, "1m", 150, "10s"),
    )
    .await;

    let result = h
        .policies
        .create(spec("broken", 100, "1m", 50, "10s"))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidPolicy(_))));
    assert_eq!(h.policies.list().await.len(), 1);
}

#[tokio::test]
async fn clients_and_policies_are_isolated() {
    let h = harness(AlgorithmKind::FixedWindow, spec("a", 1, "1m", 1, "10s")).await;
    h.policies
        .create(spec("b", 1, "1m", 1, "10s"))
        .await
        .unwrap();

    assert!(h.gate.decide("x", 1).await.unwrap().allowed);
    assert!(!h.gate.decide("x", 1).await.unwrap().allowed);
    // Different client, same policy
    assert!(h.gate.decide("y", 1).await.unwrap().allowed);
    // Same client, different policy
    assert!(h.gate.decide("x", 2).await.unwrap().allowed);
}

#[tokio::test]
async fn concurrent_decisions_admit_exactly_the_limit() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let policies = Arc::new(PolicyStore::new());
    policies
        .create(spec("default", 50, "1m", 50, "10s"))
        .await
        .unwrap();
    let gate = Arc::new(EnforcementGate::new(
        policies,
        AlgorithmKind::FixedWindow,
        store,
        clock,
        FailurePolicy::FailOpen,
        Arc::new(Metrics::new().unwrap()),
    ));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            let mut admitted = 0u32;
            for _ in 0..10 {
                if gate.decide("shared", 1).await.unwrap().allowed {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 50);
}

#[tokio::test]
async fn engine_boots_from_yaml_config() {
    let config = load_config_from_yaml(
        r#"
algorithm: token_bucket
failure_policy: fail_open
policies:
  - name: default
    limit: 100
    window: 1m
    burst_limit: 150
    burst_window: 10s
"#,
    )
    .unwrap();

    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let policies = Arc::new(PolicyStore::new());
    for policy_spec in config.policies {
        policies.create(policy_spec).await.unwrap();
    }
    let gate = EnforcementGate::new(
        policies,
        config.algorithm,
        store,
        clock,
        config.failure_policy,
        Arc::new(Metrics::new().unwrap()),
    );

    let decision = gate.decide("client", 1).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.burst_limit, 150);
}
