use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::utils::parse_duration;

/// A named quota configuration. `limit` is the average number of requests
/// allowed per `window`; `burst_limit` caps short spikes and is always at
/// least `limit`. `version` increases on every mutation, rollback included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: u64,
    pub name: String,
    pub limit: u32,
    pub window: String,
    pub burst_limit: u32,
    pub burst_window: String,
    pub version: u32,
}

impl Policy {
    pub fn window_ms(&self) -> u64 {
        // Validated at create/update time
        parse_duration(&self.window)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(60_000)
    }

    /// True when this policy and `other` carry the same quota fields,
    /// ignoring version
    pub fn same_fields(&self, other: &Policy) -> bool {
        self.name == other.name
            && self.limit == other.limit
            && self.window == other.window
            && self.burst_limit == other.burst_limit
            && self.burst_window == other.burst_window
    }
}

/// Payload for policy creation. Burst fields fall back to the base
/// limit/window when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub limit: u32,
    pub window: String,
    pub burst_limit: Option<u32>,
    pub burst_window: Option<String>,
}

/// Partial update payload; only provided fields change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub name: Option<String>,
    pub limit: Option<u32>,
    pub window: Option<String>,
    pub burst_limit: Option<u32>,
    pub burst_window: Option<String>,
}

/// Immutable snapshot of a policy at the moment it was superseded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy: Policy,
    pub saved_at: DateTime<Utc>,
}

struct PolicyTable {
    policies: HashMap<u64, Policy>,
    history: HashMap<u64, Vec<PolicySnapshot>>,
    next_id: u64,
}

/// Versioned policy registry with an append-only history. All mutations go
/// through the write lock, which is the per-policy exclusivity guarantee:
/// two concurrent updates can never both read the same pre-update record.
pub struct PolicyStore {
    table: RwLock<PolicyTable>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(PolicyTable {
                policies: HashMap::new(),
                history: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Validate and create a new policy at version 1
    pub async fn create(&self, spec: PolicySpec) -> Result<Policy> {
        let burst_limit = spec.burst_limit.unwrap_or(spec.limit);
        let burst_window = spec.burst_window.unwrap_or_else(|| spec.window.clone());

        validate_fields(&spec.name, spec.limit, &spec.window, burst_limit, &burst_window)?;

        let mut table = self.table.write().await;
        let id = table.next_id;
        table.next_id += 1;

        let policy = Policy {
            id,
            name: spec.name,
            limit: spec.limit,
            window: spec.window,
            burst_limit,
            burst_window,
            version: 1,
        };
        table.policies.insert(id, policy.clone());

        info!(policy_id = id, name = %policy.name, "Policy created");
        Ok(policy)
    }

    pub async fn get(&self, id: u64) -> Result<Policy> {
        self.table
            .read()
            .await
            .policies
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("policy {}", id)))
    }

    /// All current policies, ordered by id
    pub async fn list(&self) -> Vec<Policy> {
        let table = self.table.read().await;
        let mut policies: Vec<Policy> = table.policies.values().cloned().collect();
        policies.sort_by_key(|p| p.id);
        policies
    }

    /// Archived snapshots for a policy, oldest first
    pub async fn history(&self, id: u64) -> Result<Vec<PolicySnapshot>> {
        let table = self.table.read().await;
        if !table.policies.contains_key(&id) {
            return Err(EngineError::NotFound(format!("policy {}", id)));
        }
        Ok(table.history.get(&id).cloned().unwrap_or_default())
    }

    /// Apply a partial update: the merged result is validated before the
    /// pre-update policy is archived and replaced.
    pub async fn update(&self, id: u64, update: PolicyUpdate) -> Result<Policy> {
        let mut table = self.table.write().await;
        let current = table
            .policies
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("policy {}", id)))?;

        let mut merged = current.clone();
        if let Some(name) = update.name {
            merged.name = name;
        }
        if let Some(limit) = update.limit {
            merged.limit = limit;
        }
        if let Some(window) = update.window {
            merged.window = window;
        }
        if let Some(burst_limit) = update.burst_limit {
            merged.burst_limit = burst_limit;
        }
        if let Some(burst_window) = update.burst_window {
            merged.burst_window = burst_window;
        }

        validate_fields(
            &merged.name,
            merged.limit,
            &merged.window,
            merged.burst_limit,
            &merged.burst_window,
        )?;

        merged.version = current.version + 1;
        table.history.entry(id).or_default().push(PolicySnapshot {
            policy: current,
            saved_at: Utc::now(),
        });
        table.policies.insert(id, merged.clone());

        info!(policy_id = id, version = merged.version, "Policy updated");
        Ok(merged)
    }

    /// Restore an archived snapshot as the live policy. With no version
    /// given, the most recent snapshot is used. The restored record gets a
    /// fresh version number and the replaced policy is archived in turn,
    /// so versions stay strictly monotonic and history is never rewritten.
    pub async fn rollback(&self, id: u64, version: Option<u32>) -> Result<Policy> {
        let mut table = self.table.write().await;
        let current = table
            .policies
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("policy {}", id)))?;

        let snapshots = table
            .history
            .get(&id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::NotFound(format!("no history for policy {}", id)))?;

        let snapshot = match version {
            Some(v) => snapshots
                .iter()
                .rev()
                .find(|s| s.policy.version == v)
                .ok_or_else(|| {
                    EngineError::NotFound(format!("policy {} has no version {}", id, v))
                })?,
            None => snapshots.last().expect("checked non-empty"),
        };

        let mut restored = snapshot.policy.clone();
        restored.version = current.version + 1;

        table.history.entry(id).or_default().push(PolicySnapshot {
            policy: current,
            saved_at: Utc::now(),
        });
        table.policies.insert(id, restored.clone());

        info!(
            policy_id = id,
            version = restored.version,
            "Policy rolled back"
        );
        Ok(restored)
    }
}

/// Validate-then-commit: all violations are collected so the caller can
/// correct the request in one pass, and nothing is written on failure.
fn validate_fields(
    name: &str,
    limit: u32,
    window: &str,
    burst_limit: u32,
    burst_window: &str,
) -> Result<()> {
    let mut violations = Vec::new();

    if name.trim().is_empty() {
        violations.push("name must be a non-empty string".to_string());
    }
    if limit == 0 {
        violations.push("limit must be a positive integer".to_string());
    }
    if let Err(e) = parse_duration(window) {
        violations.push(format!("window: {}", e));
    }
    if burst_limit < limit {
        violations.push(format!(
            "burst_limit ({}) must be >= limit ({})",
            burst_limit, limit
        ));
    }
    if let Err(e) = parse_duration(burst_window) {
        violations.push(format!("burst_window: {}", e));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidPolicy(violations))
    }
}
