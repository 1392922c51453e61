use serde::{Deserialize, Serialize};

use crate::algorithm::AlgorithmKind;
use crate::error::Result;
use crate::gate::FailurePolicy;
use crate::policy::PolicySpec;

/// Engine configuration loaded at startup. Policies listed here are
/// seeded into the policy store before the server accepts traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmKind,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

fn default_algorithm() -> AlgorithmKind {
    AlgorithmKind::FixedWindow
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::FailOpen
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            failure_policy: default_failure_policy(),
            policies: Vec::new(),
        }
    }
}

/// Load engine configuration from a YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<EngineConfig> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load engine configuration from a YAML file
pub fn load_config_from_file(path: &str) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_yaml() {
        let yaml = r#"
algorithm: token_bucket
failure_policy: fail_closed
policies:
  - name: default
    limit: 100
    window: 1m
    burst_limit: 150
    burst_window: 10s
  - name: premium
    limit: 1000
    window: 1m
"#;

        let config = load_config_from_yaml(yaml).unwrap();
        assert_eq!(config.algorithm, AlgorithmKind::TokenBucket);
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies[0].burst_limit, Some(150));
        assert_eq!(config.policies[1].burst_limit, None);
    }

    #[test]
    fn test_defaults_apply() {
        let config = load_config_from_yaml("policies: []").unwrap();
        assert_eq!(config.algorithm, AlgorithmKind::FixedWindow);
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        assert!(load_config_from_yaml("algorithm: sliding_log").is_err());
    }
}
