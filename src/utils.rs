use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{EngineError, Result};

/// Time source for the engine. Algorithms take the current time as an
/// argument so tests can drive them with a manual clock.
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now_ms(&self) -> u64;
}

/// Wall-clock time source used in production
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Parse a policy duration string: digits followed by `s`, `m` or `h`.
/// Zero durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let malformed = || {
        EngineError::Config(format!(
            "duration '{}' must match <digits>[smh], e.g. '10s', '1m', '1h'",
            input
        ))
    };

    let unit = input.chars().last().ok_or_else(malformed)?;
    let multiplier_ms: u64 = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        _ => return Err(malformed()),
    };

    let digits = &input[..input.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let value: u64 = digits.parse().map_err(|_| malformed())?;

    if value == 0 {
        return Err(EngineError::Config(format!(
            "duration '{}' must be positive",
            input
        )));
    }

    Ok(Duration::from_millis(value * multiplier_ms))
}

/// Counter key for the fixed-window algorithm: the window index is folded
/// into the key so a fresh counter appears at every window boundary.
pub fn window_key(client_key: &str, policy_id: u64, now_ms: u64, window_ms: u64) -> String {
    format!("{}:{}:{}", client_key, policy_id, now_ms / window_ms)
}

/// Bucket state key for the token-bucket algorithm, scoped so different
/// policies never share state for the same client.
pub fn bucket_key(client_key: &str, policy_id: u64) -> String {
    format!("{}:{}", client_key, policy_id)
}
