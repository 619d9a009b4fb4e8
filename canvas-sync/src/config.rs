//! Tunables for the sync core.
//!
//! Every value has a default; [`SyncConfig::from_env`] overrides individual
//! values from `CANVAS_SYNC_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::presence::TiePolicy;

/// Operation queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard capacity; the oldest entry is evicted beyond it.
    pub max_size: usize,
    /// Attempts per entry before it is dropped as a terminal failure.
    pub max_retry: u32,
    /// Entries kept when a save has to be truncated after a quota error.
    pub truncate_keep: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_retry: 3,
            truncate_keep: 100,
        }
    }
}

/// Connection monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay before the first reconnect attempt in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the reconnect delay in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts before giving up and entering `failed`.
    pub max_attempts: u32,
    /// How long a disconnect must last before the offline notice fires.
    pub offline_notice_delay_ms: u64,
    /// How recent a persisted disconnect must be to resume as disconnected.
    pub resume_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            offline_notice_delay_ms: 5000,
            resume_window_ms: 60_000,
        }
    }
}

impl MonitorConfig {
    /// Delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// `min(base * 2^(attempt - 1), max)`; attempt 0 is treated as 1.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock lifetime in milliseconds.
    pub ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_ms: 30_000 }
    }
}

/// Presence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Minimum interval between cursor/selection broadcasts.
    pub throttle_ms: u64,
    /// Users silent for longer than this are considered gone.
    pub stale_after_ms: u64,
    /// Who keeps an object when selection timestamps are equal.
    pub tie_policy: TiePolicy,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 33,
            stale_after_ms: 30_000,
            tie_policy: TiePolicy::LocalWins,
        }
    }
}

/// Complete sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operation queue.
    pub queue: QueueConfig,
    /// Connection monitor.
    pub monitor: MonitorConfig,
    /// Locks.
    pub lock: LockConfig,
    /// Presence.
    pub presence: PresenceConfig,
}

impl SyncConfig {
    /// Build a configuration from environment variables or defaults.
    ///
    /// Environment variables:
    /// - `CANVAS_SYNC_QUEUE_MAX_SIZE` (default: 1000)
    /// - `CANVAS_SYNC_QUEUE_MAX_RETRY` (default: 3)
    /// - `CANVAS_SYNC_QUEUE_TRUNCATE_KEEP` (default: 100)
    /// - `CANVAS_SYNC_BACKOFF_BASE_MS` (default: 1000)
    /// - `CANVAS_SYNC_BACKOFF_MAX_MS` (default: 30000)
    /// - `CANVAS_SYNC_RECONNECT_MAX_ATTEMPTS` (default: 10)
    /// - `CANVAS_SYNC_OFFLINE_NOTICE_MS` (default: 5000)
    /// - `CANVAS_SYNC_RESUME_WINDOW_MS` (default: 60000)
    /// - `CANVAS_SYNC_LOCK_TTL_MS` (default: 30000)
    /// - `CANVAS_SYNC_THROTTLE_MS` (default: 33)
    /// - `CANVAS_SYNC_PRESENCE_STALE_MS` (default: 30000)
    /// - `CANVAS_SYNC_TIE_POLICY` (`local` or `remote`, default: local)
    ///
    /// Missing or unparsable values fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue: QueueConfig {
                max_size: env_or("CANVAS_SYNC_QUEUE_MAX_SIZE", defaults.queue.max_size),
                max_retry: env_or("CANVAS_SYNC_QUEUE_MAX_RETRY", defaults.queue.max_retry),
                truncate_keep: env_or(
                    "CANVAS_SYNC_QUEUE_TRUNCATE_KEEP",
                    defaults.queue.truncate_keep,
                ),
            },
            monitor: MonitorConfig {
                base_delay_ms: env_or(
                    "CANVAS_SYNC_BACKOFF_BASE_MS",
                    defaults.monitor.base_delay_ms,
                ),
                max_delay_ms: env_or("CANVAS_SYNC_BACKOFF_MAX_MS", defaults.monitor.max_delay_ms),
                max_attempts: env_or(
                    "CANVAS_SYNC_RECONNECT_MAX_ATTEMPTS",
                    defaults.monitor.max_attempts,
                ),
                offline_notice_delay_ms: env_or(
                    "CANVAS_SYNC_OFFLINE_NOTICE_MS",
                    defaults.monitor.offline_notice_delay_ms,
                ),
                resume_window_ms: env_or(
                    "CANVAS_SYNC_RESUME_WINDOW_MS",
                    defaults.monitor.resume_window_ms,
                ),
            },
            lock: LockConfig {
                ttl_ms: env_or("CANVAS_SYNC_LOCK_TTL_MS", defaults.lock.ttl_ms),
            },
            presence: PresenceConfig {
                throttle_ms: env_or("CANVAS_SYNC_THROTTLE_MS", defaults.presence.throttle_ms),
                stale_after_ms: env_or(
                    "CANVAS_SYNC_PRESENCE_STALE_MS",
                    defaults.presence.stale_after_ms,
                ),
                tie_policy: match std::env::var("CANVAS_SYNC_TIE_POLICY").as_deref() {
                    Ok("remote") => TiePolicy::RemoteWins,
                    Ok("local") => TiePolicy::LocalWins,
                    _ => defaults.presence.tie_policy,
                },
            },
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_schedule() {
        let config = MonitorConfig::default();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| config.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn test_backoff_attempt_zero_and_huge() {
        let config = MonitorConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"queue": {"max_size": 5}}"#).expect("parse");
        assert_eq!(config.queue.max_size, 5);
        assert_eq!(config.queue.max_retry, 3);
        assert_eq!(config.monitor, MonitorConfig::default());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("CANVAS_SYNC_TEST_UNSET_VARIABLE", 7_u32), 7);
    }

    proptest! {
        #[test]
        fn prop_backoff_matches_formula(
            base in 1_u64..5_000,
            max in 1_u64..120_000,
            attempt in 1_u32..40,
        ) {
            let config = MonitorConfig {
                base_delay_ms: base,
                max_delay_ms: max,
                ..MonitorConfig::default()
            };
            let expected = (base as u128 * (1_u128 << (attempt - 1))).min(max as u128) as u64;
            prop_assert_eq!(config.delay_for_attempt(attempt), Duration::from_millis(expected));
        }

        #[test]
        fn prop_backoff_is_monotonic(attempt in 1_u32..100) {
            let config = MonitorConfig::default();
            prop_assert!(
                config.delay_for_attempt(attempt) <= config.delay_for_attempt(attempt + 1)
            );
        }
    }
}
