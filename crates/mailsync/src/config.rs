//! Scheduler configuration
//!
//! Every threshold the scheduler uses lives here. Values are loaded from
//! `scheduler.json` in the mailsync config directory when present; any field
//! left out of the file keeps its default. Durations are in milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Config filename in the mailsync config directory
pub const SCHEDULER_CONFIG_FILE: &str = "scheduler.json";

const SECOND_MS: u64 = 1000;
const MINUTE_MS: u64 = 60 * SECOND_MS;

/// Tunable scheduler thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on any loop sleep
    pub heartbeat_ms: u64,
    /// First backoff hold after a transient failure
    pub initial_hold_delay_ms: u64,
    /// Ceiling for the doubling backoff hold
    pub max_hold_delay_ms: u64,
    /// Re-evaluation delay after reaping a dead worker thread
    pub dead_thread_recheck_ms: u64,
    /// Longest single wait for network before assuming it is back
    pub connectivity_wait_ms: u64,
    /// Sleeps longer than this arm the scheduler alarm
    pub alarm_threshold_ms: u64,
    /// Added to the sleep bound when arming the scheduler alarm
    pub alarm_slack_ms: u64,
    /// Floor for an out-of-band worker wake
    pub min_request_wait_ms: u64,
    /// Out-of-band wakes further away than this are ignored
    pub max_request_wait_ms: u64,
    /// Time a stopped worker gets to exit before it is force-released
    pub stop_grace_ms: u64,
    /// Largest polling interval honored, in minutes
    pub max_interval_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 15 * MINUTE_MS,
            initial_hold_delay_ms: 15 * SECOND_MS,
            max_hold_delay_ms: 4 * MINUTE_MS,
            dead_thread_recheck_ms: 3 * SECOND_MS,
            connectivity_wait_ms: 10 * MINUTE_MS,
            alarm_threshold_ms: 10 * SECOND_MS,
            alarm_slack_ms: 3 * SECOND_MS,
            min_request_wait_ms: 250,
            max_request_wait_ms: 11 * MINUTE_MS,
            stop_grace_ms: 60 * SECOND_MS,
            max_interval_minutes: 1440,
        }
    }
}

impl SchedulerConfig {
    /// Load from ~/.config/mailsync/scheduler.json, or defaults if absent
    pub fn load() -> Result<Self> {
        let config: Self = config::load_json_or_default(SCHEDULER_CONFIG_FILE)?;
        config.validate()?;
        Ok(config)
    }

    /// Write to ~/.config/mailsync/scheduler.json
    pub fn save(&self) -> Result<()> {
        self.validate()?;
        config::save_json(SCHEDULER_CONFIG_FILE, self)
    }

    /// Parse from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse scheduler config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would stall the loop
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_ms == 0 {
            anyhow::bail!("heartbeat_ms must be greater than zero");
        }
        if self.initial_hold_delay_ms == 0 {
            anyhow::bail!("initial_hold_delay_ms must be greater than zero");
        }
        if self.initial_hold_delay_ms > self.max_hold_delay_ms {
            anyhow::bail!(
                "initial_hold_delay_ms ({}) exceeds max_hold_delay_ms ({})",
                self.initial_hold_delay_ms,
                self.max_hold_delay_ms
            );
        }
        if self.min_request_wait_ms > self.max_request_wait_ms {
            anyhow::bail!("min_request_wait_ms exceeds max_request_wait_ms");
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn initial_hold_delay(&self) -> Duration {
        Duration::from_millis(self.initial_hold_delay_ms)
    }

    pub fn max_hold_delay(&self) -> Duration {
        Duration::from_millis(self.max_hold_delay_ms)
    }

    pub fn dead_thread_recheck(&self) -> Duration {
        Duration::from_millis(self.dead_thread_recheck_ms)
    }

    pub fn connectivity_wait(&self) -> Duration {
        Duration::from_millis(self.connectivity_wait_ms)
    }

    pub fn alarm_threshold(&self) -> Duration {
        Duration::from_millis(self.alarm_threshold_ms)
    }

    pub fn alarm_slack(&self) -> Duration {
        Duration::from_millis(self.alarm_slack_ms)
    }

    pub fn min_request_wait(&self) -> Duration {
        Duration::from_millis(self.min_request_wait_ms)
    }

    pub fn max_request_wait(&self) -> Duration {
        Duration::from_millis(self.max_request_wait_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.heartbeat(), Duration::from_secs(15 * 60));
        assert_eq!(config.initial_hold_delay(), Duration::from_secs(15));
        assert_eq!(config.max_hold_delay(), Duration::from_secs(240));
        assert_eq!(config.dead_thread_recheck(), Duration::from_secs(3));
        assert_eq!(config.connectivity_wait(), Duration::from_secs(600));
        assert_eq!(config.min_request_wait(), Duration::from_millis(250));
        assert_eq!(config.max_interval_minutes, 1440);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial_keeps_defaults() {
        let config = SchedulerConfig::from_json(r#"{ "heartbeat_ms": 60000 }"#).unwrap();
        assert_eq!(config.heartbeat(), Duration::from_secs(60));
        assert_eq!(config.max_hold_delay_ms, 240_000);
    }

    #[test]
    fn test_from_json_rejects_inverted_backoff() {
        let json = r#"{ "initial_hold_delay_ms": 500000, "max_hold_delay_ms": 1000 }"#;
        assert!(SchedulerConfig::from_json(json).is_err());
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(SchedulerConfig::from_json("not json").is_err());
    }
}
