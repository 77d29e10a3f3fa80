//! Engine configuration.
//!
//! One explicit struct, built once at startup and shared by `Arc` with the
//! engine, the dispatcher, the reverter and the queue client.

use crate::errors::RoutineflowError;
use crate::retry::RetryBackoff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Prefix of the environment variables read by [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "ROUTINEFLOW_";

/// Lock timings for one of the routine workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long to wait for the lock before giving up.
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
    /// How long a held lock stays valid without release.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

fn default_wait_seconds() -> u64 {
    5
}

fn default_lease_seconds() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait_seconds: default_wait_seconds(),
            lease_seconds: default_lease_seconds(),
        }
    }
}

impl LockSettings {
    /// Wait window as a `Duration`.
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    /// Lease as a `Duration`.
    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

/// Configuration shared by every engine component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application name; also the default queue name.
    #[serde(default)]
    pub app_name: Option<String>,
    /// Base URL the queue delivers to.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Path of the task endpoint under `domain`.
    #[serde(default = "default_tasks_path")]
    pub tasks_path: String,
    /// Separator used when composing queue task names.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Queue to use instead when the original was deleted recently.
    #[serde(default)]
    pub backup_queues: HashMap<String, String>,
    /// Dispatcher lock timings.
    #[serde(default)]
    pub dispatcher_lock: LockSettings,
    /// Reverter lock timings.
    #[serde(default)]
    pub reverter_lock: LockSettings,
    /// Pause between acquisition attempts of the default lock manager.
    #[serde(default = "default_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// Delay policy for retried attempts.
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
}

fn default_domain() -> String {
    "http://localhost:8080".to_string()
}

fn default_tasks_path() -> String {
    "/tasks".to_string()
}

fn default_delimiter() -> String {
    "--".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: None,
            domain: default_domain(),
            tasks_path: default_tasks_path(),
            delimiter: default_delimiter(),
            backup_queues: HashMap::new(),
            dispatcher_lock: LockSettings::default(),
            reverter_lock: LockSettings::default(),
            lock_poll_interval_ms: default_poll_interval_ms(),
            retry_backoff: RetryBackoff::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, RoutineflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds a configuration from `ROUTINEFLOW_*` environment variables.
    ///
    /// Recognized: `APP_NAME`, `DOMAIN_URL`, `TASKS_PATH`, `DELIMITER`,
    /// `LOCK_WAIT_SECONDS`, `LOCK_LEASE_SECONDS`, `LOCK_POLL_INTERVAL_MS`.
    ///
    /// # Errors
    ///
    /// Returns an error when a numeric variable does not parse.
    pub fn from_env() -> Result<Self, RoutineflowError> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RoutineflowError> {
        let mut config = Self::default();

        if let Some(app_name) = lookup("APP_NAME") {
            config.app_name = Some(app_name);
        }
        if let Some(domain) = lookup("DOMAIN_URL") {
            config.domain = domain;
        }
        if let Some(path) = lookup("TASKS_PATH") {
            config.tasks_path = path;
        }
        if let Some(delimiter) = lookup("DELIMITER") {
            config.delimiter = delimiter;
        }
        if let Some(wait) = lookup("LOCK_WAIT_SECONDS") {
            let wait = parse_seconds("LOCK_WAIT_SECONDS", &wait)?;
            config.dispatcher_lock.wait_seconds = wait;
            config.reverter_lock.wait_seconds = wait;
        }
        if let Some(lease) = lookup("LOCK_LEASE_SECONDS") {
            let lease = parse_seconds("LOCK_LEASE_SECONDS", &lease)?;
            config.dispatcher_lock.lease_seconds = lease;
            config.reverter_lock.lease_seconds = lease;
        }
        if let Some(interval) = lookup("LOCK_POLL_INTERVAL_MS") {
            config.lock_poll_interval_ms = parse_number("LOCK_POLL_INTERVAL_MS", &interval, "milliseconds")?;
        }

        Ok(config)
    }

    /// Sets the application name.
    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Sets the delivery domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Registers a backup queue for `queue`.
    #[must_use]
    pub fn with_backup_queue(mut self, queue: impl Into<String>, backup: impl Into<String>) -> Self {
        self.backup_queues.insert(queue.into(), backup.into());
        self
    }

    /// Uses the same lock timings for the dispatcher and the reverter.
    #[must_use]
    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.dispatcher_lock = settings.clone();
        self.reverter_lock = settings;
        self
    }

    /// Sets the pause between lock acquisition attempts.
    #[must_use]
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Lock poll interval as a `Duration`.
    #[must_use]
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Sets the retry backoff.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Queue every message is pushed to.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        self.app_name.as_deref().unwrap_or("tasks")
    }

    /// Backup queue configured for `queue`, if any.
    #[must_use]
    pub fn backup_queue(&self, queue: &str) -> Option<&str> {
        self.backup_queues.get(queue).map(String::as_str)
    }

    /// Delivery URL of the named task.
    #[must_use]
    pub fn task_url(&self, task_name: &str) -> String {
        format!(
            "{}{}/{}",
            self.domain.trim_end_matches('/'),
            self.tasks_path,
            task_name
        )
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<u64, RoutineflowError> {
    parse_number(name, value, "seconds")
}

fn parse_number(name: &str, value: &str, unit: &str) -> Result<u64, RoutineflowError> {
    value.trim().parse().map_err(|_| {
        RoutineflowError::Internal(format!("{ENV_PREFIX}{name} must be a whole number of {unit}, got '{value}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_name(), "tasks");
        assert_eq!(config.domain, "http://localhost:8080");
        assert_eq!(config.dispatcher_lock.wait(), Duration::from_secs(5));
        assert_eq!(config.dispatcher_lock.lease(), Duration::from_secs(60));
        assert_eq!(config.reverter_lock, config.dispatcher_lock);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_task_url() {
        let config = EngineConfig::new().with_domain("https://api.example.com/");
        assert_eq!(
            config.task_url("routine-dispatcher"),
            "https://api.example.com/tasks/routine-dispatcher"
        );
    }

    #[test]
    fn test_queue_name_from_app_name() {
        let config = EngineConfig::new()
            .with_app_name("wizard-api")
            .with_backup_queue("wizard-api", "wizard-api-backup");
        assert_eq!(config.queue_name(), "wizard-api");
        assert_eq!(config.backup_queue("wizard-api"), Some("wizard-api-backup"));
        assert_eq!(config.backup_queue("other"), None);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"app_name": "wizard", "dispatcher_lock": {"wait_seconds": 1}}"#)
                .unwrap();
        assert_eq!(config.queue_name(), "wizard");
        assert_eq!(config.dispatcher_lock.wait_seconds, 1);
        assert_eq!(config.dispatcher_lock.lease_seconds, 60);
        assert_eq!(config.delimiter, "--");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("APP_NAME", "wizard"),
            ("DOMAIN_URL", "https://wizard.example.com"),
            ("LOCK_WAIT_SECONDS", "2"),
            ("LOCK_POLL_INTERVAL_MS", "25"),
        ]
        .into_iter()
        .collect();

        let config =
            EngineConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.queue_name(), "wizard");
        assert_eq!(config.domain, "https://wizard.example.com");
        assert_eq!(config.reverter_lock.wait_seconds, 2);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let result = EngineConfig::from_lookup(|name| {
            (name == "LOCK_LEASE_SECONDS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }
}
