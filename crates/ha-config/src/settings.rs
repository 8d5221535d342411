//! Engine configuration
//!
//! Parses `automation.yaml`. Every field is optional; durations are written as
//! strings (`"30s"`, `"5m"`) and checked by [`EngineSettings::validate`].

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

/// Scheduler section of the engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// IANA timezone used to evaluate time triggers (e.g., "Europe/Berlin")
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Upper bound for a single trigger handler invocation
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: String,

    /// Capacity of the channel carrying synthetic time events
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            handler_timeout: default_handler_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Automation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Number of execution workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the execution queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Upper bound for one rule execution
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: String,

    /// How often finished or stale execution contexts are swept
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,

    /// Age after which an execution context is swept
    #[serde(default = "default_context_max_age")]
    pub context_max_age: String,

    /// Limit on concurrent trigger evaluations per incoming event
    #[serde(default)]
    pub max_concurrent_evaluations: Option<usize>,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Directory holding rule documents to load at startup
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,

    /// Default log filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_queue_size() -> usize {
    1000
}

fn default_execution_timeout() -> String {
    "30s".to_string()
}

fn default_cleanup_interval() -> String {
    "5m".to_string()
}

fn default_context_max_age() -> String {
    "30m".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_handler_timeout() -> String {
    "30s".to_string()
}

fn default_channel_capacity() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
            execution_timeout: default_execution_timeout(),
            cleanup_interval: default_cleanup_interval(),
            context_max_age: default_context_max_age(),
            max_concurrent_evaluations: None,
            scheduler: SchedulerSettings::default(),
            rules_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl EngineSettings {
    /// Load settings from a file inside a config directory
    ///
    /// A relative `rules_dir` is resolved against the config directory.
    pub fn load(config_dir: impl AsRef<Path>, file: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let yaml = load_yaml(config_dir.join(file))?;

        let mut settings = Self::from_yaml(&yaml)?;
        if let Some(rules_dir) = settings.rules_dir.as_mut() {
            if rules_dir.is_relative() {
                *rules_dir = config_dir.join(&*rules_dir);
            }
        }
        Ok(settings)
    }

    /// Parse settings from a YAML value
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        if !yaml.is_mapping() {
            return Err(ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: "configuration must be a mapping".to_string(),
            });
        }

        let settings: Self =
            serde_yaml::from_value(yaml.clone()).map_err(|e| ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check numeric bounds and that every duration parses
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(invalid("queue_size", "must be at least 1"));
        }
        if self.scheduler.channel_capacity == 0 {
            return Err(invalid("scheduler.channel_capacity", "must be at least 1"));
        }
        if self.max_concurrent_evaluations == Some(0) {
            return Err(invalid("max_concurrent_evaluations", "must be at least 1"));
        }
        self.execution_timeout()?;
        self.cleanup_interval()?;
        self.context_max_age()?;
        self.handler_timeout()?;
        Ok(())
    }

    /// Upper bound for one rule execution
    pub fn execution_timeout(&self) -> ConfigResult<Duration> {
        parse_setting("execution_timeout", &self.execution_timeout)
    }

    /// Interval between context sweeps
    pub fn cleanup_interval(&self) -> ConfigResult<Duration> {
        parse_setting("cleanup_interval", &self.cleanup_interval)
    }

    /// Age after which a context is swept
    pub fn context_max_age(&self) -> ConfigResult<Duration> {
        parse_setting("context_max_age", &self.context_max_age)
    }

    /// Upper bound for a scheduler handler invocation
    pub fn handler_timeout(&self) -> ConfigResult<Duration> {
        parse_setting("scheduler.handler_timeout", &self.scheduler.handler_timeout)
    }
}

fn parse_setting(key: &str, value: &str) -> ConfigResult<Duration> {
    ha_core::parse_duration(value).map_err(|e| invalid(key, &e.to_string()))
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
