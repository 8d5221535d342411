//! YAML configuration loading for the automation engine
//!
//! Loads the engine settings file and finds rule documents on disk. YAML is
//! read through [`load_yaml`], which expands `!include` and `!env_var` tags.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::EngineSettings;
//!
//! let settings = EngineSettings::load("/etc/automation", "automation.yaml")?;
//! let timeout = settings.execution_timeout()?;
//! ```

mod error;
mod loader;
mod settings;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, parse_yaml, rule_files};
pub use settings::{EngineSettings, SchedulerSettings};
