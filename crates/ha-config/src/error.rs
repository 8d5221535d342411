//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid YAML: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A `!include` or `!env_var` tag could not be expanded
    #[error("{}: {tag}: {reason}", path.display())]
    Tag {
        path: PathBuf,
        tag: &'static str,
        reason: String,
    },

    #[error("rules directory {} does not exist", .0.display())]
    NoRulesDir(PathBuf),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
