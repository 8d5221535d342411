//! Reading YAML documents from disk
//!
//! Settings files and rule documents share one reader. Two tags are expanded
//! while reading:
//!
//! - `!include file` splices in another document, resolved against the
//!   directory of the file that contains the tag
//! - `!env_var NAME [fallback]` reads an environment variable; the fallback
//!   is parsed as YAML so `!env_var WORKERS 4` yields a number
//!
//! Any other tag is rejected.

use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Extensions recognised as rule documents
const RULE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Read a YAML file and expand its tags
pub fn load_yaml(path: impl AsRef<Path>) -> ConfigResult<Value> {
    let mut chain = Vec::new();
    read_document(path.as_ref(), &mut chain)
}

/// Parse YAML text as if it had been read from `origin`
///
/// `origin` only anchors relative `!include` paths and error messages.
pub fn parse_yaml(content: &str, origin: impl AsRef<Path>) -> ConfigResult<Value> {
    let origin = origin.as_ref();
    let mut chain = vec![origin.to_path_buf()];
    parse_document(content, origin, &mut chain)
}

/// Rule documents in `dir`, sorted by file name
pub fn rule_files(dir: impl AsRef<Path>) -> ConfigResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(ConfigError::NoRulesDir(dir.to_path_buf()));
    }

    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_rule_document(path))
        .collect();

    files.sort();
    Ok(files)
}

fn is_rule_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| RULE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// `chain` holds the files currently being read, outermost first
fn read_document(path: &Path, chain: &mut Vec<PathBuf>) -> ConfigResult<Value> {
    if chain.iter().any(|open| open == path) {
        return Err(ConfigError::Tag {
            path: path.to_path_buf(),
            tag: "!include",
            reason: "file includes itself".to_string(),
        });
    }

    debug!(path = %path.display(), "Reading YAML document");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    chain.push(path.to_path_buf());
    let result = parse_document(&content, path, chain);
    chain.pop();
    result
}

fn parse_document(content: &str, path: &Path, chain: &mut Vec<PathBuf>) -> ConfigResult<Value> {
    let value: Value = serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    expand(value, path, chain)
}

fn expand(value: Value, path: &Path, chain: &mut Vec<PathBuf>) -> ConfigResult<Value> {
    match value {
        Value::Tagged(tagged) => expand_tag(*tagged, path, chain),
        Value::Mapping(map) => map
            .into_iter()
            .map(|(key, value)| Ok((key, expand(value, path, chain)?)))
            .collect::<ConfigResult<serde_yaml::Mapping>>()
            .map(Value::Mapping),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| expand(item, path, chain))
            .collect::<ConfigResult<Vec<_>>>()
            .map(Value::Sequence),
        other => Ok(other),
    }
}

fn expand_tag(tagged: TaggedValue, path: &Path, chain: &mut Vec<PathBuf>) -> ConfigResult<Value> {
    let tag_error = |tag: &'static str, reason: String| ConfigError::Tag {
        path: path.to_path_buf(),
        tag,
        reason,
    };

    if tagged.tag == "include" {
        let Value::String(target) = tagged.value else {
            return Err(tag_error("!include", "expects a file name".to_string()));
        };
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        return read_document(&base.join(target), chain);
    }

    if tagged.tag == "env_var" {
        let Value::String(spec) = tagged.value else {
            return Err(tag_error("!env_var", "expects a variable name".to_string()));
        };
        let spec = spec.trim();
        let (name, fallback) = match spec.split_once(char::is_whitespace) {
            Some((name, fallback)) => (name, Some(fallback.trim())),
            None => (spec, None),
        };
        return match (std::env::var(name), fallback) {
            (Ok(value), _) => Ok(Value::String(value)),
            (Err(_), Some(fallback)) => {
                debug!(var = name, "Environment variable unset, using fallback");
                Ok(serde_yaml::from_str(fallback)
                    .unwrap_or_else(|_| Value::String(fallback.to_string())))
            }
            (Err(_), None) => Err(tag_error("!env_var", format!("{} is not set", name))),
        };
    }

    Err(tag_error("!", format!("unsupported tag {}", tagged.tag)))
}
