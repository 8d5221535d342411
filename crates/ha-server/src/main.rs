//! Automation engine server
//!
//! Loads `automation.yaml` from the config directory (first argument, or
//! `AUTOMATION_CONFIG_DIR`, or the working directory), registers every rule
//! document found in `rules_dir` and runs the engine until ctrl-c.

use anyhow::{Context, Result};
use ha_automation::{AutomationEngine, EngineConfig, Rule, RuleParser, SchedulerConfig};
use ha_config::EngineSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "automation.yaml";

fn config_dir() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AUTOMATION_CONFIG_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn load_settings(config_dir: &Path) -> Result<EngineSettings> {
    if !config_dir.join(CONFIG_FILE).exists() {
        return Ok(EngineSettings::default());
    }
    EngineSettings::load(config_dir, CONFIG_FILE)
        .with_context(|| format!("loading {}", config_dir.join(CONFIG_FILE).display()))
}

/// Translate file settings into the engine's typed configuration
fn engine_config(settings: &EngineSettings) -> Result<EngineConfig> {
    Ok(EngineConfig {
        workers: settings.workers,
        queue_size: settings.queue_size,
        execution_timeout: settings.execution_timeout()?,
        cleanup_interval: settings.cleanup_interval()?,
        context_max_age: settings.context_max_age()?,
        max_concurrent_evaluations: settings.max_concurrent_evaluations,
        scheduler: SchedulerConfig {
            timezone: settings.scheduler.timezone.clone(),
            handler_timeout: settings.handler_timeout()?,
            channel_capacity: settings.scheduler.channel_capacity,
        },
    })
}

fn parse_rule_file(parser: &RuleParser, path: &Path) -> Result<Rule> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        let content = std::fs::read_to_string(path)?;
        return Ok(parser.parse_json(&content)?);
    }

    // YAML goes through the config loader so rule files get !include/!env_var
    let yaml = ha_config::load_yaml(path)?;
    Ok(parser.parse_value(serde_json::to_value(yaml)?)?)
}

/// Register every rule document in `dir`; broken documents are skipped
async fn load_rules(engine: &AutomationEngine, dir: &Path) -> Result<usize> {
    let parser = RuleParser::new();
    let mut loaded = 0;

    for path in ha_config::rule_files(dir)? {
        let rule = match parse_rule_file(&parser, &path) {
            Ok(rule) => rule,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unparsable rule file");
                continue;
            }
        };
        match engine.add_rule(rule).await {
            Ok(rule_id) => {
                info!(path = %path.display(), rule_id = %rule_id, "Rule loaded");
                loaded += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Rule rejected"),
        }
    }
    Ok(loaded)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let settings = load_settings(&config_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config_dir = %config_dir.display(), "Starting automation engine server");

    let engine = Arc::new(AutomationEngine::new(engine_config(&settings)?));

    if let Some(rules_dir) = &settings.rules_dir {
        let loaded = load_rules(&engine, rules_dir).await?;
        info!(rules_dir = %rules_dir.display(), loaded, "Rules loaded");
    }

    engine.start()?;
    info!("Automation engine is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.stop().await?;
    Ok(())
}
