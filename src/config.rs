//! Ambient configuration for the demo binary: log level and the timing
//! knobs of the toy pipeline it assembles. The library itself takes its
//! `Phaser` configuration programmatically (§6); this module exists only
//! for the CLI surface, same split as the teacher's `config.rs` vs. its
//! programmatic `PhaseGolemConfig` construction helpers.

use std::path::Path;

use serde::Deserialize;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub step_count: u32,
    pub wait_timeout_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            step_count: 3,
            wait_timeout_seconds: 5,
        }
    }
}

pub fn validate(config: &RunnerConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if crate::log::parse_log_level(&config.logging.level).is_err() {
        errors.push(format!(
            "logging.level '{}' is invalid: expected error, warn, info, or debug",
            config.logging.level
        ));
    }

    if config.pipeline.step_count == 0 {
        errors.push("pipeline.step_count must be >= 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/phase-golem.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None`, delegates
/// to `load_config` (returns defaults if missing).
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<RunnerConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

fn load_config_at(path: &Path) -> Result<RunnerConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let config: RunnerConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate(&config).map_err(|errors| format_errors(&errors))?;

    Ok(config)
}

pub fn load_config(project_root: &Path) -> Result<RunnerConfig, String> {
    let config_path = project_root.join("phase-golem.toml");

    if !config_path.exists() {
        return Ok(RunnerConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: RunnerConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| format_errors(&errors))?;

    Ok(config)
}

fn format_errors(errors: &[String]) -> String {
    format!(
        "Config validation failed:\n{}",
        errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
