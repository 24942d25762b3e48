use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::serialiser::JSON_FILTER;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("page_extensions must not be empty")]
    NoPageExtensions,

    #[error("Page extension '{0}' must start with '.'")]
    InvalidPageExtension(String),

    #[error("At least one source must be configured")]
    NoSources,

    #[error("Source name must not be empty")]
    EmptySourceName,

    #[error("Duplicate source name '{0}'")]
    DuplicateSource(String),

    #[error("Plugin '{0}' has a NaN priority")]
    InvalidPriority(String),

    #[error("Invalid serialiser filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Serialiser filter '{0}' is registered more than once")]
    DuplicateFilter(String),

    #[error("schedule.check_interval_mins must be greater than zero")]
    ZeroInterval,

    #[error("schedule.{field} is {value}, limit is {limit}")]
    ScheduleOutOfRange { field: &'static str, value: u64, limit: u64 },

    #[error("workflow_target '{0}' does not name a configured source")]
    UnknownWorkflowTarget(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
    #[serde(default)]
    pub plugins: Vec<PluginDefinition>,
    #[serde(default)]
    pub serialisers: Vec<SerialiserDefinition>,
    #[serde(default = "default_page_extensions")]
    pub page_extensions: Vec<String>,
    #[serde(default)]
    pub ignore_pages: Vec<String>,
    #[serde(default)]
    pub schedule: Schedule,
    /// Source that receives workflow triggers. Broadcast to all when unset.
    #[serde(default)]
    pub workflow_target: Option<String>,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub module: String,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialiserDefinition {
    pub module: String,
    pub filter: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_check_interval_mins")]
    pub check_interval_mins: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_mins.saturating_mul(60))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            check_interval_mins: default_check_interval_mins(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

/// Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub mode: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive. `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub json: bool,
}

fn default_page_extensions() -> Vec<String> {
    vec![".mdx".to_string()]
}

/// One year, in minutes.
pub const MAX_CHECK_INTERVAL_MINS: u64 = 365 * 24 * 60;
/// One day, in milliseconds.
pub const MAX_INITIAL_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

fn default_check_interval_mins() -> u64 {
    30
}

fn default_initial_delay_ms() -> u64 {
    1000
}

impl Config {
    /// Load `docweave.toml` (or `path`) layered with `DOCWEAVE_*` variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("docweave").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("DOCWEAVE").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check everything that must hold before any component is built.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.page_extensions.is_empty() {
            return Err(ConfigValidationError::NoPageExtensions);
        }
        if let Some(ext) = self.page_extensions.iter().find(|ext| !ext.starts_with('.')) {
            return Err(ConfigValidationError::InvalidPageExtension(ext.clone()));
        }

        if self.sources.is_empty() {
            return Err(ConfigValidationError::NoSources);
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigValidationError::EmptySourceName);
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigValidationError::DuplicateSource(source.name.clone()));
            }
        }

        if let Some(plugin) = self.plugins.iter().find(|plugin| plugin.priority.is_nan()) {
            return Err(ConfigValidationError::InvalidPriority(plugin.module.clone()));
        }

        let mut filters = HashSet::from([JSON_FILTER]);
        for serialiser in &self.serialisers {
            if let Err(e) = regex::Regex::new(&serialiser.filter) {
                return Err(ConfigValidationError::InvalidFilter {
                    filter: serialiser.filter.clone(),
                    reason: e.to_string(),
                });
            }
            if !filters.insert(serialiser.filter.as_str()) {
                return Err(ConfigValidationError::DuplicateFilter(serialiser.filter.clone()));
            }
        }

        let schedule = &self.schedule;
        if schedule.check_interval_mins == 0 {
            return Err(ConfigValidationError::ZeroInterval);
        }
        if schedule.check_interval_mins.checked_mul(60).is_none()
            || schedule.check_interval_mins > MAX_CHECK_INTERVAL_MINS
        {
            return Err(ConfigValidationError::ScheduleOutOfRange {
                field: "check_interval_mins",
                value: schedule.check_interval_mins,
                limit: MAX_CHECK_INTERVAL_MINS,
            });
        }
        if schedule.initial_delay_ms > MAX_INITIAL_DELAY_MS {
            return Err(ConfigValidationError::ScheduleOutOfRange {
                field: "initial_delay_ms",
                value: schedule.initial_delay_ms,
                limit: MAX_INITIAL_DELAY_MS,
            });
        }

        if let Some(target) = &self.workflow_target {
            if !names.contains(target.as_str()) {
                return Err(ConfigValidationError::UnknownWorkflowTarget(target.clone()));
            }
        }

        Ok(())
    }

    /// Sources that are not disabled, in configuration order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.sources.iter().filter(|source| !source.disabled)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            plugins: Vec::new(),
            serialisers: Vec::new(),
            page_extensions: default_page_extensions(),
            ignore_pages: Vec::new(),
            schedule: Schedule::default(),
            workflow_target: None,
            deployment: None,
            logging: LoggingConfig::default(),
        }
    }
}
