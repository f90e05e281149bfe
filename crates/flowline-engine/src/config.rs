//! Engine configuration
//!
//! `EngineConfig` carries the settings shared by every orchestrator and is
//! read from `FLOWLINE_*` environment variables (a `.env` file is honoured).
//! `FlowsFile` is the TOML document the CLI reads to know which directory
//! flows to run.

use flowline_common::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::ErrorPolicy;
use crate::model::Flow;
use crate::retry::{RetryConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_WAIT_MS};
use crate::storage::{FileStorage, StateRepository};

// ============================================================================
// Defaults
// ============================================================================

/// Default directory for state documents and packages
pub const DEFAULT_BASE_DIR: &str = "./flowline-data";

/// Default polling interval in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default number of records pulled per source per tick
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default controller kind for flows that do not name one
pub const DEFAULT_CONTROLLER_KIND: &str = "directory";

/// Settings shared by processors and file ingestion controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub page_size: usize,
    /// Abort a run on the first record that fails to map
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Quarantine a source file after this many consecutive failures; unset retries forever
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            page_size: DEFAULT_PAGE_SIZE,
            fail_on_error: false,
            retry: RetryConfig::default(),
            max_consecutive_failures: None,
        }
    }
}

impl EngineConfig {
    /// Load from the environment and a `.env` file, falling back to defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values are rejected
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            base_dir: lookup("FLOWLINE_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR)),
            poll_interval_secs: parse_var(&lookup, "FLOWLINE_POLL_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            page_size: parse_var(&lookup, "FLOWLINE_PAGE_SIZE")?.unwrap_or(DEFAULT_PAGE_SIZE),
            fail_on_error: parse_var(&lookup, "FLOWLINE_FAIL_ON_ERROR")?.unwrap_or(false),
            retry: RetryConfig {
                max_attempts: parse_var(&lookup, "FLOWLINE_RETRY_MAX_ATTEMPTS")?
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS),
                wait_ms: parse_var(&lookup, "FLOWLINE_RETRY_WAIT_MS")?.unwrap_or(DEFAULT_WAIT_MS),
            },
            max_consecutive_failures: parse_var(&lookup, "FLOWLINE_MAX_CONSECUTIVE_FAILURES")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(FlowError::config("poll interval must be greater than 0"));
        }

        if self.page_size == 0 {
            return Err(FlowError::config("page size must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(FlowError::config("retry max_attempts must be greater than 0"));
        }

        if self.max_consecutive_failures == Some(0) {
            return Err(FlowError::config(
                "max_consecutive_failures must be greater than 0 when set",
            ));
        }

        if self.base_dir.as_os_str().is_empty() {
            return Err(FlowError::config("base directory cannot be empty"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::from_fail_on_error(self.fail_on_error)
    }

    /// File-backed repository rooted at `base_dir`
    pub fn state_repository(&self) -> StateRepository {
        StateRepository::new(Arc::new(FileStorage::new(&self.base_dir)))
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FlowError::config(format!("invalid value for {}: '{}'", key, raw))),
    }
}

/// One directory flow as declared in the flows file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub code: String,
    /// Display name; defaults to the code
    #[serde(default)]
    pub name: Option<String>,
    /// Registered controller kind
    #[serde(default = "default_kind")]
    pub kind: String,
    pub inbox: PathBuf,
    pub target_dir: PathBuf,
    /// Only files with this extension are picked up
    #[serde(default)]
    pub extension: Option<String>,
    pub source_entity_type: String,
    pub target_entity_type: String,
    /// Overrides the engine poll interval for this flow
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Overrides the engine quarantine threshold for this flow
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

fn default_kind() -> String {
    DEFAULT_CONTROLLER_KIND.to_string()
}

impl FlowDefinition {
    /// Descriptor of the flow this definition runs
    pub fn flow(&self) -> Flow {
        Flow::new(self.code.as_str(), self.name.as_deref().unwrap_or(&self.code))
    }

    /// Effective engine settings for this flow
    pub fn engine_config(&self, base: &EngineConfig) -> EngineConfig {
        let mut config = base.clone();
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
        if self.max_consecutive_failures.is_some() {
            config.max_consecutive_failures = self.max_consecutive_failures;
        }
        config
    }
}

/// TOML document listing the flows the CLI runs
///
/// ```toml
/// [[flow]]
/// code = "devices"
/// inbox = "/data/inbox/devices"
/// target_dir = "/data/out/devices"
/// extension = "jsonl"
/// source_entity_type = "device_export"
/// target_entity_type = "device"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowsFile {
    #[serde(default, rename = "flow")]
    pub flows: Vec<FlowDefinition>,
}

impl FlowsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FlowError::config(format!("cannot read flows file {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: FlowsFile =
            toml::from_str(raw).map_err(|e| FlowError::config(format!("invalid flows file: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        let mut codes = HashSet::new();
        for flow in &self.flows {
            if flow.code.trim().is_empty() {
                return Err(FlowError::config("flow code cannot be empty"));
            }
            if !codes.insert(flow.code.as_str()) {
                return Err(FlowError::config(format!("duplicate flow code '{}'", flow.code)));
            }
            if flow.poll_interval_secs == Some(0) {
                return Err(FlowError::config(format!(
                    "flow '{}': poll interval must be greater than 0",
                    flow.code
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<&FlowDefinition> {
        self.flows.iter().find(|f| f.code == code)
    }
}
