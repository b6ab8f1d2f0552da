//! Configuration for the harvester.
//!
//! Constant tables hold tuning defaults. [`HarvesterConfig`] is the runtime
//! configuration loaded from a JSON file and describes the ledger backend,
//! resilience settings and the table of scheduled sources.

use crate::connector::ConnectorConfig;
use crate::error::{HarvestError, Result};
use crate::mapper::JsonMapperConfig;
use crate::models::TagPolicy;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const USER_AGENT: &'static str = concat!("catalog-harvester/", env!("CARGO_PKG_VERSION"));

    // Retry
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

    // Circuit breaker
    pub const BREAKER_FAILURE_RATIO: f64 = 0.5;
    pub const BREAKER_MINIMUM_THROUGHPUT: u32 = 5;
    pub const BREAKER_SAMPLING_WINDOW: Duration = Duration::from_secs(60);
    pub const BREAKER_BREAK_DURATION: Duration = Duration::from_secs(30);
}

/// Ingestion loop configuration.
pub struct IngestConfig;

impl IngestConfig {
    pub const PAGE_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_PAGE_SIZE: u32 = 100;
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
    pub const CANCELLED_MESSAGE: &'static str = "Fetch run was cancelled";
    pub const ORPHANED_MESSAGE: &'static str = "Fetch run abandoned by previous process";
    pub const DEFAULT_WORKFLOW_EXTENSIONS: &'static [&'static str] = &["json"];
}

/// Storage file names and SQLite tuning.
pub struct StoreConfig;

impl StoreConfig {
    pub const DATA_DIR_NAME: &'static str = "catalog-harvester";
    pub const DATABASE_FILE: &'static str = "harvester.sqlite";
    pub const LEDGER_FILE: &'static str = "fetch_runs.json";
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Which [`crate::ledger::RunLedger`] implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    Json,
}

/// Retry settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_ATTEMPTS,
            base_delay_ms: NetworkConfig::RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: NetworkConfig::RETRY_MAX_DELAY.as_millis() as u64,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

/// Circuit breaker settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_ratio: f64,
    pub minimum_throughput: u32,
    pub sampling_window_secs: u64,
    pub break_duration_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_ratio: NetworkConfig::BREAKER_FAILURE_RATIO,
            minimum_throughput: NetworkConfig::BREAKER_MINIMUM_THROUGHPUT,
            sampling_window_secs: NetworkConfig::BREAKER_SAMPLING_WINDOW.as_secs(),
            break_duration_secs: NetworkConfig::BREAKER_BREAK_DURATION.as_secs(),
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_ratio: self.failure_ratio,
            minimum_throughput: self.minimum_throughput,
            sampling_window: Duration::from_secs(self.sampling_window_secs),
            break_duration: Duration::from_secs(self.break_duration_secs),
        }
    }
}

/// When a source is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleConfig {
    IntervalSecs(u64),
    /// Six- or seven-field cron expression (seconds first).
    Cron(String),
}

/// One row of the static source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: ScheduleConfig,
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub mapper: JsonMapperConfig,
    #[serde(default)]
    pub tag_policy: TagPolicy,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub resume_from_cursor: bool,
}

fn default_enabled() -> bool {
    true
}

/// Runtime configuration for a harvester instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub ledger: LedgerBackend,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(StoreConfig::DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(StoreConfig::DATA_DIR_NAME))
}

fn default_page_delay_ms() -> u64 {
    IngestConfig::PAGE_DELAY.as_millis() as u64
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ledger: LedgerBackend::default(),
            retry: RetrySettings::default(),
            circuit_breaker: BreakerSettings::default(),
            page_delay_ms: default_page_delay_ms(),
            sources: Vec::new(),
        }
    }
}

impl HarvesterConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = crate::atomic::read_json(path)?.ok_or_else(|| HarvestError::Config {
            message: format!("Config file not found: {}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(StoreConfig::DATABASE_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(StoreConfig::LEDGER_FILE)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.circuit_breaker.failure_ratio) {
            return Err(HarvestError::Validation {
                field: "circuit_breaker.failure_ratio".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(HarvestError::Validation {
                    field: "sources.name".into(),
                    message: "source name cannot be empty".into(),
                });
            }
            if !seen.insert(source.name.as_str()) {
                return Err(HarvestError::Validation {
                    field: "sources.name".into(),
                    message: format!("duplicate source name: {}", source.name),
                });
            }
            if source.max_pages == Some(0) {
                return Err(HarvestError::Validation {
                    field: format!("sources.{}.max_pages", source.name),
                    message: "must be greater than zero".into(),
                });
            }
            crate::scheduler::Schedule::from_config(&source.schedule).map_err(|e| {
                HarvestError::Validation {
                    field: format!("sources.{}.schedule", source.name),
                    message: e.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "data_dir": "/tmp/harvest",
        "ledger": "json",
        "sources": [
            {
                "name": "models",
                "schedule": { "interval_secs": 3600 },
                "connector": { "kind": "http", "base_url": "https://example.com/api/models" },
                "tag_policy": "append_only",
                "max_pages": 5,
                "filters": { "sort": "Newest" }
            },
            {
                "name": "workflows",
                "enabled": false,
                "schedule": { "cron": "0 */15 * * * *" },
                "connector": { "kind": "workflow_dir", "base_dirs": ["/srv/workflows"] }
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config: HarvesterConfig = serde_json::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.ledger, LedgerBackend::Json);
        assert_eq!(config.page_delay(), IngestConfig::PAGE_DELAY);
        assert_eq!(config.retry.max_attempts, NetworkConfig::MAX_ATTEMPTS);

        let models = config.source("models").unwrap();
        assert!(models.enabled);
        assert_eq!(models.tag_policy, TagPolicy::AppendOnly);
        assert_eq!(models.schedule, ScheduleConfig::IntervalSecs(3600));
        assert_eq!(models.filters.get("sort").map(String::as_str), Some("Newest"));

        let workflows = config.source("workflows").unwrap();
        assert!(!workflows.enabled);
        assert_eq!(workflows.tag_policy, TagPolicy::Reconcile);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/harvest/harvester.sqlite"));
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let mut config: HarvesterConfig = serde_json::from_str(SAMPLE).unwrap();
        config.sources[1].name = "models".into();
        assert!(matches!(
            config.validate(),
            Err(HarvestError::Validation { .. })
        ));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let mut config: HarvesterConfig = serde_json::from_str(SAMPLE).unwrap();
        config.sources[1].schedule = ScheduleConfig::Cron("every tuesday".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_pages_rejected() {
        let mut config: HarvesterConfig = serde_json::from_str(SAMPLE).unwrap();
        config.sources[0].max_pages = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = HarvesterConfig::load(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(HarvestError::Config { .. })));
    }
}
