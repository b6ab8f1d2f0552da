//! Builder that wires a [`HarvestScheduler`] from a [`HarvesterConfig`].

use crate::config::{HarvesterConfig, LedgerBackend, SourceConfig};
use crate::connector::SourceConnector;
use crate::error::{HarvestError, Result};
use crate::ledger::{JsonFileLedger, RunLedger, SqliteLedger};
use crate::mapper::{EntityMapper, JsonMapper};
use crate::pipeline::{IngestSettings, SourceBinding};
use crate::resilience::ResiliencePolicy;
use crate::scheduler::{HarvestScheduler, Schedule, ScheduledSource};
use crate::store::{CatalogStore, SqliteCatalogStore};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for a configured harvester.
///
/// Connectors and mappers are built from the config file unless overridden by
/// source name. The ledger and catalog store default to files under
/// `data_dir`.
///
/// # Example
///
/// ```rust,ignore
/// use harvester_core::{HarvesterBuilder, HarvesterConfig};
///
/// let scheduler = HarvesterBuilder::new(HarvesterConfig::load(path)?).build()?;
/// scheduler.start()?;
/// ```
pub struct HarvesterBuilder {
    config: HarvesterConfig,
    connectors: HashMap<String, Arc<dyn SourceConnector>>,
    mappers: HashMap<String, Arc<dyn EntityMapper>>,
    ledger: Option<Arc<dyn RunLedger>>,
    store: Option<Arc<dyn CatalogStore>>,
}

impl HarvesterBuilder {
    pub fn new(config: HarvesterConfig) -> Self {
        Self {
            config,
            connectors: HashMap::new(),
            mappers: HashMap::new(),
            ledger: None,
            store: None,
        }
    }

    /// Load the config file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(HarvesterConfig::load(path.as_ref())?))
    }

    /// Use `connector` for the source named `source` instead of the configured one.
    pub fn with_connector(
        mut self,
        source: impl Into<String>,
        connector: Arc<dyn SourceConnector>,
    ) -> Self {
        self.connectors.insert(source.into(), connector);
        self
    }

    /// Use `mapper` for the source named `source` instead of a [`JsonMapper`].
    pub fn with_mapper(mut self, source: impl Into<String>, mapper: Arc<dyn EntityMapper>) -> Self {
        self.mappers.insert(source.into(), mapper);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CatalogStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn open_ledger(config: &HarvesterConfig) -> Result<Arc<dyn RunLedger>> {
        Ok(match config.ledger {
            LedgerBackend::Sqlite => Arc::new(SqliteLedger::open(config.database_path())?),
            LedgerBackend::Json => Arc::new(JsonFileLedger::open(config.ledger_path())?),
        })
    }

    fn bind_source(
        &self,
        ledger: &dyn RunLedger,
        source: &SourceConfig,
    ) -> Result<ScheduledSource> {
        let record = ledger.ensure_source(&source.name)?;
        let connector = match self.connectors.get(&source.name) {
            Some(connector) => connector.clone(),
            None => source.connector.build(&source.name)?,
        };
        let mapper: Arc<dyn EntityMapper> = match self.mappers.get(&source.name) {
            Some(mapper) => mapper.clone(),
            None => Arc::new(JsonMapper::new(source.mapper.clone())),
        };
        let policy = Arc::new(ResiliencePolicy::new(
            source.name.clone(),
            self.config.retry.to_retry_config(),
            self.config.circuit_breaker.to_breaker_config(),
        ));
        let schedule = if source.enabled {
            Some(Schedule::from_config(&source.schedule)?)
        } else {
            debug!("Source {} is disabled, manual trigger only", source.name);
            None
        };

        Ok(ScheduledSource {
            binding: Arc::new(SourceBinding {
                source: record,
                connector,
                mapper,
                policy,
                settings: IngestSettings {
                    tag_policy: source.tag_policy,
                    max_pages: source.max_pages,
                    filters: source.filters.clone(),
                    page_delay: self.config.page_delay(),
                    resume_from_cursor: source.resume_from_cursor,
                },
            }),
            schedule,
        })
    }

    /// Validate the config, open storage, and register every source.
    pub fn build(self) -> Result<HarvestScheduler> {
        self.config.validate()?;
        for name in self.connectors.keys().chain(self.mappers.keys()) {
            if self.config.source(name).is_none() {
                return Err(HarvestError::UnknownSource(name.clone()));
            }
        }

        if self.ledger.is_none() || self.store.is_none() {
            std::fs::create_dir_all(&self.config.data_dir)
                .map_err(|e| HarvestError::io_with_path(e, &self.config.data_dir))?;
        }
        let ledger = match &self.ledger {
            Some(ledger) => ledger.clone(),
            None => Self::open_ledger(&self.config)?,
        };
        let store: Arc<dyn CatalogStore> = match &self.store {
            Some(store) => store.clone(),
            None => Arc::new(SqliteCatalogStore::open(self.config.database_path())?),
        };

        let sources = self
            .config
            .sources
            .iter()
            .map(|source| self.bind_source(ledger.as_ref(), source))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Harvester configured with {} source(s), {:?} ledger at {}",
            sources.len(),
            self.config.ledger,
            self.config.data_dir.display()
        );
        Ok(HarvestScheduler::new(ledger, store, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::connector::{ConnectorConfig, WorkflowDirConfig};
    use crate::mapper::JsonMapperConfig;
    use crate::models::TagPolicy;
    use tempfile::TempDir;

    fn workflow_source(name: &str, dir: &Path, enabled: bool) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            enabled,
            schedule: ScheduleConfig::IntervalSecs(3600),
            connector: ConnectorConfig::WorkflowDir(WorkflowDirConfig::new(vec![dir.to_path_buf()])),
            mapper: JsonMapperConfig::default(),
            tag_policy: TagPolicy::default(),
            max_pages: None,
            filters: Default::default(),
            resume_from_cursor: false,
        }
    }

    #[test]
    fn test_build_creates_data_dir_and_registers_sources() {
        let dir = TempDir::new().unwrap();
        let config = HarvesterConfig {
            data_dir: dir.path().join("data"),
            sources: vec![
                workflow_source("workflows", dir.path(), true),
                workflow_source("archive", dir.path(), false),
            ],
            ..Default::default()
        };

        let scheduler = HarvesterBuilder::new(config).build().unwrap();
        assert!(dir.path().join("data").join("harvester.sqlite").exists());
        assert_eq!(scheduler.source_names(), vec!["archive", "workflows"]);
        assert!(!scheduler.has_running("workflows").unwrap());
    }

    #[test]
    fn test_json_ledger_backend() {
        let dir = TempDir::new().unwrap();
        let config = HarvesterConfig {
            data_dir: dir.path().to_path_buf(),
            ledger: LedgerBackend::Json,
            sources: vec![workflow_source("workflows", dir.path(), true)],
            ..Default::default()
        };
        HarvesterBuilder::new(config).build().unwrap();
        assert!(dir.path().join("fetch_runs.json").exists());
    }

    #[test]
    fn test_override_for_unknown_source_rejected() {
        let dir = TempDir::new().unwrap();
        let config = HarvesterConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let result = HarvesterBuilder::new(config)
            .with_mapper("ghost", Arc::new(JsonMapper::default()))
            .build();
        assert!(matches!(result, Err(HarvestError::UnknownSource(name)) if name == "ghost"));
    }
}
