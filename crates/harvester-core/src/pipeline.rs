//! The ingestion pipeline: one run of one source.
//!
//! Moves a claimed run to Running, walks the connector, maps and upserts each
//! record, counts outcomes in the ledger, and finalizes the run. Per-record
//! mapping and persistence errors are counted and skipped; only page-fetch
//! failures, ledger failures and cancellation end the run early.

use crate::cancel::CancellationToken;
use crate::config::IngestConfig;
use crate::connector::{Filters, RawRecord, SourceConnector};
use crate::error::Result;
use crate::ledger::RunLedger;
use crate::mapper::EntityMapper;
use crate::models::{FetchRun, RecordOutcome, RunFailure, RunStatus, Source, TagPolicy};
use crate::resilience::ResiliencePolicy;
use crate::store::CatalogStore;
use crate::walker::{PageWalker, WalkOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-source ingestion settings.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub tag_policy: TagPolicy,
    pub max_pages: Option<u32>,
    pub filters: Filters,
    pub page_delay: Duration,
    /// Seed new runs with the cursor of a failed or cancelled previous run.
    pub resume_from_cursor: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            tag_policy: TagPolicy::default(),
            max_pages: None,
            filters: Filters::new(),
            page_delay: IngestConfig::PAGE_DELAY,
            resume_from_cursor: false,
        }
    }
}

impl IngestSettings {
    /// Parameters recorded on each run.
    pub fn parameters(&self) -> Value {
        json!({
            "filters": self.filters,
            "max_pages": self.max_pages,
            "tag_policy": self.tag_policy,
        })
    }
}

/// Everything needed to ingest one source.
pub struct SourceBinding {
    pub source: Source,
    pub connector: Arc<dyn SourceConnector>,
    pub mapper: Arc<dyn EntityMapper>,
    pub policy: Arc<ResiliencePolicy>,
    pub settings: IngestSettings,
}

impl SourceBinding {
    pub fn name(&self) -> &str {
        &self.source.name
    }
}

#[derive(Debug, Default)]
struct Progress {
    pages: u32,
}

/// Executes claimed runs against a ledger and a catalog store.
#[derive(Clone)]
pub struct IngestionPipeline {
    ledger: Arc<dyn RunLedger>,
    store: Arc<dyn CatalogStore>,
}

impl IngestionPipeline {
    pub fn new(ledger: Arc<dyn RunLedger>, store: Arc<dyn CatalogStore>) -> Self {
        Self { ledger, store }
    }

    /// Run a claimed (Queued) run to a terminal status.
    ///
    /// The returned run is terminal unless the ledger itself failed, in which
    /// case the ledger error is returned.
    pub async fn execute(
        &self,
        binding: &SourceBinding,
        run: FetchRun,
        cancel: &CancellationToken,
    ) -> Result<FetchRun> {
        let run = match self.ledger.mark_running(&run.id) {
            Ok(run) => run,
            Err(e) => {
                error!("Failed to start run {} for {}: {}", run.id, binding.name(), e);
                if let Err(finalize_err) =
                    self.ledger
                        .finalize(&run.id, RunStatus::Failed, Some(&RunFailure::from(&e)))
                {
                    error!(
                        "Failed to finalize run {} for {}, claim held until orphan recovery: {}",
                        run.id,
                        binding.name(),
                        finalize_err
                    );
                }
                return Err(e);
            }
        };
        info!(
            "Fetch run {} for {} started (cursor: {:?})",
            run.id,
            binding.name(),
            run.cursor
        );

        let mut progress = Progress::default();
        let result = self.ingest(binding, &run, cancel, &mut progress).await;

        let (status, failure) = match &result {
            Ok(()) => (RunStatus::Completed, None),
            Err(e) if e.is_cancelled() => {
                info!(
                    "Fetch run {} for {} cancelled after {} page(s)",
                    run.id,
                    binding.name(),
                    progress.pages
                );
                (
                    RunStatus::Cancelled,
                    Some(RunFailure {
                        message: IngestConfig::CANCELLED_MESSAGE.to_string(),
                        detail: Some(format!(
                            "Cancellation requested after {} page(s)",
                            progress.pages
                        )),
                    }),
                )
            }
            Err(e) => {
                error!(
                    "Fetch run {} for {} failed after {} page(s): {}",
                    run.id,
                    binding.name(),
                    progress.pages,
                    e
                );
                (RunStatus::Failed, Some(RunFailure::from(e)))
            }
        };

        self.ledger.finalize(&run.id, status, failure.as_ref())
    }

    async fn ingest(
        &self,
        binding: &SourceBinding,
        run: &FetchRun,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<()> {
        let mut walker = PageWalker::new(
            binding.connector.clone(),
            binding.policy.clone(),
            cancel.clone(),
            WalkOptions {
                start_token: run.cursor.clone(),
                max_pages: binding.settings.max_pages,
                page_delay: binding.settings.page_delay,
                filters: binding.settings.filters.clone(),
            },
        );

        while let Some(page) = walker.next_page().await? {
            progress.pages += 1;
            self.ledger.record_cursor(&run.id, &page.token)?;
            // Either the whole page is processed or none of it.
            cancel.check()?;

            debug!(
                "Run {}: page {} with {} record(s)",
                run.id,
                page.token,
                page.records.len()
            );
            for record in &page.records {
                let outcome = self.process_record(binding, run, record);
                self.ledger.record_outcome(&run.id, outcome)?;
            }
        }
        Ok(())
    }

    fn process_record(
        &self,
        binding: &SourceBinding,
        run: &FetchRun,
        record: &RawRecord,
    ) -> RecordOutcome {
        let value = match record {
            RawRecord::Item(value) => value,
            RawRecord::Invalid {
                external_id,
                message,
            } => {
                warn!(
                    "Run {}: skipping unreadable record {:?}: {}",
                    run.id, external_id, message
                );
                return RecordOutcome::Error;
            }
        };

        let result = binding.mapper.map(value).and_then(|draft| {
            self.store
                .upsert_entity(&binding.source.id, &draft, binding.settings.tag_policy)
        });

        match result {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                let external_id = binding.mapper.external_id(value).ok();
                warn!(
                    "Run {}: record {:?} from {} failed: {}",
                    run.id,
                    external_id,
                    binding.name(),
                    e
                );
                RecordOutcome::Error
            }
        }
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Page;
    use crate::error::HarvestError;
    use crate::ledger::SqliteLedger;
    use crate::mapper::JsonMapper;
    use crate::models::ClaimOutcome;
    use crate::resilience::{CircuitBreakerConfig, RetryConfig};
    use crate::store::SqliteCatalogStore;
    use async_trait::async_trait;

    /// Ledger whose status writes always fail.
    struct BrokenWrites(SqliteLedger);

    fn write_failure() -> HarvestError {
        HarvestError::Other("disk full".into())
    }

    impl RunLedger for BrokenWrites {
        fn ensure_source(&self, name: &str) -> Result<Source> {
            self.0.ensure_source(name)
        }
        fn claim(
            &self,
            source: &Source,
            parameters: Option<Value>,
            cursor: Option<String>,
        ) -> Result<ClaimOutcome> {
            self.0.claim(source, parameters, cursor)
        }
        fn mark_running(&self, _run_id: &str) -> Result<FetchRun> {
            Err(write_failure())
        }
        fn record_outcome(&self, run_id: &str, outcome: RecordOutcome) -> Result<()> {
            self.0.record_outcome(run_id, outcome)
        }
        fn record_cursor(&self, run_id: &str, cursor: &str) -> Result<()> {
            self.0.record_cursor(run_id, cursor)
        }
        fn finalize(
            &self,
            _run_id: &str,
            _status: RunStatus,
            _failure: Option<&RunFailure>,
        ) -> Result<FetchRun> {
            Err(write_failure())
        }
        fn get(&self, run_id: &str) -> Result<Option<FetchRun>> {
            self.0.get(run_id)
        }
        fn latest_run(&self, source_name: &str) -> Result<Option<FetchRun>> {
            self.0.latest_run(source_name)
        }
        fn has_running(&self, source_name: &str) -> Result<bool> {
            self.0.has_running(source_name)
        }
        fn list_runs(&self, source_name: &str, limit: usize) -> Result<Vec<FetchRun>> {
            self.0.list_runs(source_name, limit)
        }
        fn fail_orphaned_runs(&self, message: &str) -> Result<Vec<FetchRun>> {
            self.0.fail_orphaned_runs(message)
        }
    }

    struct NeverCalled;

    #[async_trait]
    impl SourceConnector for NeverCalled {
        fn name(&self) -> &str {
            "never"
        }

        async fn fetch_page(&self, _token: Option<&str>, _filters: &Filters) -> Result<Page> {
            panic!("a run that never started must not fetch");
        }
    }

    #[tokio::test]
    async fn test_start_failure_returns_error_when_finalize_also_fails() {
        let ledger = Arc::new(BrokenWrites(SqliteLedger::in_memory().unwrap()));
        let source = ledger.ensure_source("models").unwrap();
        let ClaimOutcome::Claimed(run) = ledger.claim(&source, None, None).unwrap() else {
            panic!("claim failed");
        };
        let binding = SourceBinding {
            source,
            connector: Arc::new(NeverCalled),
            mapper: Arc::new(JsonMapper::default()),
            policy: Arc::new(ResiliencePolicy::new(
                "models",
                RetryConfig::new().with_max_attempts(1),
                CircuitBreakerConfig::default(),
            )),
            settings: IngestSettings::default(),
        };
        let pipeline = IngestionPipeline::new(
            ledger.clone(),
            Arc::new(SqliteCatalogStore::in_memory().unwrap()),
        );

        let result = pipeline
            .execute(&binding, run.clone(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HarvestError::Other(ref m)) if m == "disk full"));

        // The claim stays held for orphan recovery to release.
        assert_eq!(ledger.get(&run.id).unwrap().unwrap().status, RunStatus::Queued);
        let recovered = ledger.fail_orphaned_runs("abandoned").unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(!ledger.has_running("models").unwrap());
    }
}
