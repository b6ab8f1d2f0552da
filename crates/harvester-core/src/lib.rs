//! Harvester Core - Ingestion run coordinator for upstream catalogs.
//!
//! This crate schedules and executes fetch runs against paginated upstream
//! sources. Each run walks the source page by page through a retry and
//! circuit-breaker policy, maps raw records into catalog entities, and upserts
//! them idempotently. A run ledger records every attempt and guarantees that a
//! source never has two active runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvester_core::{HarvesterBuilder, TriggerOutcome};
//!
//! #[tokio::main]
//! async fn main() -> harvester_core::Result<()> {
//!     let scheduler = HarvesterBuilder::from_file("harvester.json")?.build()?;
//!
//!     // Run one source now
//!     if let TriggerOutcome::Finished(run) = scheduler.trigger_ingestion("models").await? {
//!         println!("{} fetched {} records", run.id, run.counts.fetched);
//!     }
//!
//!     // Or let the schedule drive every enabled source
//!     scheduler.start()?;
//!     tokio::signal::ctrl_c().await.ok();
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod cancel;
pub mod config;
pub mod connector;
pub mod error;
pub mod ledger;
pub mod mapper;
pub mod models;
pub mod pipeline;
pub mod resilience;
pub mod scheduler;
pub mod store;
pub mod walker;

mod builder;

// Re-export commonly used types
pub use builder::HarvesterBuilder;
pub use cancel::{CancellationToken, CancelledError};
pub use config::{HarvesterConfig, LedgerBackend, ScheduleConfig, SourceConfig};
pub use connector::{Filters, Page, RawRecord, SourceConnector};
pub use error::{HarvestError, Result};
pub use ledger::{JsonFileLedger, RunLedger, SqliteLedger};
pub use mapper::{ChildDraft, EntityDraft, EntityMapper, JsonMapper, TagDraft};
pub use models::{
    ClaimOutcome, FetchRun, RecordOutcome, RunCounts, RunFailure, RunReport, RunStatus, Source,
    TagPolicy, UpsertOutcome,
};
pub use pipeline::{IngestSettings, IngestionPipeline, SourceBinding};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, ResiliencePolicy, RetryConfig};
pub use scheduler::{HarvestScheduler, RunEvent, Schedule, ScheduledSource, TriggerOutcome};
pub use store::{CatalogStore, SqliteCatalogStore, StoredChild, StoredEntity};
pub use walker::{PageWalker, WalkOptions};
