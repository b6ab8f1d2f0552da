//! No-overlap scheduler.
//!
//! Owns one tokio task per scheduled source. Each task sleeps until the next
//! fire time of its schedule and then triggers an ingestion run. The ledger
//! claim guarantees at most one active run per source, whether the trigger
//! comes from the schedule, a manual call, or another process sharing the
//! database.

use crate::cancel::CancellationToken;
use crate::config::{IngestConfig, ScheduleConfig};
use crate::error::{HarvestError, Result};
use crate::ledger::RunLedger;
use crate::models::{ClaimOutcome, FetchRun, RunStatus};
use crate::pipeline::{IngestionPipeline, SourceBinding};
use crate::store::CatalogStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// When a source fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        match config {
            ScheduleConfig::IntervalSecs(0) => Err(HarvestError::Config {
                message: "interval_secs must be greater than zero".into(),
            }),
            ScheduleConfig::IntervalSecs(secs) => Ok(Schedule::Interval(Duration::from_secs(*secs))),
            ScheduleConfig::Cron(expr) => cron::Schedule::from_str(expr)
                .map(|schedule| Schedule::Cron(Box::new(schedule)))
                .map_err(|e| HarvestError::Config {
                    message: format!("invalid cron expression '{}': {}", expr, e),
                }),
        }
    }

    /// Time to wait from `now` until the next fire, if there is one.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Interval(every) => Some(*every),
            Schedule::Cron(schedule) => schedule
                .after(&now)
                .next()
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

/// A source registered with the scheduler. Sources without a schedule can
/// only be triggered manually.
pub struct ScheduledSource {
    pub binding: Arc<SourceBinding>,
    pub schedule: Option<Schedule>,
}

/// Lifecycle notifications published on the scheduler's broadcast channel.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started { run_id: String, source: String },
    Skipped {
        source: String,
        active_run_id: Option<String>,
    },
    Finished(FetchRun),
}

/// Result of [`HarvestScheduler::trigger_ingestion`].
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    /// A run was claimed and driven to a terminal status.
    Finished(FetchRun),
    /// The source already had an active run; nothing was changed.
    Skipped {
        source: String,
        active_run_id: Option<String>,
    },
}

impl TriggerOutcome {
    pub fn run(&self) -> Option<&FetchRun> {
        match self {
            TriggerOutcome::Finished(run) => Some(run),
            TriggerOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TriggerOutcome::Skipped { .. })
    }
}

struct Inner {
    ledger: Arc<dyn RunLedger>,
    pipeline: IngestionPipeline,
    sources: BTreeMap<String, ScheduledSource>,
    /// Cancellation tokens of runs executing in this process, by run id.
    active: Mutex<HashMap<String, CancellationToken>>,
    events: broadcast::Sender<RunEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Removes a run's token from the active map when the run future ends or is dropped.
struct ActiveRunGuard<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    run_id: String,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        lock_recover(self.active).remove(&self.run_id);
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Schedules and serializes ingestion runs per source.
#[derive(Clone)]
pub struct HarvestScheduler {
    inner: Arc<Inner>,
}

impl HarvestScheduler {
    pub fn new(
        ledger: Arc<dyn RunLedger>,
        store: Arc<dyn CatalogStore>,
        sources: Vec<ScheduledSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(IngestConfig::EVENT_CHANNEL_CAPACITY);
        let sources = sources
            .into_iter()
            .map(|s| (s.binding.name().to_string(), s))
            .collect();
        Self {
            inner: Arc::new(Inner {
                pipeline: IngestionPipeline::new(ledger.clone(), store),
                ledger,
                sources,
                active: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Names of all registered sources.
    pub fn source_names(&self) -> Vec<String> {
        self.inner.sources.keys().cloned().collect()
    }

    /// Subscribe to run lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Recover orphaned runs and spawn one task per scheduled source.
    pub fn start(&self) -> Result<()> {
        let mut tasks = lock_recover(&self.inner.tasks);
        if !tasks.is_empty() {
            warn!("Harvest scheduler already started");
            return Ok(());
        }

        let orphans = self
            .inner
            .ledger
            .fail_orphaned_runs(IngestConfig::ORPHANED_MESSAGE)?;
        if !orphans.is_empty() {
            warn!("Recovered {} orphaned fetch run(s)", orphans.len());
        }

        for (name, scheduled) in &self.inner.sources {
            let Some(schedule) = scheduled.schedule.clone() else {
                debug!("{} has no schedule, manual trigger only", name);
                continue;
            };
            let scheduler = self.clone();
            let name = name.clone();
            tasks.push(tokio::spawn(async move {
                scheduler.source_loop(name, schedule).await
            }));
        }

        info!(
            "Harvest scheduler started with {} scheduled source(s)",
            tasks.len()
        );
        Ok(())
    }

    async fn source_loop(self, name: String, schedule: Schedule) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let Some(delay) = schedule.next_delay(Utc::now()) else {
                warn!("Schedule for {} has no upcoming fire time", name);
                break;
            };
            debug!("Next run of {} in {:?}", name, delay);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.trigger_ingestion(&name).await {
                Ok(TriggerOutcome::Finished(run)) => debug!(
                    "Scheduled run {} of {} ended {}",
                    run.id, name, run.status
                ),
                Ok(TriggerOutcome::Skipped { .. }) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => error!("Scheduled run of {} failed: {}", name, e),
            }
        }
        debug!("Scheduler loop for {} stopped", name);
    }

    /// Claim `source_name` and run ingestion to completion.
    ///
    /// Returns [`TriggerOutcome::Skipped`] without side effects if the source
    /// already has a Queued or Running run.
    pub async fn trigger_ingestion(&self, source_name: &str) -> Result<TriggerOutcome> {
        let binding = self
            .inner
            .sources
            .get(source_name)
            .map(|s| s.binding.clone())
            .ok_or_else(|| HarvestError::UnknownSource(source_name.to_string()))?;
        if self.inner.shutdown.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let cursor = self.resume_cursor(&binding)?;
        let claim = self.inner.ledger.claim(
            &binding.source,
            Some(binding.settings.parameters()),
            cursor,
        )?;
        let run = match claim {
            ClaimOutcome::Claimed(run) => run,
            ClaimOutcome::Skipped { active_run_id } => {
                info!(
                    "Skipping {}: run {:?} is already active",
                    source_name, active_run_id
                );
                let _ = self.inner.events.send(RunEvent::Skipped {
                    source: source_name.to_string(),
                    active_run_id: active_run_id.clone(),
                });
                return Ok(TriggerOutcome::Skipped {
                    source: source_name.to_string(),
                    active_run_id,
                });
            }
        };

        let token = CancellationToken::new();
        lock_recover(&self.inner.active).insert(run.id.clone(), token.clone());
        let _guard = ActiveRunGuard {
            active: &self.inner.active,
            run_id: run.id.clone(),
        };
        // Shutdown may have swept the active map before this run was registered.
        if self.inner.shutdown.is_cancelled() {
            token.cancel();
        }

        let _ = self.inner.events.send(RunEvent::Started {
            run_id: run.id.clone(),
            source: source_name.to_string(),
        });

        let finished = self.inner.pipeline.execute(&binding, run, &token).await?;
        let _ = self.inner.events.send(RunEvent::Finished(finished.clone()));
        Ok(TriggerOutcome::Finished(finished))
    }

    fn resume_cursor(&self, binding: &SourceBinding) -> Result<Option<String>> {
        if !binding.settings.resume_from_cursor {
            return Ok(None);
        }
        let cursor = self
            .inner
            .ledger
            .latest_run(binding.name())?
            .filter(|run| matches!(run.status, RunStatus::Failed | RunStatus::Cancelled))
            .and_then(|run| run.cursor);
        if let Some(cursor) = &cursor {
            info!("Resuming {} from cursor {}", binding.name(), cursor);
        }
        Ok(cursor)
    }

    /// Request cancellation of a run executing in this process.
    ///
    /// Returns false if no such run is active here.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match lock_recover(&self.inner.active).get(run_id) {
            Some(token) => {
                info!("Cancelling fetch run {}", run_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop scheduling, cancel active runs, and wait for the source tasks to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down harvest scheduler");
        self.inner.shutdown.cancel();
        for token in lock_recover(&self.inner.active).values() {
            token.cancel();
        }

        let tasks = std::mem::take(&mut *lock_recover(&self.inner.tasks));
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Harvest scheduler stopped");
    }

    pub fn latest_run(&self, source_name: &str) -> Result<Option<FetchRun>> {
        self.inner.ledger.latest_run(source_name)
    }

    pub fn has_running(&self, source_name: &str) -> Result<bool> {
        self.inner.ledger.has_running(source_name)
    }

    pub fn list_runs(&self, source_name: &str, limit: usize) -> Result<Vec<FetchRun>> {
        self.inner.ledger.list_runs(source_name, limit)
    }
}
