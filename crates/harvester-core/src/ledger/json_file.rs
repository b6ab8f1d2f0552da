//! File-backed run ledger for development and tests.
//!
//! The whole ledger is one JSON document held in memory behind a mutex. Every
//! mutation is applied to a copy, written atomically, and only then swapped in,
//! so the claim check-and-insert happens under one lock and a failed write
//! leaves the previous state intact. The lock is per instance: two
//! `JsonFileLedger`s over the same file do not coordinate.
//!
//! Each mutation serializes the whole document, including every past run, and
//! `record_outcome` is one mutation per record. Write cost therefore grows with
//! ledger history times records ingested. Use [`super::SqliteLedger`] for
//! long-lived or high-volume sources.

use super::{check_transition, not_running, RunLedger};
use crate::atomic::{read_json, write_json};
use crate::error::{HarvestError, Result};
use crate::models::{ClaimOutcome, FetchRun, RecordOutcome, RunFailure, RunStatus, Source};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDoc {
    #[serde(default)]
    sources: Vec<Source>,
    /// Runs in claim order.
    #[serde(default)]
    runs: Vec<FetchRun>,
}

impl LedgerDoc {
    fn run_mut(&mut self, run_id: &str) -> Result<&mut FetchRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| HarvestError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    fn runs_of<'a>(&'a self, source_name: &'a str) -> impl Iterator<Item = &'a FetchRun> + 'a {
        // Newest first: later claims sort after earlier ones.
        self.runs
            .iter()
            .rev()
            .filter(move |r| r.source_name == source_name)
    }

    fn transition(
        &mut self,
        run_id: &str,
        to: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<FetchRun> {
        let run = self.run_mut(run_id)?;
        check_transition(run_id, run.status, to)?;
        run.status = to;
        if to.is_terminal() {
            run.completed_at = Some(Utc::now());
            run.error_message = failure.map(|f| f.message.clone());
            run.error_detail = failure.and_then(|f| f.detail.clone());
        }
        Ok(run.clone())
    }
}

/// [`RunLedger`] persisted to a single JSON file.
pub struct JsonFileLedger {
    path: PathBuf,
    doc: Mutex<LedgerDoc>,
}

impl JsonFileLedger {
    /// Open the ledger at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc: LedgerDoc = read_json(&path)?.unwrap_or_default();
        debug!(
            "Loaded JSON ledger {} with {} runs",
            path.display(),
            doc.runs.len()
        );
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerDoc>> {
        self.doc
            .lock()
            .map_err(|e| HarvestError::Other(format!("Failed to lock JSON ledger: {}", e)))
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut LedgerDoc) -> Result<T>) -> Result<T> {
        let mut doc = self.lock()?;
        let mut next = doc.clone();
        let value = apply(&mut next)?;
        write_json(&self.path, &next)?;
        *doc = next;
        Ok(value)
    }
}

impl RunLedger for JsonFileLedger {
    fn ensure_source(&self, name: &str) -> Result<Source> {
        if let Some(source) = self.lock()?.sources.iter().find(|s| s.name == name) {
            return Ok(source.clone());
        }
        self.mutate(|doc| {
            if let Some(source) = doc.sources.iter().find(|s| s.name == name) {
                return Ok(source.clone());
            }
            let source = Source {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            doc.sources.push(source.clone());
            Ok(source)
        })
    }

    fn claim(
        &self,
        source: &Source,
        parameters: Option<Value>,
        cursor: Option<String>,
    ) -> Result<ClaimOutcome> {
        let mut doc = self.lock()?;
        if let Some(active) = doc
            .runs
            .iter()
            .find(|r| r.source_id == source.id && r.status.is_active())
        {
            debug!(
                "Claim for {} skipped, active run {}",
                source.name, active.id
            );
            return Ok(ClaimOutcome::Skipped {
                active_run_id: Some(active.id.clone()),
            });
        }

        let run = FetchRun {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            status: RunStatus::Queued,
            started_at: Utc::now(),
            completed_at: None,
            counts: Default::default(),
            cursor,
            error_message: None,
            error_detail: None,
            parameters,
        };
        let mut next = doc.clone();
        next.runs.push(run.clone());
        write_json(&self.path, &next)?;
        *doc = next;

        debug!("Claimed {} with run {}", source.name, run.id);
        Ok(ClaimOutcome::Claimed(run))
    }

    fn mark_running(&self, run_id: &str) -> Result<FetchRun> {
        self.mutate(|doc| doc.transition(run_id, RunStatus::Running, None))
    }

    fn record_outcome(&self, run_id: &str, outcome: RecordOutcome) -> Result<()> {
        self.mutate(|doc| {
            let run = doc.run_mut(run_id)?;
            if run.status != RunStatus::Running {
                return Err(not_running(run_id, run.status));
            }
            run.counts.record(outcome);
            Ok(())
        })
    }

    fn record_cursor(&self, run_id: &str, cursor: &str) -> Result<()> {
        self.mutate(|doc| {
            let run = doc.run_mut(run_id)?;
            if run.status != RunStatus::Running {
                return Err(not_running(run_id, run.status));
            }
            run.cursor = Some(cursor.to_string());
            Ok(())
        })
    }

    fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<FetchRun> {
        let run = self.mutate(|doc| {
            if !status.is_terminal() {
                let from = doc.run_mut(run_id)?.status;
                return Err(HarvestError::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: from.to_string(),
                    to: status.to_string(),
                });
            }
            doc.transition(run_id, status, failure)
        })?;
        info!(
            "Fetch run {} for {} finalized as {} ({} fetched)",
            run.id, run.source_name, run.status, run.counts.fetched
        );
        Ok(run)
    }

    fn get(&self, run_id: &str) -> Result<Option<FetchRun>> {
        Ok(self.lock()?.runs.iter().find(|r| r.id == run_id).cloned())
    }

    fn latest_run(&self, source_name: &str) -> Result<Option<FetchRun>> {
        Ok(self.lock()?.runs_of(source_name).next().cloned())
    }

    fn has_running(&self, source_name: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .runs_of(source_name)
            .any(|r| r.status.is_active()))
    }

    fn list_runs(&self, source_name: &str, limit: usize) -> Result<Vec<FetchRun>> {
        Ok(self
            .lock()?
            .runs_of(source_name)
            .take(limit)
            .cloned()
            .collect())
    }

    fn fail_orphaned_runs(&self, message: &str) -> Result<Vec<FetchRun>> {
        let failure = RunFailure::new(message);
        let failed = self.mutate(|doc| {
            let orphan_ids: Vec<String> = doc
                .runs
                .iter()
                .filter(|r| r.status.is_active())
                .map(|r| r.id.clone())
                .collect();
            orphan_ids
                .iter()
                .map(|id| doc.transition(id, RunStatus::Failed, Some(&failure)))
                .collect::<Result<Vec<_>>>()
        })?;
        for run in &failed {
            warn!("Failed orphaned run {} for {}", run.id, run.source_name);
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> JsonFileLedger {
        JsonFileLedger::open(dir.path().join("fetch_runs.json")).unwrap()
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        conformance::claim_is_exclusive(&ledger(&dir));
    }

    #[test]
    fn test_counts_and_cursor() {
        let dir = TempDir::new().unwrap();
        conformance::counts_and_cursor(&ledger(&dir));
    }

    #[test]
    fn test_terminal_runs_are_immutable() {
        let dir = TempDir::new().unwrap();
        conformance::terminal_runs_are_immutable(&ledger(&dir));
    }

    #[test]
    fn test_history_and_orphans() {
        let dir = TempDir::new().unwrap();
        conformance::history_and_orphans(&ledger(&dir));
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let dir = TempDir::new().unwrap();
        let shared: Arc<dyn RunLedger> = Arc::new(ledger(&dir));
        conformance::concurrent_claims_are_exclusive(vec![shared]);
    }

    #[test]
    fn test_state_is_persisted() {
        let dir = TempDir::new().unwrap();
        let run_id = {
            let ledger = ledger(&dir);
            let source = ledger.ensure_source("models").unwrap();
            let ClaimOutcome::Claimed(run) = ledger.claim(&source, None, None).unwrap() else {
                panic!("claim failed");
            };
            ledger.mark_running(&run.id).unwrap();
            ledger
                .record_outcome(&run.id, RecordOutcome::Created)
                .unwrap();
            run.id
        };

        let reopened = ledger(&dir);
        let run = reopened.get(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.counts.created, 1);
        assert!(reopened.has_running("models").unwrap());
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("ledger");
        let ledger = JsonFileLedger::open(parent.join("fetch_runs.json")).unwrap();
        let source = ledger.ensure_source("models").unwrap();
        let ClaimOutcome::Claimed(run) = ledger.claim(&source, None, None).unwrap() else {
            panic!("claim failed");
        };
        ledger.mark_running(&run.id).unwrap();
        ledger.record_outcome(&run.id, RecordOutcome::Created).unwrap();

        // A file where the directory was makes every later write fail.
        std::fs::remove_dir_all(&parent).unwrap();
        std::fs::write(&parent, b"").unwrap();

        assert!(ledger.record_outcome(&run.id, RecordOutcome::Created).is_err());
        let current = ledger.get(&run.id).unwrap().unwrap();
        assert_eq!(current.counts.created, 1);
        assert_eq!(current.counts.fetched, 1);
    }
}
