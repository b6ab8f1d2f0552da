//! Fetch-run ledger: the audit record of every ingestion attempt.
//!
//! The ledger owns the per-source claim. Creating a run in `Queued` is the
//! claim and is a single atomic operation in each backend; a terminal status
//! releases it.

mod json_file;
mod sqlite;

pub use json_file::JsonFileLedger;
pub use sqlite::SqliteLedger;

use crate::error::{HarvestError, Result};
use crate::models::{ClaimOutcome, FetchRun, RecordOutcome, RunFailure, RunStatus, Source};
use serde_json::Value;

/// Persistent run history with an atomic per-source claim.
pub trait RunLedger: Send + Sync {
    /// Get or create the source with this name.
    fn ensure_source(&self, name: &str) -> Result<Source>;

    /// Create a `Queued` run for `source` unless one is already Queued or Running.
    fn claim(
        &self,
        source: &Source,
        parameters: Option<Value>,
        cursor: Option<String>,
    ) -> Result<ClaimOutcome>;

    /// `Queued -> Running`.
    fn mark_running(&self, run_id: &str) -> Result<FetchRun>;

    /// Increment `fetched` and exactly one outcome bucket in one write.
    fn record_outcome(&self, run_id: &str, outcome: RecordOutcome) -> Result<()>;

    /// Store the token of the page just fetched.
    fn record_cursor(&self, run_id: &str, cursor: &str) -> Result<()>;

    /// Move the run to a terminal status, stamping `completed_at`.
    fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<FetchRun>;

    fn get(&self, run_id: &str) -> Result<Option<FetchRun>>;

    /// Most recently started run of the named source.
    fn latest_run(&self, source_name: &str) -> Result<Option<FetchRun>>;

    /// Whether the named source has a Queued or Running run.
    fn has_running(&self, source_name: &str) -> Result<bool>;

    /// Runs of the named source, newest first.
    fn list_runs(&self, source_name: &str, limit: usize) -> Result<Vec<FetchRun>>;

    /// Fail every Queued or Running run. Used at startup to release claims
    /// left behind by a process that exited mid-run.
    fn fail_orphaned_runs(&self, message: &str) -> Result<Vec<FetchRun>>;
}

/// Check a status change against the run state machine.
pub(crate) fn check_transition(run_id: &str, from: RunStatus, to: RunStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(HarvestError::InvalidTransition {
            run_id: run_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub(crate) fn not_running(run_id: &str, status: RunStatus) -> HarvestError {
    HarvestError::Validation {
        field: "status".into(),
        message: format!("fetch run {} is {}, not running", run_id, status),
    }
}

/// Behavior every ledger backend must share.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use std::sync::{Arc, Barrier};

    const RACERS: usize = 8;

    /// Release `RACERS` threads at once, each claiming the same source through
    /// `ledgers[i % ledgers.len()]`. Exactly one claim may win.
    pub fn concurrent_claims_are_exclusive(ledgers: Vec<Arc<dyn RunLedger>>) {
        let source = ledgers[0].ensure_source("models").unwrap();
        let barrier = Arc::new(Barrier::new(RACERS));

        let handles: Vec<_> = (0..RACERS)
            .map(|i| {
                let ledger = ledgers[i % ledgers.len()].clone();
                let barrier = barrier.clone();
                let source = source.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.claim(&source, None, None).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<ClaimOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let claimed: Vec<&FetchRun> = outcomes
            .iter()
            .filter_map(|o| match o {
                ClaimOutcome::Claimed(run) => Some(run),
                ClaimOutcome::Skipped { .. } => None,
            })
            .collect();
        assert_eq!(claimed.len(), 1, "outcomes: {:?}", outcomes);
        for outcome in &outcomes {
            if let ClaimOutcome::Skipped { active_run_id } = outcome {
                assert_eq!(active_run_id.as_deref(), Some(claimed[0].id.as_str()));
            }
        }

        for ledger in &ledgers {
            let runs = ledger.list_runs("models", 100).unwrap();
            assert_eq!(runs.len(), 1);
            assert_eq!(runs.iter().filter(|r| r.status.is_active()).count(), 1);
        }
    }

    pub fn claim_is_exclusive(ledger: &dyn RunLedger) {
        let source = ledger.ensure_source("models").unwrap();
        let first = match ledger.claim(&source, None, None).unwrap() {
            ClaimOutcome::Claimed(run) => run,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(first.status, RunStatus::Queued);
        assert!(ledger.has_running("models").unwrap());

        match ledger.claim(&source, None, None).unwrap() {
            ClaimOutcome::Skipped { active_run_id } => {
                assert_eq!(active_run_id.as_deref(), Some(first.id.as_str()))
            }
            other => panic!("expected skip, got {:?}", other),
        }

        ledger.mark_running(&first.id).unwrap();
        ledger
            .finalize(&first.id, RunStatus::Completed, None)
            .unwrap();
        assert!(!ledger.has_running("models").unwrap());
        assert!(matches!(
            ledger.claim(&source, None, None).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    pub fn counts_and_cursor(ledger: &dyn RunLedger) {
        let source = ledger.ensure_source("posts").unwrap();
        let ClaimOutcome::Claimed(run) = ledger.claim(&source, None, None).unwrap() else {
            panic!("claim failed");
        };
        assert!(ledger.record_outcome(&run.id, RecordOutcome::Created).is_err());

        ledger.mark_running(&run.id).unwrap();
        for outcome in [
            RecordOutcome::Created,
            RecordOutcome::Created,
            RecordOutcome::Updated,
            RecordOutcome::NoOp,
            RecordOutcome::Error,
        ] {
            ledger.record_outcome(&run.id, outcome).unwrap();
        }
        ledger.record_cursor(&run.id, "7").unwrap();

        let done = ledger
            .finalize(&run.id, RunStatus::Completed, None)
            .unwrap();
        assert_eq!(done.counts.fetched, 5);
        assert_eq!(done.counts.created, 2);
        assert_eq!(done.counts.error, 1);
        assert!(done.counts.is_closed());
        assert_eq!(done.cursor.as_deref(), Some("7"));
        assert!(done.completed_at.is_some());
        assert!(done.duration().is_some());
    }

    pub fn terminal_runs_are_immutable(ledger: &dyn RunLedger) {
        let source = ledger.ensure_source("workflows").unwrap();
        let ClaimOutcome::Claimed(run) = ledger.claim(&source, None, None).unwrap() else {
            panic!("claim failed");
        };

        assert!(matches!(
            ledger.finalize(&run.id, RunStatus::Completed, None),
            Err(HarvestError::InvalidTransition { .. })
        ));

        let failure = RunFailure {
            message: "boom".into(),
            detail: Some("Upstream { status: 500 }".into()),
        };
        let failed = ledger
            .finalize(&run.id, RunStatus::Failed, Some(&failure))
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.error_detail.is_some());

        assert!(matches!(
            ledger.mark_running(&run.id),
            Err(HarvestError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ledger.finalize(&run.id, RunStatus::Cancelled, None),
            Err(HarvestError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ledger.mark_running("missing"),
            Err(HarvestError::RunNotFound { .. })
        ));
    }

    pub fn history_and_orphans(ledger: &dyn RunLedger) {
        let a = ledger.ensure_source("a").unwrap();
        let b = ledger.ensure_source("b").unwrap();
        assert_eq!(ledger.ensure_source("a").unwrap().id, a.id);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let ClaimOutcome::Claimed(run) = ledger
                .claim(&a, Some(serde_json::json!({"max_pages": 2})), None)
                .unwrap()
            else {
                panic!("claim failed");
            };
            ledger.mark_running(&run.id).unwrap();
            ledger.finalize(&run.id, RunStatus::Completed, None).unwrap();
            ids.push(run.id);
        }
        let ClaimOutcome::Claimed(orphan) = ledger.claim(&b, None, Some("4".into())).unwrap()
        else {
            panic!("claim failed");
        };
        ledger.mark_running(&orphan.id).unwrap();

        let runs = ledger.list_runs("a", 2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
        assert_eq!(
            runs[0].parameters,
            Some(serde_json::json!({"max_pages": 2}))
        );
        assert_eq!(ledger.latest_run("a").unwrap().unwrap().id, ids[2]);
        assert!(ledger.latest_run("unknown").unwrap().is_none());

        let failed = ledger.fail_orphaned_runs("abandoned").unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, orphan.id);
        assert_eq!(failed[0].status, RunStatus::Failed);
        assert_eq!(failed[0].cursor.as_deref(), Some("4"));
        assert!(!ledger.has_running("b").unwrap());
    }
}
