//! Domain types shared by the ledger, the upsert engine and the scheduler.

use crate::error::HarvestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A named upstream system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a fetch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Queued and Running hold the per-source claim.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Queued, RunStatus::Running) => true,
            (RunStatus::Queued | RunStatus::Running, RunStatus::Failed | RunStatus::Cancelled) => {
                true
            }
            (RunStatus::Running, RunStatus::Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of upserting one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    NoOp,
}

/// Per-record outcome as counted by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Created,
    Updated,
    NoOp,
    Error,
}

impl From<UpsertOutcome> for RecordOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => RecordOutcome::Created,
            UpsertOutcome::Updated => RecordOutcome::Updated,
            UpsertOutcome::NoOp => RecordOutcome::NoOp,
        }
    }
}

/// Aggregate counters of a fetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub no_op: u64,
    pub error: u64,
}

impl RunCounts {
    /// Count one processed record.
    pub fn record(&mut self, outcome: RecordOutcome) {
        self.fetched += 1;
        match outcome {
            RecordOutcome::Created => self.created += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::NoOp => self.no_op += 1,
            RecordOutcome::Error => self.error += 1,
        }
    }

    /// `created + updated + no_op + error == fetched`
    pub fn is_closed(&self) -> bool {
        self.created + self.updated + self.no_op + self.error == self.fetched
    }
}

/// Message and detail captured when a run does not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub message: String,
    pub detail: Option<String>,
}

impl RunFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }
}

impl From<&HarvestError> for RunFailure {
    fn from(err: &HarvestError) -> Self {
        Self {
            message: err.to_string(),
            detail: Some(err.detail()),
        }
    }
}

/// One attempt to ingest from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRun {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub cursor: Option<String>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    /// Filters and limits the run was started with.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl FetchRun {
    /// Wall-clock duration of a finished run.
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// Summary of a run for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub source: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub counts: RunCounts,
    pub cursor: Option<String>,
    pub error_message: Option<String>,
}

impl From<&FetchRun> for RunReport {
    fn from(run: &FetchRun) -> Self {
        Self {
            run_id: run.id.clone(),
            source: run.source_name.clone(),
            status: run.status,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_secs: run.duration().map(|d| d.as_secs_f64()),
            counts: run.counts,
            cursor: run.cursor.clone(),
            error_message: run.error_message.clone(),
        }
    }
}

/// Result of an attempt to claim a source for a new run.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A new run was created in `Queued`.
    Claimed(FetchRun),
    /// Another run already holds the source.
    Skipped { active_run_id: Option<String> },
}

/// How tag links are reconciled for a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    /// Add missing links and remove links no longer present upstream.
    #[default]
    Reconcile,
    /// Only add links; never remove.
    AppendOnly,
}
