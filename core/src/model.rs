//! Domain entities: Benchmark, Job, Output, NodeProfile, ReservedJobId.
//!
//! These are plain, strongly-typed structs. `_id` <-> [`bson::oid::ObjectId`]
//! conversion happens only at the [`crate::store::documents`] boundary;
//! nothing above that layer ever sees an `ObjectId`.

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scheduler state as reported by `squeue`/`scontrol`. Scheduler versions
/// disagree on whether `jobState` is scalar or list-valued; normalisation
/// always produces a `Vec`, so this type only needs to compare string
/// values against the fixed terminal-state vocabulary.
pub type SchedulerState = String;

pub const TERMINAL_STATES: &[&str] =
    &["COMPLETED", "CANCELLED", "FAILED", "TIMEOUT", "DEADLINE"];

/// Severity order for reducing a set of terminal job states to one
/// benchmark state. Index is severity; later wins ties.
const SEVERITY_ORDER: &[&str] = &["COMPLETED", "DEADLINE", "TIMEOUT", "CANCELLED", "FAILED"];

/// The benchmark-level state machine. `Pending` is the only initial state;
/// every other variant is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkState {
    Pending,
    Running,
    Done,
    Deadline,
    Timeout,
    Cancelled,
    Failed,
}

impl BenchmarkState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Maps one scheduler terminal state (`COMPLETED`, `DEADLINE`, ...) onto
    /// its benchmark-state label.
    fn from_scheduler_state(state: &str) -> Option<Self> {
        match state {
            "COMPLETED" => Some(Self::Done),
            "DEADLINE" => Some(Self::Deadline),
            "TIMEOUT" => Some(Self::Timeout),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Reduces a set of per-job terminal scheduler states to the single
    /// benchmark state of maximum severity, per `COMPLETED < DEADLINE <
    /// TIMEOUT < CANCELLED < FAILED`. Returns `None` if no job states are
    /// recognised terminal states (caller should treat this as `Pending`
    /// persisting, not a valid finalisation).
    pub fn max_severity(job_states: impl IntoIterator<Item = SchedulerState>) -> Option<Self> {
        job_states
            .into_iter()
            .filter_map(|s| SEVERITY_ORDER.iter().position(|t| *t == s))
            .max()
            .map(|idx| Self::from_scheduler_state(SEVERITY_ORDER[idx]).expect("index in range"))
    }
}

/// One user-visible benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub run_number: u64,
    pub issuer: Option<String>,
    pub name: String,
    /// Embedded copy of the configuration document at submit time; `None`
    /// for CLI-registered benchmarks.
    pub configuration_snapshot: Option<serde_json::Value>,
    pub variables: Vec<VariableSpec>,
    pub shared_projects: Vec<String>,

    pub state: BenchmarkState,
    pub job_ids: Vec<i64>,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,

    /// True for benchmarks created by the register endpoint rather than
    /// `SubmitBenchmark`.
    pub cli: bool,
}

impl Benchmark {
    pub fn new_pending(run_number: u64, issuer: Option<String>, name: String) -> Self {
        Self {
            id: None,
            run_number,
            issuer,
            name,
            configuration_snapshot: None,
            variables: Vec::new(),
            shared_projects: Vec::new(),
            state: BenchmarkState::Pending,
            job_ids: Vec::new(),
            start_time: None,
            end_time: None,
            failure_reason: None,
            cli: false,
        }
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = BenchmarkState::Failed;
        self.failure_reason = Some(reason.into());
        self.end_time = Some(Utc::now());
    }

    pub fn mark_running(&mut self, job_ids: Vec<i64>) {
        self.state = BenchmarkState::Running;
        self.job_ids = job_ids;
        self.start_time = Some(Utc::now());
    }
}

/// One variable, with the set of values selected for this benchmark.
/// Single-valued (`selected.len() == 1`) variables are constants; the
/// permutation expander Cartesian-products the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    pub key: String,
    pub selected: Vec<String>,
}

/// One cluster-scheduler job belonging to one benchmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub job_id: i64,
    pub run_number: u64,
    pub permutation_number: u64,
    pub iteration: u32,
    pub variant_name: String,
    pub variables: BTreeMap<String, String>,

    pub jobscript_file: String,
    pub user_jobscript_file: String,
    pub identificator: String,

    /// hostname -> {hash, hostname}, populated by node-registration callbacks.
    pub nodes: BTreeMap<String, NodeAssignment>,

    /// Last-known scheduler snapshot; shape varies across scheduler
    /// versions, so it stays a JSON blob above the store boundary.
    pub job_info: serde_json::Value,

    pub runtime: Option<i64>,
    pub capture_time: Option<i64>,
    pub capture_start: Option<i64>,
    pub capture_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub hash: String,
    pub hostname: String,
}

/// Captured stdout/stderr for one job; one row per `jobId`, overwritten on
/// every harvest pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub job_id: i64,
    pub stdout: String,
    pub stderr: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// Keyed by an opaque per-node fingerprint; holds the last successful
/// micro-benchmark snapshot used to decide whether calibration must re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProfile {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub hash: String,
    pub snapshot: serde_json::Value,
    pub last_update: DateTime<Utc>,
}

/// Transient row created by the gap-filling job-id allocator; cleared on
/// persistence of the real job or by a 1h TTL sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedJobId {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub job_id: i64,
    pub reserved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_severity_orders_failed_above_cancelled() {
        let states = vec!["COMPLETED".to_string(), "FAILED".to_string(), "CANCELLED".to_string()];
        assert_eq!(BenchmarkState::max_severity(states), Some(BenchmarkState::Failed));
    }

    #[test]
    fn max_severity_all_completed_is_done() {
        let states = vec!["COMPLETED".to_string(), "COMPLETED".to_string()];
        assert_eq!(BenchmarkState::max_severity(states), Some(BenchmarkState::Done));
    }

    #[test]
    fn max_severity_empty_is_none() {
        assert_eq!(BenchmarkState::max_severity(Vec::<String>::new()), None);
    }

    #[test]
    fn max_severity_timeout_beats_deadline() {
        let states = vec!["DEADLINE".to_string(), "TIMEOUT".to_string()];
        assert_eq!(BenchmarkState::max_severity(states), Some(BenchmarkState::Timeout));
    }
}
