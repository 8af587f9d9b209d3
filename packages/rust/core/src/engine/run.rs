//! Run records and their serializable summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tastebase_shared::{TastebaseError, new_record_id};

use super::steps::StepRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    /// Fatal errors aborted the run.
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ErrorRecord {
    pub fn from_error(error: &TastebaseError, fatal: bool, step: Option<&str>) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            fatal,
            step: step.map(String::from),
        }
    }
}

/// Pre-execution cost bounds for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_tokens: u64,
    pub estimated_usd: f64,
    pub max_tokens: u64,
    pub max_usd: f64,
}

impl CostEstimate {
    /// Sum two estimates component-wise.
    pub fn plus(self, other: CostEstimate) -> Self {
        Self {
            estimated_tokens: self.estimated_tokens + other.estimated_tokens,
            estimated_usd: self.estimated_usd + other.estimated_usd,
            max_tokens: self.max_tokens + other.max_tokens,
            max_usd: self.max_usd + other.max_usd,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCost {
    pub tokens: u64,
    pub usd: f64,
}

/// One workflow invocation and everything that happened in it.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun<O> {
    pub id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub errors: Vec<ErrorRecord>,
    pub output: Option<O>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<CostEstimate>,
    /// Records deleted by rollback.
    pub rolled_back: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl<O> WorkflowRun<O> {
    pub fn new(workflow: &str, dry_run: bool) -> Self {
        Self {
            id: new_record_id(),
            workflow: workflow.to_string(),
            status: RunStatus::Pending,
            steps: Vec::new(),
            errors: Vec::new(),
            output: None,
            dry_run,
            estimate: None,
            rolled_back: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Aggregate cost, always the sum of the step costs.
    pub fn total_cost(&self) -> RunCost {
        self.steps.iter().fold(RunCost::default(), |acc, step| RunCost {
            tokens: acc.tokens + step.tokens_used.unwrap_or(0),
            usd: acc.usd + step.cost_usd.unwrap_or(0.0),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub(crate) fn fail_with(&mut self, record: ErrorRecord) {
        self.status = RunStatus::Failed;
        self.errors.push(record);
        self.finished_at = Some(Utc::now());
    }
}

impl<O: Serialize> WorkflowRun<O> {
    pub fn summary(&self) -> RunSummary {
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        RunSummary {
            id: self.id.clone(),
            workflow: self.workflow.clone(),
            status: self.status,
            dry_run: self.dry_run,
            steps: self.steps.clone(),
            total_cost: self.total_cost(),
            estimate: self.estimate,
            errors: self.errors.clone(),
            output: self
                .output
                .as_ref()
                .and_then(|o| serde_json::to_value(o).ok()),
            rolled_back: self.rolled_back,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: (finished - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// Serializable report of a run, produced for every outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub steps: Vec<StepRecord>,
    pub total_cost: RunCost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<CostEstimate>,
    pub errors: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub rolled_back: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Rollback after a fatal failure did not complete.
#[derive(Debug, thiserror::Error)]
#[error("rollback of run {} ({}) failed: {source}", run.id, run.workflow)]
pub struct RollbackError {
    pub run: Box<RunSummary>,
    #[source]
    pub source: TastebaseError,
}
