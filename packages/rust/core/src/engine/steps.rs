//! Per-run step bookkeeping.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tastebase_shared::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StepTransitionError {
    #[error("step `{running}` is still running; cannot start `{requested}`")]
    AlreadyRunning { running: String, requested: String },

    #[error("step `{name}` is {status}, not running")]
    NotRunning { name: String, status: &'static str },

    #[error("no step at index {0}")]
    UnknownStep(usize),
}

/// Spend and notes a step body reports while it runs.
///
/// Cloned into the step scope; the engine reads it back when the step ends,
/// so a failed or timed-out step still reports what it spent.
#[derive(Debug, Clone, Default)]
pub struct StepMeter {
    inner: Arc<Mutex<MeterState>>,
}

#[derive(Debug, Default)]
struct MeterState {
    usage: TokenUsage,
    cost_usd: f64,
    metadata: Map<String, Value>,
}

impl StepMeter {
    fn lock(&self) -> MutexGuard<'_, MeterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, usage: TokenUsage, cost_usd: f64) {
        let mut state = self.lock();
        state.usage += usage;
        state.cost_usd += cost_usd;
    }

    pub fn note(&self, key: &str, value: impl Into<Value>) {
        self.lock().metadata.insert(key.to_string(), value.into());
    }

    pub fn usage(&self) -> TokenUsage {
        self.lock().usage
    }

    pub fn cost_usd(&self) -> f64 {
        self.lock().cost_usd
    }

    fn take_metadata(&self) -> Map<String, Value> {
        std::mem::take(&mut self.lock().metadata)
    }
}

/// Append-only step records with a strict lifecycle.
///
/// A step is started in `running` and leaves it exactly once, to
/// `completed` or `failed`. Skipped steps are recorded directly.
#[derive(Debug, Default)]
pub struct StepLog {
    records: Vec<StepRecord>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a step, returning its index.
    pub fn start(&mut self, name: &str) -> Result<usize, StepTransitionError> {
        if let Some(running) = self.running() {
            return Err(StepTransitionError::AlreadyRunning {
                running: self.records[running].name.clone(),
                requested: name.to_string(),
            });
        }
        self.records.push(StepRecord {
            name: name.to_string(),
            status: StepStatus::Running,
            tokens_used: None,
            cost_usd: None,
            metadata: Map::new(),
            error: None,
        });
        Ok(self.records.len() - 1)
    }

    pub fn complete(&mut self, index: usize, meter: &StepMeter) -> Result<(), StepTransitionError> {
        self.finish(index, StepStatus::Completed, meter, None)
    }

    pub fn fail(
        &mut self,
        index: usize,
        meter: &StepMeter,
        error: impl Into<String>,
    ) -> Result<(), StepTransitionError> {
        self.finish(index, StepStatus::Failed, meter, Some(error.into()))
    }

    /// Record a step that was not run.
    pub fn skip(&mut self, name: &str, reason: &str) {
        let mut metadata = Map::new();
        metadata.insert("reason".into(), Value::String(reason.to_string()));
        self.records.push(StepRecord {
            name: name.to_string(),
            status: StepStatus::Skipped,
            tokens_used: None,
            cost_usd: None,
            metadata,
            error: None,
        });
    }

    fn finish(
        &mut self,
        index: usize,
        status: StepStatus,
        meter: &StepMeter,
        error: Option<String>,
    ) -> Result<(), StepTransitionError> {
        let record = self
            .records
            .get_mut(index)
            .ok_or(StepTransitionError::UnknownStep(index))?;
        if record.status != StepStatus::Running {
            return Err(StepTransitionError::NotRunning {
                name: record.name.clone(),
                status: record.status.as_str(),
            });
        }
        let usage = meter.usage();
        record.status = status;
        record.tokens_used = Some(usage.total_tokens);
        record.cost_usd = Some(meter.cost_usd());
        record.metadata = meter.take_metadata();
        record.error = error;
        Ok(())
    }

    /// Index of the step currently running, if any.
    pub fn running(&self) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.status == StepStatus::Running)
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_records_meter() {
        let mut log = StepLog::new();
        let meter = StepMeter::default();
        let idx = log.start("fetch").unwrap();
        meter.add(TokenUsage::new(10, 5), 0.25);
        meter.note("from_cache", false);
        log.complete(idx, &meter).unwrap();

        let rec = &log.records()[0];
        assert_eq!(rec.status, StepStatus::Completed);
        assert_eq!(rec.tokens_used, Some(15));
        assert_eq!(rec.cost_usd, Some(0.25));
        assert_eq!(rec.metadata["from_cache"], Value::Bool(false));
    }

    #[test]
    fn cannot_leave_running_twice() {
        let mut log = StepLog::new();
        let meter = StepMeter::default();
        let idx = log.start("a").unwrap();
        log.fail(idx, &meter, "boom").unwrap();
        assert_eq!(
            log.complete(idx, &meter),
            Err(StepTransitionError::NotRunning {
                name: "a".into(),
                status: "failed"
            })
        );
        assert!(log.fail(idx, &meter, "again").is_err());
        assert_eq!(log.records()[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn steps_are_sequential() {
        let mut log = StepLog::new();
        log.start("a").unwrap();
        assert!(matches!(
            log.start("b"),
            Err(StepTransitionError::AlreadyRunning { .. })
        ));
        assert_eq!(log.running(), Some(0));
    }

    #[test]
    fn skip_is_terminal() {
        let mut log = StepLog::new();
        log.skip("optional", "nothing to do");
        assert_eq!(log.records()[0].status, StepStatus::Skipped);
        assert!(log.complete(0, &StepMeter::default()).is_err());
        assert!(log.running().is_none());
    }
}
