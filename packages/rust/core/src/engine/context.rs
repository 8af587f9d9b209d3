//! Execution context passed to a workflow's steps.

use std::future::Future;

use serde_json::Value;
use tastebase_gateway::{CacheOptions, CallOutcome, ExternalCalls, GatewayCall, GenerateRequest};
use tastebase_shared::{Result, TastebaseError, TokenUsage};
use tastebase_storage::Storage;
use tracing::{debug, warn};

use super::run::ErrorRecord;
use super::steps::{StepLog, StepMeter, StepRecord};
use crate::repositories::{CreatedRecords, Repositories};
use crate::services::Services;

/// Mutable state of one run. Steps execute strictly one after another.
pub struct RunContext {
    services: Services,
    source: String,
    dry_run: bool,
    created: CreatedRecords,
    log: StepLog,
    errors: Vec<ErrorRecord>,
    current: Option<(usize, StepMeter)>,
}

impl RunContext {
    pub fn new(services: Services, source: impl Into<String>, dry_run: bool) -> Self {
        Self {
            services,
            source: source.into(),
            dry_run,
            created: CreatedRecords::default(),
            log: StepLog::new(),
            errors: Vec::new(),
            current: None,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn created(&self) -> &CreatedRecords {
        &self.created
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn steps(&self) -> &[StepRecord] {
        self.log.records()
    }

    fn begin(&mut self, name: &str) -> Result<(usize, StepScope)> {
        let index = self.log.start(name).map_err(|e| TastebaseError::StepFatal {
            step: name.to_string(),
            message: e.to_string(),
        })?;
        let meter = StepMeter::default();
        self.current = Some((index, meter.clone()));
        debug!(step = name, "step started");
        Ok((
            index,
            StepScope {
                services: self.services.clone(),
                meter,
                created: self.created.clone(),
                source: self.source.clone(),
                dry_run: self.dry_run,
            },
        ))
    }

    /// Close the current step as completed or failed.
    fn finish<T>(&mut self, index: usize, name: &str, result: &Result<T>) {
        let meter = match self.current.take() {
            Some((_, meter)) => meter,
            None => StepMeter::default(),
        };
        let transition = match result {
            Ok(_) => self.log.complete(index, &meter),
            Err(e) => self.log.fail(index, &meter, e.to_string()),
        };
        if let Err(e) = transition {
            warn!(step = name, error = %e, "step record not updated");
        }
    }

    /// Run a fatal step. A failure is recorded and aborts the workflow
    /// with [`TastebaseError::StepFatal`].
    pub async fn step<T, F, Fut>(&mut self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce(StepScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (index, scope) = self.begin(name)?;
        let result = body(scope).await;
        self.finish(index, name, &result);
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(step = name, error = %e, "fatal step failed");
                self.errors
                    .push(ErrorRecord::from_error(&e, true, Some(name)));
                Err(TastebaseError::StepFatal {
                    step: name.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Run a non-fatal step. A failure is recorded and the run continues.
    pub async fn optional_step<T, F, Fut>(&mut self, name: &str, body: F) -> Option<T>
    where
        F: FnOnce(StepScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (index, scope) = match self.begin(name) {
            Ok(begun) => begun,
            Err(e) => {
                self.errors
                    .push(ErrorRecord::from_error(&e, false, Some(name)));
                return None;
            }
        };
        let result = body(scope).await;
        self.finish(index, name, &result);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(step = name, error = %e, "optional step failed, continuing");
                self.errors
                    .push(ErrorRecord::from_error(&e, false, Some(name)));
                None
            }
        }
    }

    /// Record a step that was not needed.
    pub fn skip(&mut self, name: &str, reason: &str) {
        debug!(step = name, reason, "step skipped");
        self.log.skip(name, reason);
    }

    /// Fail whatever step was running when the run was cut short.
    pub(crate) fn abort_running(&mut self, error: &TastebaseError) {
        let step = match self.current.take() {
            Some((index, meter)) => {
                let name = self.log.records().get(index).map(|r| r.name.clone());
                if let Err(e) = self.log.fail(index, &meter, error.to_string()) {
                    warn!(error = %e, "could not fail running step");
                }
                name
            }
            None => None,
        };
        self.errors
            .push(ErrorRecord::from_error(error, true, step.as_deref()));
    }

    pub(crate) fn push_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    pub(crate) fn into_parts(self) -> (Vec<StepRecord>, Vec<ErrorRecord>, CreatedRecords) {
        (self.log.into_records(), self.errors, self.created)
    }
}

/// What a step body can reach. Spend reported here lands on the step.
#[derive(Clone)]
pub struct StepScope {
    services: Services,
    meter: StepMeter,
    created: CreatedRecords,
    source: String,
    dry_run: bool,
}

impl StepScope {
    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn calls(&self) -> &ExternalCalls {
        &self.services.calls
    }

    pub fn storage(&self) -> &Storage {
        &self.services.storage
    }

    /// Repositories whose inserts are tracked for rollback and metered here.
    pub fn repos(&self) -> Repositories {
        Repositories::new(&self.services, self.source.clone(), self.dry_run)
            .tracking(self.created.clone())
            .metered(self.meter.clone())
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn meter(&self) -> &StepMeter {
        &self.meter
    }

    pub fn note(&self, key: &str, value: impl Into<Value>) {
        self.meter.note(key, value);
    }

    pub fn record_spend(&self, usage: TokenUsage, cost_usd: f64) {
        self.meter.add(usage, cost_usd);
    }

    pub fn record_call(&self, call: &GatewayCall) {
        self.meter.add(call.usage, call.cost_usd);
        self.meter.note("from_cache", call.from_cache);
        self.meter.note("model", call.model.as_str());
    }

    /// Generate through the gateway, charging the spend to this step.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
        cache: Option<&CacheOptions>,
    ) -> Result<GatewayCall> {
        let call = self
            .services
            .calls
            .generate(request, cache, self.dry_run)
            .await?;
        self.record_call(&call);
        Ok(call)
    }

    /// In-band variant of [`generate`](Self::generate); spend from every
    /// attempt is charged, including rejected ones.
    pub async fn generate_checked<A>(
        &self,
        request: &GenerateRequest,
        cache: Option<&CacheOptions>,
        accept: A,
    ) -> CallOutcome
    where
        A: Fn(&str) -> std::result::Result<(), String>,
    {
        let outcome = self
            .services
            .calls
            .generate_outcome(request, cache, self.dry_run, accept)
            .await;
        self.meter.add(outcome.usage, outcome.cost_usd);
        if let Some(call) = &outcome.call {
            self.meter.note("from_cache", call.from_cache);
            self.meter.note("model", call.model.as_str());
        }
        outcome
    }
}
