//! Workflow engine: validation, budget gate, sequential steps under a
//! deadline, and rollback of created records after a fatal failure.

mod context;
mod run;
mod steps;

pub use context::{RunContext, StepScope};
pub use run::{CostEstimate, ErrorRecord, RollbackError, RunCost, RunStatus, RunSummary, WorkflowRun};
pub use steps::{StepLog, StepMeter, StepRecord, StepStatus, StepTransitionError};

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tastebase_shared::{Result, TastebaseError};
use tracing::{info, instrument, warn};

use crate::repositories::rollback_created;
use crate::services::Services;

/// Input problems found before any cost is incurred.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub errors: Vec<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    pub fn require(&mut self, condition: bool, message: &str) {
        if !condition {
            self.errors.push(message.to_string());
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A named, multi-step enrichment procedure.
#[async_trait]
pub trait Workflow: Send + Sync {
    type Input: Send + Sync;
    type Output: Serialize + Send;

    fn name(&self) -> &'static str;

    fn validate(&self, input: &Self::Input) -> Validation;

    /// Expected and worst-case spend for `input`.
    fn estimate_cost(&self, input: &Self::Input, services: &Services) -> CostEstimate;

    /// Whether records created by a failed run are deleted.
    fn rollback_on_failure(&self) -> bool {
        false
    }

    async fn execute_steps(&self, input: &Self::Input, ctx: &mut RunContext) -> Result<Self::Output>;
}

/// Runs workflows against one set of services.
#[derive(Clone)]
pub struct Engine {
    services: Services,
    ceiling_usd: f64,
    timeout: Duration,
}

impl Engine {
    pub fn new(services: Services) -> Self {
        let budget = &services.config.budget;
        Self {
            ceiling_usd: budget.max_usd_per_run,
            timeout: budget.run_timeout(),
            services,
        }
    }

    pub fn with_ceiling(mut self, ceiling_usd: f64) -> Self {
        self.ceiling_usd = ceiling_usd;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Execute `workflow` once.
    ///
    /// Every outcome, including rejection, comes back as a [`WorkflowRun`].
    /// The only error is a rollback that could not finish; it carries the
    /// run summary.
    #[instrument(skip_all, fields(workflow = workflow.name(), dry_run = dry_run))]
    pub async fn run<W: Workflow>(
        &self,
        workflow: &W,
        input: W::Input,
        dry_run: bool,
    ) -> std::result::Result<WorkflowRun<W::Output>, RollbackError> {
        let mut run = WorkflowRun::new(workflow.name(), dry_run);

        let validation = workflow.validate(&input);
        if !validation.is_valid() {
            let error = TastebaseError::validation(validation.errors.join("; "));
            warn!(run_id = %run.id, error = %error, "input rejected");
            run.fail_with(ErrorRecord::from_error(&error, true, None));
            return Ok(run);
        }

        let estimate = workflow.estimate_cost(&input, &self.services);
        run.estimate = Some(estimate);
        if estimate.max_usd > self.ceiling_usd {
            let error = TastebaseError::BudgetExceeded {
                max_usd: estimate.max_usd,
                ceiling_usd: self.ceiling_usd,
            };
            warn!(run_id = %run.id, error = %error, "run rejected by budget gate");
            run.fail_with(ErrorRecord::from_error(&error, true, None));
            return Ok(run);
        }

        run.status = RunStatus::Running;
        let source = format!("{}:{}", workflow.name(), run.id);
        let mut ctx = RunContext::new(self.services.clone(), source.as_str(), dry_run);
        info!(run_id = %run.id, max_usd = estimate.max_usd, "run started");

        let executed =
            tokio::time::timeout(self.timeout, workflow.execute_steps(&input, &mut ctx)).await;
        let output = match executed {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                // Step failures are already recorded by the context.
                if !matches!(e, TastebaseError::StepFatal { .. }) {
                    ctx.push_error(ErrorRecord::from_error(&e, true, None));
                }
                None
            }
            Err(_) => {
                let error = TastebaseError::Timeout(format!(
                    "run exceeded {}ms",
                    self.timeout.as_millis()
                ));
                ctx.abort_running(&error);
                None
            }
        };

        let (steps, errors, created) = ctx.into_parts();
        run.steps = steps;
        run.errors = errors;
        run.finished_at = Some(Utc::now());

        match output {
            Some(output) => {
                run.output = Some(output);
                run.status = RunStatus::Completed;
            }
            None => {
                run.status = RunStatus::Failed;
                if workflow.rollback_on_failure() {
                    let services = &self.services;
                    match rollback_created(&services.storage, &services.audit, &created, &source).await {
                        Ok(deleted) => run.rolled_back = deleted,
                        Err(e) => {
                            warn!(run_id = %run.id, error = %e, "rollback incomplete");
                            return Err(RollbackError {
                                run: Box::new(run.summary()),
                                source: e,
                            });
                        }
                    }
                }
            }
        }

        let cost = run.total_cost();
        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            tokens = cost.tokens,
            usd = cost.usd,
            rolled_back = run.rolled_back,
            "run finished"
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::repositories::{NewChef, Repositories};
    use crate::services::tests::{services_on, services_with, temp_db_path};
    use tastebase_gateway::GenerateRequest;
    use tastebase_gateway::mock::MockGateway;
    use tastebase_shared::{ChangeType, EntityTable};
    use tastebase_storage::Storage;

    #[derive(Clone, Copy)]
    enum Failure {
        None,
        Fatal,
        Optional,
        Hang,
    }

    struct ThreeSteps {
        failure: Failure,
        max_usd: f64,
    }

    impl ThreeSteps {
        fn new(failure: Failure) -> Self {
            Self {
                failure,
                max_usd: 0.01,
            }
        }
    }

    #[async_trait]
    impl Workflow for ThreeSteps {
        type Input = String;
        type Output = String;

        fn name(&self) -> &'static str {
            "three_steps"
        }

        fn validate(&self, input: &String) -> Validation {
            let mut v = Validation::ok();
            v.require(!input.trim().is_empty(), "name is required");
            v
        }

        fn estimate_cost(&self, _input: &String, _services: &Services) -> CostEstimate {
            CostEstimate {
                estimated_tokens: 100,
                estimated_usd: self.max_usd / 3.0,
                max_tokens: 300,
                max_usd: self.max_usd,
            }
        }

        fn rollback_on_failure(&self) -> bool {
            true
        }

        async fn execute_steps(&self, input: &String, ctx: &mut RunContext) -> Result<String> {
            let id = ctx
                .step("create", |scope| async move {
                    let outcome = scope
                        .repos()
                        .insert_chef(NewChef {
                            name: input.clone(),
                            city: Some("Chicago".into()),
                            ..Default::default()
                        })
                        .await?;
                    Ok(outcome.id().to_string())
                })
                .await?;

            let failure = self.failure;
            match failure {
                Failure::Optional => {
                    ctx.optional_step("enrich", |_scope| async move {
                        Err::<(), _>(TastebaseError::parse("bad payload"))
                    })
                    .await;
                }
                _ => {
                    ctx.step("enrich", |scope| async move {
                        match failure {
                            Failure::Fatal => Err(TastebaseError::parse("bad payload")),
                            Failure::Hang => {
                                scope.generate(&GenerateRequest::new("s", "p"), None).await?;
                                tokio::time::sleep(Duration::from_secs(30)).await;
                                Ok(())
                            }
                            _ => {
                                scope.generate(&GenerateRequest::new("s", "p"), None).await?;
                                Ok(())
                            }
                        }
                    })
                    .await?;
                }
            }

            ctx.step("finish", |scope| async move {
                scope.note("done", true);
                Ok(())
            })
            .await?;
            Ok(id)
        }
    }

    #[tokio::test]
    async fn fatal_failure_stops_and_rolls_back_once() {
        let services = services_with(MockGateway::replying("ok")).await;
        let engine = Engine::new(services.clone());

        let run = engine
            .run(&ThreeSteps::new(Failure::Fatal), "Chef Rollback".into(), false)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].status, StepStatus::Completed);
        assert_eq!(run.steps[1].status, StepStatus::Failed);
        assert!(run.step("finish").is_none());
        assert_eq!(run.errors.len(), 1);
        assert!(run.errors[0].fatal);
        assert_eq!(run.errors[0].step.as_deref(), Some("enrich"));

        assert_eq!(run.rolled_back, 1);
        assert!(services.storage.list_chefs(None).await.unwrap().is_empty());
        let rollbacks = services
            .storage
            .list_audit_entries("chefs", None)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.entry.change_type == ChangeType::Rollback)
            .count();
        assert_eq!(rollbacks, 1);
    }

    /// Tracks an existing chef id as created, then fails.
    struct StrandedRollback;

    #[async_trait]
    impl Workflow for StrandedRollback {
        type Input = String;
        type Output = ();

        fn name(&self) -> &'static str {
            "stranded_rollback"
        }

        fn validate(&self, _input: &String) -> Validation {
            Validation::ok()
        }

        fn estimate_cost(&self, _input: &String, _services: &Services) -> CostEstimate {
            CostEstimate::default()
        }

        fn rollback_on_failure(&self) -> bool {
            true
        }

        async fn execute_steps(&self, input: &String, ctx: &mut RunContext) -> Result<()> {
            let id = ctx
                .step("track", |_scope| async move { Ok(input.clone()) })
                .await?;
            ctx.created().push(EntityTable::Chefs, id);
            ctx.step("explode", |_scope| async move {
                Err::<(), _>(TastebaseError::parse("bad payload"))
            })
            .await
        }
    }

    #[tokio::test]
    async fn failed_rollback_returns_the_run() {
        let path = temp_db_path();
        let writable = services_on(
            Arc::new(Storage::open(&path).await.unwrap()),
            Arc::new(MockGateway::replying("ok")),
        );
        let chef = Repositories::new(&writable, "test", false)
            .insert_chef(NewChef {
                name: "Chef Stranded".into(),
                city: Some("Chicago".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let readonly = services_on(
            Arc::new(Storage::open_readonly(&path).await.unwrap()),
            Arc::new(MockGateway::replying("ok")),
        );
        let err = Engine::new(readonly)
            .run(&StrandedRollback, chef.id().to_string(), false)
            .await
            .unwrap_err();

        assert!(err.source.to_string().contains("read-only"), "{}", err.source);
        assert_eq!(err.run.workflow, "stranded_rollback");
        assert_eq!(err.run.status, RunStatus::Failed);
        assert_eq!(err.run.rolled_back, 0);
        assert_eq!(err.run.steps.len(), 2);
        assert_eq!(err.run.steps[0].status, StepStatus::Completed);
        assert_eq!(err.run.steps[1].status, StepStatus::Failed);
        assert_eq!(err.run.errors.len(), 1);
        assert_eq!(err.run.errors[0].step.as_deref(), Some("explode"));
        assert!(err.run.finished_at.is_some());

        assert!(writable.storage.get_chef(chef.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn optional_failure_is_recorded_and_run_succeeds() {
        let services = services_with(MockGateway::replying("ok")).await;
        let run = Engine::new(services.clone())
            .run(&ThreeSteps::new(Failure::Optional), "Chef Optional".into(), false)
            .await
            .unwrap();

        assert!(run.is_success());
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.steps[1].status, StepStatus::Failed);
        assert_eq!(run.errors.len(), 1);
        assert!(!run.errors[0].fatal);
        assert_eq!(services.storage.list_chefs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn budget_gate_rejects_before_any_step() {
        let gateway = std::sync::Arc::new(MockGateway::replying("ok"));
        let services = crate::services::tests::services_with_shared(gateway.clone()).await;
        let workflow = ThreeSteps {
            failure: Failure::None,
            max_usd: 5.0,
        };
        let run = Engine::new(services.clone())
            .with_ceiling(0.5)
            .run(&workflow, "Chef Budget".into(), false)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.steps.is_empty());
        assert_eq!(run.errors[0].code, "budget_exceeded");
        assert_eq!(gateway.calls(), 0);
        assert!(services.storage.list_chefs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_rejected_without_steps() {
        let services = services_with(MockGateway::replying("ok")).await;
        let run = Engine::new(services)
            .run(&ThreeSteps::new(Failure::None), "  ".into(), false)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.steps.is_empty());
        assert!(run.errors[0].message.contains("name is required"));
    }

    #[tokio::test]
    async fn run_cost_is_sum_of_steps() {
        let services = services_with(MockGateway::replying("ok")).await;
        let run = Engine::new(services)
            .run(&ThreeSteps::new(Failure::None), "Chef Cost".into(), false)
            .await
            .unwrap();

        assert!(run.is_success());
        assert_eq!(run.output.as_deref().map(str::len), Some(36));
        let enrich = run.step("enrich").unwrap();
        assert_eq!(enrich.tokens_used, Some(150));
        let total = run.total_cost();
        let summed: f64 = run.steps.iter().filter_map(|s| s.cost_usd).sum();
        assert_eq!(total.tokens, 150);
        assert!((total.usd - summed).abs() < 1e-12);
        assert!(total.usd > 0.0);
        assert_eq!(run.summary().total_cost, total);
    }

    #[tokio::test]
    async fn timeout_fails_running_step() {
        let services = services_with(MockGateway::replying("ok")).await;
        let run = Engine::new(services.clone())
            .with_timeout(Duration::from_millis(200))
            .run(&ThreeSteps::new(Failure::Hang), "Chef Slow".into(), false)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let enrich = run.step("enrich").unwrap();
        assert_eq!(enrich.status, StepStatus::Failed);
        // Spend before the deadline is still reported.
        assert_eq!(enrich.tokens_used, Some(150));
        assert_eq!(run.errors.last().unwrap().code, "timeout");
        assert!(run.steps.iter().all(|s| s.status != StepStatus::Running));
        assert_eq!(run.rolled_back, 1);
    }

    #[tokio::test]
    async fn dry_run_rolls_back_nothing() {
        let services = services_with(MockGateway::replying("ok")).await;
        let run = Engine::new(services.clone())
            .run(&ThreeSteps::new(Failure::Fatal), "Chef Dry".into(), true)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.rolled_back, 0);
        assert!(services.storage.list_chefs(None).await.unwrap().is_empty());
    }
}
