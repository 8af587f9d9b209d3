//! Bounded fan-out of independent tasks, and the batch verify built on it.
//!
//! Each task holds a semaphore permit while it runs. Failures and panics are
//! confined to the task that raised them.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tastebase_shared::{RestaurantStatus, Result, TastebaseError, TokenUsage};
use tastebase_storage::RestaurantFilter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::engine::{Engine, RollbackError, RunSummary};
use crate::workflows::{VerifyRestaurant, VerifyRestaurantInput};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const MAX_CONCURRENCY: usize = 50;

/// Why one pooled task produced no value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Failed(#[from] TastebaseError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl WorkerPool {
    /// A pool running at most `concurrency` tasks at once (clamped to 1..=50).
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `task` over every item. Results come back in input order;
    /// `on_done` sees each one as it completes.
    pub async fn run_all<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        task: F,
        mut on_done: impl FnMut(usize, &std::result::Result<T, TaskError>),
    ) -> Vec<std::result::Result<T, TaskError>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = std::result::Result<T, TaskError>> + Send + 'static,
    {
        let total = items.len();
        let mut set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let semaphore = self.semaphore.clone();
            let work = task(item);
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Err(TaskError::Cancelled));
                };
                // A nested task turns a panic into a JoinError we can report.
                let result = match tokio::spawn(work).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
                    Err(_) => Err(TaskError::Cancelled),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<std::result::Result<T, TaskError>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Err(e) = &result {
                        warn!(index, error = %e, "pooled task failed");
                    }
                    on_done(index, &result);
                    results[index] = Some(result);
                }
                Err(e) => warn!(error = %e, "pool worker did not finish"),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(TaskError::Cancelled)))
            .collect()
    }
}

/// Progress callbacks for a batch.
pub trait BatchProgress: Send + Sync {
    fn started(&self, total: usize);
    fn task_finished(&self, label: &str, ok: bool, done: usize, total: usize);
    fn finished(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn started(&self, _total: usize) {}
    fn task_finished(&self, _label: &str, _ok: bool, _done: usize, _total: usize) {}
    fn finished(&self, _report: &BatchReport) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub restaurant_id: String,
    pub error: String,
}

/// Aggregate outcome of a batch verify.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed runs whose status differs from the stored one.
    pub changed: usize,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub runs: Vec<RunSummary>,
    pub failures: Vec<BatchFailure>,
}

/// Verify every open restaurant through the pool.
///
/// The usage tracker is reset first, so the report's usage and cost cover
/// this batch only.
#[instrument(skip_all, fields(concurrency = pool.concurrency(), dry_run = dry_run))]
pub async fn verify_all(
    engine: &Engine,
    pool: &WorkerPool,
    dry_run: bool,
    progress: &dyn BatchProgress,
) -> Result<BatchReport> {
    let services = engine.services();
    services.tracker().reset();

    let filter = RestaurantFilter {
        status: Some(RestaurantStatus::Open),
        ..Default::default()
    };
    let ids: Vec<String> = services
        .storage
        .list_restaurants(&filter)
        .await?
        .into_iter()
        .map(|r| r.id)
        .collect();
    let total = ids.len();
    info!(total, "batch verify started");
    progress.started(total);

    let labels = ids.clone();
    let mut done = 0;
    let results = pool
        .run_all(
            ids,
            |restaurant_id| {
                let engine = engine.clone();
                async move {
                    let run = engine
                        .run(&VerifyRestaurant, VerifyRestaurantInput { restaurant_id }, dry_run)
                        .await?;
                    Ok(run)
                }
            },
            |index, result| {
                done += 1;
                let ok = matches!(result, Ok(run) if run.is_success());
                progress.task_finished(&labels[index], ok, done, total);
            },
        )
        .await;

    let mut report = BatchReport {
        total,
        ..Default::default()
    };
    for (restaurant_id, result) in labels.into_iter().zip(results) {
        match result {
            Ok(run) => {
                if run.is_success() {
                    report.completed += 1;
                    if run.output.as_ref().is_some_and(|o| o.changed) {
                        report.changed += 1;
                    }
                } else {
                    report.failed += 1;
                    let error = run
                        .errors
                        .iter()
                        .find(|e| e.fatal)
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "run failed".into());
                    report.failures.push(BatchFailure {
                        restaurant_id,
                        error,
                    });
                }
                report.runs.push(run.summary());
            }
            Err(e) => {
                report.failed += 1;
                report.failures.push(BatchFailure {
                    restaurant_id,
                    error: e.to_string(),
                });
            }
        }
    }
    report.usage = services.tracker().total_usage();
    report.cost_usd = services.tracker().estimate_cost(&services.config.rates);

    info!(
        total = report.total,
        completed = report.completed,
        failed = report.failed,
        tokens = report.usage.total_tokens,
        usd = report.cost_usd,
        "batch verify finished"
    );
    progress.finished(&report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::NewRestaurant;
    use crate::services::tests::services_with_shared;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tastebase_gateway::mock::{MockGateway, reply};

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(WorkerPool::new(0).concurrency(), 1);
        assert_eq!(WorkerPool::new(500).concurrency(), MAX_CONCURRENCY);
        assert_eq!(WorkerPool::default().concurrency(), DEFAULT_CONCURRENCY);
    }

    #[tokio::test]
    async fn panics_are_isolated() {
        let pool = WorkerPool::new(4);
        let results = pool
            .run_all(
                vec![1u32, 2, 3],
                |n| async move {
                    if n == 2 {
                        panic!("boom on {n}");
                    }
                    Ok(n * 10)
                },
                |_, _| {},
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&10));
        assert!(matches!(&results[1], Err(TaskError::Panicked(msg)) if msg.contains("boom on 2")));
        assert_eq!(results[2].as_ref().ok(), Some(&30));
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_concurrency() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut seen = 0;

        let results = pool
            .run_all(
                (0..8).collect::<Vec<u32>>(),
                |_| {
                    let (in_flight, peak) = (in_flight.clone(), peak.clone());
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                |_, _| seen += 1,
            )
            .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(seen, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn verify_all_covers_open_restaurants_and_isolates_failures() {
        let gw = Arc::new(MockGateway::new(|req| {
            if req.prompt.contains("Broken") {
                Ok(reply("no idea"))
            } else {
                Ok(reply(r#"{"status": "closed"}"#))
            }
        }));
        let services = services_with_shared(gw.clone()).await;
        let repos = services.repositories("seed", false);
        for (name, city, status) in [
            ("Alinea", "Chicago", RestaurantStatus::Open),
            ("Franklin Barbecue", "Austin", RestaurantStatus::Open),
            ("Broken Spoon", "Denver", RestaurantStatus::Open),
            ("Gone Diner", "Boise", RestaurantStatus::Closed),
        ] {
            repos
                .insert_restaurant(NewRestaurant {
                    name: name.into(),
                    city: Some(city.into()),
                    status,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        // Leftover usage from seeding must not leak into the batch.
        services.tracker().track_usage("mock/model", TokenUsage::new(1000, 1000));

        let engine = Engine::new(services.clone());
        let report = verify_all(&engine, &WorkerPool::new(3), false, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.changed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.runs.len(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(gw.calls(), 3);
        assert_eq!(report.usage.total_tokens, 450);
        assert!(report.cost_usd > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn parallel_verify_writes_every_audit_entry() {
        let gw = Arc::new(MockGateway::replying(r#"{"status": "closed"}"#));
        let services = services_with_shared(gw).await;
        let repos = services.repositories("seed", false);
        for n in 0..48 {
            repos
                .insert_restaurant(NewRestaurant {
                    name: format!("Venue {n}"),
                    city: Some(format!("Town {n}")),
                    status: RestaurantStatus::Open,
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let engine = Engine::new(services.clone());
        let report = verify_all(&engine, &WorkerPool::new(20), false, &SilentProgress)
            .await
            .unwrap();

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.completed, 48);
        let updates = services
            .storage
            .list_audit_entries("restaurants", None)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.entry.change_type == tastebase_shared::ChangeType::Update)
            .count();
        assert_eq!(updates, 48);
    }
}
