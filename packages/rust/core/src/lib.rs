//! Enrichment orchestration for tastebase.
//!
//! This crate ties the gateway, the duplicate resolver, and storage together
//! into workflows (e.g., `enrich_chef`) run by the [`engine::Engine`], plus a
//! bounded [`pool::WorkerPool`] for batch fan-out.

pub mod audit;
pub mod engine;
pub mod pool;
pub mod repositories;
pub mod services;
pub mod workflows;

pub use audit::{AuditLog, MAX_AUDIT_BATCH};
pub use engine::{
    CostEstimate, Engine, ErrorRecord, RollbackError, RunContext, RunStatus, RunSummary,
    StepScope, Validation, Workflow, WorkflowRun,
};
pub use pool::{BatchProgress, BatchReport, SilentProgress, WorkerPool, verify_all};
pub use repositories::{DiscoveryOutcome, InsertOutcome, NewChef, NewRestaurant, Repositories};
pub use services::Services;
