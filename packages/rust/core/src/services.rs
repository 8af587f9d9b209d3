//! The shared service bundle handed to workflows and the worker pool.

use std::sync::Arc;

use tastebase_dedup::{Adjudicator, DuplicateResolver};
use tastebase_gateway::{ExternalCalls, Gateway, UsageTracker};
use tastebase_shared::AppConfig;
use tastebase_storage::Storage;

use crate::audit::AuditLog;
use crate::repositories::Repositories;

/// Everything a workflow needs, cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub storage: Arc<Storage>,
    pub calls: ExternalCalls,
    pub resolver: DuplicateResolver,
    pub audit: AuditLog,
}

impl Services {
    pub fn new(
        config: AppConfig,
        storage: Arc<Storage>,
        gateway: Arc<dyn Gateway>,
        tracker: UsageTracker,
    ) -> Self {
        let calls = ExternalCalls::from_config(gateway, storage.clone(), &config, tracker);
        let resolver = DuplicateResolver::new(
            storage.clone(),
            Adjudicator::new(calls.clone(), &config.dedup),
            &config.dedup,
        );
        let audit = AuditLog::new(storage.clone());
        Self {
            config: Arc::new(config),
            storage,
            calls,
            resolver,
            audit,
        }
    }

    pub fn tracker(&self) -> &UsageTracker {
        self.calls.tracker()
    }

    /// Untracked repositories for one-off writes outside a run.
    pub fn repositories(&self, source: &str, dry_run: bool) -> Repositories {
        Repositories::new(self, source, dry_run)
    }
}
