//! Dedup-aware writes to the knowledge base.
//!
//! Every insert passes the duplicate gate first. Confident duplicates are
//! suppressed and audited, review-band matches are written and queued for a
//! human, and everything else is inserted. In dry-run mode nothing is
//! written, including audit entries.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tastebase_dedup::{CandidateRecord, Decision, DuplicateCheck, DuplicateResolver, EntityKind};
use tastebase_shared::{
    AuditEntry, ChangeType, Chef, Discovery, DiscoveryStatus, EntityTable, PendingDiscovery,
    Restaurant, RestaurantStatus, Result, ReviewItem, Show, TastebaseError, new_record_id,
};
use tastebase_storage::Storage;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditLog, MAX_AUDIT_BATCH};
use crate::engine::StepMeter;
use crate::services::Services;

/// Ids of records created during one run, in creation order.
#[derive(Debug, Clone, Default)]
pub struct CreatedRecords {
    inner: Arc<Mutex<Vec<(EntityTable, String)>>>,
}

impl CreatedRecords {
    fn lock(&self) -> MutexGuard<'_, Vec<(EntityTable, String)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, table: EntityTable, id: impl Into<String>) {
        self.lock().push((table, id.into()));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(EntityTable, String)> {
        self.lock().clone()
    }

    /// Remove and return every tracked id, newest first.
    pub fn take_newest_first(&self) -> Vec<(EntityTable, String)> {
        let mut taken = std::mem::take(&mut *self.lock());
        taken.reverse();
        taken
    }

    /// Put back ids taken newest first, restoring creation order.
    fn restore_newest_first(&self, mut records: Vec<(EntityTable, String)>) {
        if records.is_empty() {
            return;
        }
        records.reverse();
        let mut tracked = self.lock();
        records.append(&mut tracked);
        *tracked = records;
    }
}

/// Delete every record tracked in `created`, newest first, auditing each.
///
/// Deleted and already-missing ids are dropped from `created`, so a second
/// call only retries ids whose delete failed. Returns the number deleted.
#[instrument(skip_all, fields(source = source, tracked = created.len()))]
pub async fn rollback_created(
    storage: &Storage,
    audit: &AuditLog,
    created: &CreatedRecords,
    source: &str,
) -> Result<usize> {
    let mut deleted = 0;
    let mut first_error = None;
    let mut entries = Vec::new();
    let mut failed = Vec::new();

    for (table, id) in created.take_newest_first() {
        let old = storage.snapshot_record(table, &id).await.ok().flatten();
        match storage.delete_record(table, &id).await {
            Ok(true) => {
                deleted += 1;
                entries.push(
                    AuditEntry::new(table.as_str(), ChangeType::Rollback, source)
                        .record(id)
                        .old(old.unwrap_or(Value::Null)),
                );
            }
            Ok(false) => debug!(table = %table, id, "already gone"),
            Err(e) => {
                warn!(table = %table, id, error = %e, "rollback delete failed");
                first_error.get_or_insert(e);
                failed.push((table, id));
            }
        }
    }
    created.restore_newest_first(failed);

    for chunk in entries.chunks(MAX_AUDIT_BATCH) {
        if let Err(e) = audit.log_batch(chunk).await {
            first_error.get_or_insert(e);
        }
    }

    info!(deleted, "rollback finished");
    match first_error {
        Some(e) => Err(e),
        None => Ok(deleted),
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewChef {
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRestaurant {
    pub name: String,
    pub chef_id: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub address: Option<String>,
    pub status: RestaurantStatus,
}

/// Result of a gated insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted { id: String },
    /// Inserted, with the pair queued for review.
    Flagged {
        id: String,
        existing_id: String,
        confidence: f64,
    },
    /// Suppressed in favor of an existing record.
    Duplicate { existing_id: String, confidence: f64 },
    /// Dry run: would have been inserted under this id.
    WouldInsert { id: String },
}

impl InsertOutcome {
    /// The id that now stands for the entity.
    pub fn id(&self) -> &str {
        match self {
            Self::Inserted { id } | Self::Flagged { id, .. } | Self::WouldInsert { id } => id,
            Self::Duplicate { existing_id, .. } => existing_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Result of queueing a discovery through the identity gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DiscoveryOutcome {
    Queued { id: String, identity_key: String },
    Duplicate { existing_id: String, identity_key: String },
    WouldQueue { identity_key: String },
}

impl DiscoveryOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

fn to_json(value: &impl Serialize) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| TastebaseError::Storage(format!("serialize audit payload: {e}")))
}

/// Write access for one caller: a workflow step or a CLI command.
#[derive(Clone)]
pub struct Repositories {
    storage: Arc<Storage>,
    resolver: DuplicateResolver,
    audit: AuditLog,
    created: CreatedRecords,
    meter: Option<StepMeter>,
    source: String,
    dry_run: bool,
}

impl Repositories {
    pub fn new(services: &Services, source: impl Into<String>, dry_run: bool) -> Self {
        Self {
            storage: services.storage.clone(),
            resolver: services.resolver.clone(),
            audit: services.audit.clone(),
            created: CreatedRecords::default(),
            meter: None,
            source: source.into(),
            dry_run,
        }
    }

    /// Track created ids in `created` (for rollback).
    pub fn tracking(mut self, created: CreatedRecords) -> Self {
        self.created = created;
        self
    }

    /// Charge adjudication spend to a step.
    pub fn metered(mut self, meter: StepMeter) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn created(&self) -> &CreatedRecords {
        &self.created
    }

    pub fn resolver(&self) -> &DuplicateResolver {
        &self.resolver
    }

    fn charge(&self, check: &DuplicateCheck) {
        if let Some(meter) = &self.meter {
            meter.add(check.usage, check.cost_usd);
        }
    }

    async fn audit(&self, entry: AuditEntry) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.audit.log_change(entry).await
    }

    async fn record_insert(&self, table: EntityTable, id: &str, payload: Value) -> Result<()> {
        self.created.push(table, id);
        self.audit(
            AuditEntry::new(table.as_str(), ChangeType::Insert, &self.source)
                .record(id)
                .new_value(payload),
        )
        .await
    }

    async fn record_suppressed(
        &self,
        table: EntityTable,
        existing_id: &str,
        attempted: Value,
        confidence: f64,
    ) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let matched = self
            .storage
            .snapshot_record(table, existing_id)
            .await?
            .unwrap_or(Value::Null);
        self.audit(
            AuditEntry::new(table.as_str(), ChangeType::DuplicateSuppressed, &self.source)
                .record(existing_id)
                .old(matched)
                .new_value(attempted)
                .confidence(confidence),
        )
        .await
    }

    async fn flag_for_review(
        &self,
        table: EntityTable,
        id: &str,
        payload: Value,
        check: &DuplicateCheck,
        existing_id: &str,
    ) -> Result<()> {
        let item = ReviewItem {
            id: new_record_id(),
            entity_type: table.as_str().to_string(),
            record_a: existing_id.to_string(),
            record_b: payload,
            confidence: check.confidence,
            reasoning: check.reasoning.clone(),
            status: "open".into(),
            created_at: Utc::now(),
        };
        self.storage.insert_review_item(&item).await?;
        self.created.push(EntityTable::ReviewQueue, &item.id);
        self.audit(
            AuditEntry::new(table.as_str(), ChangeType::FlaggedForReview, &self.source)
                .record(id)
                .new_value(json!({ "review_id": item.id, "matched_id": existing_id }))
                .confidence(check.confidence),
        )
        .await
    }

    /// Insert a chef unless the gate finds a duplicate.
    #[instrument(skip_all, fields(name = %new.name, dry_run = self.dry_run))]
    pub async fn insert_chef(&self, new: NewChef) -> Result<InsertOutcome> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(TastebaseError::validation("chef name is empty"));
        }
        let now = Utc::now();
        let chef = Chef {
            id: new_record_id(),
            normalized_name: tastebase_dedup::normalize_name(&name),
            name,
            bio: new.bio,
            city: new.city,
            state: new.state,
            created_at: now,
            updated_at: now,
        };
        let check = self
            .resolver
            .check(EntityKind::Chef, &CandidateRecord::from(&chef), self.dry_run)
            .await?;
        self.charge(&check);
        let payload = to_json(&chef)?;

        match (check.decision, check.existing_id.clone()) {
            (Decision::Merge, Some(existing_id)) => {
                self.record_suppressed(EntityTable::Chefs, &existing_id, payload, check.confidence)
                    .await?;
                Ok(InsertOutcome::Duplicate {
                    existing_id,
                    confidence: check.confidence,
                })
            }
            _ if self.dry_run => Ok(InsertOutcome::WouldInsert { id: chef.id }),
            (Decision::Review, Some(existing_id)) => {
                self.storage.insert_chef(&chef).await?;
                self.record_insert(EntityTable::Chefs, &chef.id, payload.clone())
                    .await?;
                self.flag_for_review(EntityTable::Chefs, &chef.id, payload, &check, &existing_id)
                    .await?;
                Ok(InsertOutcome::Flagged {
                    id: chef.id,
                    existing_id,
                    confidence: check.confidence,
                })
            }
            _ => {
                self.storage.insert_chef(&chef).await?;
                self.record_insert(EntityTable::Chefs, &chef.id, payload).await?;
                Ok(InsertOutcome::Inserted { id: chef.id })
            }
        }
    }

    /// Insert a restaurant unless the gate finds a duplicate.
    #[instrument(skip_all, fields(name = %new.name, dry_run = self.dry_run))]
    pub async fn insert_restaurant(&self, new: NewRestaurant) -> Result<InsertOutcome> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(TastebaseError::validation("restaurant name is empty"));
        }
        let now = Utc::now();
        let restaurant = Restaurant {
            id: new_record_id(),
            normalized_name: tastebase_dedup::normalize_name(&name),
            name,
            chef_id: new.chef_id,
            city: new.city,
            state: new.state,
            address: new.address,
            status: new.status,
            status_checked_at: None,
            created_at: now,
            updated_at: now,
        };
        let check = self
            .resolver
            .check(
                EntityKind::Restaurant,
                &CandidateRecord::from(&restaurant),
                self.dry_run,
            )
            .await?;
        self.charge(&check);
        let payload = to_json(&restaurant)?;

        match (check.decision, check.existing_id.clone()) {
            (Decision::Merge, Some(existing_id)) => {
                self.record_suppressed(
                    EntityTable::Restaurants,
                    &existing_id,
                    payload,
                    check.confidence,
                )
                .await?;
                Ok(InsertOutcome::Duplicate {
                    existing_id,
                    confidence: check.confidence,
                })
            }
            _ if self.dry_run => Ok(InsertOutcome::WouldInsert { id: restaurant.id }),
            (Decision::Review, Some(existing_id)) => {
                self.storage.insert_restaurant(&restaurant).await?;
                self.record_insert(EntityTable::Restaurants, &restaurant.id, payload.clone())
                    .await?;
                self.flag_for_review(
                    EntityTable::Restaurants,
                    &restaurant.id,
                    payload,
                    &check,
                    &existing_id,
                )
                .await?;
                Ok(InsertOutcome::Flagged {
                    id: restaurant.id,
                    existing_id,
                    confidence: check.confidence,
                })
            }
            _ => {
                self.storage.insert_restaurant(&restaurant).await?;
                self.record_insert(EntityTable::Restaurants, &restaurant.id, payload)
                    .await?;
                Ok(InsertOutcome::Inserted { id: restaurant.id })
            }
        }
    }

    /// Find a show by alias-resolved name, creating it if absent.
    ///
    /// An existing show comes back as [`InsertOutcome::Duplicate`] with
    /// confidence 1.0.
    #[instrument(skip_all, fields(name = name, dry_run = self.dry_run))]
    pub async fn find_or_create_show(
        &self,
        name: &str,
        network: Option<&str>,
    ) -> Result<InsertOutcome> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TastebaseError::validation("show name is empty"));
        }
        let key = self.resolver.aliases().canonical_key(name);
        if let Some(show) = self.storage.find_show_by_normalized_name(&key).await? {
            return Ok(InsertOutcome::Duplicate {
                existing_id: show.id,
                confidence: 1.0,
            });
        }
        let show = Show {
            id: new_record_id(),
            name: name.to_string(),
            normalized_name: key.clone(),
            network: network.map(String::from),
            created_at: Utc::now(),
        };
        if self.dry_run {
            return Ok(InsertOutcome::WouldInsert { id: show.id });
        }
        match self.storage.insert_show(&show).await {
            Ok(()) => {
                self.record_insert(EntityTable::Shows, &show.id, to_json(&show)?)
                    .await?;
                Ok(InsertOutcome::Inserted { id: show.id })
            }
            // Lost a race with a concurrent insert of the same show.
            Err(TastebaseError::PersistenceConflict { .. }) => {
                let existing = self
                    .storage
                    .find_show_by_normalized_name(&key)
                    .await?
                    .ok_or_else(|| TastebaseError::not_found("show", key.as_str()))?;
                Ok(InsertOutcome::Duplicate {
                    existing_id: existing.id,
                    confidence: 1.0,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Link a chef to a show. Returns the new link id, or `None` if the link
    /// already existed or this is a dry run.
    pub async fn link_chef_show(
        &self,
        chef_id: &str,
        show_id: &str,
        role: Option<&str>,
    ) -> Result<Option<String>> {
        if self.dry_run {
            return Ok(None);
        }
        let link = self.storage.link_chef_show(chef_id, show_id, role).await?;
        if let Some(id) = &link {
            self.record_insert(
                EntityTable::ChefShows,
                id,
                json!({ "chef_id": chef_id, "show_id": show_id, "role": role }),
            )
            .await?;
        }
        Ok(link)
    }

    /// Queue a discovery unless a live one with the same identity exists.
    #[instrument(skip_all, fields(kind = discovery.kind().as_str(), name = discovery.name(), dry_run = self.dry_run))]
    pub async fn queue_discovery(
        &self,
        discovery: Discovery,
        source_ref: &str,
    ) -> Result<DiscoveryOutcome> {
        let identity_key = self.resolver.identity_key(&discovery);
        if let Some(existing) = self.resolver.check_identity(&discovery).await? {
            return self.discovery_duplicate(&discovery, existing, identity_key).await;
        }
        if self.dry_run {
            return Ok(DiscoveryOutcome::WouldQueue { identity_key });
        }

        let now = Utc::now();
        let pending = PendingDiscovery {
            id: new_record_id(),
            discovery,
            identity_key: identity_key.clone(),
            source_ref: source_ref.to_string(),
            status: DiscoveryStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        match self.storage.insert_discovery(&pending).await {
            Ok(()) => {
                self.record_insert(EntityTable::PendingDiscoveries, &pending.id, to_json(&pending)?)
                    .await?;
                Ok(DiscoveryOutcome::Queued {
                    id: pending.id,
                    identity_key,
                })
            }
            // The partial unique index caught a concurrent insert.
            Err(TastebaseError::PersistenceConflict { .. }) => {
                let existing = self
                    .storage
                    .find_live_discovery(pending.discovery.kind(), &identity_key)
                    .await?
                    .ok_or_else(|| TastebaseError::not_found("discovery", identity_key.as_str()))?;
                self.discovery_duplicate(&pending.discovery, existing, identity_key)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn discovery_duplicate(
        &self,
        attempted: &Discovery,
        existing: PendingDiscovery,
        identity_key: String,
    ) -> Result<DiscoveryOutcome> {
        debug!(existing = %existing.id, identity_key, "discovery already live");
        self.record_suppressed(
            EntityTable::PendingDiscoveries,
            &existing.id,
            to_json(attempted)?,
            1.0,
        )
        .await?;
        Ok(DiscoveryOutcome::Duplicate {
            existing_id: existing.id,
            identity_key,
        })
    }

    /// Replace a chef's biography. Returns whether anything was written.
    pub async fn update_chef_bio(&self, chef_id: &str, bio: &str) -> Result<bool> {
        let chef = self
            .storage
            .get_chef(chef_id)
            .await?
            .ok_or_else(|| TastebaseError::not_found("chef", chef_id))?;
        if self.dry_run {
            return Ok(false);
        }
        let updated = self.storage.update_chef_bio(chef_id, bio).await?;
        self.audit(
            AuditEntry::new(EntityTable::Chefs.as_str(), ChangeType::Update, &self.source)
                .record(chef_id)
                .old(json!({ "bio": chef.bio }))
                .new_value(json!({ "bio": bio })),
        )
        .await?;
        Ok(updated)
    }

    /// Record a verified operating status. Returns whether anything was written.
    pub async fn update_restaurant_status(
        &self,
        restaurant_id: &str,
        status: RestaurantStatus,
    ) -> Result<bool> {
        let restaurant = self
            .storage
            .get_restaurant(restaurant_id)
            .await?
            .ok_or_else(|| TastebaseError::not_found("restaurant", restaurant_id))?;
        if self.dry_run {
            return Ok(false);
        }
        let updated = self
            .storage
            .update_restaurant_status(restaurant_id, status, Utc::now())
            .await?;
        self.audit(
            AuditEntry::new(
                EntityTable::Restaurants.as_str(),
                ChangeType::Update,
                &self.source,
            )
            .record(restaurant_id)
            .old(json!({ "status": restaurant.status }))
            .new_value(json!({ "status": status })),
        )
        .await?;
        Ok(updated)
    }

    /// Move a discovery through review (approve, reject, ...).
    pub async fn set_discovery_status(&self, id: &str, status: DiscoveryStatus) -> Result<bool> {
        let discovery = self
            .storage
            .get_discovery(id)
            .await?
            .ok_or_else(|| TastebaseError::not_found("discovery", id))?;
        if self.dry_run {
            return Ok(false);
        }
        let updated = self.storage.update_discovery_status(id, status).await?;
        self.audit(
            AuditEntry::new(
                EntityTable::PendingDiscoveries.as_str(),
                ChangeType::Update,
                &self.source,
            )
            .record(id)
            .old(json!({ "status": discovery.status }))
            .new_value(json!({ "status": status })),
        )
        .await?;
        Ok(updated)
    }
}
