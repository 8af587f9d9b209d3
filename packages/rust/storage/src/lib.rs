//! libSQL storage layer for the tastebase knowledge base.
//!
//! The [`Storage`] struct wraps an embedded libSQL database holding chefs,
//! restaurants, shows, pending discoveries, the external-call result cache,
//! the audit log, and the duplicate review queue.
//!
//! **Access rules:**
//! - Workflows and the CLI: read-write via [`Storage::open`]
//! - Reporting tools: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tastebase_shared::{
    AuditEntry, Chef, Discovery, DiscoveryKind, DiscoveryStatus, EntityTable, PendingDiscovery,
    Restaurant, RestaurantStatus, Result, ReviewItem, Show, TastebaseError, format_timestamp,
    new_record_id, parse_timestamp,
};

/// How long a connection waits on another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Primary storage handle wrapping a libSQL database.
///
/// Plain statements share one connection. Transactions each get their own
/// connection so concurrent callers never nest or join them.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
    tx_lock: tokio::sync::Mutex<()>,
}

fn connect(db: &Database) -> Result<Connection> {
    let conn = db.connect().map_err(db_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
    Ok(conn)
}

/// Map any driver error into a storage error.
fn db_err(e: impl std::fmt::Display) -> TastebaseError {
    TastebaseError::Storage(e.to_string())
}

/// Map an insert error, surfacing uniqueness violations as conflicts.
fn insert_err(table: EntityTable, e: libsql::Error) -> TastebaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        TastebaseError::conflict(table.as_str(), message)
    } else {
        TastebaseError::Storage(message)
    }
}

// ---------------------------------------------------------------------------
// Filters and row types
// ---------------------------------------------------------------------------

/// Filtered select over restaurants. `None` fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct RestaurantFilter {
    pub status: Option<RestaurantStatus>,
    pub chef_id: Option<String>,
    pub city: Option<String>,
    pub limit: Option<u32>,
}

/// One row of the external-call result cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: String,
    pub query_hash: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub query: String,
    pub results: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A stored audit entry with its row metadata.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: String,
    pub entry: AuditEntry,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TastebaseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = connect(&db)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            tx_lock: tokio::sync::Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = connect(&db)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            tx_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TastebaseError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TastebaseError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generic operations
    // -----------------------------------------------------------------------

    /// Delete a record by id. Returns whether a row was removed.
    ///
    /// Deleting an id that does not exist is not an error.
    pub async fn delete_record(&self, table: EntityTable, id: &str) -> Result<bool> {
        self.check_writable()?;
        // Table names come from a closed enum, never from input.
        let sql = format!("DELETE FROM {} WHERE id = ?1", table.as_str());
        let affected = self
            .conn
            .execute(&sql, params![id])
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    /// Fetch a record as JSON, for audit snapshots.
    pub async fn snapshot_record(
        &self,
        table: EntityTable,
        id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let value = match table {
            EntityTable::Chefs => self.get_chef(id).await?.map(serde_json::to_value),
            EntityTable::Restaurants => self.get_restaurant(id).await?.map(serde_json::to_value),
            EntityTable::Shows => self.get_show(id).await?.map(serde_json::to_value),
            EntityTable::PendingDiscoveries => {
                self.get_discovery(id).await?.map(serde_json::to_value)
            }
            EntityTable::ChefShows | EntityTable::ReviewQueue => {
                return Ok(Some(serde_json::json!({ "id": id })));
            }
        };
        value.transpose().map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Chef operations
    // -----------------------------------------------------------------------

    /// Insert a new chef record.
    pub async fn insert_chef(&self, chef: &Chef) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO chefs (id, name, normalized_name, bio, city, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chef.id.as_str(),
                    chef.name.as_str(),
                    chef.normalized_name.as_str(),
                    chef.bio.as_deref(),
                    chef.city.as_deref(),
                    chef.state.as_deref(),
                    format_timestamp(chef.created_at),
                    format_timestamp(chef.updated_at),
                ],
            )
            .await
            .map_err(|e| insert_err(EntityTable::Chefs, e))?;
        Ok(())
    }

    /// Get a chef by id.
    pub async fn get_chef(&self, id: &str) -> Result<Option<Chef>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, bio, city, state, created_at, updated_at
                 FROM chefs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_chef(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Chefs whose normalized name equals `normalized_name`.
    pub async fn find_chefs_by_normalized_name(&self, normalized_name: &str) -> Result<Vec<Chef>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, bio, city, state, created_at, updated_at
                 FROM chefs WHERE normalized_name = ?1 ORDER BY created_at",
                params![normalized_name],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_chef(&row)?);
        }
        Ok(results)
    }

    /// List chefs, optionally restricted to a city.
    pub async fn list_chefs(&self, city: Option<&str>) -> Result<Vec<Chef>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, bio, city, state, created_at, updated_at
                 FROM chefs WHERE (?1 IS NULL OR city = ?1) ORDER BY name",
                params![city],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_chef(&row)?);
        }
        Ok(results)
    }

    /// Replace a chef's biography.
    pub async fn update_chef_bio(&self, id: &str, bio: &str) -> Result<bool> {
        self.check_writable()?;
        let now = format_timestamp(Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE chefs SET bio = ?1, updated_at = ?2 WHERE id = ?3",
                params![bio, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Restaurant operations
    // -----------------------------------------------------------------------

    /// Insert a new restaurant record.
    pub async fn insert_restaurant(&self, restaurant: &Restaurant) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO restaurants (id, name, normalized_name, chef_id, city, state, address,
                                          status, status_checked_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    restaurant.id.as_str(),
                    restaurant.name.as_str(),
                    restaurant.normalized_name.as_str(),
                    restaurant.chef_id.as_deref(),
                    restaurant.city.as_deref(),
                    restaurant.state.as_deref(),
                    restaurant.address.as_deref(),
                    restaurant.status.as_str(),
                    restaurant.status_checked_at.map(format_timestamp),
                    format_timestamp(restaurant.created_at),
                    format_timestamp(restaurant.updated_at),
                ],
            )
            .await
            .map_err(|e| insert_err(EntityTable::Restaurants, e))?;
        Ok(())
    }

    /// Get a restaurant by id.
    pub async fn get_restaurant(&self, id: &str) -> Result<Option<Restaurant>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, chef_id, city, state, address, status,
                        status_checked_at, created_at, updated_at
                 FROM restaurants WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_restaurant(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Restaurants whose normalized name equals `normalized_name`.
    pub async fn find_restaurants_by_normalized_name(
        &self,
        normalized_name: &str,
    ) -> Result<Vec<Restaurant>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, chef_id, city, state, address, status,
                        status_checked_at, created_at, updated_at
                 FROM restaurants WHERE normalized_name = ?1 ORDER BY created_at",
                params![normalized_name],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_restaurant(&row)?);
        }
        Ok(results)
    }

    /// Filtered select over restaurants.
    pub async fn list_restaurants(&self, filter: &RestaurantFilter) -> Result<Vec<Restaurant>> {
        let limit = i64::from(filter.limit.unwrap_or(10_000));
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, chef_id, city, state, address, status,
                        status_checked_at, created_at, updated_at
                 FROM restaurants
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR chef_id = ?2)
                   AND (?3 IS NULL OR city = ?3)
                 ORDER BY name
                 LIMIT ?4",
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.chef_id.as_deref(),
                    filter.city.as_deref(),
                    limit,
                ],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_restaurant(&row)?);
        }
        Ok(results)
    }

    /// Record a verified operating status.
    pub async fn update_restaurant_status(
        &self,
        id: &str,
        status: RestaurantStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let checked = format_timestamp(checked_at);
        let affected = self
            .conn
            .execute(
                "UPDATE restaurants SET status = ?1, status_checked_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![status.as_str(), checked.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Show operations
    // -----------------------------------------------------------------------

    /// Insert a new show record. Fails with a conflict if the name is taken.
    pub async fn insert_show(&self, show: &Show) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO shows (id, name, normalized_name, network, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    show.id.as_str(),
                    show.name.as_str(),
                    show.normalized_name.as_str(),
                    show.network.as_deref(),
                    format_timestamp(show.created_at),
                ],
            )
            .await
            .map_err(|e| insert_err(EntityTable::Shows, e))?;
        Ok(())
    }

    /// Get a show by id.
    pub async fn get_show(&self, id: &str) -> Result<Option<Show>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, network, created_at FROM shows WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_show(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Get a show by its normalized name.
    pub async fn find_show_by_normalized_name(&self, normalized_name: &str) -> Result<Option<Show>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, normalized_name, network, created_at
                 FROM shows WHERE normalized_name = ?1",
                params![normalized_name],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_show(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Link a chef to a show. Returns the link id, or `None` if already linked.
    pub async fn link_chef_show(
        &self,
        chef_id: &str,
        show_id: &str,
        role: Option<&str>,
    ) -> Result<Option<String>> {
        self.check_writable()?;
        let id = new_record_id();
        let now = format_timestamp(Utc::now());
        let affected = self
            .conn
            .execute(
                "INSERT INTO chef_shows (id, chef_id, show_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chef_id, show_id) DO NOTHING",
                params![id.as_str(), chef_id, show_id, role, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok((affected > 0).then_some(id))
    }

    /// Show ids linked to a chef.
    pub async fn shows_for_chef(&self, chef_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT show_id FROM chef_shows WHERE chef_id = ?1 ORDER BY created_at",
                params![chef_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Pending discovery operations
    // -----------------------------------------------------------------------

    /// Insert a pending discovery.
    ///
    /// A second live record with the same kind and identity key is rejected
    /// by the partial unique index and surfaces as a persistence conflict.
    pub async fn insert_discovery(&self, discovery: &PendingDiscovery) -> Result<()> {
        self.check_writable()?;
        let payload = discovery.discovery.payload_json()?;
        self.conn
            .execute(
                "INSERT INTO pending_discoveries (id, discovery_type, identity_key, source_ref,
                                                  payload_json, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    discovery.id.as_str(),
                    discovery.discovery.kind().as_str(),
                    discovery.identity_key.as_str(),
                    discovery.source_ref.as_str(),
                    payload,
                    discovery.status.as_str(),
                    format_timestamp(discovery.created_at),
                    format_timestamp(discovery.updated_at),
                ],
            )
            .await
            .map_err(|e| insert_err(EntityTable::PendingDiscoveries, e))?;
        Ok(())
    }

    /// Get a pending discovery by id.
    pub async fn get_discovery(&self, id: &str) -> Result<Option<PendingDiscovery>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, discovery_type, identity_key, source_ref, payload_json, status,
                        created_at, updated_at
                 FROM pending_discoveries WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_discovery(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// The live discovery holding `identity_key` for `kind`, if any.
    pub async fn find_live_discovery(
        &self,
        kind: DiscoveryKind,
        identity_key: &str,
    ) -> Result<Option<PendingDiscovery>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, discovery_type, identity_key, source_ref, payload_json, status,
                        created_at, updated_at
                 FROM pending_discoveries
                 WHERE discovery_type = ?1 AND identity_key = ?2
                   AND status IN ('pending', 'approved', 'needs_review')
                 ORDER BY created_at
                 LIMIT 1",
                params![kind.as_str(), identity_key],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_discovery(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List discoveries, optionally filtered by status and kind.
    pub async fn list_discoveries(
        &self,
        status: Option<DiscoveryStatus>,
        kind: Option<DiscoveryKind>,
    ) -> Result<Vec<PendingDiscovery>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, discovery_type, identity_key, source_ref, payload_json, status,
                        created_at, updated_at
                 FROM pending_discoveries
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR discovery_type = ?2)
                 ORDER BY created_at",
                params![status.map(|s| s.as_str()), kind.map(|k| k.as_str())],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_discovery(&row)?);
        }
        Ok(results)
    }

    /// Move a discovery to a new review status.
    pub async fn update_discovery_status(&self, id: &str, status: DiscoveryStatus) -> Result<bool> {
        self.check_writable()?;
        let now = format_timestamp(Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE pending_discoveries SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now.as_str(), id],
            )
            .await
            .map_err(|e| insert_err(EntityTable::PendingDiscoveries, e))?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Result cache operations
    // -----------------------------------------------------------------------

    /// Append a cache row. Existing rows for the same hash are left alone.
    pub async fn insert_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.check_writable()?;
        let results = serde_json::to_string(&entry.results).map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO search_cache (id, query_hash, entity_type, entity_id, entity_name,
                                           query, results_json, fetched_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id.as_str(),
                    entry.query_hash.as_str(),
                    entry.entity_type.as_str(),
                    entry.entity_id.as_deref(),
                    entry.entity_name.as_deref(),
                    entry.query.as_str(),
                    results,
                    format_timestamp(entry.fetched_at),
                    format_timestamp(entry.expires_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Newest row for `query_hash` that is still valid at `now`.
    pub async fn latest_cache_entry(
        &self,
        query_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let now = format_timestamp(now);
        let mut rows = self
            .conn
            .query(
                "SELECT id, query_hash, entity_type, entity_id, entity_name, query, results_json,
                        fetched_at, expires_at
                 FROM search_cache
                 WHERE query_hash = ?1 AND expires_at > ?2
                 ORDER BY fetched_at DESC, rowid DESC
                 LIMIT 1",
                params![query_hash, now.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_cache_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Number of cache rows (expired or not) stored for a hash.
    pub async fn count_cache_rows(&self, query_hash: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM search_cache WHERE query_hash = ?1",
                params![query_hash],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<u64>(0).map_err(db_err)?),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Delete every cache row for an entity. Returns the number removed.
    pub async fn invalidate_cache(&self, entity_type: &str, entity_id: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM search_cache WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id],
            )
            .await
            .map_err(db_err)
    }

    /// Delete rows that expired before `now`. Maintenance only.
    pub async fn purge_expired_cache(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let now = format_timestamp(now);
        self.conn
            .execute(
                "DELETE FROM search_cache WHERE expires_at <= ?1",
                params![now.as_str()],
            )
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Audit log operations
    // -----------------------------------------------------------------------

    /// Write audit entries in a single transaction.
    pub async fn insert_audit_entries(&self, entries: &[AuditEntry]) -> Result<()> {
        self.check_writable()?;
        if entries.is_empty() {
            return Ok(());
        }
        let now = format_timestamp(Utc::now());
        let _guard = self.tx_lock.lock().await;
        let conn = connect(&self.db)?;
        let tx = conn.transaction().await.map_err(db_err)?;
        for entry in entries {
            let old_data = entry.old_data.as_ref().map(|v| v.to_string());
            let new_data = entry.new_data.as_ref().map(|v| v.to_string());
            tx.execute(
                "INSERT INTO audit_log (id, table_name, record_id, change_type, old_data, new_data,
                                        source, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new_record_id(),
                    entry.table.as_str(),
                    entry.record_id.as_deref(),
                    entry.change_type.as_str(),
                    old_data,
                    new_data,
                    entry.source.as_str(),
                    entry.confidence,
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Audit entries for a table, optionally narrowed to one record.
    pub async fn list_audit_entries(
        &self,
        table: &str,
        record_id: Option<&str>,
    ) -> Result<Vec<AuditRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, table_name, record_id, change_type, old_data, new_data, source,
                        confidence, created_at
                 FROM audit_log
                 WHERE table_name = ?1 AND (?2 IS NULL OR record_id = ?2)
                 ORDER BY created_at, rowid",
                params![table, record_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_audit(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Review queue operations
    // -----------------------------------------------------------------------

    /// Park a duplicate pair for a human decision.
    pub async fn insert_review_item(&self, item: &ReviewItem) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO review_queue (id, entity_type, record_a, record_b, confidence,
                                           reasoning, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.id.as_str(),
                    item.entity_type.as_str(),
                    item.record_a.as_str(),
                    item.record_b.to_string(),
                    item.confidence,
                    item.reasoning.as_str(),
                    item.status.as_str(),
                    format_timestamp(item.created_at),
                ],
            )
            .await
            .map_err(|e| insert_err(EntityTable::ReviewQueue, e))?;
        Ok(())
    }

    /// Review items in a given status (`open` or `resolved`).
    pub async fn list_review_items(&self, status: &str) -> Result<Vec<ReviewItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, record_a, record_b, confidence, reasoning, status, created_at
                 FROM review_queue WHERE status = ?1 ORDER BY created_at",
                params![status],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_review_item(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

fn get_timestamp(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_timestamp(&get_string(row, idx)?)
}

fn row_to_chef(row: &libsql::Row) -> Result<Chef> {
    Ok(Chef {
        id: get_string(row, 0)?,
        name: get_string(row, 1)?,
        normalized_name: get_string(row, 2)?,
        bio: row.get::<String>(3).ok(),
        city: row.get::<String>(4).ok(),
        state: row.get::<String>(5).ok(),
        created_at: get_timestamp(row, 6)?,
        updated_at: get_timestamp(row, 7)?,
    })
}

fn row_to_restaurant(row: &libsql::Row) -> Result<Restaurant> {
    Ok(Restaurant {
        id: get_string(row, 0)?,
        name: get_string(row, 1)?,
        normalized_name: get_string(row, 2)?,
        chef_id: row.get::<String>(3).ok(),
        city: row.get::<String>(4).ok(),
        state: row.get::<String>(5).ok(),
        address: row.get::<String>(6).ok(),
        status: get_string(row, 7)?.parse()?,
        status_checked_at: match row.get::<String>(8).ok() {
            Some(s) => Some(parse_timestamp(&s)?),
            None => None,
        },
        created_at: get_timestamp(row, 9)?,
        updated_at: get_timestamp(row, 10)?,
    })
}

fn row_to_show(row: &libsql::Row) -> Result<Show> {
    Ok(Show {
        id: get_string(row, 0)?,
        name: get_string(row, 1)?,
        normalized_name: get_string(row, 2)?,
        network: row.get::<String>(3).ok(),
        created_at: get_timestamp(row, 4)?,
    })
}

fn row_to_discovery(row: &libsql::Row) -> Result<PendingDiscovery> {
    let kind: DiscoveryKind = get_string(row, 1)?.parse()?;
    Ok(PendingDiscovery {
        id: get_string(row, 0)?,
        discovery: Discovery::from_parts(kind, &get_string(row, 4)?)?,
        identity_key: get_string(row, 2)?,
        source_ref: get_string(row, 3)?,
        status: get_string(row, 5)?.parse()?,
        created_at: get_timestamp(row, 6)?,
        updated_at: get_timestamp(row, 7)?,
    })
}

fn row_to_cache_entry(row: &libsql::Row) -> Result<CacheEntry> {
    let results_json = get_string(row, 6)?;
    Ok(CacheEntry {
        id: get_string(row, 0)?,
        query_hash: get_string(row, 1)?,
        entity_type: get_string(row, 2)?,
        entity_id: row.get::<String>(3).ok(),
        entity_name: row.get::<String>(4).ok(),
        query: get_string(row, 5)?,
        results: serde_json::from_str(&results_json)
            .map_err(|e| TastebaseError::Storage(format!("corrupt cache row: {e}")))?,
        fetched_at: get_timestamp(row, 7)?,
        expires_at: get_timestamp(row, 8)?,
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord> {
    let parse_json = |idx: i32| -> Option<serde_json::Value> {
        row.get::<String>(idx)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    };
    Ok(AuditRecord {
        id: get_string(row, 0)?,
        entry: AuditEntry {
            table: get_string(row, 1)?,
            record_id: row.get::<String>(2).ok(),
            change_type: get_string(row, 3)?.parse()?,
            old_data: parse_json(4),
            new_data: parse_json(5),
            source: get_string(row, 6)?,
            confidence: row.get::<f64>(7).ok(),
        },
        created_at: get_timestamp(row, 8)?,
    })
}

fn row_to_review_item(row: &libsql::Row) -> Result<ReviewItem> {
    let record_b = get_string(row, 3)?;
    Ok(ReviewItem {
        id: get_string(row, 0)?,
        entity_type: get_string(row, 1)?,
        record_a: get_string(row, 2)?,
        record_b: serde_json::from_str(&record_b).unwrap_or(serde_json::Value::String(record_b)),
        confidence: row.get::<f64>(4).map_err(db_err)?,
        reasoning: get_string(row, 5)?,
        status: get_string(row, 6)?,
        created_at: get_timestamp(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tastebase_shared::{ChangeType, ShowDiscovery};

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("tb_test_{}.db", new_record_id()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn chef(name: &str, city: Option<&str>) -> Chef {
        let now = Utc::now();
        Chef {
            id: new_record_id(),
            name: name.into(),
            normalized_name: name.to_lowercase(),
            bio: None,
            city: city.map(String::from),
            state: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn restaurant(name: &str, status: RestaurantStatus) -> Restaurant {
        let now = Utc::now();
        Restaurant {
            id: new_record_id(),
            name: name.into(),
            normalized_name: name.to_lowercase(),
            chef_id: None,
            city: Some("Chicago".into()),
            state: Some("IL".into()),
            address: None,
            status,
            status_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn discovery(name: &str, key: &str) -> PendingDiscovery {
        let now = Utc::now();
        PendingDiscovery {
            id: new_record_id(),
            discovery: Discovery::Show(ShowDiscovery {
                name: name.into(),
                network: None,
                season: None,
            }),
            identity_key: key.into(),
            source_ref: "test".into(),
            status: DiscoveryStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn cache_entry(hash: &str, ttl: Duration, results: serde_json::Value) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            id: new_record_id(),
            query_hash: hash.into(),
            entity_type: "chef".into(),
            entity_id: Some("chef-1".into()),
            entity_name: None,
            query: "who is chef one".into(),
            results,
            fetched_at: now,
            expires_at: now + ttl,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("tb_test_{}.db", new_record_id()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn chef_crud() {
        let storage = test_storage().await;
        let c = chef("Stephanie Izard", Some("Chicago"));
        storage.insert_chef(&c).await.expect("insert chef");

        let found = storage.get_chef(&c.id).await.unwrap().expect("chef exists");
        assert_eq!(found.name, "Stephanie Izard");
        assert_eq!(found.city.as_deref(), Some("Chicago"));
        assert!(found.bio.is_none());

        assert!(storage.update_chef_bio(&c.id, "Top Chef winner").await.unwrap());
        let found = storage.get_chef(&c.id).await.unwrap().unwrap();
        assert_eq!(found.bio.as_deref(), Some("Top Chef winner"));

        let by_name = storage
            .find_chefs_by_normalized_name("stephanie izard")
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(storage.list_chefs(Some("Chicago")).await.unwrap().len(), 1);
        assert!(storage.list_chefs(Some("Austin")).await.unwrap().is_empty());

        assert!(storage.delete_record(EntityTable::Chefs, &c.id).await.unwrap());
        assert!(storage.get_chef(&c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_record_is_harmless() {
        let storage = test_storage().await;
        let removed = storage
            .delete_record(EntityTable::Restaurants, "does-not-exist")
            .await
            .expect("delete");
        assert!(!removed);
    }

    #[tokio::test]
    async fn restaurant_filter_and_status_update() {
        let storage = test_storage().await;
        let open = restaurant("Girl & the Goat", RestaurantStatus::Open);
        let closed = restaurant("Little Goat", RestaurantStatus::Closed);
        storage.insert_restaurant(&open).await.unwrap();
        storage.insert_restaurant(&closed).await.unwrap();

        let filter = RestaurantFilter {
            status: Some(RestaurantStatus::Open),
            ..Default::default()
        };
        let listed = storage.list_restaurants(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, open.id);

        let checked = Utc::now();
        assert!(
            storage
                .update_restaurant_status(&open.id, RestaurantStatus::Closed, checked)
                .await
                .unwrap()
        );
        let found = storage.get_restaurant(&open.id).await.unwrap().unwrap();
        assert_eq!(found.status, RestaurantStatus::Closed);
        assert!(found.status_checked_at.is_some());
        assert!(storage.list_restaurants(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn show_names_are_unique_and_links_idempotent() {
        let storage = test_storage().await;
        let now = Utc::now();
        let show = Show {
            id: new_record_id(),
            name: "Top Chef".into(),
            normalized_name: "top chef".into(),
            network: Some("Bravo".into()),
            created_at: now,
        };
        storage.insert_show(&show).await.unwrap();
        let dup = Show {
            id: new_record_id(),
            ..show.clone()
        };
        let err = storage.insert_show(&dup).await.unwrap_err();
        assert!(matches!(err, TastebaseError::PersistenceConflict { .. }));

        let c = chef("Stephanie Izard", None);
        storage.insert_chef(&c).await.unwrap();
        let first = storage.link_chef_show(&c.id, &show.id, Some("winner")).await.unwrap();
        assert!(first.is_some());
        let second = storage.link_chef_show(&c.id, &show.id, None).await.unwrap();
        assert!(second.is_none());
        assert_eq!(storage.shows_for_chef(&c.id).await.unwrap(), vec![show.id.clone()]);
    }

    #[tokio::test]
    async fn live_discovery_identity_is_unique() {
        let storage = test_storage().await;
        let first = discovery("Top Chef", "top chef");
        storage.insert_discovery(&first).await.expect("first insert");

        let second = discovery("TOP.CHEF!!", "top chef");
        let err = storage.insert_discovery(&second).await.unwrap_err();
        assert!(matches!(err, TastebaseError::PersistenceConflict { .. }));

        let live = storage
            .find_live_discovery(DiscoveryKind::Show, "top chef")
            .await
            .unwrap()
            .expect("live record");
        assert_eq!(live.id, first.id);

        // Rejecting frees the identity for a fresh discovery.
        storage
            .update_discovery_status(&first.id, DiscoveryStatus::Rejected)
            .await
            .unwrap();
        storage.insert_discovery(&second).await.expect("insert after reject");
        let pending = storage
            .list_discoveries(Some(DiscoveryStatus::Pending), Some(DiscoveryKind::Show))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }

    #[tokio::test]
    async fn cache_reads_newest_unexpired_row() {
        let storage = test_storage().await;
        storage
            .insert_cache_entry(&cache_entry("h1", Duration::days(1), serde_json::json!("old")))
            .await
            .unwrap();
        storage
            .insert_cache_entry(&cache_entry("h1", Duration::days(1), serde_json::json!("new")))
            .await
            .unwrap();
        storage
            .insert_cache_entry(&cache_entry("h2", Duration::seconds(-1), serde_json::json!("gone")))
            .await
            .unwrap();

        let hit = storage.latest_cache_entry("h1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(hit.results, serde_json::json!("new"));
        assert_eq!(storage.count_cache_rows("h1").await.unwrap(), 2);

        assert!(storage.latest_cache_entry("h2", Utc::now()).await.unwrap().is_none());
        assert_eq!(storage.count_cache_rows("h2").await.unwrap(), 1);

        assert_eq!(storage.purge_expired_cache(Utc::now()).await.unwrap(), 1);
        assert_eq!(storage.invalidate_cache("chef", "chef-1").await.unwrap(), 2);
        assert!(storage.latest_cache_entry("h1", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audit_batch_roundtrip() {
        let storage = test_storage().await;
        let entries = vec![
            AuditEntry::new("chefs", ChangeType::Insert, "test")
                .record("c1")
                .new_value(serde_json::json!({"name": "A"})),
            AuditEntry::new("chefs", ChangeType::DuplicateSuppressed, "test")
                .record("c1")
                .confidence(0.9),
        ];
        storage.insert_audit_entries(&entries).await.unwrap();

        let stored = storage.list_audit_entries("chefs", Some("c1")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].entry.change_type, ChangeType::Insert);
        assert_eq!(stored[0].entry.new_data, Some(serde_json::json!({"name": "A"})));
        assert_eq!(stored[1].entry.confidence, Some(0.9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_audit_batches_do_not_nest() {
        let storage = std::sync::Arc::new(test_storage().await);
        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..40 {
            let storage = storage.clone();
            tasks.spawn(async move {
                let c = chef(&format!("Chef {n}"), Some("Chicago"));
                storage.insert_chef(&c).await?;
                let entries = vec![
                    AuditEntry::new("chefs", ChangeType::Insert, "test").record(c.id.as_str()),
                    AuditEntry::new("chefs", ChangeType::Update, "test").record(c.id.as_str()),
                ];
                storage.insert_audit_entries(&entries).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(storage.list_chefs(None).await.unwrap().len(), 40);
        assert_eq!(storage.list_audit_entries("chefs", None).await.unwrap().len(), 80);
    }

    #[tokio::test]
    async fn review_queue_roundtrip() {
        let storage = test_storage().await;
        let item = ReviewItem {
            id: new_record_id(),
            entity_type: "restaurants".into(),
            record_a: "r1".into(),
            record_b: serde_json::json!({"name": "Aba"}),
            confidence: 0.75,
            reasoning: "same chef, similar name".into(),
            status: "open".into(),
            created_at: Utc::now(),
        };
        storage.insert_review_item(&item).await.unwrap();
        let open = storage.list_review_items("open").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].record_b, serde_json::json!({"name": "Aba"}));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("tb_test_{}.db", new_record_id()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_chef(&chef("A", None)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.insert_chef(&chef("B", None)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
