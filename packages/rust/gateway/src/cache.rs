//! TTL-governed cache of external call results, backed by `search_cache`.
//!
//! Rows are append-only: a put always inserts, a get reads the newest row
//! that has not expired. Expired rows linger until [`ResultCache::purge_expired`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tastebase_shared::{CacheConfig, Result, new_record_id};
use tastebase_storage::{CacheEntry, Storage};
use tracing::debug;

/// Volatility class of a query; decides its default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Biography,
    ShowCast,
    RestaurantDetails,
    OperatingStatus,
    General,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Biography => "biography",
            Self::ShowCast => "show_cast",
            Self::RestaurantDetails => "restaurant_details",
            Self::OperatingStatus => "operating_status",
            Self::General => "general",
        }
    }

    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        let days = |d: u64| Duration::days(d as i64);
        match self {
            Self::Biography => days(config.biography_ttl_days),
            Self::ShowCast => days(config.show_cast_ttl_days),
            Self::RestaurantDetails => days(config.restaurant_details_ttl_days),
            Self::OperatingStatus => Duration::hours(config.operating_status_ttl_hours as i64),
            Self::General => days(config.general_ttl_days),
        }
    }
}

/// Where a cached result belongs and how long it lives.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub kind: QueryKind,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    /// Overrides the kind's TTL.
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    pub fn new(kind: QueryKind, entity_type: impl Into<String>) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            entity_id: None,
            entity_name: None,
            ttl: None,
        }
    }

    pub fn entity(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Trim, lowercase, and collapse internal whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable cache key for a query.
pub fn query_hash(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct ResultCache {
    storage: Arc<Storage>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(storage: Arc<Storage>, config: CacheConfig) -> Self {
        Self { storage, config }
    }

    /// Newest unexpired entry for `query`, if any.
    pub async fn get(&self, query: &str) -> Result<Option<CacheEntry>> {
        let hash = query_hash(query);
        let entry = self.storage.latest_cache_entry(&hash, Utc::now()).await?;
        debug!(hash = %&hash[..12], hit = entry.is_some(), "cache lookup");
        Ok(entry)
    }

    /// Insert a new row for `query`.
    pub async fn put(
        &self,
        query: &str,
        results: serde_json::Value,
        opts: &CacheOptions,
    ) -> Result<CacheEntry> {
        let now = Utc::now();
        let ttl = opts.ttl.unwrap_or_else(|| opts.kind.ttl(&self.config));
        let entry = CacheEntry {
            id: new_record_id(),
            query_hash: query_hash(query),
            entity_type: opts.entity_type.clone(),
            entity_id: opts.entity_id.clone(),
            entity_name: opts.entity_name.clone(),
            query: query.to_string(),
            results,
            fetched_at: now,
            expires_at: now + ttl,
        };
        self.storage.insert_cache_entry(&entry).await?;
        debug!(kind = opts.kind.as_str(), ttl_secs = ttl.num_seconds(), "cache put");
        Ok(entry)
    }

    /// Drop every row for an entity. Returns the number of rows removed.
    pub async fn invalidate(&self, entity_type: &str, entity_id: &str) -> Result<u64> {
        self.storage.invalidate_cache(entity_type, entity_id).await
    }

    /// Delete expired rows.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.storage.purge_expired_cache(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn cache() -> ResultCache {
        let tmp = std::env::temp_dir().join(format!("tb_cache_{}.db", new_record_id()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        ResultCache::new(Arc::new(storage), CacheConfig::default())
    }

    #[test]
    fn normalization_makes_keys_stable() {
        assert_eq!(normalize_query("  Who is   Chef\tX? "), "who is chef x?");
        assert_eq!(query_hash("Who is chef X?"), query_hash("who  is chef x?"));
        assert_ne!(query_hash("chef x"), query_hash("chef y"));
    }

    #[test]
    fn ttl_follows_volatility() {
        let config = CacheConfig::default();
        assert_eq!(QueryKind::Biography.ttl(&config), Duration::days(90));
        assert_eq!(QueryKind::ShowCast.ttl(&config), Duration::days(30));
        assert_eq!(QueryKind::RestaurantDetails.ttl(&config), Duration::days(14));
        assert_eq!(QueryKind::OperatingStatus.ttl(&config), Duration::hours(24));
        assert_eq!(QueryKind::General.ttl(&config), Duration::days(7));
    }

    #[tokio::test]
    async fn put_then_get_hits_until_expiry() {
        let cache = cache().await;
        let opts = CacheOptions::new(QueryKind::Biography, "chef").entity("c1");
        cache.put("Bio of Chef", json!({"text": "a"}), &opts).await.unwrap();

        let hit = cache.get("bio of  chef").await.unwrap().expect("hit");
        assert_eq!(hit.results, json!({"text": "a"}));
        assert_eq!(hit.entity_id.as_deref(), Some("c1"));

        let expired = CacheOptions::new(QueryKind::General, "chef").ttl(Duration::zero());
        cache.put("stale query", json!(1), &expired).await.unwrap();
        assert!(cache.get("stale query").await.unwrap().is_none());
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn newer_put_shadows_older() {
        let cache = cache().await;
        let opts = CacheOptions::new(QueryKind::General, "chef").entity("c1");
        cache.put("q", json!("first"), &opts).await.unwrap();
        cache.put("q", json!("second"), &opts).await.unwrap();
        assert_eq!(cache.get("q").await.unwrap().unwrap().results, json!("second"));

        assert_eq!(cache.invalidate("chef", "c1").await.unwrap(), 2);
        assert!(cache.get("q").await.unwrap().is_none());
    }
}
