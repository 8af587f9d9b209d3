//! Shared types, error model, and configuration for tastebase.
//!
//! This crate is the foundation depended on by all other tastebase crates.
//! It provides:
//! - [`TastebaseError`], the unified error type
//! - Domain types ([`Chef`], [`Restaurant`], [`Show`], [`Discovery`], [`AuditEntry`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BudgetConfig, CacheConfig, DEFAULT_RATE_KEY, DatabaseConfig, DedupConfig,
    GatewayConfig, ModelRate, PoolConfig, RetryConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, resolve_api_key,
};
pub use error::{Result, TastebaseError, is_transient_message};
pub use types::{
    AuditEntry, ChangeType, Chef, ChefDiscovery, Discovery, DiscoveryKind, DiscoveryStatus,
    EntityTable, PendingDiscovery, Restaurant, RestaurantDiscovery, RestaurantStatus, ReviewItem,
    Show, ShowDiscovery, TokenUsage, format_timestamp, new_record_id, parse_timestamp,
};
