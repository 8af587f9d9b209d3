//! Application configuration for tastebase.
//!
//! User config lives at `~/.tastebase/tastebase.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, TastebaseError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tastebase.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tastebase";

/// Rate-table key used when a model has no explicit entry.
pub const DEFAULT_RATE_KEY: &str = "default";

// ---------------------------------------------------------------------------
// Config structs (matching tastebase.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// External call gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Per-run budget and deadline.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Backoff schedule for external calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Result cache TTLs.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Duplicate resolver thresholds and aliases.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Fan-out worker pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Database location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// USD rates per model, keyed by model id (plus `default`).
    #[serde(default = "default_rates")]
    pub rates: BTreeMap<String, ModelRate>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            dedup: DedupConfig::default(),
            pool: PoolConfig::default(),
            database: DatabaseConfig::default(),
            rates: default_rates(),
        }
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible chat completions API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for generation and adjudication.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            default_model: default_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_request_timeout() -> u64 {
    120
}

/// `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Ceiling on a single run's worst-case spend, in USD.
    #[serde(default = "default_max_usd")]
    pub max_usd_per_run: f64,

    /// Wall-clock deadline for one run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_usd_per_run: default_max_usd(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

impl BudgetConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

fn default_max_usd() -> f64 {
    0.50
}
fn default_run_timeout() -> u64 {
    300
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

/// `[cache]` section. TTLs are in days except operating status (hours).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_biography_ttl")]
    pub biography_ttl_days: u64,
    #[serde(default = "default_show_cast_ttl")]
    pub show_cast_ttl_days: u64,
    #[serde(default = "default_restaurant_ttl")]
    pub restaurant_details_ttl_days: u64,
    #[serde(default = "default_status_ttl")]
    pub operating_status_ttl_hours: u64,
    #[serde(default = "default_general_ttl")]
    pub general_ttl_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            biography_ttl_days: default_biography_ttl(),
            show_cast_ttl_days: default_show_cast_ttl(),
            restaurant_details_ttl_days: default_restaurant_ttl(),
            operating_status_ttl_hours: default_status_ttl(),
            general_ttl_days: default_general_ttl(),
        }
    }
}

fn default_biography_ttl() -> u64 {
    90
}
fn default_show_cast_ttl() -> u64 {
    30
}
fn default_restaurant_ttl() -> u64 {
    14
}
fn default_status_ttl() -> u64 {
    24
}
fn default_general_ttl() -> u64 {
    7
}

/// `[dedup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Lexical similarity below which a pair is dropped without adjudication.
    #[serde(default = "default_prefilter")]
    pub prefilter_threshold: f64,

    /// Adjudicated confidence needed to merge automatically.
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f64,

    /// Adjudicated confidence needed to flag a pair for human review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,

    /// Maximum Tier 2 adjudications per insert.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Extra show-name aliases (alias -> canonical name).
    #[serde(default)]
    pub show_aliases: BTreeMap<String, String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            prefilter_threshold: default_prefilter(),
            merge_threshold: default_merge_threshold(),
            review_threshold: default_review_threshold(),
            max_candidates: default_max_candidates(),
            show_aliases: BTreeMap::new(),
        }
    }
}

fn default_prefilter() -> f64 {
    0.3
}
fn default_merge_threshold() -> f64 {
    0.85
}
fn default_review_threshold() -> f64 {
    0.7
}
fn default_max_candidates() -> usize {
    5
}

/// `[pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path; `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.tastebase/tastebase.db".into()
}

/// `[rates.<model>]` entry: USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelRate {
    /// USD for a given token split at this rate.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

fn default_rates() -> BTreeMap<String, ModelRate> {
    let mut rates = BTreeMap::new();
    rates.insert(
        DEFAULT_RATE_KEY.to_string(),
        ModelRate {
            input_per_million: 0.15,
            output_per_million: 0.60,
        },
    );
    rates.insert(
        "openai/gpt-4o-mini".to_string(),
        ModelRate {
            input_per_million: 0.15,
            output_per_million: 0.60,
        },
    );
    rates.insert(
        "openai/gpt-4o".to_string(),
        ModelRate {
            input_per_million: 2.50,
            output_per_million: 10.00,
        },
    );
    rates
}

impl AppConfig {
    /// Resolve the rate for `model`, falling back to the `default` entry.
    pub fn rate_for(&self, model: &str) -> Option<ModelRate> {
        self.rates
            .get(model)
            .or_else(|| self.rates.get(DEFAULT_RATE_KEY))
            .copied()
    }

    /// Resolve the database path, expanding a leading `~`.
    pub fn database_path(&self) -> Result<PathBuf> {
        expand_home(&self.database.path)
    }

    /// Sanity-check values that serde defaults cannot guard.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.gateway.base_url).map_err(|e| {
            TastebaseError::config(format!("invalid gateway.base_url `{}`: {e}", self.gateway.base_url))
        })?;
        if self.retry.max_attempts == 0 {
            return Err(TastebaseError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(TastebaseError::config("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(TastebaseError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        let d = &self.dedup;
        for (name, value) in [
            ("prefilter_threshold", d.prefilter_threshold),
            ("merge_threshold", d.merge_threshold),
            ("review_threshold", d.review_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TastebaseError::config(format!(
                    "dedup.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if d.review_threshold > d.merge_threshold {
            return Err(TastebaseError::config(
                "dedup.review_threshold must not exceed dedup.merge_threshold",
            ));
        }
        if self.budget.max_usd_per_run < 0.0 {
            return Err(TastebaseError::config("budget.max_usd_per_run must be >= 0"));
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| TastebaseError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tastebase/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TastebaseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tastebase/tastebase.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TastebaseError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        TastebaseError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TastebaseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TastebaseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TastebaseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the gateway API key from the env var named in config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.gateway.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(TastebaseError::config(format!(
            "gateway API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_usd_per_run"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.retry, RetryConfig::default());
        assert_eq!(parsed.dedup.merge_threshold, 0.85);
        assert_eq!(parsed.pool.concurrency, 10);
        parsed.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[budget]
max_usd_per_run = 2.0

[dedup.show_aliases]
"ddd" = "Diners, Drive-Ins and Dives"

[rates.custom-model]
input_per_million = 1.0
output_per_million = 2.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.budget.max_usd_per_run, 2.0);
        assert_eq!(config.budget.run_timeout_secs, 300);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.dedup.show_aliases.len(), 1);
        assert!(config.rates.contains_key("custom-model"));
    }

    #[test]
    fn rate_lookup_falls_back_to_default() {
        let config = AppConfig::default();
        let rate = config.rate_for("someone/unknown-model").expect("default rate");
        assert_eq!(rate, config.rates[DEFAULT_RATE_KEY]);
        let cost = rate.cost(1_000_000, 0);
        assert!((cost - 0.15).abs() < 1e-9);
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.dedup.review_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gateway.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_resolution() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.gateway.api_key_env = "TB_TEST_NONEXISTENT_KEY_12345".into();
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn home_expansion() {
        let plain = expand_home("/tmp/x.db").unwrap();
        assert_eq!(plain, PathBuf::from("/tmp/x.db"));
    }
}
