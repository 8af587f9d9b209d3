//! The call path every workflow step goes through: cache, then retried
//! gateway call, then usage tracking and cache write.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tastebase_shared::{AppConfig, ModelRate, Result, TastebaseError, TokenUsage};
use tastebase_storage::Storage;
use tracing::{info, instrument, warn};

use crate::cache::{CacheOptions, ResultCache};
use crate::client::{Gateway, GenerateRequest, GenerateResponse};
use crate::retry::{AttemptOutcome, RetryPolicy};
use crate::usage::{UsageTracker, cost_for};

/// Result of one logical external call.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCall {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    /// USD billed for this call. Zero on a cache hit.
    pub cost_usd: f64,
    pub from_cache: bool,
}

/// A call that reports failure in-band, for the outcome retry variant.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub call: Option<GatewayCall>,
    pub error: Option<String>,
    /// Usage spent across failed attempts too.
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

impl AttemptOutcome for CallOutcome {
    fn failure(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Clone)]
pub struct ExternalCalls {
    gateway: Arc<dyn Gateway>,
    retry: RetryPolicy,
    cache: ResultCache,
    tracker: UsageTracker,
    rates: BTreeMap<String, ModelRate>,
}

impl ExternalCalls {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        retry: RetryPolicy,
        cache: ResultCache,
        tracker: UsageTracker,
        rates: BTreeMap<String, ModelRate>,
    ) -> Self {
        Self {
            gateway,
            retry,
            cache,
            tracker,
            rates,
        }
    }

    pub fn from_config(
        gateway: Arc<dyn Gateway>,
        storage: Arc<Storage>,
        config: &AppConfig,
        tracker: UsageTracker,
    ) -> Self {
        Self::new(
            gateway,
            RetryPolicy::from(&config.retry),
            ResultCache::new(storage, config.cache.clone()),
            tracker,
            config.rates.clone(),
        )
    }

    pub fn tracker(&self) -> &UsageTracker {
        &self.tracker
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn model(&self) -> &str {
        self.gateway.model()
    }

    /// USD for `usage` at the gateway model's rate.
    pub fn cost_of(&self, usage: TokenUsage) -> f64 {
        cost_for(&self.rates, self.gateway.model(), usage)
    }

    /// Worst-case USD for `request` if it is not served from cache,
    /// counting every retry attempt.
    pub fn worst_case_cost(&self, request: &GenerateRequest, input_tokens: u64) -> f64 {
        let per_attempt = TokenUsage::new(input_tokens, request.max_output_tokens());
        self.cost_of(per_attempt) * f64::from(self.retry.max_attempts)
    }

    /// Generate text for `request`.
    ///
    /// With `cache` set, a fresh cached result is returned without calling
    /// the gateway. Misses are retried on transient failure, tracked, and
    /// written back to the cache unless `dry_run` is set.
    #[instrument(skip_all, fields(model = %self.gateway.model(), cache_kind = cache.map(|c| c.kind.as_str())))]
    pub async fn generate(
        &self,
        request: &GenerateRequest,
        cache: Option<&CacheOptions>,
        dry_run: bool,
    ) -> Result<GatewayCall> {
        if let Some(hit) = self.lookup(request, cache).await {
            return Ok(hit);
        }

        let response = self
            .retry
            .run_default("gateway.generate", |_| self.gateway.generate(request))
            .await?;
        let call = self.account(response);

        if let Some(opts) = cache {
            self.store(request, &call, opts, dry_run).await;
        }
        Ok(call)
    }

    /// Like [`generate`](Self::generate), but failures come back in-band and
    /// are retried by message classification.
    ///
    /// `accept` validates the text; a rejection message is retried when it
    /// looks transient and otherwise ends the call.
    #[instrument(skip_all, fields(model = %self.gateway.model()))]
    pub async fn generate_outcome<A>(
        &self,
        request: &GenerateRequest,
        cache: Option<&CacheOptions>,
        dry_run: bool,
        accept: A,
    ) -> CallOutcome
    where
        A: Fn(&str) -> std::result::Result<(), String>,
    {
        if let Some(hit) = self.lookup(request, cache).await {
            if accept(&hit.text).is_ok() {
                return CallOutcome {
                    call: Some(hit),
                    error: None,
                    usage: TokenUsage::default(),
                    cost_usd: 0.0,
                };
            }
        }

        // Usage and cost across every attempt, priced per response model.
        let spent_total = std::sync::Mutex::new((TokenUsage::default(), 0.0_f64));
        let (this, spent, accept) = (self, &spent_total, &accept);
        let outcome = self
            .retry
            .run_outcome_default("gateway.generate_outcome", move |_| async move {
                match this.gateway.generate(request).await {
                    Ok(response) => {
                        let call = this.account(response);
                        if let Ok(mut total) = spent.lock() {
                            total.0 += call.usage;
                            total.1 += call.cost_usd;
                        }
                        match accept(&call.text) {
                            Ok(()) => CallOutcome {
                                call: Some(call),
                                error: None,
                                usage: TokenUsage::default(),
                                cost_usd: 0.0,
                            },
                            Err(reason) => CallOutcome {
                                call: None,
                                error: Some(reason),
                                usage: TokenUsage::default(),
                                cost_usd: 0.0,
                            },
                        }
                    }
                    Err(e) => CallOutcome {
                        call: None,
                        error: Some(e.to_string()),
                        usage: TokenUsage::default(),
                        cost_usd: 0.0,
                    },
                }
            })
            .await;

        let (usage, cost_usd) = spent_total.into_inner().unwrap_or_default();
        let outcome = CallOutcome {
            usage,
            cost_usd,
            ..outcome
        };

        if let (Some(call), Some(opts)) = (&outcome.call, cache) {
            self.store(request, call, opts, dry_run).await;
        }
        outcome
    }

    async fn lookup(
        &self,
        request: &GenerateRequest,
        cache: Option<&CacheOptions>,
    ) -> Option<GatewayCall> {
        cache?;
        let entry = match self.cache.get(&request.prompt).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(error = %e, "cache read failed, calling gateway");
                return None;
            }
        };
        let text = entry.results.get("text")?.as_str()?.to_string();
        let model = entry
            .results
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        info!(entity_type = %entry.entity_type, "served from cache");
        Some(GatewayCall {
            text,
            model,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            from_cache: true,
        })
    }

    fn account(&self, response: GenerateResponse) -> GatewayCall {
        self.tracker.track_usage(&response.model, response.usage);
        let cost_usd = cost_for(&self.rates, &response.model, response.usage);
        GatewayCall {
            text: response.text,
            model: response.model,
            usage: response.usage,
            cost_usd,
            from_cache: false,
        }
    }

    async fn store(
        &self,
        request: &GenerateRequest,
        call: &GatewayCall,
        opts: &CacheOptions,
        dry_run: bool,
    ) {
        if dry_run {
            return;
        }
        let results = json!({
            "text": call.text,
            "model": call.model,
            "usage": call.usage,
        });
        if let Err(e) = self.cache.put(&request.prompt, results, opts).await {
            warn!(error = %e, "cache write failed");
        }
    }
}

impl CallOutcome {
    /// Convert into a `Result`, surfacing the in-band failure as a gateway error.
    pub fn into_result(self) -> Result<GatewayCall> {
        match (self.call, self.error) {
            (Some(call), None) => Ok(GatewayCall {
                usage: self.usage,
                cost_usd: self.cost_usd,
                ..call
            }),
            (_, error) => Err(TastebaseError::Gateway {
                status: None,
                message: error.unwrap_or_else(|| "call produced no result".into()),
            }),
        }
    }
}
