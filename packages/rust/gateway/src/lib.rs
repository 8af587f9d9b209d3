//! External call gateway for tastebase.
//!
//! Every costly generative or search call flows through [`ExternalCalls`]:
//! a TTL cache lookup, then a [`Gateway`] call wrapped in [`RetryPolicy`],
//! with token usage accumulated in a shared [`UsageTracker`].

pub mod cache;
pub mod calls;
pub mod client;
pub mod openrouter;
pub mod retry;
pub mod usage;

pub use cache::{CacheOptions, QueryKind, ResultCache, normalize_query, query_hash};
pub use calls::{CallOutcome, ExternalCalls, GatewayCall};
#[cfg(any(test, feature = "mock"))]
pub use client::mock;
pub use client::{Gateway, GenerateOptions, GenerateRequest, GenerateResponse, SearchContextSize};
pub use openrouter::OpenRouterGateway;
pub use retry::{AttemptOutcome, RetryPolicy};
pub use usage::{UsageTracker, cost_for};
