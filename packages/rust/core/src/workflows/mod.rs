//! Concrete enrichment workflows.

mod discover_show;
mod enrich_chef;
mod verify_restaurant;

pub use discover_show::{CastMember, DiscoverShow, DiscoverShowInput, ShowCast};
pub use enrich_chef::{ChefProfile, EnrichChef, EnrichChefInput};
pub use verify_restaurant::{StatusVerification, VerifyRestaurant, VerifyRestaurantInput, parse_status};

use serde::de::DeserializeOwned;
use tastebase_gateway::GenerateRequest;
use tastebase_shared::{Result, TastebaseError, TokenUsage};

use crate::engine::CostEstimate;
use crate::services::Services;

/// Prompt size of one adjudication request, in tokens.
const ADJUDICATION_INPUT_TOKENS: u64 = 400;
const ADJUDICATION_OUTPUT_TOKENS: u64 = 300;

/// Rough token count for `text` (4 chars per token).
pub(crate) fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Cost bounds for one gateway call that misses the cache.
pub(crate) fn call_estimate(services: &Services, request: &GenerateRequest) -> CostEstimate {
    let input = approx_tokens(&request.system) + approx_tokens(&request.prompt);
    let output = request.max_output_tokens();
    let attempts = u64::from(services.config.retry.max_attempts.max(1));
    CostEstimate {
        estimated_tokens: input + output / 2,
        estimated_usd: services.calls.cost_of(TokenUsage::new(input, output / 2)),
        max_tokens: (input + output) * attempts,
        max_usd: services.calls.worst_case_cost(request, input),
    }
}

/// Cost bounds for dedup adjudication across `inserts` gated writes.
pub(crate) fn adjudication_estimate(services: &Services, inserts: u64) -> CostEstimate {
    let attempts = u64::from(services.config.retry.max_attempts.max(1));
    let candidates = services.config.dedup.max_candidates as u64;
    let per_call = ADJUDICATION_INPUT_TOKENS + ADJUDICATION_OUTPUT_TOKENS;
    let unit = services.calls.cost_of(TokenUsage::new(
        ADJUDICATION_INPUT_TOKENS,
        ADJUDICATION_OUTPUT_TOKENS,
    ));
    // Most inserts meet no candidates; expect one adjudication in four.
    CostEstimate {
        estimated_tokens: per_call * inserts / 4,
        estimated_usd: unit * inserts as f64 / 4.0,
        max_tokens: per_call * inserts * candidates * attempts,
        max_usd: unit * (inserts * candidates * attempts) as f64,
    }
}

/// Parse the first JSON array in `text`, tolerating surrounding prose
/// and code fences.
pub(crate) fn parse_json_list<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let start = text
        .find('[')
        .ok_or_else(|| TastebaseError::parse("response contains no JSON array"))?;
    let end = text
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| TastebaseError::parse("response JSON array is not closed"))?;
    serde_json::from_str(&text[start..=end])
        .map_err(|e| TastebaseError::parse(format!("invalid JSON array: {e}")))
}

/// Trim a free-text field, mapping blanks to `None`.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
