//! Tier 2: an external arbiter judges pairs that cleared the lexical tier.

use serde::{Deserialize, Serialize};
use tastebase_gateway::{ExternalCalls, GenerateRequest};
use tastebase_shared::{Chef, DedupConfig, Restaurant, TokenUsage};
use tracing::{debug, instrument, warn};

use crate::normalize::normalize_place;

const SYSTEM_PROMPT: &str = "You decide whether two records describe the same real-world entity. \
Answer with a single JSON object: {\"is_duplicate\": true|false, \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}.";

/// The fields of a record the arbiter sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl CandidateRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn in_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }
}

impl From<&Restaurant> for CandidateRecord {
    fn from(r: &Restaurant) -> Self {
        Self {
            id: Some(r.id.clone()),
            name: r.name.clone(),
            city: r.city.clone(),
            state: r.state.clone(),
            address: r.address.clone(),
        }
    }
}

impl From<&Chef> for CandidateRecord {
    fn from(c: &Chef) -> Self {
        Self {
            id: Some(c.id.clone()),
            name: c.name.clone(),
            city: c.city.clone(),
            state: c.state.clone(),
            address: None,
        }
    }
}

/// An adjudicated candidate pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCandidatePair {
    pub entity_a: CandidateRecord,
    pub entity_b: CandidateRecord,
    pub lexical_similarity: f64,
    pub adjudicated_confidence: f64,
    pub is_duplicate: bool,
    pub reasoning: String,
    /// Spend on the arbiter call, zero when it was skipped or cached.
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// What to do with an adjudicated pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Confident duplicate: suppress the write.
    Merge,
    /// Possible duplicate: write, and queue the pair for a human.
    Review,
    Distinct,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    is_duplicate: bool,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// Extract a verdict from the arbiter's text, tolerating surrounding prose.
fn parse_verdict(text: &str) -> Option<Verdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let verdict: Verdict = serde_json::from_str(&text[start..=end]).ok()?;
    if !verdict.confidence.is_finite() {
        return None;
    }
    Some(Verdict {
        confidence: verdict.confidence.clamp(0.0, 1.0),
        ..verdict
    })
}

/// Both sides name a place and the places differ.
fn places_conflict(a: &Option<String>, b: &Option<String>) -> Option<bool> {
    match (a.as_deref(), b.as_deref()) {
        (Some(a), Some(b)) if !a.trim().is_empty() && !b.trim().is_empty() => {
            Some(normalize_place(a) != normalize_place(b))
        }
        _ => None,
    }
}

/// Whether two records are in provably different places.
///
/// Cities decide when both sides have one; otherwise states do.
pub fn geographically_distinct(a: &CandidateRecord, b: &CandidateRecord) -> bool {
    places_conflict(&a.city, &b.city)
        .or_else(|| places_conflict(&a.state, &b.state))
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct Adjudicator {
    calls: ExternalCalls,
    merge_threshold: f64,
    review_threshold: f64,
}

impl Adjudicator {
    pub fn new(calls: ExternalCalls, config: &DedupConfig) -> Self {
        Self {
            calls,
            merge_threshold: config.merge_threshold,
            review_threshold: config.review_threshold,
        }
    }

    pub fn decide(&self, pair: &DuplicateCandidatePair) -> Decision {
        if !pair.is_duplicate {
            Decision::Distinct
        } else if pair.adjudicated_confidence >= self.merge_threshold {
            Decision::Merge
        } else if pair.adjudicated_confidence >= self.review_threshold {
            Decision::Review
        } else {
            Decision::Distinct
        }
    }

    /// Ask the arbiter about a pair.
    ///
    /// Geographic conflicts short-circuit to a non-duplicate. Arbiter errors
    /// and unparseable verdicts count as non-duplicates with zero confidence.
    #[instrument(skip_all, fields(entity_type = %entity_type, a = %a.name, b = %b.name))]
    pub async fn adjudicate(
        &self,
        entity_type: &str,
        a: &CandidateRecord,
        b: &CandidateRecord,
        lexical_similarity: f64,
        dry_run: bool,
    ) -> DuplicateCandidatePair {
        let mut pair = DuplicateCandidatePair {
            entity_a: a.clone(),
            entity_b: b.clone(),
            lexical_similarity,
            adjudicated_confidence: 0.0,
            is_duplicate: false,
            reasoning: String::new(),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        };

        if geographically_distinct(a, b) {
            pair.reasoning = "records are in different locations".into();
            debug!("geographic guard rejected pair");
            return pair;
        }

        let prompt = format!(
            "Entity type: {entity_type}\nRecord A: {}\nRecord B: {}\nLexical similarity: {lexical_similarity:.2}",
            serde_json::to_string(a).unwrap_or_default(),
            serde_json::to_string(b).unwrap_or_default(),
        );
        let request = GenerateRequest::new(SYSTEM_PROMPT, prompt).max_tokens(300);

        match self.calls.generate(&request, None, dry_run).await {
            Ok(call) => {
                pair.usage = call.usage;
                pair.cost_usd = call.cost_usd;
                match parse_verdict(&call.text) {
                    Some(verdict) => {
                        pair.is_duplicate = verdict.is_duplicate;
                        pair.adjudicated_confidence = verdict.confidence;
                        pair.reasoning = verdict.reasoning;
                    }
                    None => {
                        warn!("arbiter returned an unparseable verdict");
                        pair.reasoning = "unparseable verdict".into();
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "arbiter call failed");
                pair.reasoning = format!("adjudication failed: {e}");
            }
        }
        pair
    }
}
