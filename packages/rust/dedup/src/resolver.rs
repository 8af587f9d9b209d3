//! The duplicate gate in front of every primary-store write.

use std::sync::Arc;

use tastebase_shared::{DedupConfig, Discovery, PendingDiscovery, Result, TokenUsage};
use tastebase_storage::{RestaurantFilter, Storage};
use tracing::{debug, info, instrument};

use crate::adjudicate::{
    Adjudicator, CandidateRecord, Decision, DuplicateCandidatePair, geographically_distinct,
};
use crate::identity::{AliasTable, discovery_identity};
use crate::lexical::lexical_similarity;
use crate::normalize::normalize_name;

/// Most rows pulled into the lexical tier per check.
const CANDIDATE_SCAN_LIMIT: u32 = 500;

/// Which table a candidate is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Chef,
    Restaurant,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chef => "chef",
            Self::Restaurant => "restaurant",
        }
    }
}

/// Outcome of checking one candidate against stored records.
#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    pub decision: Decision,
    /// The stored record the decision refers to, for merge and review.
    pub existing_id: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    /// Every pair that reached the arbiter.
    pub adjudicated: Vec<DuplicateCandidatePair>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

impl DuplicateCheck {
    fn distinct() -> Self {
        Self {
            decision: Decision::Distinct,
            existing_id: None,
            confidence: 0.0,
            reasoning: String::new(),
            adjudicated: Vec::new(),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        }
    }
}

#[derive(Clone)]
pub struct DuplicateResolver {
    storage: Arc<Storage>,
    adjudicator: Adjudicator,
    aliases: AliasTable,
    prefilter_threshold: f64,
    max_candidates: usize,
}

impl DuplicateResolver {
    pub fn new(storage: Arc<Storage>, adjudicator: Adjudicator, config: &DedupConfig) -> Self {
        Self {
            storage,
            adjudicator,
            aliases: AliasTable::from_config(config),
            prefilter_threshold: config.prefilter_threshold,
            max_candidates: config.max_candidates.max(1),
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn lexical_similarity(&self, a: &str, b: &str) -> f64 {
        lexical_similarity(a, b)
    }

    /// Identity key a discovery is stored under.
    pub fn identity_key(&self, discovery: &Discovery) -> String {
        discovery_identity(&self.aliases, discovery)
    }

    /// The live discovery this one would duplicate, if any.
    pub async fn check_identity(&self, discovery: &Discovery) -> Result<Option<PendingDiscovery>> {
        let key = self.identity_key(discovery);
        self.storage.find_live_discovery(discovery.kind(), &key).await
    }

    /// Check a candidate against stored records of `kind`.
    ///
    /// An exact normalized-name match in the same place merges without an
    /// arbiter call. Otherwise pairs at or above the prefilter threshold
    /// are adjudicated best-first until one merges; the best review-band
    /// pair wins if none does.
    #[instrument(skip_all, fields(kind = kind.as_str(), name = %candidate.name))]
    pub async fn check(
        &self,
        kind: EntityKind,
        candidate: &CandidateRecord,
        dry_run: bool,
    ) -> Result<DuplicateCheck> {
        let existing = self.load_candidates(kind, candidate).await?;
        let normalized = normalize_name(&candidate.name);

        let mut scored: Vec<(f64, CandidateRecord)> = existing
            .into_iter()
            .filter(|e| e.id != candidate.id)
            .map(|e| (lexical_similarity(&candidate.name, &e.name), e))
            .filter(|(score, _)| *score >= self.prefilter_threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.max_candidates);

        let mut check = DuplicateCheck::distinct();
        for (score, existing) in scored {
            if normalize_name(&existing.name) == normalized
                && !geographically_distinct(candidate, &existing)
            {
                debug!(existing = ?existing.id, "exact match");
                check.decision = Decision::Merge;
                check.existing_id = existing.id;
                check.confidence = 1.0;
                check.reasoning = "exact normalized name match".into();
                return Ok(check);
            }

            let pair = self
                .adjudicator
                .adjudicate(kind.as_str(), candidate, &existing, score, dry_run)
                .await;
            check.usage += pair.usage;
            check.cost_usd += pair.cost_usd;
            let decision = self.adjudicator.decide(&pair);
            let better = decision == Decision::Merge
                || (decision == Decision::Review
                    && (check.decision == Decision::Distinct
                        || pair.adjudicated_confidence > check.confidence));
            if better {
                check.decision = decision;
                check.existing_id = existing.id.clone();
                check.confidence = pair.adjudicated_confidence;
                check.reasoning = pair.reasoning.clone();
            }
            check.adjudicated.push(pair);
            if decision == Decision::Merge {
                break;
            }
        }

        info!(
            decision = ?check.decision,
            confidence = check.confidence,
            adjudicated = check.adjudicated.len(),
            "duplicate check"
        );
        Ok(check)
    }

    async fn load_candidates(
        &self,
        kind: EntityKind,
        candidate: &CandidateRecord,
    ) -> Result<Vec<CandidateRecord>> {
        // Records in other cities cannot match, so scan the candidate's city when known.
        let city = candidate.city.clone().filter(|c| !c.trim().is_empty());
        let records = match kind {
            EntityKind::Restaurant => {
                let filter = RestaurantFilter {
                    city,
                    limit: Some(CANDIDATE_SCAN_LIMIT),
                    ..Default::default()
                };
                let mut found: Vec<CandidateRecord> = self
                    .storage
                    .list_restaurants(&filter)
                    .await?
                    .iter()
                    .map(CandidateRecord::from)
                    .collect();
                if filter.city.is_some() {
                    // City spelled differently still lands on exact-name rows.
                    let exact = self
                        .storage
                        .find_restaurants_by_normalized_name(&normalize_name(&candidate.name))
                        .await?;
                    for r in &exact {
                        if !found.iter().any(|f| f.id.as_deref() == Some(&r.id)) {
                            found.push(CandidateRecord::from(r));
                        }
                    }
                }
                found
            }
            EntityKind::Chef => {
                // Chefs move between cities; scan everyone.
                self.storage
                    .list_chefs(None)
                    .await?
                    .iter()
                    .map(CandidateRecord::from)
                    .collect()
            }
        };
        Ok(records)
    }
}
