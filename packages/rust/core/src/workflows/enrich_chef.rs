//! `enrich_chef`: biography, restaurants, and show appearances for one chef.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tastebase_gateway::{CacheOptions, GenerateRequest, QueryKind, SearchContextSize};
use tastebase_shared::{Chef, Discovery, Result, ShowDiscovery, TastebaseError};
use tracing::info;

use super::{adjudication_estimate, call_estimate, non_blank, parse_json_list};
use crate::engine::{CostEstimate, RunContext, Validation, Workflow};
use crate::repositories::{DiscoveryOutcome, InsertOutcome, NewRestaurant};
use crate::services::Services;

/// Restaurants inserted per run at most.
const MAX_RESTAURANTS: usize = 10;
const MAX_SHOWS: usize = 10;

const BIO_SYSTEM: &str = "You are a culinary researcher. Write a factual, neutral biography \
of the chef in 2-4 short paragraphs. Do not invent awards or restaurants. Reply with the \
biography text only.";

const RESTAURANTS_SYSTEM: &str = "You are a culinary researcher. List restaurants the chef \
owns or runs as head chef. Reply with a JSON array only, each element shaped as \
{\"name\": string, \"city\": string|null, \"state\": string|null, \"address\": string|null}. \
Reply with [] when unsure.";

const SHOWS_SYSTEM: &str = "You are a culinary researcher. List television food shows the \
chef has appeared on. Reply with a JSON array only, each element shaped as \
{\"name\": string, \"network\": string|null, \"season\": number|null}. Reply with [] when unsure.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichChefInput {
    pub chef_id: String,
}

/// What one enrichment run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ChefProfile {
    pub chef_id: String,
    pub name: String,
    pub bio: String,
    pub bio_from_cache: bool,
    pub restaurants: Vec<InsertOutcome>,
    pub shows: Vec<DiscoveryOutcome>,
    /// Whether the biography was written (false in dry runs).
    pub saved: bool,
}

#[derive(Debug, Deserialize)]
struct FoundRestaurant {
    name: String,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FoundShow {
    name: String,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    season: Option<u32>,
}

fn describe(chef: &Chef) -> String {
    match (chef.city.as_deref(), chef.state.as_deref()) {
        (Some(city), Some(state)) => format!("{} ({city}, {state})", chef.name),
        (Some(place), None) | (None, Some(place)) => format!("{} ({place})", chef.name),
        (None, None) => chef.name.clone(),
    }
}

fn bio_request(subject: &str) -> GenerateRequest {
    GenerateRequest::new(BIO_SYSTEM, format!("Chef: {subject}"))
        .max_tokens(800)
        .with_search(SearchContextSize::Medium)
}

fn restaurants_request(subject: &str) -> GenerateRequest {
    GenerateRequest::new(RESTAURANTS_SYSTEM, format!("Restaurants of chef: {subject}"))
        .max_tokens(1200)
        .with_search(SearchContextSize::Medium)
}

fn shows_request(subject: &str) -> GenerateRequest {
    GenerateRequest::new(SHOWS_SYSTEM, format!("TV appearances of chef: {subject}"))
        .max_tokens(800)
        .with_search(SearchContextSize::Low)
}

pub struct EnrichChef;

#[async_trait]
impl Workflow for EnrichChef {
    type Input = EnrichChefInput;
    type Output = ChefProfile;

    fn name(&self) -> &'static str {
        "enrich_chef"
    }

    fn validate(&self, input: &EnrichChefInput) -> Validation {
        let mut v = Validation::ok();
        v.require(!input.chef_id.trim().is_empty(), "chef_id is required");
        v
    }

    fn estimate_cost(&self, input: &EnrichChefInput, services: &Services) -> CostEstimate {
        // The name is unknown until load_chef runs; size prompts on the id.
        let subject = input.chef_id.as_str();
        call_estimate(services, &bio_request(subject))
            .plus(call_estimate(services, &restaurants_request(subject)))
            .plus(call_estimate(services, &shows_request(subject)))
            .plus(adjudication_estimate(services, MAX_RESTAURANTS as u64))
    }

    fn rollback_on_failure(&self) -> bool {
        true
    }

    async fn execute_steps(&self, input: &EnrichChefInput, ctx: &mut RunContext) -> Result<ChefProfile> {
        let chef_id = input.chef_id.trim();

        let chef = ctx
            .step("load_chef", |scope| async move {
                scope
                    .storage()
                    .get_chef(chef_id)
                    .await?
                    .ok_or_else(|| TastebaseError::not_found("chef", chef_id))
            })
            .await?;
        let subject = describe(&chef);

        let (bio, bio_from_cache) = ctx
            .step("fetch_biography", |scope| {
                let (chef, subject) = (&chef, &subject);
                async move {
                    let cache = CacheOptions::new(QueryKind::Biography, "chef")
                        .entity(chef.id.as_str())
                        .named(chef.name.as_str());
                    let call = scope.generate(&bio_request(subject), Some(&cache)).await?;
                    let bio = call.text.trim().to_string();
                    if bio.is_empty() {
                        return Err(TastebaseError::parse("biography response was empty"));
                    }
                    scope.note("bio_chars", bio.chars().count());
                    Ok((bio, call.from_cache))
                }
            })
            .await?;

        let restaurants = ctx
            .optional_step("discover_restaurants", |scope| {
                let (chef, subject) = (&chef, &subject);
                async move {
                    let cache = CacheOptions::new(QueryKind::RestaurantDetails, "chef")
                        .entity(chef.id.as_str())
                        .named(chef.name.as_str());
                    let call = scope
                        .generate(&restaurants_request(subject), Some(&cache))
                        .await?;
                    let found: Vec<FoundRestaurant> = parse_json_list(&call.text)?;
                    scope.note("found", found.len());

                    let repos = scope.repos();
                    let mut outcomes = Vec::new();
                    for r in found.into_iter().take(MAX_RESTAURANTS) {
                        if r.name.trim().is_empty() {
                            continue;
                        }
                        let outcome = repos
                            .insert_restaurant(NewRestaurant {
                                name: r.name,
                                chef_id: Some(chef.id.clone()),
                                city: non_blank(r.city).or_else(|| chef.city.clone()),
                                state: non_blank(r.state).or_else(|| chef.state.clone()),
                                address: non_blank(r.address),
                                ..Default::default()
                            })
                            .await?;
                        outcomes.push(outcome);
                    }
                    let duplicates = outcomes.iter().filter(|o| o.is_duplicate()).count();
                    scope.note("duplicates", duplicates);
                    Ok(outcomes)
                }
            })
            .await
            .unwrap_or_default();

        let shows = ctx
            .optional_step("discover_shows", |scope| {
                let (chef, subject) = (&chef, &subject);
                async move {
                    let call = scope.generate(&shows_request(subject), None).await?;
                    let found: Vec<FoundShow> = parse_json_list(&call.text)?;
                    scope.note("found", found.len());

                    let repos = scope.repos();
                    let source_ref = format!("enrich_chef:{}", chef.id);
                    let mut outcomes = Vec::new();
                    for show in found.into_iter().take(MAX_SHOWS) {
                        if show.name.trim().is_empty() {
                            continue;
                        }
                        let discovery = Discovery::Show(ShowDiscovery {
                            name: show.name.trim().to_string(),
                            network: non_blank(show.network),
                            season: show.season,
                        });
                        outcomes.push(repos.queue_discovery(discovery, &source_ref).await?);
                    }
                    Ok(outcomes)
                }
            })
            .await
            .unwrap_or_default();

        let saved = ctx
            .step("save_profile", |scope| {
                let (chef, bio) = (&chef, &bio);
                async move {
                    let written = scope.repos().update_chef_bio(&chef.id, bio).await?;
                    scope.note("written", written);
                    Ok(written)
                }
            })
            .await?;

        info!(
            chef = %chef.name,
            restaurants = restaurants.len(),
            shows = shows.len(),
            "chef enriched"
        );
        Ok(ChefProfile {
            chef_id: chef.id,
            name: chef.name,
            bio,
            bio_from_cache,
            restaurants,
            shows,
            saved,
        })
    }
}
