//! `discover_show`: find a show's cast and queue the chefs we don't know yet.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tastebase_dedup::normalize_name;
use tastebase_gateway::{CacheOptions, GenerateRequest, QueryKind, SearchContextSize};
use tastebase_shared::{ChefDiscovery, Discovery, Result};
use tracing::info;

use super::{call_estimate, non_blank, parse_json_list};
use crate::engine::{CostEstimate, RunContext, Validation, Workflow};
use crate::repositories::{DiscoveryOutcome, InsertOutcome};
use crate::services::Services;

const MAX_CAST: usize = 50;

const CAST_SYSTEM: &str = "You research television food shows. List the chefs who appeared \
as contestants, judges, or hosts. Reply with a JSON array only, each element shaped as \
{\"name\": string, \"role\": string|null, \"city\": string|null, \"state\": string|null}.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverShowInput {
    pub show_name: String,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastMember {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowCast {
    pub show: InsertOutcome,
    pub show_name: String,
    pub cast: Vec<CastMember>,
    pub queued: Vec<DiscoveryOutcome>,
    /// Chef-show link ids created for cast members already on file.
    pub linked: Vec<String>,
}

fn cast_request(show_name: &str, season: Option<u32>) -> GenerateRequest {
    let prompt = match season {
        Some(season) => format!("Show: {show_name}, season {season}"),
        None => format!("Show: {show_name}"),
    };
    GenerateRequest::new(CAST_SYSTEM, prompt)
        .max_tokens(2000)
        .with_search(SearchContextSize::High)
}

pub struct DiscoverShow;

#[async_trait]
impl Workflow for DiscoverShow {
    type Input = DiscoverShowInput;
    type Output = ShowCast;

    fn name(&self) -> &'static str {
        "discover_show"
    }

    fn validate(&self, input: &DiscoverShowInput) -> Validation {
        let mut v = Validation::ok();
        v.require(!input.show_name.trim().is_empty(), "show_name is required");
        v.require(input.season != Some(0), "season starts at 1");
        v
    }

    fn estimate_cost(&self, input: &DiscoverShowInput, services: &Services) -> CostEstimate {
        call_estimate(services, &cast_request(&input.show_name, input.season))
    }

    fn rollback_on_failure(&self) -> bool {
        true
    }

    async fn execute_steps(&self, input: &DiscoverShowInput, ctx: &mut RunContext) -> Result<ShowCast> {
        let show_name = input.show_name.trim();

        let show = ctx
            .step("resolve_show", |scope| async move {
                let outcome = scope
                    .repos()
                    .find_or_create_show(show_name, input.network.as_deref())
                    .await?;
                scope.note("created", !outcome.is_duplicate());
                Ok(outcome)
            })
            .await?;
        let show_id = show.id().to_string();

        let cast = ctx
            .step("search_cast", |scope| {
                let show_id = show_id.as_str();
                async move {
                    let cache = CacheOptions::new(QueryKind::ShowCast, "show")
                        .entity(show_id)
                        .named(show_name);
                    let call = scope
                        .generate(&cast_request(show_name, input.season), Some(&cache))
                        .await?;
                    let mut cast: Vec<CastMember> = parse_json_list(&call.text)?;
                    cast.retain(|m| !m.name.trim().is_empty());
                    cast.truncate(MAX_CAST);
                    for member in &mut cast {
                        member.name = member.name.trim().to_string();
                        member.role = non_blank(member.role.take());
                        member.city = non_blank(member.city.take());
                        member.state = non_blank(member.state.take());
                    }
                    scope.note("cast", cast.len());
                    Ok(cast)
                }
            })
            .await?;

        let (queued, known) = ctx
            .step("queue_chef_discoveries", |scope| {
                let (cast, show_id) = (&cast, show_id.as_str());
                async move {
                    let repos = scope.repos();
                    let source_ref = format!("discover_show:{show_id}");
                    let mut queued = Vec::new();
                    let mut known = Vec::new();
                    for member in cast {
                        let existing = scope
                            .storage()
                            .find_chefs_by_normalized_name(&normalize_name(&member.name))
                            .await?;
                        if let Some(chef) = existing.into_iter().next() {
                            known.push((chef.id, member.role.clone()));
                            continue;
                        }
                        let discovery = Discovery::Chef(ChefDiscovery {
                            name: member.name.clone(),
                            city: member.city.clone(),
                            state: member.state.clone(),
                            show_name: Some(show_name.to_string()),
                            role: member.role.clone(),
                        });
                        queued.push(repos.queue_discovery(discovery, &source_ref).await?);
                    }
                    scope.note("queued", queued.iter().filter(|q| !q.is_duplicate()).count());
                    scope.note("known", known.len());
                    Ok((queued, known))
                }
            })
            .await?;

        let linked = if known.is_empty() {
            ctx.skip("link_known_chefs", "no cast member is a known chef");
            Vec::new()
        } else {
            ctx.optional_step("link_known_chefs", |scope| {
                let (known, show_id) = (&known, show_id.as_str());
                async move {
                    let repos = scope.repos();
                    let mut linked = Vec::new();
                    for (chef_id, role) in known {
                        if let Some(link) = repos.link_chef_show(chef_id, show_id, role.as_deref()).await? {
                            linked.push(link);
                        }
                    }
                    scope.note("linked", linked.len());
                    Ok(linked)
                }
            })
            .await
            .unwrap_or_default()
        };

        info!(
            show = show_name,
            cast = cast.len(),
            queued = queued.len(),
            linked = linked.len(),
            "show discovered"
        );
        Ok(ShowCast {
            show,
            show_name: show_name.to_string(),
            cast,
            queued,
            linked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, RunStatus, StepStatus};
    use crate::repositories::NewChef;
    use crate::services::tests::services_with_shared;
    use std::sync::Arc;
    use tastebase_gateway::mock::MockGateway;
    use tastebase_shared::{DiscoveryKind, DiscoveryStatus};

    const CAST: &str = r#"[
        {"name": "Stephanie Izard", "role": "winner", "city": "Chicago"},
        {"name": "Richard Blais", "role": "contestant"},
        {"name": "  ", "role": "ghost"}
    ]"#;

    fn input(name: &str) -> DiscoverShowInput {
        DiscoverShowInput {
            show_name: name.into(),
            season: Some(4),
            network: Some("Bravo".into()),
        }
    }

    #[tokio::test]
    async fn queues_unknown_cast_and_links_known_chefs() {
        let gw = Arc::new(MockGateway::replying(CAST));
        let services = services_with_shared(gw).await;
        let known = services
            .repositories("seed", false)
            .insert_chef(NewChef {
                name: "Stephanie Izard".into(),
                city: Some("Chicago".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let run = Engine::new(services.clone())
            .run(&DiscoverShow, input("Top Chef"), false)
            .await
            .unwrap();

        assert!(run.is_success(), "{:?}", run.errors);
        let out = run.output.as_ref().unwrap();
        assert_eq!(out.cast.len(), 2);
        assert_eq!(out.queued.len(), 1);
        assert_eq!(out.linked.len(), 1);

        let pending = services
            .storage
            .list_discoveries(Some(DiscoveryStatus::Pending), Some(DiscoveryKind::Chef))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].discovery.name(), "Richard Blais");
        let shows = services.storage.shows_for_chef(known.id()).await.unwrap();
        assert_eq!(shows.len(), 1);
    }

    #[tokio::test]
    async fn alias_resolves_to_existing_show_and_rerun_dedups() {
        let gw = Arc::new(MockGateway::replying(CAST));
        let services = services_with_shared(gw.clone()).await;
        let engine = Engine::new(services.clone());

        let first = engine
            .run(&DiscoverShow, input("Diners, Drive-Ins and Dives"), false)
            .await
            .unwrap();
        let second = engine.run(&DiscoverShow, input("DDD"), false).await.unwrap();

        let first_show = &first.output.as_ref().unwrap().show;
        let second_show = &second.output.as_ref().unwrap().show;
        assert_eq!(first_show.id(), second_show.id());
        assert!(second_show.is_duplicate());
        assert!(second.output.as_ref().unwrap().queued.iter().all(|q| q.is_duplicate()));
        assert_eq!(
            services
                .storage
                .list_discoveries(Some(DiscoveryStatus::Pending), None)
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            second.step("link_known_chefs").unwrap().status,
            StepStatus::Skipped
        );
    }

    #[tokio::test]
    async fn unparseable_cast_rolls_back_new_show() {
        let gw = Arc::new(MockGateway::replying("No idea, sorry."));
        let services = services_with_shared(gw).await;

        let run = Engine::new(services.clone())
            .run(&DiscoverShow, input("Chopped"), false)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step("search_cast").unwrap().status, StepStatus::Failed);
        assert_eq!(run.rolled_back, 1);
        let key = services.resolver.aliases().canonical_key("Chopped");
        assert!(services.storage.find_show_by_normalized_name(&key).await.unwrap().is_none());
    }

    #[test]
    fn season_zero_is_invalid() {
        let mut bad = input("Top Chef");
        bad.season = Some(0);
        assert!(!DiscoverShow.validate(&bad).is_valid());
        assert!(DiscoverShow.validate(&input("Top Chef")).is_valid());
    }
}
