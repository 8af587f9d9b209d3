//! `verify_restaurant`: confirm a venue's operating status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tastebase_gateway::{CacheOptions, GenerateRequest, QueryKind, SearchContextSize};
use tastebase_shared::{Restaurant, RestaurantStatus, Result, TastebaseError};

use super::call_estimate;
use crate::engine::{CostEstimate, RunContext, Validation, Workflow};
use crate::services::Services;

const STATUS_SYSTEM: &str = "You verify whether restaurants are currently operating. Search \
for recent evidence. Reply with JSON only: {\"status\": \"open\"|\"closed\"|\"unknown\", \
\"evidence\": string}.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRestaurantInput {
    pub restaurant_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusVerification {
    pub restaurant_id: String,
    pub name: String,
    pub previous: RestaurantStatus,
    pub status: RestaurantStatus,
    pub changed: bool,
    pub from_cache: bool,
    /// Whether the status was written (false in dry runs).
    pub written: bool,
}

/// Read a status verdict from a model reply.
///
/// Accepts a JSON object with a `status` field anywhere in the text, or a
/// reply whose first word is the status.
pub fn parse_status(text: &str) -> std::result::Result<RestaurantStatus, String> {
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                if let Some(status) = value.get("status").and_then(Value::as_str) {
                    return status.parse().map_err(|e: TastebaseError| e.to_string());
                }
            }
        }
    }
    let word: String = text
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    word.parse()
        .map_err(|_| format!("unparseable status reply: {}", text.trim()))
}

fn subject(restaurant: &Restaurant) -> String {
    let place: Vec<&str> = [
        restaurant.address.as_deref(),
        restaurant.city.as_deref(),
        restaurant.state.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    if place.is_empty() {
        restaurant.name.clone()
    } else {
        format!("{} ({})", restaurant.name, place.join(", "))
    }
}

fn status_request(subject: &str) -> GenerateRequest {
    GenerateRequest::new(STATUS_SYSTEM, format!("Restaurant: {subject}"))
        .max_tokens(200)
        .with_search(SearchContextSize::Low)
}

pub struct VerifyRestaurant;

#[async_trait]
impl Workflow for VerifyRestaurant {
    type Input = VerifyRestaurantInput;
    type Output = StatusVerification;

    fn name(&self) -> &'static str {
        "verify_restaurant"
    }

    fn validate(&self, input: &VerifyRestaurantInput) -> Validation {
        let mut v = Validation::ok();
        v.require(
            !input.restaurant_id.trim().is_empty(),
            "restaurant_id is required",
        );
        v
    }

    fn estimate_cost(&self, input: &VerifyRestaurantInput, services: &Services) -> CostEstimate {
        call_estimate(services, &status_request(&input.restaurant_id))
    }

    async fn execute_steps(
        &self,
        input: &VerifyRestaurantInput,
        ctx: &mut RunContext,
    ) -> Result<StatusVerification> {
        let restaurant_id = input.restaurant_id.trim();

        let restaurant = ctx
            .step("load_restaurant", |scope| async move {
                scope
                    .storage()
                    .get_restaurant(restaurant_id)
                    .await?
                    .ok_or_else(|| TastebaseError::not_found("restaurant", restaurant_id))
            })
            .await?;

        let (status, from_cache) = ctx
            .step("lookup_status", |scope| {
                let restaurant = &restaurant;
                async move {
                    let cache = CacheOptions::new(QueryKind::OperatingStatus, "restaurant")
                        .entity(restaurant.id.as_str())
                        .named(restaurant.name.as_str());
                    let call = scope
                        .generate_checked(&status_request(&subject(restaurant)), Some(&cache), |text| {
                            parse_status(text).map(|_| ())
                        })
                        .await
                        .into_result()?;
                    let status = parse_status(&call.text).map_err(TastebaseError::parse)?;
                    scope.note("status", status.as_str());
                    Ok((status, call.from_cache))
                }
            })
            .await?;

        let written = ctx
            .step("apply_status", |scope| {
                let restaurant = &restaurant;
                async move {
                    let written = scope
                        .repos()
                        .update_restaurant_status(&restaurant.id, status)
                        .await?;
                    scope.note("written", written);
                    Ok(written)
                }
            })
            .await?;

        Ok(StatusVerification {
            changed: status != restaurant.status,
            previous: restaurant.status,
            restaurant_id: restaurant.id,
            name: restaurant.name,
            status,
            from_cache,
            written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, RunStatus, StepStatus};
    use crate::repositories::NewRestaurant;
    use crate::services::tests::services_with_shared;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tastebase_gateway::mock::{MockGateway, reply};
    use tastebase_shared::ChangeType;

    async fn seeded(gateway: Arc<MockGateway>) -> (Services, String) {
        let services = services_with_shared(gateway).await;
        let outcome = services
            .repositories("seed", false)
            .insert_restaurant(NewRestaurant {
                name: "Alinea".into(),
                city: Some("Chicago".into()),
                status: RestaurantStatus::Open,
                ..Default::default()
            })
            .await
            .unwrap();
        (services, outcome.id().to_string())
    }

    #[test]
    fn status_parses_json_and_bare_words() {
        assert_eq!(
            parse_status(r#"Here: {"status": "closed", "evidence": "sign"}"#),
            Ok(RestaurantStatus::Closed)
        );
        assert_eq!(parse_status("Open."), Ok(RestaurantStatus::Open));
        assert_eq!(parse_status("permanently_closed"), Ok(RestaurantStatus::Closed));
        assert!(parse_status("Maybe?").is_err());
        assert!(parse_status("").is_err());
    }

    #[tokio::test]
    async fn closed_venue_is_updated_and_audited() {
        let gw = Arc::new(MockGateway::replying(r#"{"status": "closed", "evidence": "x"}"#));
        let (services, id) = seeded(gw).await;

        let run = Engine::new(services.clone())
            .run(&VerifyRestaurant, VerifyRestaurantInput { restaurant_id: id.clone() }, false)
            .await
            .unwrap();

        assert!(run.is_success());
        let out = run.output.as_ref().unwrap();
        assert_eq!(out.status, RestaurantStatus::Closed);
        assert!(out.changed && out.written);

        let stored = services.storage.get_restaurant(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RestaurantStatus::Closed);
        assert!(stored.status_checked_at.is_some());
        let updates = services
            .storage
            .list_audit_entries("restaurants", Some(&id))
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.entry.change_type == ChangeType::Update)
            .count();
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn transient_outcome_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let gw = Arc::new(MockGateway::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TastebaseError::RateLimited("429 too many requests".into()))
            } else {
                Ok(reply("open"))
            }
        }));
        let (services, id) = seeded(gw.clone()).await;
        let mut config = (*services.config).clone();
        config.retry.max_attempts = 3;
        let services = Services::new(
            config,
            services.storage.clone(),
            gw.clone(),
            services.tracker().clone(),
        );

        let run = Engine::new(services)
            .run(&VerifyRestaurant, VerifyRestaurantInput { restaurant_id: id }, false)
            .await
            .unwrap();

        assert!(run.is_success(), "{:?}", run.errors);
        assert_eq!(gw.calls(), 2);
        assert_eq!(run.output.unwrap().status, RestaurantStatus::Open);
    }

    #[tokio::test]
    async fn unparseable_reply_fails_lookup_and_keeps_status() {
        let gw = Arc::new(MockGateway::replying("I am not sure about that place."));
        let (services, id) = seeded(gw.clone()).await;

        let run = Engine::new(services.clone())
            .run(&VerifyRestaurant, VerifyRestaurantInput { restaurant_id: id.clone() }, false)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let lookup = run.step("lookup_status").unwrap();
        assert_eq!(lookup.status, StepStatus::Failed);
        // Rejected replies are still billed to the step.
        assert_eq!(lookup.tokens_used, Some(150));
        assert!(run.step("apply_status").is_none());
        // A parse rejection is not transient, so there is no retry.
        assert_eq!(gw.calls(), 1);
        let stored = services.storage.get_restaurant(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RestaurantStatus::Open);
    }
}
