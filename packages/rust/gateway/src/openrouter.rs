//! OpenRouter chat-completions backing for [`Gateway`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tastebase_shared::{AppConfig, GatewayConfig, Result, TastebaseError, TokenUsage, resolve_api_key};
use tracing::{debug, instrument, warn};

use crate::client::{Gateway, GenerateRequest, GenerateResponse};

const USER_AGENT: &str = concat!("tastebase/", env!("CARGO_PKG_VERSION"));

/// Prompt sent when a round stopped on the token limit.
const CONTINUE_PROMPT: &str = "Continue exactly where you left off.";

pub struct OpenRouterGateway {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenRouterGateway {
    pub fn new(config: &GatewayConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TastebaseError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.default_model.clone(),
        })
    }

    /// Build from app config, reading the API key from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        Self::new(&config.gateway, api_key)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn request_body(&self, request: &GenerateRequest, messages: &[Value]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.options.max_tokens,
        });
        if let Some(size) = request.options.search_context {
            body["plugins"] = json!([{ "id": "web" }]);
            body["web_search_options"] = json!({ "search_context_size": size.as_str() });
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<ChatResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, text));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| TastebaseError::parse(format!("malformed completion response: {e}")))
    }
}

fn map_transport_error(e: reqwest::Error) -> TastebaseError {
    if e.is_timeout() {
        TastebaseError::Timeout(format!("gateway request timed out: {e}"))
    } else {
        TastebaseError::Network(e.to_string())
    }
}

fn map_status(status: StatusCode, body: String) -> TastebaseError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        TastebaseError::RateLimited(body)
    } else {
        TastebaseError::Gateway {
            status: Some(status.as_u16()),
            message: body,
        }
    }
}

#[async_trait]
impl Gateway for OpenRouterGateway {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, search = request.options.search_context.is_some()))]
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let mut messages = vec![
            json!({ "role": "system", "content": request.system }),
            json!({ "role": "user", "content": request.prompt }),
        ];
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason = String::from("stop");
        let mut model = self.model.clone();

        let rounds = request.options.max_steps.max(1);
        for round in 1..=rounds {
            let body = self.request_body(request, &messages);
            let response = match self.send(&body).await {
                Ok(response) => response,
                // Earlier rounds are already billed; hand back what they produced.
                Err(e) if round > 1 => {
                    warn!(round, error = %e, "continuation failed, returning partial completion");
                    break;
                }
                Err(e) => return Err(e),
            };

            if let Some(u) = &response.usage {
                usage += TokenUsage::new(u.prompt_tokens, u.completion_tokens);
            }
            if let Some(m) = response.model {
                model = m;
            }
            let Some(choice) = response.choices.into_iter().next() else {
                if round > 1 {
                    warn!(round, "continuation had no choices, returning partial completion");
                    break;
                }
                return Err(TastebaseError::parse("completion response had no choices"));
            };
            let chunk = choice.message.content.unwrap_or_default();
            finish_reason = choice.finish_reason.unwrap_or_else(|| "stop".into());
            text.push_str(&chunk);

            debug!(round, finish_reason = %finish_reason, chars = chunk.len(), "completion round");
            if finish_reason != "length" || round == rounds {
                break;
            }
            messages.push(json!({ "role": "assistant", "content": chunk }));
            messages.push(json!({ "role": "user", "content": CONTINUE_PROMPT }));
        }

        Ok(GenerateResponse {
            text,
            usage,
            finish_reason,
            model,
        })
    }
}
