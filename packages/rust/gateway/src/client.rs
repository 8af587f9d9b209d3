//! The external call seam: one request in, generated text and usage out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tastebase_shared::{Result, TokenUsage};

/// How much web context a search-grounded call may pull in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchContextSize {
    Low,
    Medium,
    High,
}

impl SearchContextSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    /// Upper bound on generation rounds, counting continuations after a
    /// length stop.
    pub max_steps: u32,
    /// Enables web search when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_context: Option<SearchContextSize>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            max_steps: 1,
            search_context: None,
        }
    }
}

/// A single generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub system: String,
    pub prompt: String,
    #[serde(default)]
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            options: GenerateOptions::default(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = max_tokens;
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.options.max_steps = max_steps.max(1);
        self
    }

    pub fn with_search(mut self, size: SearchContextSize) -> Self {
        self.options.search_context = Some(size);
        self
    }

    /// Worst-case output tokens across all rounds.
    pub fn max_output_tokens(&self) -> u64 {
        u64::from(self.options.max_tokens) * u64::from(self.options.max_steps.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
    pub model: String,
}

/// A generative (optionally search-grounded) text service.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Model identifier billed for calls through this gateway.
    fn model(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    //! In-memory gateway that counts calls and answers from a closure.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    type Responder = dyn Fn(&GenerateRequest) -> Result<GenerateResponse> + Send + Sync;

    pub struct MockGateway {
        model: String,
        responder: Box<Responder>,
        calls: AtomicUsize,
    }

    impl MockGateway {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&GenerateRequest) -> Result<GenerateResponse> + Send + Sync + 'static,
        {
            Self {
                model: "mock/model".into(),
                responder: Box::new(responder),
                calls: AtomicUsize::new(0),
            }
        }

        /// Answers every request with `text`, billing 100 in / 50 out.
        pub fn replying(text: &str) -> Self {
            let text = text.to_string();
            Self::new(move |_| Ok(reply(&text)))
        }

        pub fn with_model(mut self, model: &str) -> Self {
            self.model = model.into();
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// A successful response billing 100 input and 50 output tokens.
    pub fn reply(text: &str) -> GenerateResponse {
        GenerateResponse {
            text: text.to_string(),
            usage: TokenUsage::new(100, 50),
            finish_reason: "stop".into(),
            model: "mock/model".into(),
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        fn model(&self) -> &str {
            &self.model
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = (self.responder)(request)?;
            response.model = self.model.clone();
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = GenerateRequest::new("sys", "prompt")
            .max_tokens(500)
            .max_steps(3)
            .with_search(SearchContextSize::High);
        assert_eq!(req.options.max_tokens, 500);
        assert_eq!(req.max_output_tokens(), 1500);
        assert_eq!(req.options.search_context, Some(SearchContextSize::High));
    }

    #[tokio::test]
    async fn mock_counts_calls() {
        let gateway = mock::MockGateway::replying("hi").with_model("m1");
        let resp = gateway
            .generate(&GenerateRequest::new("s", "p"))
            .await
            .unwrap();
        assert_eq!(resp.text, "hi");
        assert_eq!(resp.model, "m1");
        assert_eq!(gateway.calls(), 1);
    }
}
