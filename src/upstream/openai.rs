//! `OpenAI`-compatible provider built on the `async-openai` crate.
//!
//! Works with any chat completions API that follows the `OpenAI` request
//! shape (Perplexity, `OpenAI`, local proxies) via the base URL override.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
};
use async_trait::async_trait;
use tracing::debug;

use super::{SearchAnswer, SearchProvider, SearchRequest, TokenUsage};
use crate::error::{ErrorKind, Result, UpstreamError};

/// Chat-completions provider for `OpenAI`-compatible endpoints.
pub struct OpenAiCompatibleProvider {
    client: Client<OpenAIConfig>,
    base_url: Option<String>,
}

impl OpenAiCompatibleProvider {
    /// Creates a provider with `api_key`, optionally against `base_url`.
    #[must_use]
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);

        if let Some(base_url) = base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        Self {
            client: Client::with_config(openai_config),
            base_url: base_url.map(str::to_string),
        }
    }

    fn build_request(request: &SearchRequest) -> CreateChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(system.to_string()),
                    name: None,
                },
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(request.query.clone()),
                name: None,
            },
        ));

        CreateChatCompletionRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_completion_tokens: request.max_tokens,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("client", &"<async-openai::Client>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl SearchProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchAnswer> {
        let openai_request = Self::build_request(request);

        let response = self
            .client
            .chat()
            .create(openai_request)
            .await
            .map_err(map_openai_error)?;

        let choice = response.choices.first();

        let content = choice
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let finish_reason = choice.and_then(|c| {
            c.finish_reason
                .as_ref()
                .map(|fr| format!("{fr:?}").to_lowercase())
        });

        let usage = response
            .usage
            .map_or_else(TokenUsage::default, |u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        debug!(
            model = %response.model,
            total_tokens = usage.total_tokens,
            "upstream answered"
        );

        Ok(SearchAnswer {
            content,
            model: response.model,
            usage,
            finish_reason,
        })
    }
}

fn map_openai_error(err: OpenAIError) -> crate::error::Error {
    let upstream = match &err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                UpstreamError::new(ErrorKind::Timeout, e.to_string())
            } else if let Some(status) = e.status() {
                UpstreamError::from_status(status.as_u16(), e.to_string())
            } else {
                UpstreamError::new(ErrorKind::Network, e.to_string())
            }
        }
        OpenAIError::ApiError(api) => UpstreamError::new(
            classify_api_failure(api.r#type.as_deref(), &api.message),
            api.message.clone(),
        ),
        OpenAIError::InvalidArgument(message) => {
            UpstreamError::new(ErrorKind::Client, message.clone())
        }
        other => UpstreamError::new(ErrorKind::Server, other.to_string()),
    };
    upstream.into()
}

/// Classifies an API error body the client already decoded, where the HTTP
/// status is no longer available.
#[must_use]
pub fn classify_api_failure(type_hint: Option<&str>, message: &str) -> ErrorKind {
    let hint = type_hint.unwrap_or_default().to_ascii_lowercase();
    let message = message.to_ascii_lowercase();
    let mentions = |needle: &str| hint.contains(needle) || message.contains(needle);

    if mentions("auth") || mentions("api key") || mentions("api_key") || mentions("permission") {
        ErrorKind::Auth
    } else if mentions("rate_limit") || mentions("rate limit") || mentions("too many requests") {
        ErrorKind::RateLimit
    } else if mentions("timeout") || mentions("timed out") {
        ErrorKind::Timeout
    } else if mentions("server_error")
        || mentions("overloaded")
        || mentions("unavailable")
        || mentions("internal")
    {
        ErrorKind::Server
    } else if hint.contains("invalid_request") || hint.contains("not_found") {
        ErrorKind::Client
    } else {
        ErrorKind::Server
    }
}
