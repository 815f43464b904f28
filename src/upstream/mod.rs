//! Upstream model API abstraction.
//!
//! The server only sees [`SearchProvider`]; [`OpenAiCompatibleProvider`] is
//! the one real implementation, and tests substitute their own.

mod openai;

pub use openai::{OpenAiCompatibleProvider, classify_api_failure};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One search query bound for the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// The user's query.
    pub query: String,
    /// Model identifier.
    pub model: String,
    /// System prompt sent ahead of the query.
    pub system_prompt: Option<String>,
    /// Completion token limit.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl SearchRequest {
    /// Request for `query` against `model` with no optional settings.
    pub fn new(query: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            model: model.into(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Checks the request before it reaches the cache or the upstream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty query or model, a zero
    /// token limit, or a temperature outside `0.0..=2.0`.
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(Error::validation("model must not be empty"));
        }
        if self.max_tokens == Some(0) {
            return Err(Error::validation("max_tokens must be at least 1"));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(Error::validation(format!(
                "temperature must be between 0 and 2, got {t}"
            )));
        }
        Ok(())
    }

    /// Key identifying logically identical requests, for the cache and the
    /// deduplicator. Queries differing only in case or whitespace share a key.
    pub fn dedup_key(&self) -> String {
        let query = self
            .query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let temperature = self
            .temperature
            .map_or_else(|| "-".to_string(), |t| t.to_string());
        let max_tokens = self
            .max_tokens
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        format!("{}|{temperature}|{max_tokens}|{query}", self.model)
    }
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

/// The upstream's answer to a [`SearchRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchAnswer {
    /// Answer text.
    pub content: String,
    /// Model that produced it, as reported upstream.
    pub model: String,
    /// Token usage.
    pub usage: TokenUsage,
    /// Finish reason (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Backend that answers search requests.
///
/// Implementations make exactly one upstream call per invocation; retries,
/// timeouts and circuit breaking are layered on by the caller.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &'static str;

    /// Executes one search.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] classified by [`crate::error::ErrorKind`].
    async fn search(&self, request: &SearchRequest) -> Result<SearchAnswer>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_dedup_key_normalizes_query() {
        let a = SearchRequest::new("  Rust   async\truntimes ", "sonar");
        let b = SearchRequest::new("rust async runtimes", "sonar");
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), "sonar|-|-|rust async runtimes");
    }

    #[test]
    fn test_dedup_key_separates_settings() {
        let base = SearchRequest::new("q", "sonar");
        let other_model = SearchRequest::new("q", "sonar-pro");
        let limited = SearchRequest {
            max_tokens: Some(64),
            ..base.clone()
        };
        let warm = SearchRequest {
            temperature: Some(0.5),
            ..base.clone()
        };
        let keys = [
            base.dedup_key(),
            other_model.dedup_key(),
            limited.dedup_key(),
            warm.dedup_key(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test_case(SearchRequest::new("   ", "sonar") ; "blank query")]
    #[test_case(SearchRequest::new("q", "") ; "empty model")]
    #[test_case(SearchRequest { max_tokens: Some(0), ..SearchRequest::new("q", "m") } ; "zero tokens")]
    #[test_case(SearchRequest { temperature: Some(2.5), ..SearchRequest::new("q", "m") } ; "hot temperature")]
    fn test_invalid_requests(request: SearchRequest) {
        assert_eq!(request.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_valid_request() {
        let request = SearchRequest {
            temperature: Some(0.2),
            max_tokens: Some(256),
            ..SearchRequest::new("latest tokio release", "sonar")
        };
        request.validate().unwrap();
    }
}
