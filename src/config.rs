//! Settings for the search server: upstream credentials and model, cache,
//! dedup, retry, breaker and transport tuning.
//!
//! A setter on [`ServerConfigBuilder`] wins over a `SEARCHLIGHT_*` variable,
//! which wins over the built-in default.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cache::CacheOptions;
use crate::dedup::DedupOptions;
use crate::error::{Error, Result};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::transport::{LineEnding, TransportOptions};

/// Default upstream model.
pub const DEFAULT_MODEL: &str = "sonar";
/// Default system prompt sent with every query.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a search assistant. Answer the query accurately \
     and concisely, and cite your sources when they are available.";
/// Default per-attempt upstream timeout in milliseconds.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default cache entry lifetime in milliseconds.
const DEFAULT_CACHE_TTL_MS: u64 = 300_000;
/// Default cache capacity.
const DEFAULT_CACHE_MAX_SIZE: usize = 100;
/// Default number of distinct searches in flight.
const DEFAULT_MAX_CONCURRENT: usize = 10;
/// Default attempts per search, first included.
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
/// Default first retry delay in milliseconds.
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
/// Default retry delay ceiling in milliseconds.
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
/// Default consecutive failures that open the breaker.
const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Default open period of the breaker in milliseconds.
const DEFAULT_BREAKER_RESET_TIMEOUT_MS: u64 = 60_000;
/// Upper bound on retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Configuration for the search server.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// API key for the upstream.
    pub api_key: String,
    /// Optional base URL override (for Perplexity, proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Model used when a call does not name one.
    pub model: String,
    /// System prompt sent ahead of each query.
    pub system_prompt: String,
    /// Completion token limit used when a call does not give one.
    pub max_tokens: Option<u32>,
    /// Deadline for one upstream attempt.
    pub request_timeout: Duration,
    /// Lifetime of cached answers.
    pub cache_ttl: Duration,
    /// Cache capacity; zero disables caching.
    pub cache_max_size: usize,
    /// Maximum distinct searches in flight.
    pub max_concurrent: usize,
    /// Attempts per search, first included.
    pub retry_max_attempts: u32,
    /// Delay before the first retry.
    pub retry_initial_delay: Duration,
    /// Ceiling for any retry delay.
    pub retry_max_delay: Duration,
    /// Consecutive failures that open the breaker.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open.
    pub breaker_reset_timeout: Duration,
    /// Terminator for outbound frames.
    pub line_ending: LineEnding,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout", &self.request_timeout)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_max_size", &self.cache_max_size)
            .field("max_concurrent", &self.max_concurrent)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("breaker_failure_threshold", &self.breaker_failure_threshold)
            .field("line_ending", &self.line_ending)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Creates a new builder for `ServerConfig`.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no API key is found or a value is out of
    /// range.
    pub fn from_env() -> Result<Self> {
        Self::builder().from_env().build()
    }

    /// Options for the answer cache.
    #[must_use]
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            default_ttl: self.cache_ttl,
            max_size: self.cache_max_size,
            ..CacheOptions::default()
        }
    }

    /// Options for the request deduplicator.
    #[must_use]
    pub fn dedup_options(&self) -> DedupOptions {
        DedupOptions {
            max_pending: self.max_concurrent,
            default_timeout: self.dedup_timeout(),
            ..DedupOptions::default()
        }
    }

    /// Upper bound on one deduplicated search: every attempt at its deadline
    /// plus the longest delay between each pair.
    #[must_use]
    pub fn dedup_timeout(&self) -> Duration {
        let attempts = self.retry_max_attempts.max(1);
        self.request_timeout
            .saturating_mul(attempts)
            .saturating_add(self.retry_max_delay.saturating_mul(attempts - 1))
    }

    /// Retry policy for upstream calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
            ..RetryPolicy::default()
        }
    }

    /// Circuit breaker thresholds for upstream calls.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_timeout: self.breaker_reset_timeout,
            ..CircuitBreakerConfig::default()
        }
    }

    /// Options for the stdio transport.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            line_ending: self.line_ending,
            ..TransportOptions::default()
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    request_timeout: Option<Duration>,
    cache_ttl: Option<Duration>,
    cache_max_size: Option<usize>,
    max_concurrent: Option<usize>,
    retry_max_attempts: Option<u32>,
    retry_initial_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    breaker_failure_threshold: Option<u32>,
    breaker_reset_timeout: Option<Duration>,
    line_ending: Option<LineEnding>,
}

impl ServerConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(self) -> Self {
        self.from_lookup(|name| std::env::var(name).ok())
    }

    /// Populates unset fields from `lookup`, which maps a variable name to
    /// its value.
    #[must_use]
    pub fn from_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let millis = |name: &str| parsed::<u64>(name, text(name)).map(Duration::from_millis);

        if self.api_key.is_none() {
            self.api_key = text("SEARCHLIGHT_API_KEY").or_else(|| text("OPENAI_API_KEY"));
        }
        if self.base_url.is_none() {
            self.base_url = text("SEARCHLIGHT_BASE_URL");
        }
        if self.model.is_none() {
            self.model = text("SEARCHLIGHT_MODEL");
        }
        if self.system_prompt.is_none() {
            self.system_prompt = text("SEARCHLIGHT_SYSTEM_PROMPT");
        }
        if self.max_tokens.is_none() {
            self.max_tokens = parsed("SEARCHLIGHT_MAX_TOKENS", text("SEARCHLIGHT_MAX_TOKENS"));
        }
        if self.request_timeout.is_none() {
            self.request_timeout = millis("SEARCHLIGHT_REQUEST_TIMEOUT_MS");
        }
        if self.cache_ttl.is_none() {
            self.cache_ttl = millis("SEARCHLIGHT_CACHE_TTL_MS");
        }
        if self.cache_max_size.is_none() {
            self.cache_max_size = parsed(
                "SEARCHLIGHT_CACHE_MAX_SIZE",
                text("SEARCHLIGHT_CACHE_MAX_SIZE"),
            );
        }
        if self.max_concurrent.is_none() {
            self.max_concurrent = parsed(
                "SEARCHLIGHT_MAX_CONCURRENT",
                text("SEARCHLIGHT_MAX_CONCURRENT"),
            );
        }
        if self.retry_max_attempts.is_none() {
            self.retry_max_attempts = parsed(
                "SEARCHLIGHT_RETRY_MAX_ATTEMPTS",
                text("SEARCHLIGHT_RETRY_MAX_ATTEMPTS"),
            );
        }
        if self.retry_initial_delay.is_none() {
            self.retry_initial_delay = millis("SEARCHLIGHT_RETRY_INITIAL_DELAY_MS");
        }
        if self.retry_max_delay.is_none() {
            self.retry_max_delay = millis("SEARCHLIGHT_RETRY_MAX_DELAY_MS");
        }
        if self.breaker_failure_threshold.is_none() {
            self.breaker_failure_threshold = parsed(
                "SEARCHLIGHT_BREAKER_FAILURE_THRESHOLD",
                text("SEARCHLIGHT_BREAKER_FAILURE_THRESHOLD"),
            );
        }
        if self.breaker_reset_timeout.is_none() {
            self.breaker_reset_timeout = millis("SEARCHLIGHT_BREAKER_RESET_TIMEOUT_MS");
        }
        if self.line_ending.is_none() {
            self.line_ending = parsed("SEARCHLIGHT_LINE_ENDING", text("SEARCHLIGHT_LINE_ENDING"));
        }
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the default model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the default completion token limit.
    #[must_use]
    pub const fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Sets the per-attempt upstream timeout.
    #[must_use]
    pub const fn request_timeout(mut self, duration: Duration) -> Self {
        self.request_timeout = Some(duration);
        self
    }

    /// Sets the cache entry lifetime.
    #[must_use]
    pub const fn cache_ttl(mut self, duration: Duration) -> Self {
        self.cache_ttl = Some(duration);
        self
    }

    /// Sets the cache capacity.
    #[must_use]
    pub const fn cache_max_size(mut self, n: usize) -> Self {
        self.cache_max_size = Some(n);
        self
    }

    /// Sets the maximum distinct searches in flight.
    #[must_use]
    pub const fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    /// Sets the attempts per search.
    #[must_use]
    pub const fn retry_max_attempts(mut self, n: u32) -> Self {
        self.retry_max_attempts = Some(n);
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub const fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = Some(delay);
        self
    }

    /// Sets the retry delay ceiling.
    #[must_use]
    pub const fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    /// Sets the breaker failure threshold.
    #[must_use]
    pub const fn breaker_failure_threshold(mut self, n: u32) -> Self {
        self.breaker_failure_threshold = Some(n);
        self
    }

    /// Sets the breaker open period.
    #[must_use]
    pub const fn breaker_reset_timeout(mut self, duration: Duration) -> Self {
        self.breaker_reset_timeout = Some(duration);
        self
    }

    /// Sets the outbound line terminator.
    #[must_use]
    pub const fn line_ending(mut self, ending: LineEnding) -> Self {
        self.line_ending = Some(ending);
        self
    }

    /// Builds the [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no API key was set or a value is out of
    /// range.
    pub fn build(self) -> Result<ServerConfig> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                Error::config("no API key: set SEARCHLIGHT_API_KEY or OPENAI_API_KEY")
            })?;

        let config = ServerConfig {
            api_key,
            base_url: self.base_url,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: self
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: self.max_tokens,
            request_timeout: self
                .request_timeout
                .unwrap_or(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            cache_ttl: self
                .cache_ttl
                .unwrap_or(Duration::from_millis(DEFAULT_CACHE_TTL_MS)),
            cache_max_size: self.cache_max_size.unwrap_or(DEFAULT_CACHE_MAX_SIZE),
            max_concurrent: self.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT),
            retry_max_attempts: self
                .retry_max_attempts
                .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_initial_delay: self
                .retry_initial_delay
                .unwrap_or(Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS)),
            retry_max_delay: self
                .retry_max_delay
                .unwrap_or(Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS)),
            breaker_failure_threshold: self
                .breaker_failure_threshold
                .unwrap_or(DEFAULT_BREAKER_FAILURE_THRESHOLD),
            breaker_reset_timeout: self
                .breaker_reset_timeout
                .unwrap_or(Duration::from_millis(DEFAULT_BREAKER_RESET_TIMEOUT_MS)),
            line_ending: self.line_ending.unwrap_or_default(),
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &ServerConfig) -> Result<()> {
    let mut problems = Vec::new();
    if config.model.trim().is_empty() {
        problems.push("model must not be empty".to_string());
    }
    if config.max_tokens == Some(0) {
        problems.push("max_tokens must be at least 1".to_string());
    }
    if config.request_timeout.is_zero() {
        problems.push("request timeout must be positive".to_string());
    }
    if config.cache_ttl.is_zero() {
        problems.push("cache TTL must be positive".to_string());
    }
    if config.max_concurrent == 0 {
        problems.push("max concurrent must be at least 1".to_string());
    }
    if !(1..=MAX_RETRY_ATTEMPTS).contains(&config.retry_max_attempts) {
        problems.push(format!(
            "retry attempts must be between 1 and {MAX_RETRY_ATTEMPTS}, got {}",
            config.retry_max_attempts
        ));
    }
    if config.retry_initial_delay > config.retry_max_delay {
        problems.push("retry initial delay exceeds the maximum delay".to_string());
    }
    if config.breaker_failure_threshold == 0 {
        problems.push("breaker failure threshold must be at least 1".to_string());
    }
    if config.breaker_reset_timeout.is_zero() {
        problems.push("breaker reset timeout must be positive".to_string());
    }
    if let Some(url) = &config.base_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        problems.push(format!("base URL must be http(s), got '{url}'"));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::config(problems.join("; ")))
    }
}

fn parsed<T: FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    let value = raw.trim().parse().ok();
    if value.is_none() {
        warn!(variable = name, value = %raw, "ignoring unparseable environment value");
    }
    value
}
