//! MCP dispatcher and the `search` tool.

use std::sync::Arc;
use std::time::Duration;

use schemars::schema_for;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::params::{InitializeParams, SearchParams, ToolCallParams};
use crate::cache::{CacheStats, TtlCache};
use crate::config::ServerConfig;
use crate::dedup::{DedupStats, RequestDeduplicator};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{
    JSONRPC_VERSION, Message, Notification, ProtocolValidator, Request, Response, RpcError,
    codes,
};
use crate::resilience::{CircuitState, ResilientCaller};
use crate::upstream::{SearchAnswer, SearchProvider, SearchRequest};

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "searchlight";
/// Protocol revision used when the client asks for one we do not know.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
/// Protocol revisions echoed back when requested.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];
/// Name of the single tool.
pub const SEARCH_TOOL: &str = "search";

const SEARCH_TOOL_DESCRIPTION: &str = "Search the web through an online model and return a \
     concise, sourced answer. Identical concurrent queries share one upstream call and recent \
     answers are served from cache.";

const INSTRUCTIONS: &str = "Use the `search` tool for questions that need current information \
     from the web. Phrase the query as a complete question for the best answers.";

/// Counters across the server's components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStats {
    /// Answer cache.
    pub cache: CacheStats,
    /// Request deduplication.
    pub dedup: DedupStats,
    /// Upstream breaker state.
    pub breaker: CircuitState,
}

/// Answers MCP requests; owns the cache, deduplicator and resilient caller.
pub struct SearchServer {
    provider: Arc<dyn SearchProvider>,
    cache: Arc<TtlCache<SearchAnswer>>,
    dedup: RequestDeduplicator<SearchAnswer>,
    caller: ResilientCaller,
    validator: ProtocolValidator,
    model: String,
    system_prompt: String,
    max_tokens: Option<u32>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for SearchServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchServer")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

impl SearchServer {
    /// Builds a server around `provider`. Call from within a tokio runtime
    /// so the cache and dedup sweeps start.
    #[must_use]
    pub fn new(config: &ServerConfig, provider: Arc<dyn SearchProvider>) -> Self {
        Self {
            provider,
            cache: Arc::new(TtlCache::new(config.cache_options())),
            dedup: RequestDeduplicator::new(config.dedup_options()),
            caller: ResilientCaller::new(
                "upstream",
                config.retry_policy(),
                config.breaker_config(),
                config.request_timeout,
            ),
            validator: ProtocolValidator::default(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
            drain_timeout: config.dedup_timeout(),
        }
    }

    /// Longest a single call can run, used to bound the shutdown drain.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Handles one inbound value. Returns the response to send, if any.
    ///
    /// The returned value has already passed response validation; a
    /// response that failed it is replaced by a `-32603` error.
    pub async fn handle_value(&self, value: Value) -> Option<Value> {
        let response = match self.validator.classify(value) {
            Err(invalid) => {
                warn!(errors = ?invalid.report.errors, id = %invalid.id, "invalid inbound message");
                Response::failure(invalid.id.clone(), invalid.to_rpc_error())
            }
            Ok(Message::Request(request)) => self.handle_request(request).await,
            Ok(Message::Notification(notification)) => {
                Self::handle_notification(&notification);
                return None;
            }
            Ok(Message::Response(response)) => {
                debug!(id = %response.id, error = response.is_error(), "ignoring inbound response");
                return None;
            }
        };
        Some(self.encode(&response))
    }

    async fn handle_request(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        debug!(%id, %method, "request");
        let outcome = match method.as_str() {
            "initialize" => Ok(Self::initialize(params)),
            "ping" => Ok(json!({})),
            "tools/list" => Self::tools_list(),
            "tools/call" => self.tools_call(params).await,
            _ => Err(ProtocolError::MethodNotFound { method }.into()),
        };
        match outcome {
            Ok(result) => Response::success(id, result),
            Err(err) => {
                debug!(%id, error = %err, "request failed");
                Response::failure(id, RpcError::from(&err))
            }
        }
    }

    fn handle_notification(notification: &Notification) {
        match notification.method.as_str() {
            "notifications/initialized" => info!("client initialized"),
            "notifications/cancelled" => {
                debug!(params = ?notification.params, "client cancelled a request");
            }
            other => debug!(method = other, "ignoring notification"),
        }
    }

    fn encode(&self, response: &Response) -> Value {
        match self.validator.serializer().to_value(response) {
            Ok(value) => self.validator.validate_and_sanitize_response(value),
            Err(err) => {
                warn!(error = %err, "response could not be encoded");
                json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": response.id.to_value(),
                    "error": {
                        "code": codes::INTERNAL_ERROR,
                        "message": format!("response could not be encoded: {err}"),
                    },
                })
            }
        }
    }

    fn initialize(params: Option<Value>) -> Value {
        let requested = params
            .and_then(|p| serde_json::from_value::<InitializeParams>(p).ok())
            .and_then(|p| p.protocol_version);
        let version = requested
            .as_deref()
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        info!(protocol_version = version, requested = ?requested, "initialize");
        json!({
            "protocolVersion": version,
            "capabilities": {"tools": {}},
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": INSTRUCTIONS,
        })
    }

    fn tools_list() -> Result<Value> {
        let mut schema = serde_json::to_value(schema_for!(SearchParams)).map_err(|e| {
            Error::Internal {
                message: format!("search schema: {e}"),
            }
        })?;
        if let Value::Object(map) = &mut schema {
            map.remove("$schema");
        }
        Ok(json!({
            "tools": [{
                "name": SEARCH_TOOL,
                "description": SEARCH_TOOL_DESCRIPTION,
                "inputSchema": schema,
            }],
        }))
    }

    async fn tools_call(&self, params: Option<Value>) -> Result<Value> {
        let call: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| invalid_params(format!("tools/call: {e}")))?;
        if call.name != SEARCH_TOOL {
            return Err(invalid_params(format!("unknown tool '{}'", call.name)));
        }
        let args: SearchParams =
            serde_json::from_value(call.arguments.unwrap_or_else(|| json!({})))
                .map_err(|e| invalid_params(format!("search arguments: {e}")))?;

        let request = self.search_request(args);
        request
            .validate()
            .map_err(|e| invalid_params(e.to_string()))?;

        Ok(match self.search(request).await {
            Ok(answer) => json!({
                "content": [{"type": "text", "text": answer.content}],
                "isError": false,
            }),
            Err(err) => {
                warn!(kind = %err.kind(), error = %err, "search failed");
                json!({
                    "content": [{
                        "type": "text",
                        "text": format!("Search failed ({}): {err}", err.kind()),
                    }],
                    "isError": true,
                    "_meta": {
                        "errorKind": err.kind(),
                        "retryable": err.is_retryable(),
                    },
                })
            }
        })
    }

    /// Fills unset search settings from the server defaults.
    #[must_use]
    pub fn search_request(&self, args: SearchParams) -> SearchRequest {
        SearchRequest {
            query: args.query,
            model: args.model.unwrap_or_else(|| self.model.clone()),
            system_prompt: Some(self.system_prompt.clone()),
            max_tokens: args.max_tokens.or(self.max_tokens),
            temperature: args.temperature,
        }
    }

    /// Runs a search through cache, deduplication and the resilient caller.
    ///
    /// Successful answers are cached by the call that produced them; errors
    /// are never cached.
    ///
    /// # Errors
    ///
    /// Returns the upstream error after retries, or a local
    /// `ResourceExhausted`, `Timeout` or `CircuitOpen`.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchAnswer> {
        let key = request.dedup_key();
        if let Some(answer) = self.cache.get(&key) {
            debug!(key, "cache hit");
            return Ok(answer);
        }
        debug!(key, "cache miss");

        let cache = Arc::clone(&self.cache);
        let caller = self.caller.clone();
        let provider = Arc::clone(&self.provider);
        let cache_key = key.clone();
        self.dedup
            .execute(
                &key,
                move || async move {
                    let answer = caller.call(|| provider.search(&request)).await?;
                    cache.set(cache_key, answer.clone(), None);
                    Ok(answer)
                },
                None,
            )
            .await
    }

    /// Component counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            cache: self.cache.stats(),
            dedup: self.dedup.stats(),
            breaker: self.caller.breaker().state(),
        }
    }

    /// Stops background sweeps and releases pending state.
    pub fn shutdown(&self) {
        let stats = self.stats();
        info!(
            cache_hits = stats.cache.hits,
            cache_misses = stats.cache.misses,
            unique_requests = stats.dedup.unique_requests,
            deduplicated_requests = stats.dedup.deduplicated_requests,
            breaker = %stats.breaker,
            "search server shutting down"
        );
        self.cache.destroy();
        self.dedup.destroy();
    }
}

fn invalid_params(message: String) -> Error {
    ProtocolError::InvalidParams { message }.into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::UpstreamError;
    use crate::upstream::TokenUsage;

    #[derive(Default)]
    struct MockProvider {
        calls: AtomicU32,
        failure: Mutex<Option<Error>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl SearchProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn search(&self, request: &SearchRequest) -> Result<SearchAnswer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(err) = self.failure.lock().clone() {
                return Err(err);
            }
            Ok(SearchAnswer {
                content: format!("answer to {}", request.query),
                model: request.model.clone(),
                usage: TokenUsage::default(),
                finish_reason: Some("stop".into()),
            })
        }
    }

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .api_key("test")
            .retry_initial_delay(Duration::from_millis(10))
            .retry_max_delay(Duration::from_millis(20))
            .build()
            .unwrap()
    }

    fn server_with(provider: Arc<MockProvider>) -> SearchServer {
        SearchServer::new(&config(), provider)
    }

    fn call(id: i64, query: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"query": query}},
        })
    }

    #[tokio::test]
    async fn test_initialize_echoes_known_version() {
        let server = server_with(Arc::default());
        let out = server
            .handle_value(json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"protocolVersion": "2025-03-26", "capabilities": {}},
            }))
            .await
            .unwrap();
        assert_eq!(out["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(out["result"]["serverInfo"]["name"], SERVER_NAME);
        assert!(out["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_initialize_defaults_unknown_version() {
        let server = server_with(Arc::default());
        let out = server
            .handle_value(json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"protocolVersion": "1999-01-01"},
            }))
            .await
            .unwrap();
        assert_eq!(out["result"]["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let server = server_with(Arc::default());
        let pong = server
            .handle_value(json!({"jsonrpc": "2.0", "id": "p", "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(pong, json!({"jsonrpc": "2.0", "id": "p", "result": {}}));

        let missing = server
            .handle_value(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}))
            .await
            .unwrap();
        assert_eq!(missing["error"]["code"], codes::METHOD_NOT_FOUND);
        assert_eq!(missing["id"], 2);
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_id() {
        let server = server_with(Arc::default());
        let out = server
            .handle_value(json!({"jsonrpc": "1.0", "id": 5, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(out["error"]["code"], codes::INVALID_REQUEST);
        assert_eq!(out["id"], 5);
    }

    #[tokio::test]
    async fn test_notifications_and_responses_get_no_reply() {
        let server = server_with(Arc::default());
        assert!(
            server
                .handle_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .await
                .is_none()
        );
        assert!(
            server
                .handle_value(json!({"jsonrpc": "2.0", "id": 9, "result": {}}))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_tools_list_advertises_search_schema() {
        let server = server_with(Arc::default());
        let out = server
            .handle_value(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await
            .unwrap();
        let tool = &out["result"]["tools"][0];
        assert_eq!(tool["name"], SEARCH_TOOL);
        assert_eq!(tool["inputSchema"]["type"], "object");
        assert_eq!(tool["inputSchema"]["required"], json!(["query"]));
        assert!(tool["inputSchema"]["properties"]["max_tokens"].is_object());
    }

    #[tokio::test]
    async fn test_search_is_cached() {
        let provider = Arc::new(MockProvider::default());
        let server = server_with(Arc::clone(&provider));

        let first = server.handle_value(call(1, "tokio 1.0")).await.unwrap();
        assert_eq!(first["result"]["isError"], false);
        assert_eq!(first["result"]["content"][0]["text"], "answer to tokio 1.0");

        let second = server.handle_value(call(2, "  Tokio   1.0 ")).await.unwrap();
        assert_eq!(second["result"]["content"][0]["text"], "answer to tokio 1.0");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.stats().cache.hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_searches_share_one_call() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(MockProvider {
            gate: Some(Arc::clone(&gate)),
            ..MockProvider::default()
        });
        let server = server_with(Arc::clone(&provider));

        let a = server.handle_value(call(1, "same"));
        let b = server.handle_value(call(2, "same"));
        let release = async {
            while provider.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            gate.notify_waiters();
        };
        let (a, b, ()) = tokio::join!(a, b, release);

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap()["result"]["content"], b.unwrap()["result"]["content"]);
        assert_eq!(server.stats().dedup.deduplicated_requests, 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_tool_error() {
        let provider = Arc::new(MockProvider::default());
        *provider.failure.lock() = Some(UpstreamError::from_status(401, "bad key").into());
        let server = server_with(Arc::clone(&provider));

        let out = server.handle_value(call(3, "anything")).await.unwrap();
        assert_eq!(out["id"], 3);
        assert_eq!(out["result"]["isError"], true);
        assert_eq!(out["result"]["_meta"]["errorKind"], "auth");
        assert_eq!(out["result"]["_meta"]["retryable"], false);
        assert!(
            out["result"]["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("bad key")
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.stats().cache.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(MockProvider::default());
        *provider.failure.lock() = Some(UpstreamError::from_status(503, "busy").into());
        let server = server_with(Arc::clone(&provider));

        let out = server.handle_value(call(4, "q")).await.unwrap();
        assert_eq!(out["result"]["isError"], true);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bad_tool_calls_are_invalid_params() {
        let server = server_with(Arc::default());
        let unknown = server
            .handle_value(json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "fetch", "arguments": {}},
            }))
            .await
            .unwrap();
        assert_eq!(unknown["error"]["code"], codes::INVALID_PARAMS);

        let empty = server.handle_value(call(2, "   ")).await.unwrap();
        assert_eq!(empty["error"]["code"], codes::INVALID_PARAMS);

        let missing = server
            .handle_value(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call"}))
            .await
            .unwrap();
        assert_eq!(missing["error"]["code"], codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_search_request_uses_defaults() {
        let server = server_with(Arc::default());
        let request = server.search_request(SearchParams {
            query: "q".into(),
            model: None,
            max_tokens: Some(64),
            temperature: None,
        });
        assert_eq!(request.model, "sonar");
        assert_eq!(request.max_tokens, Some(64));
        assert!(request.system_prompt.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_clears_cache() {
        let server = server_with(Arc::default());
        server.handle_value(call(1, "q")).await.unwrap();
        assert_eq!(server.stats().cache.size, 1);
        server.shutdown();
        assert_eq!(server.stats().cache.size, 0);
    }
}
