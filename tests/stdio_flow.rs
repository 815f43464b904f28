//! End-to-end MCP sessions over in-memory pipes.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use searchlight::config::ServerConfig;
use searchlight::error::{ErrorKind, UpstreamError};
use searchlight::server::{SearchServer, serve};
use searchlight::transport::{StdioTransport, TransportOptions};
use searchlight::upstream::{SearchAnswer, SearchProvider, SearchRequest, TokenUsage};
use searchlight::{Error, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, duplex};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct EchoProvider {
    calls: AtomicU32,
    fail_with: Option<ErrorKind>,
    padding: usize,
}

#[async_trait]
impl SearchProvider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail_with {
            return Err(UpstreamError::new(kind, "rejected").into());
        }
        Ok(SearchAnswer {
            content: format!("results for {}{}", request.query, ".".repeat(self.padding)),
            model: request.model.clone(),
            usage: TokenUsage::default(),
            finish_reason: Some("stop".into()),
        })
    }
}

fn server(provider: Arc<EchoProvider>) -> Arc<SearchServer> {
    let config = ServerConfig::builder()
        .api_key("test")
        .retry_max_attempts(2)
        .retry_initial_delay(Duration::from_millis(5))
        .retry_max_delay(Duration::from_millis(10))
        .build()
        .unwrap();
    Arc::new(SearchServer::new(&config, provider))
}

struct Client {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.input.write_all(line.as_bytes()).await.unwrap();
        self.input.write_all(b"\n").await.unwrap();
    }

    async fn request(&mut self, message: Value) {
        self.send(&message.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let line = self.output.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

/// Pipes wired to a transport; the returned reader feeds `serve`.
fn session() -> (Client, DuplexStream, Arc<StdioTransport<DuplexStream>>) {
    session_with(TransportOptions::default())
}

fn session_with(
    options: TransportOptions,
) -> (Client, DuplexStream, Arc<StdioTransport<DuplexStream>>) {
    let (client_in, server_in) = duplex(64 * 1024);
    let (server_out, client_out) = duplex(64 * 1024);
    let transport = Arc::new(StdioTransport::new(server_out, options));
    let client = Client {
        input: client_in,
        output: BufReader::new(client_out).lines(),
    };
    (client, server_in, transport)
}

fn search_call(id: i64, query: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": "search", "arguments": {"query": query}},
    })
}

#[tokio::test]
async fn test_initialize_list_and_search() {
    let provider = Arc::new(EchoProvider::default());
    let (mut client, reader, transport) = session();
    let serving = serve(
        server(Arc::clone(&provider)),
        transport,
        reader,
        CancellationToken::new(),
    );

    let script = async move {
        client
            .request(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2025-03-26", "capabilities": {}},
            }))
            .await;
        let init = client.recv().await;
        client
            .request(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        client
            .request(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let tools = client.recv().await;
        client.request(search_call(3, "rust async")).await;
        let answer = client.recv().await;
        drop(client);
        (init, tools, answer)
    };

    let (served, (init, tools, answer)) = tokio::join!(serving, script);
    served.unwrap();

    assert_eq!(init["id"], 1);
    assert_eq!(init["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(init["result"]["serverInfo"]["name"], "searchlight");

    assert_eq!(tools["id"], 2);
    let tool = &tools["result"]["tools"][0];
    assert_eq!(tool["name"], "search");
    assert!(tool["inputSchema"]["properties"]["query"].is_object());

    assert_eq!(answer["id"], 3);
    assert_eq!(answer["result"]["isError"], false);
    assert_eq!(answer["result"]["content"][0]["text"], "results for rust async");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let provider = Arc::new(EchoProvider::default());
    let (mut client, reader, transport) = session();
    let serving = serve(server(provider), transport, reader, CancellationToken::new());

    let script = async move {
        client.send("{not json").await;
        client.send("").await;
        client
            .request(json!({"jsonrpc": "2.0", "id": "p1", "method": "ping"}))
            .await;
        let pong = client.recv().await;
        drop(client);
        pong
    };

    let (served, pong) = tokio::join!(serving, script);
    served.unwrap();
    assert_eq!(pong, json!({"jsonrpc": "2.0", "id": "p1", "result": {}}));
}

#[tokio::test]
async fn test_duplicate_searches_share_one_upstream_call() {
    let provider = Arc::new(EchoProvider::default());
    let (mut client, reader, transport) = session();
    let serving = serve(
        server(Arc::clone(&provider)),
        transport,
        reader,
        CancellationToken::new(),
    );

    let script = async move {
        let batch = format!(
            "{}\n{}\n{}",
            search_call(1, "tokio"),
            search_call(2, "  TOKIO "),
            search_call(3, "tokio"),
        );
        client.send(&batch).await;
        let mut responses = vec![client.recv().await, client.recv().await, client.recv().await];
        drop(client);
        responses.sort_by_key(|r| r["id"].as_i64());
        responses
    };

    let (served, responses) = tokio::join!(serving, script);
    served.unwrap();
    for (response, id) in responses.iter().zip(1..) {
        assert_eq!(response["id"], id);
        assert_eq!(response["result"]["isError"], false);
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_failure_is_a_tool_error() {
    let provider = Arc::new(EchoProvider {
        fail_with: Some(ErrorKind::Auth),
        ..EchoProvider::default()
    });
    let (mut client, reader, transport) = session();
    let serving = serve(
        server(Arc::clone(&provider)),
        transport,
        reader,
        CancellationToken::new(),
    );

    let script = async move {
        client.request(search_call(7, "anything")).await;
        let response = client.recv().await;
        drop(client);
        response
    };

    let (served, response) = tokio::join!(serving, script);
    served.unwrap();
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"]["isError"], true);
    assert_eq!(response["result"]["_meta"]["errorKind"], "auth");
    assert_eq!(response["result"]["_meta"]["retryable"], false);
    // Auth failures are not retried.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversize_result_is_answered_with_an_error() {
    let provider = Arc::new(EchoProvider {
        padding: 4_000,
        ..EchoProvider::default()
    });
    let (mut client, reader, transport) = session_with(TransportOptions {
        large_message_threshold: 1_024,
        max_buffer_size: 512,
        ..TransportOptions::default()
    });
    let serving = serve(
        server(Arc::clone(&provider)),
        Arc::clone(&transport),
        reader,
        CancellationToken::new(),
    );

    let script = async move {
        client.request(search_call(11, "huge")).await;
        let refused = client.recv().await;
        client
            .request(json!({"jsonrpc": "2.0", "id": 12, "method": "ping"}))
            .await;
        let pong = client.recv().await;
        drop(client);
        (refused, pong)
    };

    let (served, (refused, pong)) = tokio::join!(serving, script);
    served.unwrap();
    assert_eq!(refused["id"], 11);
    assert_eq!(refused["error"]["code"], -32010);
    assert_eq!(refused["error"]["data"]["kind"], "transmission");
    assert!(
        refused["error"]["message"]
            .as_str()
            .unwrap()
            .contains("message too large")
    );
    assert_eq!(pong["id"], 12);
    assert_eq!(transport.metrics().errors, 1);
}

#[tokio::test]
async fn test_invalid_requests_get_error_responses() {
    let provider = Arc::new(EchoProvider::default());
    let (mut client, reader, transport) = session();
    let serving = serve(server(provider), transport, reader, CancellationToken::new());

    let script = async move {
        client
            .request(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))
            .await;
        let bad_version = client.recv().await;
        client
            .request(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}))
            .await;
        let unknown = client.recv().await;
        client
            .request(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "search", "arguments": {"query": ""}},
            }))
            .await;
        let empty_query = client.recv().await;
        drop(client);
        (bad_version, unknown, empty_query)
    };

    let (served, (bad_version, unknown, empty_query)) = tokio::join!(serving, script);
    served.unwrap();
    assert_eq!(bad_version["id"], 1);
    assert_eq!(bad_version["error"]["code"], -32600);
    assert_eq!(unknown["error"]["code"], -32601);
    assert_eq!(empty_query["error"]["code"], -32602);
}

#[tokio::test]
async fn test_cancellation_stops_serving_with_input_open() {
    let provider = Arc::new(EchoProvider::default());
    let (client, reader, transport) = session();
    let shutdown = CancellationToken::new();
    let serving = serve(server(provider), Arc::clone(&transport), reader, shutdown.clone());

    shutdown.cancel();
    let served: std::result::Result<(), Error> =
        tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap();
    served.unwrap();
    assert_eq!(transport.metrics().messages_sent, 0);
    drop(client);
}
