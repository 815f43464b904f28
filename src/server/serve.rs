//! The stdio serve loop.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::SearchServer;
use crate::error::{Error, Result, TransmissionError};
use crate::protocol::{Id, Response, RpcError};
use crate::transport::{StdioTransport, TransportOptions};

/// Serves MCP over the process's stdin and stdout until EOF or `shutdown`.
///
/// # Errors
///
/// Returns an error if the final flush of stdout fails.
pub async fn serve_stdio(
    server: Arc<SearchServer>,
    options: TransportOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let transport = Arc::new(StdioTransport::stdio(options));
    serve(server, transport, tokio::io::stdin(), shutdown).await
}

/// Reads messages from `reader` and answers them through `transport`.
///
/// Inbound lines are dispatched as they arrive and handled concurrently;
/// responses are written as each completes. On EOF or cancellation the loop
/// stops reading, waits for in-flight handlers (bounded by the server's
/// drain timeout), flushes the transport and shuts the server down.
///
/// # Errors
///
/// Returns an error if the final flush fails.
pub async fn serve<R, W>(
    server: Arc<SearchServer>,
    transport: Arc<StdioTransport<W>>,
    reader: R,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut receiver = transport.create_message_receiver(reader);
    let mut in_flight = FuturesUnordered::new();
    info!("serving MCP over stdio");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("shutdown requested");
                break;
            }
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            next = receiver.next() => match next {
                Some(Ok(value)) => {
                    let server = Arc::clone(&server);
                    let transport = Arc::clone(&transport);
                    in_flight.push(async move {
                        let Some(response) = server.handle_value(value).await else {
                            return;
                        };
                        deliver(&transport, &response).await;
                    });
                }
                Some(Err(err)) => {
                    error!(error = %err, "reading input failed");
                    break;
                }
                None => {
                    info!("input closed");
                    break;
                }
            }
        }
    }

    let pending = in_flight.len();
    if pending > 0 {
        info!(pending, "draining in-flight requests");
        let drain = async { while in_flight.next().await.is_some() {} };
        if tokio::time::timeout(server.drain_timeout(), drain).await.is_err() {
            warn!(abandoned = in_flight.len(), "drain timed out");
        }
    }

    let flushed = transport.flush().await;
    let metrics = transport.metrics();
    info!(
        sent = metrics.messages_sent,
        received = metrics.messages_received,
        errors = metrics.errors,
        timeouts = metrics.timeouts,
        "transport closed"
    );
    server.shutdown();
    flushed
}

/// Writes `response`. When the transport refuses it, the client still gets
/// an error for the same id; only I/O failures go unanswered.
async fn deliver<W>(transport: &StdioTransport<W>, response: &Value)
where
    W: AsyncWrite + Unpin + Send,
{
    let err = match transport.send_message(response).await {
        Ok(()) => return,
        Err(err) => err,
    };
    if matches!(err, Error::Transmission(TransmissionError::Io { .. })) {
        error!(error = %err, "failed to send response");
        return;
    }

    let id = response
        .get("id")
        .and_then(Id::from_value)
        .unwrap_or(Id::Null);
    warn!(error = %err, %id, "response refused; answering with an error");
    let refused = Response::failure(
        id,
        RpcError::new(err.rpc_code(), format!("response could not be delivered: {err}"))
            .with_data(json!({ "kind": err.kind() })),
    );
    if let Err(fallback) = transport.send_message(&refused).await {
        error!(error = %fallback, original = %err, "failed to send error response");
    }
}
