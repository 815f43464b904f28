//! # searchlight
//!
//! An MCP server that answers web search queries through an
//! OpenAI-compatible online model API (Perplexity Sonar by default).
//!
//! The server speaks newline-delimited JSON-RPC 2.0 on stdin/stdout and
//! exposes a single `search` tool. Each query passes through:
//!
//! - [`cache::TtlCache`]: answers for identical queries within the TTL
//! - [`dedup::RequestDeduplicator`]: one upstream call for concurrent duplicates
//! - [`resilience::ResilientCaller`]: retry with backoff and a circuit breaker
//!   around a per-attempt timeout
//!
//! Every outbound message is checked by [`protocol::ProtocolValidator`] and
//! encoded with [`serializer::SafeSerializer`] rules before
//! [`transport::StdioTransport`] writes it.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use searchlight::config::ServerConfig;
//! use searchlight::server::{SearchServer, serve_stdio};
//! use searchlight::upstream::OpenAiCompatibleProvider;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> searchlight::Result<()> {
//! let config = ServerConfig::from_env()?;
//! let provider = Arc::new(OpenAiCompatibleProvider::new(
//!     &config.api_key,
//!     config.base_url.as_deref(),
//! ));
//! let server = Arc::new(SearchServer::new(&config, provider));
//! serve_stdio(server, config.transport_options(), CancellationToken::new()).await
//! # }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod resilience;
pub mod serializer;
pub mod server;
pub mod transport;
pub mod upstream;

pub use error::{Error, ErrorKind, Result};
