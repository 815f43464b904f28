//! MCP server for searchlight.
//!
//! ```text
//! stdin ──▶ MessageReceiver ──▶ SearchServer::handle_value
//!                                 ├── initialize / ping / tools/list
//!                                 └── tools/call "search"
//!                                       TtlCache ─miss─▶ RequestDeduplicator
//!                                         ─▶ ResilientCaller ─▶ SearchProvider
//! stdout ◀── StdioTransport::send_message ◀── validated response
//! ```

pub mod handler;
pub mod params;
pub mod serve;

pub use handler::{SearchServer, ServerStats};
pub use params::SearchParams;
pub use serve::{serve, serve_stdio};
