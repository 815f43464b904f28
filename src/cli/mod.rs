//! CLI layer for searchlight.
//!
//! Provides the command-line interface using clap: `serve` (the default)
//! runs the stdio MCP server, `search` answers one query.

pub mod commands;
pub mod parser;

pub use commands::execute;
pub use parser::{Cli, Commands};
