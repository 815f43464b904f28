//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{ArgAction, Parser, Subcommand};

use crate::config::{ServerConfig, ServerConfigBuilder};

/// Searchlight: web search for MCP clients through an online model API.
///
/// Speaks MCP over stdio by default. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "searchlight")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long, global = true, env = "SEARCHLIGHT_BASE_URL")]
    pub base_url: Option<String>,

    /// Default model for searches.
    #[arg(long, global = true, env = "SEARCHLIGHT_MODEL")]
    pub model: Option<String>,

    /// The subcommand to execute; `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve MCP on stdin/stdout.
    #[command(after_help = r#"Examples:
  searchlight                                  # Serve with settings from the environment
  SEARCHLIGHT_API_KEY=pplx-... searchlight serve
  searchlight --base-url https://api.openai.com/v1 --model gpt-4o-search-preview serve
"#)]
    Serve,

    /// Run one search through the same cache and resilience stack and print
    /// the answer.
    #[command(after_help = r#"Examples:
  searchlight search "latest tokio release"
  searchlight search "rust 2024 edition changes" --max-tokens 300
  searchlight search "MCP spec revisions" --json | jq .usage
"#)]
    Search {
        /// Search query text.
        query: String,

        /// Maximum tokens in the answer.
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Print the full answer as JSON.
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Configuration builder read from the environment, with flags applied
    /// on top.
    #[must_use]
    pub fn config_builder(&self) -> ServerConfigBuilder {
        let mut builder = ServerConfig::builder().from_env();
        if let Some(url) = &self.base_url {
            builder = builder.base_url(url);
        }
        if let Some(model) = &self.model {
            builder = builder.model(model);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_is_default() {
        let cli = Cli::try_parse_from(["searchlight"]).unwrap_or_else(|_| unreachable!());
        assert_eq!(cli.command, None);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_search_with_globals() {
        let cli = Cli::try_parse_from([
            "searchlight",
            "search",
            "what is mcp",
            "--max-tokens",
            "200",
            "-vv",
            "--model",
            "sonar-pro",
        ])
        .unwrap_or_else(|_| unreachable!());
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.model.as_deref(), Some("sonar-pro"));
        assert_eq!(
            cli.command,
            Some(Commands::Search {
                query: "what is mcp".into(),
                max_tokens: Some(200),
                json: false,
            })
        );
    }

    #[test]
    fn test_search_requires_query() {
        assert!(Cli::try_parse_from(["searchlight", "search"]).is_err());
    }
}
