//! CLI command implementations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::parser::{Cli, Commands};
use crate::config::ServerConfig;
use crate::error::{Result, SerializationError};
use crate::server::{SearchParams, SearchServer, serve_stdio};
use crate::upstream::{OpenAiCompatibleProvider, SearchProvider};

/// Runs the command selected by `cli`.
///
/// Returns text for stdout, if the command produces any. `shutdown` stops
/// the server loop.
///
/// # Errors
///
/// Returns [`crate::error::Error::Config`] for invalid configuration, and
/// the command's own error otherwise.
pub async fn execute(cli: &Cli, shutdown: CancellationToken) -> Result<Option<String>> {
    let config = cli.config_builder().build()?;

    match &cli.command {
        None | Some(Commands::Serve) => {
            cmd_serve(&config, shutdown).await?;
            Ok(None)
        }
        Some(Commands::Search {
            query,
            max_tokens,
            json,
        }) => cmd_search(&config, query, *max_tokens, *json).await.map(Some),
    }
}

fn build_server(config: &ServerConfig) -> Arc<SearchServer> {
    let provider: Arc<dyn SearchProvider> = Arc::new(OpenAiCompatibleProvider::new(
        &config.api_key,
        config.base_url.as_deref(),
    ));
    Arc::new(SearchServer::new(config, provider))
}

async fn cmd_serve(config: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    info!(model = %config.model, base_url = ?config.base_url, "starting searchlight");
    serve_stdio(build_server(config), config.transport_options(), shutdown).await
}

async fn cmd_search(
    config: &ServerConfig,
    query: &str,
    max_tokens: Option<u32>,
    json: bool,
) -> Result<String> {
    let server = build_server(config);
    let request = server.search_request(SearchParams {
        query: query.to_string(),
        model: None,
        max_tokens,
        temperature: None,
    });
    request.validate()?;

    let outcome = server.search(request).await;
    server.shutdown();
    let answer = outcome?;

    if json {
        serde_json::to_string_pretty(&answer).map_err(|e| {
            SerializationError::Encode {
                message: e.to_string(),
            }
            .into()
        })
    } else {
        Ok(answer.content)
    }
}
