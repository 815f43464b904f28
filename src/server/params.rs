//! MCP method parameter types.
//!
//! Defines the input schema for the `search` tool using `schemars` for the
//! JSON Schema that `tools/list` advertises.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for the `search` MCP tool.
///
/// Answers a web search query through the configured online model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// The search query or question.
    pub query: String,

    /// Model override; the server default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Maximum tokens in the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0–2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Parameters of a `tools/call` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments, validated against the tool's schema.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// The part of `initialize` parameters the server reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol revision the client asks for.
    #[serde(default)]
    pub protocol_version: Option<String>,
}
