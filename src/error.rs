//! Error types for searchlight.
//!
//! One [`Error`] enum covers the whole crate. It is [`Clone`] so a single
//! upstream outcome can be handed to every caller waiting on a deduplicated
//! request; sources that are not `Clone` (such as [`std::io::Error`]) are
//! held behind an [`Arc`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::codes;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification shared by every error variant.
///
/// The kind decides retry eligibility and the JSON-RPC error code a failure
/// is reported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials rejected by the upstream (HTTP 401/403).
    Auth,
    /// Upstream throttled the request (HTTP 429).
    RateLimit,
    /// Upstream failed on its side (HTTP 5xx).
    Server,
    /// Upstream rejected the request as malformed (other HTTP 4xx).
    Client,
    /// Connection-level failure before a response arrived.
    Network,
    /// An operation did not finish within its deadline.
    Timeout,
    /// Caller-supplied input was rejected locally.
    Validation,
    /// The circuit breaker refused the call.
    CircuitOpen,
    /// A bounded resource (in-flight requests) is at capacity.
    ResourceExhausted,
    /// A JSON-RPC structural rule was violated.
    Protocol,
    /// Bytes could not be written to or read from the stream.
    Transmission,
    /// A value could not be encoded as JSON.
    Serialization,
    /// Configuration was missing or out of range.
    Config,
    /// An invariant broke inside the process (a task panicked).
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name, used in logs and error `data`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Client => "client",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Protocol => "protocol",
            Self::Transmission => "transmission",
            Self::Serialization => "serialization",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }

    /// JSON-RPC error code for this kind.
    ///
    /// Protocol errors carry their own codes; see [`ProtocolError::rpc_code`].
    #[must_use]
    pub const fn rpc_code(self) -> i64 {
        match self {
            Self::Auth => codes::AUTH_ERROR,
            Self::RateLimit => codes::RATE_LIMITED,
            Self::Server => codes::UPSTREAM_SERVER_ERROR,
            Self::Client => codes::UPSTREAM_CLIENT_ERROR,
            Self::Network => codes::NETWORK_ERROR,
            Self::Timeout => codes::TIMEOUT,
            Self::Validation => codes::VALIDATION_ERROR,
            Self::CircuitOpen => codes::CIRCUIT_OPEN,
            Self::ResourceExhausted => codes::RESOURCE_EXHAUSTED,
            Self::Protocol | Self::Internal => codes::INTERNAL_ERROR,
            Self::Transmission => codes::TRANSMISSION_ERROR,
            Self::Serialization => codes::SERIALIZATION_ERROR,
            Self::Config => codes::CONFIG_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by (or on the way to) the upstream model API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error{}: {message}", status_suffix(.status))]
pub struct UpstreamError {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable description from the upstream or the HTTP client.
    pub message: String,
    /// HTTP status if a response was received.
    pub status: Option<u16>,
    /// Server-suggested wait before retrying.
    pub retry_after: Option<Duration>,
}

#[allow(clippy::ref_option)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl UpstreamError {
    /// Creates an error of the given kind without an HTTP status.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Classifies an HTTP status code into an error.
    ///
    /// 401/403 → auth, 408 → timeout, 429 → rate limit, 5xx → server,
    /// other 4xx → client. Anything else is treated as a server fault.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Client,
            _ => ErrorKind::Server,
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    /// Attaches a server-suggested retry delay.
    #[must_use]
    pub const fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

/// JSON-RPC structural failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Inbound bytes were not valid JSON.
    #[error("parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// The message violated a JSON-RPC 2.0 shape rule.
    #[error("invalid request: {}", .reasons.join("; "))]
    InvalidRequest {
        /// Every rule the message broke.
        reasons: Vec<String>,
    },

    /// No handler exists for the method.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// The requested method name.
        method: String,
    },

    /// The params did not match what the method expects.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// What was wrong.
        message: String,
    },

    /// An outbound message failed verification right before sending.
    #[error("pre-transmission validation failed: {}", .reasons.join("; "))]
    PreTransmission {
        /// Every check that failed.
        reasons: Vec<String>,
    },
}

impl ProtocolError {
    /// JSON-RPC error code for this failure.
    #[must_use]
    pub const fn rpc_code(&self) -> i64 {
        match self {
            Self::Parse { .. } => codes::PARSE_ERROR,
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
            Self::PreTransmission { .. } => codes::INTERNAL_ERROR,
        }
    }
}

/// Failures while moving bytes over the stdio stream.
#[derive(Debug, Clone, Error)]
pub enum TransmissionError {
    /// The underlying stream reported an I/O error.
    #[error("stream I/O failed: {source}")]
    Io {
        /// The I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A frame exceeded the buffering limit.
    #[error("message too large: {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Size of the rejected frame.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },
}

impl From<std::io::Error> for TransmissionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            source: Arc::new(err),
        }
    }
}

/// A value could not be turned into JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    /// The value holds parts JSON cannot represent and the fallback encoder
    /// is disabled.
    #[error("value cannot be represented as JSON: {}", .findings.join("; "))]
    Unrepresentable {
        /// One entry per offending node.
        findings: Vec<String>,
    },

    /// The encoder itself failed.
    #[error("JSON encoding failed: {message}")]
    Encode {
        /// Encoder diagnostic.
        message: String,
    },
}

/// Crate-wide error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The upstream model API failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// An operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {}ms", .after.as_millis())]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The circuit breaker is open and failing fast.
    #[error("circuit '{name}' is open; retry in {}ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Breaker name.
        name: String,
        /// Time until the breaker allows a trial call.
        retry_after: Duration,
    },

    /// Too many distinct requests are in flight.
    #[error("resource exhausted: {limit} requests already in flight")]
    ResourceExhausted {
        /// The configured in-flight limit.
        limit: usize,
    },

    /// Local input validation failed.
    #[error("validation failed: {message}")]
    Validation {
        /// What was rejected.
        message: String,
    },

    /// A JSON-RPC structural rule was violated.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Writing to or reading from the stream failed.
    #[error(transparent)]
    Transmission(#[from] TransmissionError),

    /// A value could not be encoded.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Config {
        /// Which setting and why.
        message: String,
    },

    /// A background task failed unexpectedly.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Shorthand for [`Error::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Config`].
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Upstream(e) => e.kind,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Transmission(_) => ErrorKind::Transmission,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Network faults, 5xx, 429 and timeouts retry. Upstream errors whose
    /// message mentions a timeout also retry, since some gateways report
    /// them without a usable status.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Network | ErrorKind::Server | ErrorKind::RateLimit | ErrorKind::Timeout => {
                true
            }
            ErrorKind::Client => match self {
                Self::Upstream(e) => mentions_timeout(&e.message),
                _ => false,
            },
            _ => false,
        }
    }

    /// JSON-RPC error code this error is reported with.
    #[must_use]
    pub const fn rpc_code(&self) -> i64 {
        match self {
            Self::Protocol(e) => e.rpc_code(),
            other => other.kind().rpc_code(),
        }
    }

    /// Server-suggested retry delay, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Upstream(e) => e.retry_after,
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

fn mentions_timeout(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Transmission(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(401, ErrorKind::Auth ; "unauthorized")]
    #[test_case(403, ErrorKind::Auth ; "forbidden")]
    #[test_case(408, ErrorKind::Timeout ; "request timeout")]
    #[test_case(429, ErrorKind::RateLimit ; "too many requests")]
    #[test_case(400, ErrorKind::Client ; "bad request")]
    #[test_case(404, ErrorKind::Client ; "not found")]
    #[test_case(500, ErrorKind::Server ; "internal")]
    #[test_case(503, ErrorKind::Server ; "unavailable")]
    fn test_status_classification(status: u16, expected: ErrorKind) {
        assert_eq!(UpstreamError::from_status(status, "x").kind, expected);
    }

    #[test_case(ErrorKind::Network, true)]
    #[test_case(ErrorKind::Server, true)]
    #[test_case(ErrorKind::RateLimit, true)]
    #[test_case(ErrorKind::Timeout, true)]
    #[test_case(ErrorKind::Client, false)]
    #[test_case(ErrorKind::Auth, false)]
    fn test_upstream_retryable(kind: ErrorKind, retryable: bool) {
        let err = Error::from(UpstreamError::new(kind, "failure"));
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn test_message_detected_timeout_retries() {
        let err = Error::from(UpstreamError::new(
            ErrorKind::Client,
            "gateway said: upstream request Timed Out",
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_local_failures_do_not_retry() {
        assert!(!Error::validation("empty query").is_retryable());
        assert!(!Error::ResourceExhausted { limit: 3 }.is_retryable());
        assert!(
            !Error::CircuitOpen {
                name: "upstream".into(),
                retry_after: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_rpc_codes() {
        let err = Error::from(ProtocolError::MethodNotFound {
            method: "nope".into(),
        });
        assert_eq!(err.rpc_code(), -32601);
        assert_eq!(Error::ResourceExhausted { limit: 1 }.rpc_code(), -32008);
        assert_eq!(
            Error::from(UpstreamError::from_status(429, "slow down")).rpc_code(),
            -32002
        );
    }

    #[test]
    fn test_display_includes_status() {
        let err = UpstreamError::from_status(502, "bad gateway");
        assert_eq!(err.to_string(), "server error (HTTP 502): bad gateway");
        let err = UpstreamError::new(ErrorKind::Network, "connection refused");
        assert_eq!(err.to_string(), "network error: connection refused");
    }

    #[test]
    fn test_io_error_is_shared_on_clone() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed",
        ));
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::Transmission);
        assert!(copy.to_string().contains("pipe closed"));
    }
}
