//! JSON-RPC 2.0 message model and structural validation.
//!
//! Inbound values are classified once into a [`Message`] by
//! [`ProtocolValidator::classify`]. Outbound messages go through
//! [`ProtocolValidator::validate_pre_transmission`] before any byte is
//! written.

mod message;
mod validator;

pub use message::{
    Id, JSONRPC_VERSION, Message, Notification, Request, Response, ResponsePayload, RpcError,
};
pub use validator::{InvalidMessage, MessageKind, ProtocolValidator, ValidationReport};

/// JSON-RPC error codes.
///
/// The standard codes come from the JSON-RPC 2.0 specification; the
/// `-32001..=-32012` range is application-defined.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Upstream rejected the credentials.
    pub const AUTH_ERROR: i64 = -32001;
    /// Upstream rate limit hit.
    pub const RATE_LIMITED: i64 = -32002;
    /// Upstream server-side failure.
    pub const UPSTREAM_SERVER_ERROR: i64 = -32003;
    /// Upstream rejected the request.
    pub const UPSTREAM_CLIENT_ERROR: i64 = -32004;
    /// Network failure reaching the upstream.
    pub const NETWORK_ERROR: i64 = -32005;
    /// Deadline exceeded.
    pub const TIMEOUT: i64 = -32006;
    /// Circuit breaker open.
    pub const CIRCUIT_OPEN: i64 = -32007;
    /// Too many requests in flight.
    pub const RESOURCE_EXHAUSTED: i64 = -32008;
    /// Local input validation failed.
    pub const VALIDATION_ERROR: i64 = -32009;
    /// Stream write or read failed.
    pub const TRANSMISSION_ERROR: i64 = -32010;
    /// Value could not be encoded.
    pub const SERIALIZATION_ERROR: i64 = -32011;
    /// Invalid configuration.
    pub const CONFIG_ERROR: i64 = -32012;
}
