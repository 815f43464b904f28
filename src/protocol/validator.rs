//! Structural JSON-RPC 2.0 checks for inbound and outbound messages.

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::codes;
use super::message::{Id, JSONRPC_VERSION, Message, Notification, Request, Response, RpcError};
use crate::error::{Error, ProtocolError, Result};
use crate::serializer::SafeSerializer;

/// Method prefix reserved by JSON-RPC 2.0 for system extensions.
const RESERVED_PREFIX: &str = "rpc.";

/// Reserved methods that are accepted without a warning.
const RESERVED_WHITELIST: &[&str] = &["rpc.discover"];

/// Which of the three message shapes a value has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Has `method` and `id`.
    Request,
    /// Has `method`, no `id`.
    Notification,
    /// Has `result` or `error`.
    Response,
}

/// Result of validating one candidate message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Detected shape, if any could be determined.
    pub kind: Option<MessageKind>,
    /// Rule violations; non-empty means invalid.
    pub errors: Vec<String>,
    /// Non-fatal remarks.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// True when a shape was detected and no rule was broken.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.kind.is_some() && self.errors.is_empty()
    }
}

/// An inbound value that did not classify as a valid message.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    /// The candidate's id when it had a usable one, else `null`.
    pub id: Id,
    /// What was wrong.
    pub report: ValidationReport,
}

impl InvalidMessage {
    /// The `-32600` error this failure is answered with.
    #[must_use]
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::invalid_request(&self.report.errors)
    }
}

/// JSON-RPC 2.0 shape rules plus pre-transmission round-trip checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolValidator {
    serializer: SafeSerializer,
}

impl ProtocolValidator {
    /// Creates a validator that encodes with `serializer`.
    #[must_use]
    pub const fn new(serializer: SafeSerializer) -> Self {
        Self { serializer }
    }

    /// The serializer used for outbound encoding.
    #[must_use]
    pub const fn serializer(&self) -> &SafeSerializer {
        &self.serializer
    }

    /// Classifies `candidate` and checks it against the JSON-RPC 2.0 rules.
    #[must_use]
    pub fn validate_message(&self, candidate: &Value) -> ValidationReport {
        let mut report = ValidationReport::default();

        let Some(obj) = candidate.as_object() else {
            report.errors.push(if candidate.is_array() {
                "batch messages are not supported".to_string()
            } else {
                "message must be a JSON object".to_string()
            });
            return report;
        };

        match obj.get("jsonrpc") {
            None => report.errors.push("missing 'jsonrpc' member".to_string()),
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => report
                .errors
                .push(format!("'jsonrpc' must be \"2.0\", got {other}")),
        }

        if let Some(method) = obj.get("method") {
            Self::check_call(obj, method, &mut report);
        } else if obj.contains_key("result") || obj.contains_key("error") {
            report.kind = Some(MessageKind::Response);
            Self::check_response(obj, &mut report);
        } else {
            report.errors.push(
                "message has neither 'method' (request or notification) nor 'result'/'error' (response)"
                    .to_string(),
            );
        }

        if report.errors.is_empty() {
            debug!(kind = ?report.kind, warnings = report.warnings.len(), "message validated");
        } else {
            debug!(kind = ?report.kind, errors = ?report.errors, "message failed validation");
        }
        report
    }

    /// Validates `candidate` and additionally requires it to be of `expected`
    /// kind.
    ///
    /// This is how an explicit `id` on a message meant as a notification is
    /// caught: by shape alone such a message is a request.
    #[must_use]
    pub fn validate_as(&self, candidate: &Value, expected: MessageKind) -> ValidationReport {
        let mut report = self.validate_message(candidate);
        match (expected, report.kind) {
            (_, None) => {}
            (MessageKind::Notification, Some(MessageKind::Request)) => {
                report
                    .errors
                    .push("notification must not carry an 'id'".to_string());
            }
            (expected, Some(found)) if expected != found => {
                let message = format!("expected a {expected:?} message, found a {found:?}");
                report.errors.push(message.to_lowercase());
            }
            _ => {}
        }
        report
    }

    fn check_call(obj: &Map<String, Value>, method: &Value, report: &mut ValidationReport) {
        let kind = if obj.contains_key("id") {
            MessageKind::Request
        } else {
            MessageKind::Notification
        };
        report.kind = Some(kind);

        match method.as_str() {
            None => report.errors.push("'method' must be a string".to_string()),
            Some(name)
                if name.starts_with(RESERVED_PREFIX) && !RESERVED_WHITELIST.contains(&name) =>
            {
                report
                    .warnings
                    .push(format!("method '{name}' uses the reserved 'rpc.' prefix"));
            }
            Some(_) => {}
        }

        if let Some(id) = obj.get("id")
            && Id::from_value(id).is_none()
        {
            report
                .errors
                .push("'id' must be a string, number or null".to_string());
        }

        if let Some(params) = obj.get("params")
            && !params.is_array()
            && !params.is_object()
        {
            report
                .errors
                .push("'params' must be an array or an object".to_string());
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            report
                .errors
                .push("a request must not carry 'result' or 'error'".to_string());
        }
    }

    fn check_response(obj: &Map<String, Value>, report: &mut ValidationReport) {
        match obj.get("id") {
            None => report.errors.push("response is missing 'id'".to_string()),
            Some(id) if Id::from_value(id).is_none() => report
                .errors
                .push("'id' must be a string, number or null".to_string()),
            Some(_) => {}
        }

        if obj.contains_key("result") && obj.contains_key("error") {
            report
                .errors
                .push("response must not carry both 'result' and 'error'".to_string());
        }

        if let Some(error) = obj.get("error") {
            match error.as_object() {
                None => report.errors.push("'error' must be an object".to_string()),
                Some(e) => {
                    let integer_code = e
                        .get("code")
                        .and_then(Value::as_number)
                        .is_some_and(|n| n.is_i64() || n.is_u64());
                    if !integer_code {
                        report
                            .errors
                            .push("'error.code' must be an integer".to_string());
                    }
                    if !e.get("message").is_some_and(Value::is_string) {
                        report
                            .errors
                            .push("'error.message' must be a string".to_string());
                    }
                }
            }
        }
    }

    /// Validates `candidate` and turns it into a typed [`Message`].
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidMessage`] carrying the candidate's id (or `null`)
    /// and the validation report.
    pub fn classify(&self, candidate: Value) -> std::result::Result<Message, InvalidMessage> {
        let report = self.validate_message(&candidate);
        for warning in &report.warnings {
            warn!(%warning, "protocol warning");
        }

        let Value::Object(mut obj) = candidate else {
            return Err(InvalidMessage {
                id: Id::Null,
                report,
            });
        };
        let id = obj.get("id").and_then(Id::from_value);

        if !report.is_valid() {
            return Err(InvalidMessage {
                id: id.unwrap_or(Id::Null),
                report,
            });
        }

        let params = obj.remove("params");
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            _ => None,
        };

        let message = match (report.kind, method, id) {
            (Some(MessageKind::Request), Some(method), Some(id)) => {
                Message::Request(Request { id, method, params })
            }
            (Some(MessageKind::Notification), Some(method), _) => {
                Message::Notification(Notification { method, params })
            }
            (Some(MessageKind::Response), _, Some(id)) => {
                let response = match obj.remove("error") {
                    Some(error) => match serde_json::from_value::<RpcError>(error) {
                        Ok(error) => Response::failure(id, error),
                        Err(e) => {
                            return Err(InvalidMessage {
                                id,
                                report: ValidationReport {
                                    errors: vec![format!("malformed 'error' object: {e}")],
                                    ..report
                                },
                            });
                        }
                    },
                    None => Response::success(id, obj.remove("result").unwrap_or(Value::Null)),
                };
                Message::Response(response)
            }
            (_, _, id) => {
                return Err(InvalidMessage {
                    id: id.unwrap_or(Id::Null),
                    report,
                });
            }
        };
        Ok(message)
    }

    /// Returns `response` unchanged when valid, otherwise a compliant
    /// `-32603` error response describing what was wrong.
    ///
    /// The original id is kept when it is a valid id; otherwise it is `null`.
    #[must_use]
    pub fn validate_and_sanitize_response(&self, response: Value) -> Value {
        let report = self.validate_as(&response, MessageKind::Response);
        if report.is_valid() {
            return response;
        }

        warn!(errors = ?report.errors, "outbound response failed validation; replacing it");
        let id = response
            .get("id")
            .and_then(Id::from_value)
            .unwrap_or(Id::Null);
        let error = RpcError::new(
            codes::INTERNAL_ERROR,
            "Internal error: response failed protocol validation",
        )
        .with_data(json!({ "validation_errors": report.errors }));

        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id.to_value(),
            "error": {
                "code": error.code,
                "message": error.message,
                "data": error.data,
            },
        })
    }

    /// Runs every check a message must pass before it is written.
    ///
    /// Structural validation, then encode → parse → encode with the two
    /// encodings required to be identical. Returns the verified text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PreTransmission`] listing every failed check.
    pub fn validate_pre_transmission(&self, message: &Value) -> Result<String> {
        let report = self.validate_message(message);
        if !report.is_valid() {
            return Err(pre_transmission(report.errors));
        }

        let first = self
            .serializer
            .stringify(message)
            .map_err(|e| pre_transmission(vec![format!("encoding failed: {e}")]))?;

        let parsed: Value = serde_json::from_str(&first)
            .map_err(|e| pre_transmission(vec![format!("encoded text does not parse: {e}")]))?;

        let second = self
            .serializer
            .stringify(&parsed)
            .map_err(|e| pre_transmission(vec![format!("re-encoding failed: {e}")]))?;

        let mut reasons = Vec::new();
        if first != second {
            reasons.push("encoding is not stable across a parse round trip".to_string());
        }
        if first.contains(['\n', '\r']) {
            reasons.push("encoded text contains a raw line terminator".to_string());
        }
        if !reasons.is_empty() {
            return Err(pre_transmission(reasons));
        }
        Ok(first)
    }
}

fn pre_transmission(reasons: Vec<String>) -> Error {
    warn!(?reasons, "pre-transmission validation failed");
    ProtocolError::PreTransmission { reasons }.into()
}
