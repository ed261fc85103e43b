//! OCPP-J message framing
//!
//! OCPP 2.0.1/2.1 carries JSON arrays over WebSocket:
//! - CALL:            [2, messageId, action, payload]
//! - CALLRESULT:      [3, messageId, payload]
//! - CALLERROR:       [4, messageId, errorCode, errorDescription, errorDetails]
//! - CALLRESULTERROR: [5, messageId, errorCode, errorDescription, errorDetails]
//!
//! Between networking nodes the overlay layout inserts the destination and the
//! network path right after the message id, e.g.
//! `[2, messageId, destination, networkPath, action, payload]`.
//! The layout is detected from the array length on parse and chosen by the
//! presence of `Routing` on serialization.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::routing::{NetworkPath, RequestId, SourceRouting};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    CallResultError = 5,
}

/// OCPP RPC framework error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Parse a wire error code; unknown codes degrade to `GenericError`
    pub fn parse(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors while decoding a wire frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {reason}")]
    InvalidFormat {
        message_id: Option<RequestId>,
        reason: String,
    },

    #[error("Unknown message type: {message_type}")]
    UnknownMessageType {
        message_id: Option<RequestId>,
        message_type: i64,
    },
}

impl FrameError {
    fn invalid(message_id: Option<&RequestId>, reason: impl Into<String>) -> Self {
        FrameError::InvalidFormat {
            message_id: message_id.cloned(),
            reason: reason.into(),
        }
    }

    /// Message id, when the frame was readable far enough to contain one
    pub fn message_id(&self) -> Option<&RequestId> {
        match self {
            FrameError::Json(_) => None,
            FrameError::InvalidFormat { message_id, .. } => message_id.as_ref(),
            FrameError::UnknownMessageType { message_id, .. } => message_id.as_ref(),
        }
    }

    /// Error code to answer this framing failure with
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::UnknownMessageType { .. } => ErrorCode::MessageTypeNotSupported,
            _ => ErrorCode::FormatViolation,
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Request id {0} is already outstanding")]
    DuplicateRequestId(RequestId),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame layout spoken on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkingMode {
    /// Plain OCPP-J, routing derived from the connection
    #[default]
    Standard,
    /// Destination and network path carried in every frame
    OverlayNetwork,
}

/// Overlay routing metadata carried by networking-node frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
}

impl Routing {
    pub fn new(destination: SourceRouting, network_path: NetworkPath) -> Self {
        Self {
            destination,
            network_path,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: RequestId,
    pub routing: Option<Routing>,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: RequestId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id,
            routing: None,
            action: action.into(),
            payload,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    fn to_json(&self) -> Value {
        match &self.routing {
            Some(r) => json!([
                MessageType::Call as i32,
                self.message_id.as_str(),
                r.destination.to_json(),
                r.network_path.to_json(),
                &self.action,
                &self.payload
            ]),
            None => json!([
                MessageType::Call as i32,
                self.message_id.as_str(),
                &self.action,
                &self.payload
            ]),
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: RequestId,
    pub routing: Option<Routing>,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: RequestId, payload: Value) -> Self {
        Self {
            message_id,
            routing: None,
            payload,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    fn to_json(&self) -> Value {
        match &self.routing {
            Some(r) => json!([
                MessageType::CallResult as i32,
                self.message_id.as_str(),
                r.destination.to_json(),
                r.network_path.to_json(),
                &self.payload
            ]),
            None => json!([
                MessageType::CallResult as i32,
                self.message_id.as_str(),
                &self.payload
            ]),
        }
    }
}

/// OCPP CALLERROR / CALLRESULTERROR body
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: RequestId,
    pub routing: Option<Routing>,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: RequestId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            routing: None,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    fn to_json(&self, message_type: MessageType) -> Value {
        match &self.routing {
            Some(r) => json!([
                message_type as i32,
                self.message_id.as_str(),
                r.destination.to_json(),
                r.network_path.to_json(),
                self.error_code.to_string(),
                &self.error_description,
                &self.error_details
            ]),
            None => json!([
                message_type as i32,
                self.message_id.as_str(),
                self.error_code.to_string(),
                &self.error_description,
                &self.error_details
            ]),
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
    CallResultError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let array = value
            .as_array()
            .ok_or_else(|| FrameError::invalid(None, "frame is not a JSON array"))?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| FrameError::invalid(None, "missing message type"))?;

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(RequestId::from)
            .ok_or_else(|| FrameError::invalid(None, "missing message id"))?;
        let id = Some(&message_id);

        match msg_type {
            2 => {
                let (routing, rest) = match array.len() {
                    4 => (None, &array[2..]),
                    6 => (Some(parse_routing(&array[2], &array[3], id)?), &array[4..]),
                    n => return Err(FrameError::invalid(id, format!("CALL with {} elements", n))),
                };

                let action = rest[0]
                    .as_str()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| FrameError::invalid(id, "missing action"))?
                    .to_string();

                let payload = expect_object(&rest[1], id)?;
                Ok(OcppMessage::Call(Call {
                    message_id,
                    routing,
                    action,
                    payload,
                }))
            }
            3 => {
                let (routing, rest) = match array.len() {
                    3 => (None, &array[2..]),
                    5 => (Some(parse_routing(&array[2], &array[3], id)?), &array[4..]),
                    n => {
                        return Err(FrameError::invalid(
                            id,
                            format!("CALLRESULT with {} elements", n),
                        ))
                    }
                };

                let payload = expect_object(&rest[0], id)?;
                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    routing,
                    payload,
                }))
            }
            4 | 5 => {
                let (routing, rest) = match array.len() {
                    5 => (None, &array[2..]),
                    7 => (Some(parse_routing(&array[2], &array[3], id)?), &array[4..]),
                    n => {
                        return Err(FrameError::invalid(
                            id,
                            format!("error frame with {} elements", n),
                        ))
                    }
                };

                let error_code = rest[0]
                    .as_str()
                    .map(ErrorCode::parse)
                    .ok_or_else(|| FrameError::invalid(id, "missing error code"))?;

                let error = CallError {
                    message_id,
                    routing,
                    error_code,
                    error_description: rest[1].as_str().unwrap_or("").to_string(),
                    error_details: rest[2].clone(),
                };

                if msg_type == 4 {
                    Ok(OcppMessage::CallError(error))
                } else {
                    Ok(OcppMessage::CallResultError(error))
                }
            }
            other => Err(FrameError::UnknownMessageType {
                message_id: Some(message_id),
                message_type: other,
            }),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &RequestId {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) | OcppMessage::CallResultError(e) => &e.message_id,
        }
    }

    /// Overlay routing metadata, if present
    pub fn routing(&self) -> Option<&Routing> {
        match self {
            OcppMessage::Call(c) => c.routing.as_ref(),
            OcppMessage::CallResult(r) => r.routing.as_ref(),
            OcppMessage::CallError(e) | OcppMessage::CallResultError(e) => e.routing.as_ref(),
        }
    }

    /// Replace (or strip) the overlay routing metadata
    pub fn set_routing(&mut self, routing: Option<Routing>) {
        match self {
            OcppMessage::Call(c) => c.routing = routing,
            OcppMessage::CallResult(r) => r.routing = routing,
            OcppMessage::CallError(e) | OcppMessage::CallResultError(e) => e.routing = routing,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
            OcppMessage::CallResultError(_) => MessageType::CallResultError,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_json(),
            OcppMessage::CallResult(r) => r.to_json(),
            OcppMessage::CallError(e) => e.to_json(MessageType::CallError),
            OcppMessage::CallResultError(e) => e.to_json(MessageType::CallResultError),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    /// Serialize to a WebSocket text frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        Ok(serde_json::to_string(&self.to_json())?)
    }
}

fn parse_routing(
    destination: &Value,
    path: &Value,
    id: Option<&RequestId>,
) -> Result<Routing, FrameError> {
    let destination = SourceRouting::from_json(destination)
        .ok_or_else(|| FrameError::invalid(id, "invalid destination"))?;
    let network_path =
        NetworkPath::from_json(path).ok_or_else(|| FrameError::invalid(id, "invalid network path"))?;
    Ok(Routing::new(destination, network_path))
}

fn expect_object(payload: &Value, id: Option<&RequestId>) -> Result<Value, FrameError> {
    if payload.is_object() {
        Ok(payload.clone())
    } else {
        Err(FrameError::invalid(id, "payload is not a JSON object"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::routing::NodeId;

    #[test]
    fn test_call_serialization() {
        let call = Call::new("msg-1".into(), "Heartbeat", json!({}));
        let text = OcppMessage::Call(call).to_text().unwrap();

        assert_eq!(text, r#"[2,"msg-1","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, RequestId::from("msg-123"));
                assert_eq!(call.action, "Heartbeat");
                assert!(call.routing.is_none());
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_overlay_call_parsing() {
        let json = r#"[2, "msg-9", "CSMS", ["CS001", "NN1"], "BootNotification", {"reason": "PowerUp"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        let routing = msg.routing().cloned().unwrap();
        assert_eq!(routing.destination.target(), &NodeId::from("CSMS"));
        assert_eq!(routing.network_path.source(), Some(&NodeId::from("CS001")));

        // Serializing keeps the overlay layout
        let reparsed = OcppMessage::parse(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(reparsed, msg);
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id.as_str(), "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id.as_str(), "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_call_result_error_parsing() {
        let json = r#"[5, "msg-7", "NoSuchCode", "bad response", {"field": "status"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResultError(error) => {
                assert_eq!(error.error_code, ErrorCode::GenericError);
                assert_eq!(error.error_details["field"], "status");
            }
            _ => panic!("Expected CallResultError"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        let err = OcppMessage::parse(b"{\"not\": \"an array\"}").unwrap_err();
        assert!(err.message_id().is_none());

        let err = OcppMessage::parse(br#"[2, "msg-1", "Heartbeat"]"#).unwrap_err();
        assert_eq!(err.message_id(), Some(&RequestId::from("msg-1")));
        assert_eq!(err.error_code(), ErrorCode::FormatViolation);

        let err = OcppMessage::parse(br#"[2, "msg-2", "Heartbeat", []]"#).unwrap_err();
        assert_eq!(err.message_id(), Some(&RequestId::from("msg-2")));

        let err = OcppMessage::parse(br#"[9, "msg-3", {}]"#).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::MessageTypeNotSupported);

        assert!(OcppMessage::parse(b"[2, \"msg").is_err());
    }

    #[test]
    fn test_call_error_serialization_with_routing() {
        let error = CallError::new("msg-4".into(), ErrorCode::SecurityError, "bad signature")
            .with_routing(Routing::new(
                SourceRouting::to("CS001"),
                NetworkPath::from_node("NN1"),
            ));

        let value = OcppMessage::CallError(error).to_json();
        assert_eq!(
            value,
            json!([4, "msg-4", "CS001", ["NN1"], "SecurityError", "bad signature", {}])
        );
    }
}
