//! Typed response envelope and error messages

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use super::actions::{Action, ResponsePayload};
use super::custom::{put_nested_list, put_nested_opt, CustomParsers, CustomSerializers, ToJson};
use super::messages::{CallError, ErrorCode, OcppMessage, Routing};
use super::request::OcppRequest;
use super::routing::{EventTrackingId, NetworkPath, RequestId, SourceRouting};
use super::types::{CustomData, Signature};

/// Elapsed time between a request and its answer
///
/// `None` when the request time is unknown.
pub fn runtime(request_timestamp: Option<DateTime<Utc>>, response_timestamp: DateTime<Utc>) -> Option<Duration> {
    request_timestamp.map(|start| response_timestamp - start)
}

/// The request a response answers
#[derive(Debug, Clone, PartialEq)]
pub enum Origin<A: Action> {
    Request(Arc<OcppRequest<A>>),
    /// The correlation was lost
    Unknown,
}

impl<A: Action> Origin<A> {
    pub fn request(&self) -> Option<&Arc<OcppRequest<A>>> {
        match self {
            Origin::Request(request) => Some(request),
            Origin::Unknown => None,
        }
    }
}

/// How a request was answered
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseResult<P> {
    /// A real answer
    Success(P),
    /// Signature verification of the request or response failed
    SignatureError { reason: String },
    /// The request was not handled
    Failed { reason: String },
    /// A received response did not match the action's schema
    FormationViolation { reason: String },
    /// The handler raised
    ExceptionOccurred { error: String },
    /// The peer answered with CALLERROR
    RequestError {
        error_code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl<P> ResponseResult<P> {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseResult::Success(_))
    }

    pub fn payload(&self) -> Option<&P> {
        match self {
            ResponseResult::Success(payload) => Some(payload),
            _ => None,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseResult::Success(_) => "Success",
            ResponseResult::SignatureError { .. } => "SignatureError",
            ResponseResult::Failed { .. } => "Failed",
            ResponseResult::FormationViolation { .. } => "FormationViolation",
            ResponseResult::ExceptionOccurred { .. } => "ExceptionOccurred",
            ResponseResult::RequestError { .. } => "RequestError",
        }
    }

    /// Human readable reason for every non-success outcome
    pub fn reason(&self) -> Option<&str> {
        match self {
            ResponseResult::Success(_) => None,
            ResponseResult::SignatureError { reason }
            | ResponseResult::Failed { reason }
            | ResponseResult::FormationViolation { reason } => Some(reason),
            ResponseResult::ExceptionOccurred { error } => Some(error),
            ResponseResult::RequestError { description, .. } => Some(description),
        }
    }
}

/// Transport-derived metadata of a received response
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub response_timestamp: Option<DateTime<Utc>>,
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
    /// Defaults to the tracking id of the request
    pub event_tracking_id: Option<EventTrackingId>,
}

impl ResponseHeader {
    pub fn new(destination: SourceRouting, network_path: NetworkPath) -> Self {
        Self {
            response_timestamp: None,
            destination,
            network_path,
            event_tracking_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.response_timestamp = Some(timestamp);
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(id);
        self
    }
}

/// An OCPP response for action `A`, real or synthesized
#[derive(Debug, Clone, PartialEq)]
pub struct OcppResponse<A: Action> {
    pub origin: Origin<A>,
    pub result: ResponseResult<A::Response>,
    pub response_timestamp: DateTime<Utc>,
    pub runtime: Option<Duration>,
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
    pub event_tracking_id: EventTrackingId,
    pub signatures: Vec<Signature>,
    pub custom_data: Option<CustomData>,
}

impl<A: Action> OcppResponse<A> {
    fn answering(request: Arc<OcppRequest<A>>, result: ResponseResult<A::Response>) -> Self {
        let response_timestamp = Utc::now();
        let destination = match request.network_path.source() {
            Some(source) => SourceRouting::to(source.clone()),
            None => request.destination.clone(),
        };

        Self {
            runtime: runtime(Some(request.request_timestamp), response_timestamp),
            response_timestamp,
            destination,
            network_path: NetworkPath::empty(),
            event_tracking_id: request.event_tracking_id.clone(),
            signatures: Vec::new(),
            custom_data: None,
            result,
            origin: Origin::Request(request),
        }
    }

    pub fn success(request: Arc<OcppRequest<A>>, payload: A::Response) -> Self {
        Self::answering(request, ResponseResult::Success(payload))
    }

    pub fn signature_error(request: Arc<OcppRequest<A>>, reason: impl Into<String>) -> Self {
        Self::answering(
            request,
            ResponseResult::SignatureError {
                reason: reason.into(),
            },
        )
    }

    pub fn failed(request: Arc<OcppRequest<A>>, reason: impl Into<String>) -> Self {
        Self::answering(
            request,
            ResponseResult::Failed {
                reason: reason.into(),
            },
        )
    }

    pub fn formation_violation(request: Arc<OcppRequest<A>>, reason: impl Into<String>) -> Self {
        Self::answering(
            request,
            ResponseResult::FormationViolation {
                reason: reason.into(),
            },
        )
    }

    pub fn exception_occurred(request: Arc<OcppRequest<A>>, error: impl Into<String>) -> Self {
        Self::answering(
            request,
            ResponseResult::ExceptionOccurred {
                error: error.into(),
            },
        )
    }

    /// Wrap a CALLERROR received for `request`
    pub fn request_error(request: Option<Arc<OcppRequest<A>>>, error: &RequestErrorMessage) -> Self {
        Self {
            runtime: runtime(
                request.as_ref().map(|r| r.request_timestamp),
                error.response_timestamp,
            ),
            origin: match request {
                Some(request) => Origin::Request(request),
                None => Origin::Unknown,
            },
            result: ResponseResult::RequestError {
                error_code: error.error_code,
                description: error.error_description.clone(),
                details: error.error_details.clone(),
            },
            response_timestamp: error.response_timestamp,
            destination: error.destination.clone(),
            network_path: error.network_path.clone(),
            event_tracking_id: error.event_tracking_id.clone(),
            signatures: Vec::new(),
            custom_data: None,
        }
    }

    pub fn with_signatures(mut self, signatures: Vec<Signature>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn with_custom_data(mut self, custom_data: CustomData) -> Self {
        self.custom_data = Some(custom_data);
        self
    }

    pub fn with_network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_destination(mut self, destination: SourceRouting) -> Self {
        self.destination = destination;
        self
    }

    pub fn request(&self) -> Option<&Arc<OcppRequest<A>>> {
        self.origin.request()
    }

    /// Id of the answered request, if known
    pub fn request_id(&self) -> Option<&RequestId> {
        self.origin.request().map(|r| &r.request_id)
    }

    /// Parse the JSON payload of a CALLRESULT received for `request`
    pub fn try_parse(
        request: Arc<OcppRequest<A>>,
        json: &Value,
        header: ResponseHeader,
        parsers: &CustomParsers,
    ) -> Result<Self, String> {
        let object = json
            .as_object()
            .ok_or_else(|| format!("{} response must be a JSON object", A::NAME))?;

        let payload: A::Response = serde_json::from_value(json.clone())
            .map_err(|e| format!("Invalid {} response: {}", A::NAME, e))?;
        let payload = parsers.apply(json, payload);

        let signatures = match object.get("signatures") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| format!("Invalid {} response signatures: {}", A::NAME, e))?,
            None => Vec::new(),
        };

        let custom_data = match object.get("customData") {
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| format!("Invalid {} response customData: {}", A::NAME, e))?,
            ),
            None => None,
        };

        let response_timestamp = header.response_timestamp.unwrap_or_else(Utc::now);
        let response = Self {
            runtime: runtime(Some(request.request_timestamp), response_timestamp),
            response_timestamp,
            destination: header.destination,
            network_path: header.network_path,
            event_tracking_id: header
                .event_tracking_id
                .unwrap_or_else(|| request.event_tracking_id.clone()),
            signatures,
            custom_data,
            result: ResponseResult::Success(payload),
            origin: Origin::Request(request),
        };

        Ok(parsers.apply(json, response))
    }

    /// JSON payload of the CALLRESULT
    ///
    /// Non-success outcomes that still travel as CALLRESULT carry the action's
    /// fallback payload.
    pub fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = match &self.result {
            ResponseResult::Success(payload) => payload.to_json(custom),
            _ => A::Response::fallback().to_json(custom),
        };
        if !self.signatures.is_empty() {
            put_nested_list(&mut json, "signatures", &self.signatures, custom);
        }
        put_nested_opt(&mut json, "customData", self.custom_data.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// A CALLERROR, either received or about to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct RequestErrorMessage {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub response_timestamp: DateTime<Utc>,
    pub event_tracking_id: EventTrackingId,
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
}

impl RequestErrorMessage {
    pub fn new(
        request_id: RequestId,
        destination: SourceRouting,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
            response_timestamp: Utc::now(),
            event_tracking_id: EventTrackingId::new(),
            destination,
            network_path: NetworkPath::empty(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    pub fn with_network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = id;
        self
    }

    /// Lift a received CALLERROR; `routing` is what the frame carried or the
    /// connection implies
    pub fn from_call_error(error: &CallError, routing: Routing) -> Self {
        Self {
            request_id: error.message_id.clone(),
            error_code: error.error_code,
            error_description: error.error_description.clone(),
            error_details: error.error_details.clone(),
            response_timestamp: Utc::now(),
            event_tracking_id: EventTrackingId::new(),
            destination: routing.destination,
            network_path: routing.network_path,
        }
    }

    pub fn to_message(&self, overlay: bool) -> OcppMessage {
        OcppMessage::CallError(error_frame(
            &self.request_id,
            self.error_code,
            &self.error_description,
            &self.error_details,
            overlay.then(|| Routing::new(self.destination.clone(), self.network_path.clone())),
        ))
    }
}

/// A CALLRESULTERROR: the peer could not process our response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseErrorMessage {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub response_timestamp: DateTime<Utc>,
    pub event_tracking_id: EventTrackingId,
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
}

impl ResponseErrorMessage {
    pub fn new(
        request_id: RequestId,
        destination: SourceRouting,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
            response_timestamp: Utc::now(),
            event_tracking_id: EventTrackingId::new(),
            destination,
            network_path: NetworkPath::empty(),
        }
    }

    pub fn with_network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn from_call_error(error: &CallError, routing: Routing) -> Self {
        Self {
            request_id: error.message_id.clone(),
            error_code: error.error_code,
            error_description: error.error_description.clone(),
            error_details: error.error_details.clone(),
            response_timestamp: Utc::now(),
            event_tracking_id: EventTrackingId::new(),
            destination: routing.destination,
            network_path: routing.network_path,
        }
    }

    pub fn to_message(&self, overlay: bool) -> OcppMessage {
        OcppMessage::CallResultError(error_frame(
            &self.request_id,
            self.error_code,
            &self.error_description,
            &self.error_details,
            overlay.then(|| Routing::new(self.destination.clone(), self.network_path.clone())),
        ))
    }
}

fn error_frame(
    request_id: &RequestId,
    error_code: ErrorCode,
    description: &str,
    details: &Value,
    routing: Option<Routing>,
) -> CallError {
    let error = CallError::new(request_id.clone(), error_code, description).with_details(details.clone());
    match routing {
        Some(routing) => error.with_routing(routing),
        None => error,
    }
}
