//! Typed request envelope

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::actions::Action;
use super::custom::{put_nested_list, put_nested_opt, CustomParsers, CustomSerializers, ToJson};
use super::messages::{Call, Routing};
use super::routing::{EventTrackingId, NetworkPath, RequestId, SourceRouting};
use super::types::{CustomData, Signature};

/// Transport-derived metadata of an inbound request
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub request_id: RequestId,
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
    /// Defaults to the time of parsing
    pub request_timestamp: Option<DateTime<Utc>>,
    pub request_timeout: Option<Duration>,
    /// Defaults to a fresh id
    pub event_tracking_id: Option<EventTrackingId>,
}

impl RequestHeader {
    pub fn new(request_id: RequestId, destination: SourceRouting, network_path: NetworkPath) -> Self {
        Self {
            request_id,
            destination,
            network_path,
            request_timestamp: None,
            request_timeout: None,
            event_tracking_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.request_timestamp = Some(timestamp);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(id);
        self
    }
}

/// An OCPP request for action `A`
///
/// Immutable once built; shared as `Arc<OcppRequest<A>>` through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct OcppRequest<A: Action> {
    pub request_id: RequestId,
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
    pub request_timestamp: DateTime<Utc>,
    pub event_tracking_id: EventTrackingId,
    pub request_timeout: Option<Duration>,
    pub payload: A::Request,
    pub signatures: Vec<Signature>,
    pub custom_data: Option<CustomData>,
}

impl<A: Action> OcppRequest<A> {
    /// Build an outbound request with fresh ids
    pub fn new(destination: SourceRouting, payload: A::Request) -> Self {
        Self {
            request_id: RequestId::new(),
            destination,
            network_path: NetworkPath::empty(),
            request_timestamp: Utc::now(),
            event_tracking_id: EventTrackingId::new(),
            request_timeout: None,
            payload,
            signatures: Vec::new(),
            custom_data: None,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = id;
        self
    }

    pub fn with_network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signatures.push(signature);
        self
    }

    pub fn with_custom_data(mut self, custom_data: CustomData) -> Self {
        self.custom_data = Some(custom_data);
        self
    }

    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        A::NAME
    }

    /// Parse the JSON payload of a CALL
    ///
    /// Returns a description of the problem when a mandatory field is missing
    /// or any nested value fails to parse.
    pub fn try_parse(
        json: &Value,
        header: RequestHeader,
        parsers: &CustomParsers,
    ) -> Result<Self, String> {
        let object = json
            .as_object()
            .ok_or_else(|| format!("{} request must be a JSON object", A::NAME))?;

        let payload: A::Request = serde_json::from_value(json.clone())
            .map_err(|e| format!("Invalid {} request: {}", A::NAME, e))?;
        let payload = parsers.apply(json, payload);

        let signatures = match object.get("signatures") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| format!("Invalid {} request signatures: {}", A::NAME, e))?,
            None => Vec::new(),
        };

        let custom_data = match object.get("customData") {
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| format!("Invalid {} request customData: {}", A::NAME, e))?,
            ),
            None => None,
        };

        let request = Self {
            request_id: header.request_id,
            destination: header.destination,
            network_path: header.network_path,
            request_timestamp: header.request_timestamp.unwrap_or_else(Utc::now),
            event_tracking_id: header.event_tracking_id.unwrap_or_default(),
            request_timeout: header.request_timeout,
            payload,
            signatures,
            custom_data,
        };

        Ok(parsers.apply(json, request))
    }

    /// JSON payload of the CALL, including signatures and customData
    pub fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = self.payload.to_json(custom);
        if !self.signatures.is_empty() {
            put_nested_list(&mut json, "signatures", &self.signatures, custom);
        }
        put_nested_opt(&mut json, "customData", self.custom_data.as_ref(), custom);
        custom.apply(self, json)
    }

    /// Wire frame for this request
    pub fn to_call(&self, custom: &CustomSerializers, routing: Option<Routing>) -> Call {
        let call = Call::new(self.request_id.clone(), A::NAME, self.to_json(custom));
        match routing {
            Some(routing) => call.with_routing(routing),
            None => call,
        }
    }
}
