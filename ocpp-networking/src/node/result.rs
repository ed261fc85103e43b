//! Result builder
//!
//! Turns the outcome of one inbound request pipeline into the reply frame,
//! with the reply addressed back along the incoming path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::ocpp::{
    Action, CallError, CallResult, ErrorCode, EventTrackingId, NetworkPath, NodeId, OcppMessage,
    OcppResponse, RequestId, ResponseResult, Routing, SourceRouting,
};

/// Terminal state of an inbound request pipeline
#[derive(Debug, Clone)]
pub enum RequestOutcome<A: Action> {
    /// A response, real or synthetic, was produced
    Answered {
        response: Arc<OcppResponse<A>>,
        /// CALLRESULT payload exactly as signed
        json: Value,
        signing_error: Option<String>,
    },
    /// The request payload did not parse
    CouldNotParse {
        event_tracking_id: EventTrackingId,
        request_id: RequestId,
        action: &'static str,
        json: Value,
        error: String,
    },
    /// Something failed unexpectedly while processing the request
    ExceptionOccurred {
        event_tracking_id: EventTrackingId,
        request_id: RequestId,
        action: &'static str,
        json: Value,
        error: String,
        request_timestamp: DateTime<Utc>,
    },
}

impl<A: Action> RequestOutcome<A> {
    pub fn response(&self) -> Option<&Arc<OcppResponse<A>>> {
        match self {
            RequestOutcome::Answered { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn event_tracking_id(&self) -> &EventTrackingId {
        match self {
            RequestOutcome::Answered { response, .. } => &response.event_tracking_id,
            RequestOutcome::CouldNotParse {
                event_tracking_id, ..
            }
            | RequestOutcome::ExceptionOccurred {
                event_tracking_id, ..
            } => event_tracking_id,
        }
    }

    /// Reply frame for the peer
    ///
    /// `inbound` is the routing the request frame carried; the reply uses the
    /// overlay layout exactly when the request did.
    pub fn to_reply(
        &self,
        request_id: &RequestId,
        node_id: &NodeId,
        peer: &NodeId,
        inbound: Option<&Routing>,
    ) -> OcppMessage {
        let reply_routing = inbound.map(|routing| {
            Routing::new(
                SourceRouting::reply_to(&routing.network_path, peer),
                NetworkPath::from_node(node_id.clone()),
            )
        });

        match self {
            RequestOutcome::Answered { response, json, .. } => {
                let routing = reply_routing.map(|_| {
                    Routing::new(response.destination.clone(), response.network_path.clone())
                });
                answered_reply(request_id, response, json, routing)
            }
            RequestOutcome::CouldNotParse {
                event_tracking_id,
                action,
                json,
                error,
                ..
            } => error_reply(
                CallError::new(request_id.clone(), ErrorCode::FormatViolation, error.clone())
                    .with_details(json!({
                        "action": display_action(action),
                        "eventTrackingId": event_tracking_id.as_str(),
                        "json": json,
                    })),
                reply_routing,
            ),
            RequestOutcome::ExceptionOccurred {
                event_tracking_id,
                action,
                error,
                request_timestamp,
                ..
            } => error_reply(
                CallError::new(request_id.clone(), ErrorCode::InternalError, error.clone())
                    .with_details(json!({
                        "action": display_action(action),
                        "eventTrackingId": event_tracking_id.as_str(),
                        "requestTimestamp": request_timestamp.to_rfc3339(),
                    })),
                reply_routing,
            ),
        }
    }
}

fn answered_reply<A: Action>(
    request_id: &RequestId,
    response: &OcppResponse<A>,
    json: &Value,
    routing: Option<Routing>,
) -> OcppMessage {
    let error = |code: ErrorCode, description: &str, details: Value| {
        error_reply(
            CallError::new(request_id.clone(), code, description).with_details(details),
            routing.clone(),
        )
    };

    match &response.result {
        ResponseResult::Success(_) | ResponseResult::Failed { .. } => {
            let result = CallResult::new(request_id.clone(), json.clone());
            OcppMessage::CallResult(match &routing {
                Some(routing) => result.with_routing(routing.clone()),
                None => result,
            })
        }
        ResponseResult::SignatureError { reason } => {
            error(ErrorCode::SecurityError, reason, json!({}))
        }
        ResponseResult::ExceptionOccurred { error: message } => {
            error(ErrorCode::InternalError, message, json!({}))
        }
        ResponseResult::FormationViolation { reason } => {
            error(ErrorCode::FormatViolation, reason, json!({}))
        }
        ResponseResult::RequestError {
            error_code,
            description,
            details,
        } => error(*error_code, description, details.clone()),
    }
}

fn error_reply(error: CallError, routing: Option<Routing>) -> OcppMessage {
    OcppMessage::CallError(match routing {
        Some(routing) => error.with_routing(routing),
        None => error,
    })
}

/// Last dotted segment of an action name
fn display_action(action: &str) -> &str {
    action.rsplit('.').next().unwrap_or(action)
}
