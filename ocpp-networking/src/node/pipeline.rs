//! Generic per-action pipeline
//!
//! One `ActionSlot<A>` exists per registered action. It owns the handler slot
//! and the observers of that action and runs both directions of an exchange:
//!
//! ```text
//! inbound CALL
//!   parse ──► verify ──► RequestReceived ──► handler ──► sign ──► reply ──► ResponseSent
//!     │          │                              │
//!     │          └─ SignatureError              ├─ Failed (no handler / cancelled)
//!     └─ CouldNotParse                          └─ ExceptionOccurred (error / panic)
//!
//! reply to our CALL
//!   CALLRESULT ──► parse ──► verify ──► ResponseReceived
//!                    │          └─ SignatureError
//!                    └─ FormationViolation
//!   CALLERROR  ──► RequestErrorReceived
//! ```
//!
//! The router keeps slots behind the object-safe `ActionEntry` so that frames
//! can be dispatched by action name without reflection.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{
    panic_message, ActionEvents, RequestErrorReceived, RequestReceived, ResponseErrorReceived,
    ResponseReceived, ResponseSent,
};
use super::result::RequestOutcome;
use super::router::RouterInner;
use super::sender::send_message;
use super::signature::SignedMessage;
use super::tracker::{response_error_runtime, AnsweredExchange, InboundReply};
use crate::ocpp::custom::put_nested_list;
use crate::ocpp::{
    runtime, Action, Call, EventTrackingId, NetworkPath, NodeId, OcppRequest, OcppResponse,
    RequestErrorMessage, RequestHeader, ResponseErrorMessage, ResponseHeader, ResponseResult,
    SourceRouting,
};
use crate::transport::{Connection, ConnectionInfo};

/// Error type application handlers fail with
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Who is asking, passed to every handler invocation
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// When the frame was received
    pub timestamp: DateTime<Utc>,
    /// This node
    pub sender: NodeId,
    pub connection: ConnectionInfo,
}

/// Processing delegate for requests of action `A`
///
/// Implemented for any async closure
/// `Fn(HandlerContext, Arc<OcppRequest<A>>, CancellationToken) -> Result<A::Response, HandlerError>`.
#[async_trait]
pub trait RequestHandler<A: Action>: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext,
        request: Arc<OcppRequest<A>>,
        cancel: CancellationToken,
    ) -> Result<A::Response, HandlerError>;
}

#[async_trait]
impl<A, F, Fut> RequestHandler<A> for F
where
    A: Action,
    F: Fn(HandlerContext, Arc<OcppRequest<A>>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<A::Response, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: HandlerContext,
        request: Arc<OcppRequest<A>>,
        cancel: CancellationToken,
    ) -> Result<A::Response, HandlerError> {
        (self)(ctx, request, cancel).await
    }
}

/// Handler slot and observers of one action
pub struct ActionSlot<A: Action> {
    handler: RwLock<Option<Arc<dyn RequestHandler<A>>>>,
    pub events: ActionEvents<A>,
}

impl<A: Action> Default for ActionSlot<A> {
    fn default() -> Self {
        Self {
            handler: RwLock::new(None),
            events: ActionEvents::default(),
        }
    }
}

impl<A: Action> ActionSlot<A> {
    /// Install the handler; returns true when one was replaced
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler<A>>) -> bool {
        self.handler.write().replace(handler).is_some()
    }

    pub fn clear_handler(&self) -> bool {
        self.handler.write().take().is_some()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler<A>>> {
        self.handler.read().clone()
    }

    /// Run an inbound CALL through the pipeline and send the reply
    pub(crate) async fn process_request(
        &self,
        router: &RouterInner,
        connection: Arc<dyn Connection>,
        call: Call,
        received_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> RequestOutcome<A> {
        let info = connection.info().clone();
        let event_tracking_id = EventTrackingId::new();

        let guarded = AssertUnwindSafe(self.run_request(
            router,
            &info,
            &call,
            received_at,
            event_tracking_id.clone(),
            &cancel,
        ))
        .catch_unwind()
        .await;

        let outcome = match guarded {
            Ok(outcome) => outcome,
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                error!("{} request {} panicked: {}", A::NAME, call.message_id, error);
                RequestOutcome::ExceptionOccurred {
                    event_tracking_id,
                    request_id: call.message_id.clone(),
                    action: A::NAME,
                    json: call.payload.clone(),
                    error,
                    request_timestamp: received_at,
                }
            }
        };

        let reply = outcome.to_reply(
            &call.message_id,
            &router.node_id,
            &info.remote_node,
            call.routing.as_ref(),
        );
        let sent = send_message(&connection, &reply, &cancel).await;

        if let RequestOutcome::Answered {
            response,
            signing_error,
            ..
        } = &outcome
        {
            debug!(
                "{} {} answered with {} ({})",
                A::NAME,
                call.message_id,
                response.result.kind(),
                sent.result
            );

            if matches!(
                response.result,
                ResponseResult::Success(_) | ResponseResult::Failed { .. }
            ) {
                router.answered.record(AnsweredExchange {
                    connection: info.id,
                    request_id: call.message_id.clone(),
                    action: A::NAME,
                    response: response.clone(),
                });
            }

            if let Some(request) = response.request() {
                self.events
                    .response_sent
                    .emit(ResponseSent {
                        timestamp: Utc::now(),
                        sender: router.node_id.clone(),
                        request: request.clone(),
                        response: response.clone(),
                        runtime: response.runtime,
                        signing_error: signing_error.clone(),
                        sent,
                    })
                    .await;
            }
        }

        outcome
    }

    async fn run_request(
        &self,
        router: &RouterInner,
        info: &ConnectionInfo,
        call: &Call,
        received_at: DateTime<Utc>,
        event_tracking_id: EventTrackingId,
        cancel: &CancellationToken,
    ) -> RequestOutcome<A> {
        let routing = router.inbound_routing(call.routing.as_ref(), info);
        let header = RequestHeader::new(
            call.message_id.clone(),
            routing.destination,
            routing.network_path,
        )
        .with_timestamp(received_at)
        .with_timeout(router.request_timeout)
        .with_event_tracking_id(event_tracking_id.clone());

        // Received
        let request = match OcppRequest::<A>::try_parse(&call.payload, header, &router.parsers) {
            Ok(request) => Arc::new(request),
            Err(error) => {
                warn!("Could not parse {} request {}: {}", A::NAME, call.message_id, error);
                return RequestOutcome::CouldNotParse {
                    event_tracking_id,
                    request_id: call.message_id.clone(),
                    action: A::NAME,
                    json: call.payload.clone(),
                    error,
                };
            }
        };

        // SignatureChecked
        let verification = router
            .signatures
            .verify_request_message(SignedMessage {
                action: A::NAME,
                request_id: &request.request_id,
                json: &call.payload,
                signatures: &request.signatures,
            })
            .await;

        self.events
            .request_received
            .emit(RequestReceived {
                timestamp: Utc::now(),
                sender: router.node_id.clone(),
                connection: info.clone(),
                request: request.clone(),
                cancel: cancel.clone(),
            })
            .await;

        // HandlerInvoked
        let response = match verification {
            Err(reason) => {
                warn!(
                    "{} request {} failed signature verification: {}",
                    A::NAME,
                    request.request_id,
                    reason
                );
                OcppResponse::signature_error(request.clone(), reason)
            }
            Ok(()) => match self.handler() {
                None => {
                    warn!("No handler registered for {}, answering with fallback", A::NAME);
                    OcppResponse::failed(
                        request.clone(),
                        format!("No handler registered for {}", A::NAME),
                    )
                }
                Some(handler) => {
                    let ctx = HandlerContext {
                        timestamp: received_at,
                        sender: router.node_id.clone(),
                        connection: info.clone(),
                    };

                    let handled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Ok(None),
                        result = handler.handle(ctx, request.clone(), cancel.clone()) => result.map(Some),
                    };

                    match handled {
                        Ok(Some(payload)) => OcppResponse::success(request.clone(), payload),
                        Ok(None) => {
                            info!("{} request {} cancelled", A::NAME, request.request_id);
                            OcppResponse::failed(request.clone(), "Request cancelled")
                        }
                        Err(e) => {
                            error!("{} handler failed for {}: {}", A::NAME, request.request_id, e);
                            return RequestOutcome::ExceptionOccurred {
                                event_tracking_id,
                                request_id: call.message_id.clone(),
                                action: A::NAME,
                                json: call.payload.clone(),
                                error: e.to_string(),
                                request_timestamp: request.request_timestamp,
                            };
                        }
                    }
                }
            },
        };

        // ResponseReady
        let mut response = response
            .with_network_path(NetworkPath::from_node(router.node_id.clone()))
            .with_destination(SourceRouting::reply_to(&request.network_path, &info.remote_node));
        let mut json = response.to_json(&router.serializers);
        let mut signing_error = None;

        if matches!(
            response.result,
            ResponseResult::Success(_) | ResponseResult::Failed { .. }
        ) {
            let signed = router
                .signatures
                .sign_response_message(SignedMessage {
                    action: A::NAME,
                    request_id: &request.request_id,
                    json: &json,
                    signatures: &response.signatures,
                })
                .await;

            match signed {
                Ok(signatures) if signatures.is_empty() => {}
                Ok(signatures) => {
                    response.signatures.extend(signatures);
                    put_nested_list(&mut json, "signatures", &response.signatures, &router.serializers);
                }
                Err(reason) => {
                    warn!("Signing {} response {} failed: {}", A::NAME, request.request_id, reason);
                    signing_error = Some(reason);
                }
            }
        }

        RequestOutcome::Answered {
            response: Arc::new(response),
            json,
            signing_error,
        }
    }

    /// Turn the reply to a request this node sent into a response
    pub(crate) async fn process_reply(
        &self,
        router: &RouterInner,
        request: Arc<OcppRequest<A>>,
        reply: InboundReply,
        cancel: CancellationToken,
    ) -> OcppResponse<A> {
        match reply {
            InboundReply::Result {
                result,
                connection,
                received_at,
            } => {
                let routing = router.inbound_routing(result.routing.as_ref(), &connection);
                let header = ResponseHeader::new(routing.destination, routing.network_path)
                    .with_timestamp(received_at)
                    .with_event_tracking_id(request.event_tracking_id.clone());

                let parsed = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    OcppResponse::try_parse(request.clone(), &result.payload, header, &router.parsers)
                }));

                let response = match parsed {
                    Err(panic) => {
                        let error = panic_message(panic.as_ref());
                        error!("{} response {} panicked: {}", A::NAME, request.request_id, error);
                        OcppResponse::exception_occurred(request.clone(), error)
                    }
                    Ok(Err(reason)) => {
                        warn!("Malformed {} response {}: {}", A::NAME, request.request_id, reason);
                        OcppResponse::formation_violation(request.clone(), reason)
                    }
                    Ok(Ok(response)) => {
                        let verification = router
                            .signatures
                            .verify_response_message(SignedMessage {
                                action: A::NAME,
                                request_id: &request.request_id,
                                json: &result.payload,
                                signatures: &response.signatures,
                            })
                            .await;
                        match verification {
                            Ok(()) => response,
                            Err(reason) => {
                                warn!(
                                    "{} response {} failed signature verification: {}",
                                    A::NAME,
                                    request.request_id,
                                    reason
                                );
                                OcppResponse::signature_error(request.clone(), reason)
                            }
                        }
                    }
                };

                let response = Arc::new(response);
                self.events
                    .response_received
                    .emit(ResponseReceived {
                        timestamp: Utc::now(),
                        sender: router.node_id.clone(),
                        connection,
                        request: Some(request),
                        response: response.clone(),
                        runtime: response.runtime,
                        cancel,
                    })
                    .await;

                Arc::try_unwrap(response).unwrap_or_else(|shared| (*shared).clone())
            }
            InboundReply::Error {
                error,
                connection,
                received_at,
            } => {
                let routing = router.inbound_routing(error.routing.as_ref(), &connection);
                let mut message = RequestErrorMessage::from_call_error(&error, routing)
                    .with_event_tracking_id(request.event_tracking_id.clone());
                message.response_timestamp = received_at;

                warn!(
                    "{} request {} rejected by {}: {} {}",
                    A::NAME,
                    request.request_id,
                    connection.remote_node,
                    message.error_code,
                    message.error_description
                );

                self.events
                    .request_error_received
                    .emit(RequestErrorReceived {
                        timestamp: Utc::now(),
                        sender: router.node_id.clone(),
                        connection,
                        request: Some(request.clone()),
                        error: message.clone(),
                        runtime: runtime(Some(request.request_timestamp), message.response_timestamp),
                        cancel,
                    })
                    .await;

                OcppResponse::request_error(Some(request), &message)
            }
        }
    }

    /// A CALLRESULTERROR for an exchange this node answered
    pub(crate) async fn process_response_error(
        &self,
        router: &RouterInner,
        connection: ConnectionInfo,
        mut error: ResponseErrorMessage,
        response: Option<Arc<OcppResponse<A>>>,
        cancel: CancellationToken,
    ) {
        if let Some(response) = &response {
            error.event_tracking_id = response.event_tracking_id.clone();
        }
        let runtime = response_error_runtime(response.as_ref().map(|r| r.response_timestamp), &error);
        warn!(
            "{} response {} rejected by {}: {} {}",
            A::NAME,
            error.request_id,
            connection.remote_node,
            error.error_code,
            error.error_description
        );

        self.events
            .response_error_received
            .emit(ResponseErrorReceived {
                timestamp: Utc::now(),
                sender: router.node_id.clone(),
                connection,
                request: response.as_ref().and_then(|r| r.request().cloned()),
                response,
                error,
                runtime,
                cancel,
            })
            .await;
    }
}

/// Object-safe view of an `ActionSlot<A>` used for dispatch by name
#[async_trait]
pub(crate) trait ActionEntry: Send + Sync {
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &(dyn Any + Send + Sync);

    async fn handle_call(
        &self,
        router: &RouterInner,
        connection: Arc<dyn Connection>,
        call: Call,
        received_at: DateTime<Utc>,
        cancel: CancellationToken,
    );

    async fn handle_response_error(
        &self,
        router: &RouterInner,
        connection: ConnectionInfo,
        error: ResponseErrorMessage,
        response: Arc<dyn Any + Send + Sync>,
        cancel: CancellationToken,
    );
}

#[async_trait]
impl<A: Action> ActionEntry for ActionSlot<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    async fn handle_call(
        &self,
        router: &RouterInner,
        connection: Arc<dyn Connection>,
        call: Call,
        received_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) {
        self.process_request(router, connection, call, received_at, cancel)
            .await;
    }

    async fn handle_response_error(
        &self,
        router: &RouterInner,
        connection: ConnectionInfo,
        error: ResponseErrorMessage,
        response: Arc<dyn Any + Send + Sync>,
        cancel: CancellationToken,
    ) {
        let response = response.downcast::<OcppResponse<A>>().ok();
        self.process_response_error(router, connection, error, response, cancel)
            .await;
    }
}
