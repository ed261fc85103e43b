//! Dispatch router
//!
//! ## Architecture
//!
//! ```text
//!            text frame (any link)
//!                   │
//!                   ▼
//!          ┌─────────────────┐   unreadable ──► FrameRejected (+ CALLERROR when id known)
//!          │   handle_text   │
//!          └────────┬────────┘
//!    ┌──────────────┼──────────────────┬─────────────────────┐
//!    ▼              ▼                  ▼                     ▼
//!  CALL         CALLRESULT         CALLERROR           CALLRESULTERROR
//!    │              │                  │                     │
//!    ├─ not for us ─┼── relay ─────────┤                     ├─ answered cache ─► ActionSlot
//!    │  (forward)   │                  │                     └─ miss ─► UnmatchedResponseError
//!    ▼              └──► pending table ◄┘
//!  ActionSlot<A>            │
//!  (registry by name)       ▼
//!                      send_request waiter
//! ```
//!
//! The router owns every piece of mutable shared state: the action registry
//! (fixed after `build`), handler slots and observer lists, the connection
//! registry and the three correlation tables.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{ActionEvents, EventHandlers, FrameRejected, RequestSent, UnmatchedResponseError};
use super::pipeline::{ActionEntry, ActionSlot, HandlerContext, HandlerError, RequestHandler};
use super::result::RequestOutcome;
use super::sender::send_message;
use super::signature::{AcceptAllSignatures, SignaturePolicy, SignedMessage};
use super::tracker::{
    AnsweredExchanges, ForwardedRequest, ForwardedRequests, InboundReply, PendingRequests,
};
use crate::config::NodeConfig;
use crate::ocpp::actions::{
    BootNotification, DataTransfer, GetCompositeSchedule, Heartbeat, RequestStartTransaction,
    RequestStopTransaction, Reset, StatusNotification,
};
use crate::ocpp::{
    Action, Call, CallError, CustomParsers, CustomSerializers, ErrorCode, FrameError,
    NetworkPath, NetworkingMode, NodeId, OcppError, OcppMessage, OcppRequest, OcppResponse,
    ResponseErrorMessage, Routing, SourceRouting,
};
use crate::transport::{Connection, ConnectionId, ConnectionInfo};

/// Shared router state
pub(crate) struct RouterInner {
    pub(crate) node_id: NodeId,
    pub(crate) networking_mode: NetworkingMode,
    pub(crate) request_timeout: Duration,
    pub(crate) signatures: Arc<dyn SignaturePolicy>,
    pub(crate) serializers: CustomSerializers,
    pub(crate) parsers: CustomParsers,
    pub(crate) pending: PendingRequests,
    pub(crate) answered: AnsweredExchanges,
    pub(crate) forwarded: ForwardedRequests,
    connections: RwLock<HashMap<NodeId, Arc<dyn Connection>>>,
    upstream: RwLock<Option<NodeId>>,
    unmatched_response_errors: EventHandlers<UnmatchedResponseError>,
    frames_rejected: EventHandlers<FrameRejected>,
    actions: HashMap<&'static str, Arc<dyn ActionEntry>>,
}

impl RouterInner {
    /// Routing of an inbound frame; standard frames get it from the link
    pub(crate) fn inbound_routing(&self, routing: Option<&Routing>, info: &ConnectionInfo) -> Routing {
        match routing {
            Some(routing) => routing.clone(),
            None => Routing::new(
                SourceRouting::to(self.node_id.clone()),
                NetworkPath::from_node(info.remote_node.clone()),
            ),
        }
    }
}

/// Builder for `Router`
pub struct RouterBuilder {
    node_id: NodeId,
    networking_mode: NetworkingMode,
    request_timeout: Duration,
    answered_cache_size: usize,
    signatures: Arc<dyn SignaturePolicy>,
    serializers: CustomSerializers,
    parsers: CustomParsers,
    actions: HashMap<&'static str, Arc<dyn ActionEntry>>,
}

impl RouterBuilder {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            networking_mode: NetworkingMode::Standard,
            request_timeout: Duration::from_secs(30),
            answered_cache_size: 256,
            signatures: Arc::new(AcceptAllSignatures),
            serializers: CustomSerializers::new(),
            parsers: CustomParsers::new(),
            actions: HashMap::new(),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.node_id.as_str())
            .networking_mode(config.networking_mode)
            .request_timeout(config.request_timeout)
            .answered_cache_size(config.answered_cache_size)
    }

    /// Instantiate the pipeline for `A`
    pub fn register<A: Action>(mut self) -> Self {
        self.actions
            .insert(A::NAME, Arc::new(ActionSlot::<A>::default()));
        self
    }

    /// Register every action this crate ships
    pub fn with_default_actions(self) -> Self {
        self.register::<BootNotification>()
            .register::<Heartbeat>()
            .register::<StatusNotification>()
            .register::<Reset>()
            .register::<RequestStartTransaction>()
            .register::<RequestStopTransaction>()
            .register::<DataTransfer>()
            .register::<GetCompositeSchedule>()
    }

    pub fn signature_policy(mut self, policy: Arc<dyn SignaturePolicy>) -> Self {
        self.signatures = policy;
        self
    }

    pub fn custom_serializers(mut self, serializers: CustomSerializers) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn custom_parsers(mut self, parsers: CustomParsers) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn networking_mode(mut self, mode: NetworkingMode) -> Self {
        self.networking_mode = mode;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn answered_cache_size(mut self, size: usize) -> Self {
        self.answered_cache_size = size;
        self
    }

    pub fn build(self) -> Router {
        let mut names: Vec<&str> = self.actions.values().map(|entry| entry.name()).collect();
        names.sort_unstable();
        info!(
            "Router {} ready with {} actions: {}",
            self.node_id,
            names.len(),
            names.join(", ")
        );

        Router {
            inner: Arc::new(RouterInner {
                node_id: self.node_id,
                networking_mode: self.networking_mode,
                request_timeout: self.request_timeout,
                signatures: self.signatures,
                serializers: self.serializers,
                parsers: self.parsers,
                pending: PendingRequests::new(),
                answered: AnsweredExchanges::new(self.answered_cache_size),
                forwarded: ForwardedRequests::new(),
                connections: RwLock::new(HashMap::new()),
                upstream: RwLock::new(None),
                unmatched_response_errors: EventHandlers::default(),
                frames_rejected: EventHandlers::default(),
                actions: self.actions,
            }),
        }
    }
}

/// One router per node; cheap to clone
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn builder(node_id: impl Into<NodeId>) -> RouterBuilder {
        RouterBuilder::new(node_id)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn networking_mode(&self) -> NetworkingMode {
        self.inner.networking_mode
    }

    /// Names of all registered actions
    pub fn actions(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.inner.actions.values().map(|entry| entry.name()).collect();
        names.sort_unstable();
        names
    }

    fn slot<A: Action>(&self) -> Option<&ActionSlot<A>> {
        self.inner
            .actions
            .get(A::NAME)?
            .as_any()
            .downcast_ref::<ActionSlot<A>>()
    }

    // ------------------------------------------------------------------------
    // Handlers and observers
    // ------------------------------------------------------------------------

    /// Install an async closure as the processing delegate for `A`
    pub fn on_request<A, F, Fut>(&self, handler: F) -> Result<(), OcppError>
    where
        A: Action,
        F: Fn(HandlerContext, Arc<OcppRequest<A>>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A::Response, HandlerError>> + Send + 'static,
    {
        self.set_handler::<A>(Arc::new(handler))
    }

    /// Install the processing delegate for `A`, replacing any previous one
    pub fn set_handler<A: Action>(&self, handler: Arc<dyn RequestHandler<A>>) -> Result<(), OcppError> {
        let slot = self
            .slot::<A>()
            .ok_or_else(|| OcppError::UnknownAction(A::NAME.to_string()))?;
        if slot.set_handler(handler) {
            debug!("Replaced handler for {}", A::NAME);
        }
        Ok(())
    }

    /// Returns true when a handler was removed
    pub fn clear_handler<A: Action>(&self) -> bool {
        self.slot::<A>().map(|slot| slot.clear_handler()).unwrap_or(false)
    }

    pub fn has_handler<A: Action>(&self) -> bool {
        self.slot::<A>().map(|slot| slot.has_handler()).unwrap_or(false)
    }

    /// Observer lists of `A`; `None` when `A` is not registered
    pub fn events<A: Action>(&self) -> Option<&ActionEvents<A>> {
        self.slot::<A>().map(|slot| &slot.events)
    }

    pub fn unmatched_response_errors(&self) -> &EventHandlers<UnmatchedResponseError> {
        &self.inner.unmatched_response_errors
    }

    pub fn frames_rejected(&self) -> &EventHandlers<FrameRejected> {
        &self.inner.frames_rejected
    }

    // ------------------------------------------------------------------------
    // Connection registry
    // ------------------------------------------------------------------------

    /// Register a link; a previous link of the same peer is replaced
    pub fn register_connection(&self, connection: Arc<dyn Connection>) {
        let info = connection.info().clone();
        info!(
            "Connection {} registered for {} ({:?})",
            info.id, info.remote_node, info.networking_mode
        );
        if let Some(previous) = self
            .inner
            .connections
            .write()
            .insert(info.remote_node.clone(), connection)
        {
            warn!(
                "{} reconnected, dropping connection {}",
                info.remote_node,
                previous.info().id
            );
        }
    }

    /// Forget a link and fail every request waiting on it
    pub fn unregister_connection(&self, info: &ConnectionInfo) {
        {
            let mut connections = self.inner.connections.write();
            let current = connections.get(&info.remote_node).map(|c| c.info().id);
            if current == Some(info.id) {
                connections.remove(&info.remote_node);
            }
        }

        let failed = self.inner.pending.fail_connection(info.id);
        if failed > 0 {
            warn!(
                "Connection {} to {} closed with {} pending requests",
                info.id, info.remote_node, failed
            );
        } else {
            info!("Connection {} to {} closed", info.id, info.remote_node);
        }
    }

    /// Peer used when no direct link to a destination exists
    pub fn set_upstream(&self, node: Option<NodeId>) {
        *self.inner.upstream.write() = node;
    }

    pub fn upstream(&self) -> Option<NodeId> {
        self.inner.upstream.read().clone()
    }

    pub fn connection(&self, node: &NodeId) -> Option<Arc<dyn Connection>> {
        self.inner.connections.read().get(node).cloned()
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.inner.connections.read().keys().cloned().collect()
    }

    fn connection_by_id(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.inner
            .connections
            .read()
            .values()
            .find(|c| c.info().id == id)
            .cloned()
    }

    /// Next hop towards `destination`
    ///
    /// Prefers a direct link to the endpoint closest to the final destination,
    /// then the upstream link.
    pub fn route(&self, destination: &SourceRouting) -> Option<Arc<dyn Connection>> {
        let connections = self.inner.connections.read();
        for endpoint in destination.endpoints().iter().rev() {
            if let Some(connection) = connections.get(endpoint) {
                return Some(connection.clone());
            }
        }

        let upstream = self.inner.upstream.read().clone()?;
        connections.get(&upstream).cloned()
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Entry point for every inbound text frame
    pub async fn handle_text(
        &self,
        connection: Arc<dyn Connection>,
        text: &str,
        cancel: CancellationToken,
    ) {
        let received_at = Utc::now();
        debug!("Received from {}: {}", connection.info().remote_node, text);

        let message = match OcppMessage::parse(text.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                self.reject_frame(connection, text, e, cancel).await;
                return;
            }
        };

        match message {
            OcppMessage::Call(call) => {
                self.dispatch_call(connection, call, received_at, cancel)
                    .await
            }
            OcppMessage::CallResult(result) => {
                let reply = InboundReply::Result {
                    result,
                    connection: connection.info().clone(),
                    received_at,
                };
                self.dispatch_reply(connection, reply, cancel).await
            }
            OcppMessage::CallError(error) => {
                let reply = InboundReply::Error {
                    error,
                    connection: connection.info().clone(),
                    received_at,
                };
                self.dispatch_reply(connection, reply, cancel).await
            }
            OcppMessage::CallResultError(error) => {
                self.dispatch_response_error(connection, error, received_at, cancel)
                    .await
            }
        }
    }

    async fn reject_frame(
        &self,
        connection: Arc<dyn Connection>,
        text: &str,
        error: FrameError,
        cancel: CancellationToken,
    ) {
        let info = connection.info().clone();
        let answered = match error.message_id() {
            Some(id) => {
                warn!("Malformed frame {} from {}: {}", id, info.remote_node, error);
                let mut reply = CallError::new(id.clone(), error.error_code(), error.to_string());
                if info.is_overlay() {
                    reply = reply.with_routing(self.local_reply_routing(&info, None));
                }
                send_message(&connection, &OcppMessage::CallError(reply), &cancel)
                    .await
                    .result
                    .is_success()
            }
            None => {
                warn!("Dropping unreadable frame from {}: {}", info.remote_node, error);
                false
            }
        };

        self.inner
            .frames_rejected
            .emit(FrameRejected {
                timestamp: Utc::now(),
                sender: self.inner.node_id.clone(),
                connection: info,
                text: text.to_string(),
                error: error.to_string(),
                answered,
            })
            .await;
    }

    /// Routing for an error this node answers itself
    fn local_reply_routing(&self, info: &ConnectionInfo, inbound: Option<&Routing>) -> Routing {
        let path = inbound.map(|r| r.network_path.clone()).unwrap_or_else(NetworkPath::empty);
        Routing::new(
            SourceRouting::reply_to(&path, &info.remote_node),
            NetworkPath::from_node(self.inner.node_id.clone()),
        )
    }

    async fn reply_error(
        &self,
        connection: &Arc<dyn Connection>,
        call: &Call,
        code: ErrorCode,
        description: String,
        cancel: &CancellationToken,
    ) {
        let mut reply = CallError::new(call.message_id.clone(), code, description).with_details(
            json!({ "action": call.action }),
        );
        if call.routing.is_some() {
            reply = reply.with_routing(self.local_reply_routing(connection.info(), call.routing.as_ref()));
        }
        send_message(connection, &OcppMessage::CallError(reply), cancel).await;
    }

    async fn dispatch_call(
        &self,
        connection: Arc<dyn Connection>,
        call: Call,
        received_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) {
        if let Some(routing) = &call.routing {
            if !routing.destination.is_local(&self.inner.node_id) {
                let routing = routing.clone();
                self.forward_call(connection, call, routing, cancel).await;
                return;
            }
        }

        let entry = self.inner.actions.get(call.action.as_str()).cloned();
        match entry {
            Some(entry) => {
                entry
                    .handle_call(&self.inner, connection, call, received_at, cancel)
                    .await
            }
            None => {
                warn!(
                    "No pipeline for action {} from {}",
                    call.action,
                    connection.info().remote_node
                );
                let description = format!("Action {} is not implemented", call.action);
                self.reply_error(&connection, &call, ErrorCode::NotImplemented, description, &cancel)
                    .await;
            }
        }
    }

    /// Routing for a frame leaving on `next`
    ///
    /// Overlay links carry the path with this node appended; standard links
    /// carry no routing at all.
    fn readdress(&self, destination: SourceRouting, path: &NetworkPath, next: &ConnectionInfo) -> Option<Routing> {
        next.is_overlay()
            .then(|| Routing::new(destination, path.append(self.inner.node_id.clone())))
    }

    async fn forward_call(
        &self,
        connection: Arc<dyn Connection>,
        call: Call,
        routing: Routing,
        cancel: CancellationToken,
    ) {
        if routing.network_path.contains(&self.inner.node_id) {
            warn!(
                "Routing loop for {} {}: path {:?} already contains {}",
                call.action,
                call.message_id,
                routing.network_path.hops(),
                self.inner.node_id
            );
            let description = format!("Routing loop detected at {}", self.inner.node_id);
            self.reply_error(&connection, &call, ErrorCode::ProtocolError, description, &cancel)
                .await;
            return;
        }

        let next = match self.route(&routing.destination) {
            Some(next) if next.info().id != connection.info().id => next,
            _ => {
                warn!("No route to {} for {} {}", routing.destination, call.action, call.message_id);
                let description = format!("Unknown destination {}", routing.destination);
                self.reply_error(&connection, &call, ErrorCode::GenericError, description, &cancel)
                    .await;
                return;
            }
        };

        // Relays whose reply never came back are forgotten after two timeouts
        let max_age = chrono::Duration::from_std(self.inner.request_timeout * 2)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let expired = self.inner.forwarded.prune(max_age);
        if expired > 0 {
            debug!("Dropped {} stale forwarded requests", expired);
        }

        let recorded = self.inner.forwarded.insert(
            call.message_id.clone(),
            ForwardedRequest {
                action: call.action.clone(),
                origin: connection.info().id,
                target: next.info().id,
                origin_path: routing.network_path.clone(),
                forwarded_at: Utc::now(),
            },
        );
        if !recorded {
            let description = format!("Request {} is already being forwarded", call.message_id);
            self.reply_error(&connection, &call, ErrorCode::GenericError, description, &cancel)
                .await;
            return;
        }

        let message_id = call.message_id.clone();
        let reply_call = call.clone();
        let mut outbound = OcppMessage::Call(call);
        outbound.set_routing(self.readdress(routing.destination.clone(), &routing.network_path, next.info()));

        info!(
            "Forwarding {} {} to {} via {}",
            reply_call.action,
            message_id,
            routing.destination,
            next.info().remote_node
        );

        let sent = send_message(&next, &outbound, &cancel).await;
        if !sent.result.is_success() {
            self.inner.forwarded.remove(connection.info().id, &message_id);
            let description = format!(
                "Forwarding to {} failed: {}",
                next.info().remote_node,
                sent.result
            );
            self.reply_error(&connection, &reply_call, ErrorCode::GenericError, description, &cancel)
                .await;
        }
    }

    async fn dispatch_reply(
        &self,
        connection: Arc<dyn Connection>,
        reply: InboundReply,
        cancel: CancellationToken,
    ) {
        let request_id = reply.request_id().clone();
        let reply = match self.inner.pending.resolve(connection.info().id, &request_id, reply) {
            Ok(action) => {
                debug!("{} reply {} delivered to initiator", action, request_id);
                return;
            }
            Err(reply) => reply,
        };

        self.relay(connection, reply.into_message(), cancel).await;
    }

    /// Pass a reply on towards the node it is addressed to
    async fn relay(
        &self,
        connection: Arc<dyn Connection>,
        mut message: OcppMessage,
        cancel: CancellationToken,
    ) {
        let request_id = message.message_id().clone();
        let from = connection.info().clone();

        let forwarded = self.inner.forwarded.take_reply(
            from.id,
            &request_id,
            message.routing().map(|r| r.destination.target()),
        );

        let (next, routing) = if let Some(forwarded) = forwarded {
            let Some(origin) = self.connection_by_id(forwarded.origin) else {
                warn!(
                    "Origin of forwarded {} {} is gone, dropping reply",
                    forwarded.action, request_id
                );
                return;
            };
            let inbound = match message.routing() {
                Some(routing) => routing.clone(),
                None => Routing::new(
                    SourceRouting::reply_to(&forwarded.origin_path, &origin.info().remote_node),
                    NetworkPath::from_node(from.remote_node.clone()),
                ),
            };
            let routing = self.readdress(inbound.destination, &inbound.network_path, origin.info());
            (origin, routing)
        } else {
            let Some(routing) = message
                .routing()
                .filter(|r| !r.destination.is_local(&self.inner.node_id))
                .cloned()
            else {
                warn!(
                    "Unexpected {:?} {} from {}, nobody is waiting for it",
                    message.message_type(),
                    request_id,
                    from.remote_node
                );
                return;
            };
            let Some(next) = self.route(&routing.destination) else {
                warn!("No route to {} for reply {}", routing.destination, request_id);
                return;
            };
            let readdressed = self.readdress(routing.destination, &routing.network_path, next.info());
            (next, readdressed)
        };

        message.set_routing(routing);
        debug!("Relaying reply {} to {}", request_id, next.info().remote_node);
        let sent = send_message(&next, &message, &cancel).await;
        if !sent.result.is_success() {
            error!(
                "Relaying reply {} to {} failed: {}",
                request_id,
                next.info().remote_node,
                sent.result
            );
        }
    }

    async fn dispatch_response_error(
        &self,
        connection: Arc<dyn Connection>,
        error: CallError,
        received_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) {
        let info = connection.info().clone();

        if error
            .routing
            .as_ref()
            .is_some_and(|r| !r.destination.is_local(&self.inner.node_id))
        {
            self.relay(connection, OcppMessage::CallResultError(error), cancel)
                .await;
            return;
        }

        let routing = self.inner.inbound_routing(error.routing.as_ref(), &info);
        let mut message = ResponseErrorMessage::from_call_error(&error, routing);
        message.response_timestamp = received_at;

        let exchange = self.inner.answered.take(info.id, &message.request_id);
        let entry = exchange
            .as_ref()
            .and_then(|e| self.inner.actions.get(e.action).cloned());

        match (exchange, entry) {
            (Some(exchange), Some(entry)) => {
                entry
                    .handle_response_error(&self.inner, info, message, exchange.response, cancel)
                    .await
            }
            _ => {
                warn!(
                    "CALLRESULTERROR {} from {} matches no answered exchange: {} {}",
                    message.request_id, info.remote_node, message.error_code, message.error_description
                );
                self.inner
                    .unmatched_response_errors
                    .emit(UnmatchedResponseError {
                        timestamp: Utc::now(),
                        sender: self.inner.node_id.clone(),
                        connection: info,
                        error: message,
                        runtime: None,
                    })
                    .await;
            }
        }
    }

    /// Run a CALL through the pipeline of `A` directly
    ///
    /// `handle_text` does this after decoding; exposed for embedding the
    /// router behind a different framing.
    pub async fn process_request<A: Action>(
        &self,
        connection: Arc<dyn Connection>,
        call: Call,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome<A>, OcppError> {
        let slot = self
            .slot::<A>()
            .ok_or_else(|| OcppError::UnknownAction(A::NAME.to_string()))?;
        Ok(slot
            .process_request(&self.inner, connection, call, Utc::now(), cancel)
            .await)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Send a request and wait for its response
    ///
    /// Every failure mode ends up as a response variant: no route, duplicate
    /// id, send failure, timeout and cancellation are `Failed`.
    pub async fn send_request<A: Action>(
        &self,
        mut request: OcppRequest<A>,
        cancel: &CancellationToken,
    ) -> OcppResponse<A> {
        let inner = &self.inner;

        if request.network_path.is_empty() {
            request.network_path = NetworkPath::from_node(inner.node_id.clone());
        }
        let timeout = *request.request_timeout.get_or_insert(inner.request_timeout);

        let Some(slot) = self.slot::<A>() else {
            return OcppResponse::failed(
                Arc::new(request),
                format!("Action {} is not registered", A::NAME),
            );
        };

        let json = request.to_json(&inner.serializers);
        let signed = inner
            .signatures
            .sign_request_message(SignedMessage {
                action: A::NAME,
                request_id: &request.request_id,
                json: &json,
                signatures: &request.signatures,
            })
            .await;
        match signed {
            Ok(signatures) => request.signatures.extend(signatures),
            Err(reason) => warn!("Signing {} request {} failed: {}", A::NAME, request.request_id, reason),
        }

        let request = Arc::new(request);

        let Some(connection) = self.route(&request.destination) else {
            warn!("No route to {} for {} {}", request.destination, A::NAME, request.request_id);
            let reason = format!("No connection towards {}", request.destination);
            return OcppResponse::failed(request, reason);
        };

        let rx = match inner
            .pending
            .insert(connection.info().id, request.request_id.clone(), A::NAME)
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!("{}", e);
                return OcppResponse::failed(request, e.to_string());
            }
        };

        let routing = connection
            .info()
            .is_overlay()
            .then(|| Routing::new(request.destination.clone(), request.network_path.clone()));
        let message = OcppMessage::Call(request.to_call(&inner.serializers, routing));

        let sent = send_message(&connection, &message, cancel).await;
        let delivered = sent.result.is_success();
        let failure = sent.result.to_string();

        slot.events
            .request_sent
            .emit(RequestSent {
                timestamp: Utc::now(),
                sender: inner.node_id.clone(),
                request: request.clone(),
                sent,
            })
            .await;

        if !delivered {
            inner.pending.remove(connection.info().id, &request.request_id);
            let reason = format!("Could not send {}: {}", A::NAME, failure);
            return OcppResponse::failed(request, reason);
        }

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("Request cancelled".to_string()),
            reply = rx => reply.map_err(|_| "Connection closed before the response arrived".to_string()),
            _ = tokio::time::sleep(timeout) => Err(format!(
                "No {} response within {:?}",
                A::NAME,
                timeout
            )),
        };

        match reply {
            Ok(reply) => {
                slot.process_reply(inner, request, reply, cancel.clone())
                    .await
            }
            Err(reason) => {
                inner.pending.remove(connection.info().id, &request.request_id);
                warn!("{} request {} failed: {}", A::NAME, request.request_id, reason);
                OcppResponse::failed(request, reason)
            }
        }
    }
}
