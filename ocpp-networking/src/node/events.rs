//! Observer registry
//!
//! Each action owns one `EventHandlers` list per observable stage. Lists are
//! owned by the router instance, may be mutated at any time and are read
//! concurrently by in-flight pipelines: `emit` works on a snapshot taken under
//! the read lock, so subscribe/unsubscribe never block an emission.
//!
//! Listeners of one emission run concurrently and are all awaited before the
//! pipeline moves on. No ordering between listeners is guaranteed.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::sender::SentMessageResult;
use crate::ocpp::{
    Action, NodeId, OcppRequest, OcppResponse, RequestErrorMessage, ResponseErrorMessage,
};
use crate::transport::ConnectionInfo;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(Arc<E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Multi-subscriber list for one event type
pub struct EventHandlers<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E> Default for EventHandlers<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for EventHandlers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl<E: Send + Sync + 'static> EventHandlers<E> {
    pub fn subscribe<F, Fut>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener<E> = Arc::new(move |event: Arc<E>| listener(event).boxed());
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns false when `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener and wait for all of them
    ///
    /// A panicking listener is logged and does not affect the others.
    pub async fn emit(&self, event: E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        if snapshot.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let results = join_all(snapshot.into_iter().map(|listener| {
            let event = event.clone();
            AssertUnwindSafe(async move { listener(event).await }).catch_unwind()
        }))
        .await;

        for panic in results.into_iter().filter_map(Result::err) {
            error!("Event listener panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Events
// ============================================================================

/// A request was parsed and its signature checked; fires before the handler
#[derive(Debug, Clone)]
pub struct RequestReceived<A: Action> {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub request: Arc<OcppRequest<A>>,
    pub cancel: CancellationToken,
}

/// The answer to a received request was handed to the transport
#[derive(Debug, Clone)]
pub struct ResponseSent<A: Action> {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub request: Arc<OcppRequest<A>>,
    pub response: Arc<OcppResponse<A>>,
    pub runtime: Option<Duration>,
    /// Failure reported by the signing hook, the response went out unsigned
    pub signing_error: Option<String>,
    pub sent: SentMessageResult,
}

/// A request initiated by this node was handed to the transport
#[derive(Debug, Clone)]
pub struct RequestSent<A: Action> {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub request: Arc<OcppRequest<A>>,
    pub sent: SentMessageResult,
}

/// The answer to a request initiated by this node arrived
#[derive(Debug, Clone)]
pub struct ResponseReceived<A: Action> {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub request: Option<Arc<OcppRequest<A>>>,
    pub response: Arc<OcppResponse<A>>,
    pub runtime: Option<Duration>,
    pub cancel: CancellationToken,
}

/// The peer rejected a request initiated by this node (CALLERROR)
#[derive(Debug, Clone)]
pub struct RequestErrorReceived<A: Action> {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub request: Option<Arc<OcppRequest<A>>>,
    pub error: RequestErrorMessage,
    pub runtime: Option<Duration>,
    pub cancel: CancellationToken,
}

/// The peer rejected a response this node sent (CALLRESULTERROR)
#[derive(Debug, Clone)]
pub struct ResponseErrorReceived<A: Action> {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub request: Option<Arc<OcppRequest<A>>>,
    pub response: Option<Arc<OcppResponse<A>>>,
    pub error: ResponseErrorMessage,
    pub runtime: Option<Duration>,
    pub cancel: CancellationToken,
}

/// A CALLRESULTERROR whose exchange is no longer known
#[derive(Debug, Clone)]
pub struct UnmatchedResponseError {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub error: ResponseErrorMessage,
    pub runtime: Option<Duration>,
}

/// A frame that could not be decoded
#[derive(Debug, Clone)]
pub struct FrameRejected {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub text: String,
    pub error: String,
    /// Whether a CALLERROR was sent back
    pub answered: bool,
}

/// Observable stages of one action
pub struct ActionEvents<A: Action> {
    pub request_received: EventHandlers<RequestReceived<A>>,
    pub response_sent: EventHandlers<ResponseSent<A>>,
    pub request_sent: EventHandlers<RequestSent<A>>,
    pub response_received: EventHandlers<ResponseReceived<A>>,
    pub request_error_received: EventHandlers<RequestErrorReceived<A>>,
    pub response_error_received: EventHandlers<ResponseErrorReceived<A>>,
}

impl<A: Action> Default for ActionEvents<A> {
    fn default() -> Self {
        Self {
            request_received: EventHandlers::default(),
            response_sent: EventHandlers::default(),
            request_sent: EventHandlers::default(),
            response_received: EventHandlers::default(),
            request_error_received: EventHandlers::default(),
            response_error_received: EventHandlers::default(),
        }
    }
}
