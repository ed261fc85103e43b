//! Correlation and timing
//!
//! Three in-memory tables, all transient:
//! - pending: requests this node initiated, awaiting CALLRESULT/CALLERROR
//! - answered: recently answered exchanges, for late CALLRESULTERRORs
//! - forwarded: requests relayed for other nodes, awaiting their reply

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::ocpp::{
    CallError, CallResult, NetworkPath, NodeId, OcppError, OcppMessage, RequestId,
    ResponseErrorMessage,
};
use crate::transport::{ConnectionId, ConnectionInfo};

/// Runtime of a response error
///
/// Measured from the response it rejects; `None` when that response is not
/// known, whatever the error's own timestamp says.
pub fn response_error_runtime(
    response_timestamp: Option<DateTime<Utc>>,
    error: &ResponseErrorMessage,
) -> Option<Duration> {
    response_timestamp.map(|sent| error.response_timestamp - sent)
}

/// Reply delivered to a waiting initiator
#[derive(Debug)]
pub enum InboundReply {
    Result {
        result: CallResult,
        connection: ConnectionInfo,
        received_at: DateTime<Utc>,
    },
    Error {
        error: CallError,
        connection: ConnectionInfo,
        received_at: DateTime<Utc>,
    },
}

impl InboundReply {
    pub fn request_id(&self) -> &RequestId {
        match self {
            InboundReply::Result { result, .. } => &result.message_id,
            InboundReply::Error { error, .. } => &error.message_id,
        }
    }

    /// Back to a wire frame, for replies nobody here waits for
    pub fn into_message(self) -> OcppMessage {
        match self {
            InboundReply::Result { result, .. } => OcppMessage::CallResult(result),
            InboundReply::Error { error, .. } => OcppMessage::CallError(error),
        }
    }
}

/// Message ids are only unique per link, so every table keys on both
type ExchangeKey = (ConnectionId, RequestId);

struct PendingEntry {
    action: &'static str,
    reply: oneshot::Sender<InboundReply>,
}

/// Outstanding requests initiated by this node
///
/// An id resolves at most once, and only by a reply arriving on the link the
/// request went out on. It can be reused after its exchange completed.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<ExchangeKey, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `request_id`
    pub fn insert(
        &self,
        connection: ConnectionId,
        request_id: RequestId,
        action: &'static str,
    ) -> Result<oneshot::Receiver<InboundReply>, OcppError> {
        let mut entries = self.entries.lock();
        let key = (connection, request_id);
        if entries.contains_key(&key) {
            return Err(OcppError::DuplicateRequestId(key.1));
        }

        let (reply, rx) = oneshot::channel();
        entries.insert(key, PendingEntry { action, reply });
        Ok(rx)
    }

    /// Hand `reply` to the waiter; gives it back when nobody on `connection`
    /// waits for the id
    pub fn resolve(
        &self,
        connection: ConnectionId,
        request_id: &RequestId,
        reply: InboundReply,
    ) -> Result<&'static str, InboundReply> {
        let entry = self
            .entries
            .lock()
            .remove(&(connection, request_id.clone()));
        match entry {
            Some(entry) => {
                let action = entry.action;
                // A dropped receiver means the initiator already gave up
                let _ = entry.reply.send(reply);
                Ok(action)
            }
            None => Err(reply),
        }
    }

    pub fn remove(&self, connection: ConnectionId, request_id: &RequestId) -> bool {
        self.entries
            .lock()
            .remove(&(connection, request_id.clone()))
            .is_some()
    }

    /// Drop every request sent over `connection`; their waiters see a closed channel
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(link, _), _| *link != connection);
        before - entries.len()
    }

    pub fn contains(&self, connection: ConnectionId, request_id: &RequestId) -> bool {
        self.entries
            .lock()
            .contains_key(&(connection, request_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// An answered exchange kept for late CALLRESULTERRORs
#[derive(Clone)]
pub struct AnsweredExchange {
    /// Link the request came in on and the response went out on
    pub connection: ConnectionId,
    pub request_id: RequestId,
    pub action: &'static str,
    /// `OcppResponse<A>` of the answering action
    pub response: Arc<dyn Any + Send + Sync>,
}

/// Bounded FIFO of answered exchanges
pub struct AnsweredExchanges {
    capacity: usize,
    entries: Mutex<VecDeque<AnsweredExchange>>,
}

impl AnsweredExchanges {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record(&self, exchange: AnsweredExchange) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(exchange);
    }

    /// Remove and return the newest exchange with `request_id` answered on `connection`
    pub fn take(&self, connection: ConnectionId, request_id: &RequestId) -> Option<AnsweredExchange> {
        let mut entries = self.entries.lock();
        let index = entries
            .iter()
            .rposition(|e| e.connection == connection && &e.request_id == request_id)?;
        entries.remove(index)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A CALL relayed on behalf of another node
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub action: String,
    /// Link the CALL came in on; the reply goes back there
    pub origin: ConnectionId,
    /// Link the CALL went out on; the reply comes in there
    pub target: ConnectionId,
    /// Path the CALL had travelled when it reached this node
    pub origin_path: NetworkPath,
    pub forwarded_at: DateTime<Utc>,
}

/// Keyed by origin link and message id
#[derive(Default)]
pub struct ForwardedRequests {
    entries: Mutex<HashMap<ExchangeKey, ForwardedRequest>>,
}

impl ForwardedRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the origin link already has this id in flight
    pub fn insert(&self, request_id: RequestId, forwarded: ForwardedRequest) -> bool {
        let mut entries = self.entries.lock();
        let key = (forwarded.origin, request_id);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, forwarded);
        true
    }

    pub fn remove(&self, origin: ConnectionId, request_id: &RequestId) -> Option<ForwardedRequest> {
        self.entries.lock().remove(&(origin, request_id.clone()))
    }

    /// Claim the relay a reply arriving on `target` belongs to
    ///
    /// Several origins may have the same id in flight towards one link. The
    /// relay whose origin path starts at `destination` wins, then the oldest.
    pub fn take_reply(
        &self,
        target: ConnectionId,
        request_id: &RequestId,
        destination: Option<&NodeId>,
    ) -> Option<ForwardedRequest> {
        let mut entries = self.entries.lock();
        let key = entries
            .iter()
            .filter(|((_, id), f)| id == request_id && f.target == target)
            .max_by_key(|(_, f)| {
                let addressed = destination.is_some_and(|d| f.origin_path.source() == Some(d));
                (addressed, Reverse(f.forwarded_at))
            })
            .map(|(key, _)| key.clone())?;
        entries.remove(&key)
    }

    /// Forget relays older than `max_age`
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, f| f.forwarded_at >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
