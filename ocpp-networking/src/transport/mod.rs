//! Transport boundary
//!
//! The router only needs to know who is on the other end of a link and how to
//! push a text frame onto it. WebSocket is the production implementation;
//! tests plug in an in-memory connection.

pub mod websocket;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ocpp::{NetworkingMode, NodeId};

pub use websocket::{connect_upstream, serve, WsConnection};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Static description of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Node id of the peer (charging station id, CSMS id, ...)
    pub remote_node: NodeId,
    pub remote_addr: Option<SocketAddr>,
    pub networking_mode: NetworkingMode,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(remote_node: impl Into<NodeId>, networking_mode: NetworkingMode) -> Self {
        Self {
            id: ConnectionId::next(),
            remote_node: remote_node.into(),
            remote_addr: None,
            networking_mode,
            connected_at: Utc::now(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn is_overlay(&self) -> bool {
        self.networking_mode == NetworkingMode::OverlayNetwork
    }
}

/// Errors pushing a frame onto a link
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

/// A link to a peer node
#[async_trait]
pub trait Connection: Send + Sync {
    fn info(&self) -> &ConnectionInfo;

    /// Queue one text frame for delivery
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
}
