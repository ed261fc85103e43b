//! # OCPP Networking
//!
//! Message exchange engine for OCPP 2.0.1 / 2.1 networking nodes: charging
//! station management systems, local controllers and any node sitting between
//! charging stations and a CSMS.
//!
//! ## Architecture
//!
//! ```text
//!  Charging stations / other nodes             Upstream (CSMS or node)
//!        │ WebSocket (OCPP-J)                          ▲ WebSocket (OCPP-J)
//!        ▼                                             │
//! ┌──────────────────────────────────────────────────────────────┐
//! │  transport   serve() ─────┐            ┌───── connect_upstream() │
//! │                           ▼            │                       │
//! │  node        ┌────────────────────────────────┐                │
//! │              │ Router                         │                │
//! │              │  connection registry           │                │
//! │              │  pending / forwarded / answered│                │
//! │              └──────────────┬─────────────────┘                │
//! │                             ▼                                  │
//! │              ActionSlot<A> (one per action)                    │
//! │   parse → verify → RequestReceived → handler → sign → send     │
//! │                             │                                  │
//! │  ocpp        frames, routing, typed payloads, envelopes        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Message Flow
//!
//! 1. A text frame arrives and is decoded into CALL / CALLRESULT / CALLERROR / CALLRESULTERROR
//! 2. CALLs addressed elsewhere are forwarded along the network path
//! 3. CALLs for this node run through the pipeline of their action
//! 4. Every CALL gets exactly one reply: a payload, a fallback or a CALLERROR
//! 5. Replies to requests this node sent resolve the waiting `send_request`
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_networking::ocpp::actions::Heartbeat;
//! use ocpp_networking::ocpp::types::HeartbeatResponse;
//! use ocpp_networking::{HandlerError, NetworkingNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("CSMS", "0.0.0.0:9000".parse()?);
//!     let node = NetworkingNode::new(config);
//!
//!     node.router().on_request::<Heartbeat, _, _>(|_ctx, _request, _cancel| async move {
//!         Ok::<_, HandlerError>(HeartbeatResponse {
//!             current_time: chrono::Utc::now(),
//!         })
//!     })?;
//!
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod node;
pub mod ocpp;
pub mod transport;

pub use config::{NodeConfig, OcppVersion, UpstreamConfig};
pub use node::{
    AcceptAllSignatures, HandlerContext, HandlerError, NetworkingNode, RequestHandler,
    RequestOutcome, RequireSignatures, Router, RouterBuilder, SendResult, SignaturePolicy,
};

// Re-export key types
pub use ocpp::{
    Action, ErrorCode, NetworkPath, NetworkingMode, NodeId, OcppError, OcppMessage, OcppRequest,
    OcppResponse, RequestId, ResponseResult, SourceRouting,
};
pub use transport::{Connection, ConnectionInfo, TransportError};
