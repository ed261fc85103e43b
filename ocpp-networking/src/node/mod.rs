//! Networking node
//!
//! The dispatch router with its per-action pipelines, the correlation tables
//! and the node runtime that wires the router to the WebSocket transport.

pub mod events;
pub mod pipeline;
pub mod result;
pub mod router;
pub mod sender;
pub mod signature;
pub mod tracker;

pub use events::{
    ActionEvents, EventHandlers, FrameRejected, RequestErrorReceived, RequestReceived, RequestSent,
    ResponseErrorReceived, ResponseReceived, ResponseSent, SubscriptionId, UnmatchedResponseError,
};
pub use pipeline::{ActionSlot, HandlerContext, HandlerError, RequestHandler};
pub use result::RequestOutcome;
pub use router::{Router, RouterBuilder};
pub use sender::{send_message, SendResult, SentMessageResult};
pub use signature::{AcceptAllSignatures, RequireSignatures, SignaturePolicy, SignedMessage};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::ocpp::{NodeId, OcppError};
use crate::transport::{connect_upstream, serve};

/// A networking node: router plus listener plus optional upstream link
pub struct NetworkingNode {
    config: NodeConfig,
    router: Router,
}

impl NetworkingNode {
    /// Node with every shipped action registered and no handlers
    pub fn new(config: NodeConfig) -> Self {
        let router = RouterBuilder::from_config(&config)
            .with_default_actions()
            .build();
        Self { config, router }
    }

    /// Node around a custom-built router
    pub fn with_router(config: NodeConfig, router: Router) -> Self {
        Self { config, router }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run until `shutdown` fires
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<(), OcppError> {
        info!(
            "Starting networking node {} ({}, {:?})",
            self.config.node_id,
            self.config.ocpp_version.subprotocol(),
            self.config.networking_mode
        );

        let listener = TcpListener::bind(self.config.listen_addr).await?;

        let upstream = self.config.upstream.clone().map(|upstream| {
            let router = self.router.clone();
            let node_id = NodeId::new(self.config.node_id.clone());
            let version = self.config.ocpp_version;
            let shutdown = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = connect_upstream(upstream, node_id, version, router, shutdown).await {
                    error!("Upstream link failed: {}", e);
                }
            })
        });

        let served = serve(
            listener,
            self.router.clone(),
            self.config.ocpp_version,
            shutdown.clone(),
        )
        .await;

        shutdown.cancel();
        if let Some(upstream) = upstream {
            let _ = upstream.await;
        }

        info!("Networking node {} stopped", self.config.node_id);
        served
    }

    /// Run until Ctrl-C
    pub async fn run(&self) -> Result<(), OcppError> {
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            trigger.cancel();
        });

        self.run_until(shutdown).await
    }
}
