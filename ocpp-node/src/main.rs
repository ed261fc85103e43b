//! OCPP Node - CLI for an OCPP networking node
//!
//! Runs a CSMS-side endpoint or an intermediate networking node with
//! demonstration handlers for the core station messages.
//!
//! # Usage
//!
//! ```bash
//! # CSMS on the default port
//! ocpp-node --name CSMS
//!
//! # Local controller between stations and a CSMS, overlay framing
//! ocpp-node --name LC1 --listen 0.0.0.0:9100 --mode overlay \
//!     --upstream ws://csms.example:9000/ocpp --upstream-id CSMS
//!
//! # OCPP 2.0.1 stations
//! ocpp-node --name CSMS --ocpp-version 2.0.1
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use ocpp_networking::ocpp::actions::{BootNotification, Heartbeat, StatusNotification};
use ocpp_networking::ocpp::types::{
    BootNotificationResponse, HeartbeatResponse, RegistrationStatus, StatusNotificationResponse,
};
use ocpp_networking::{
    HandlerError, NetworkingMode, NetworkingNode, NodeConfig, OcppVersion, Router,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Frame layout on links this node opens
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Standard,
    Overlay,
}

impl From<Mode> for NetworkingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Standard => NetworkingMode::Standard,
            Mode::Overlay => NetworkingMode::OverlayNetwork,
        }
    }
}

/// OCPP 2.0.1 / 2.1 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(short, long, default_value = "CSMS")]
    name: String,

    /// WebSocket listen address
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// OCPP version (2.0.1 or 2.1)
    #[arg(long, default_value = "2.1")]
    ocpp_version: OcppVersion,

    /// Networking mode
    #[arg(long, value_enum, default_value = "standard")]
    mode: Mode,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Answered exchanges kept for late CALLRESULTERRORs
    #[arg(long, default_value = "256")]
    answered_cache: usize,

    /// Upstream WebSocket URL (node id is appended)
    #[arg(long)]
    upstream: Option<String>,

    /// Node id of the upstream peer
    #[arg(long, default_value = "CSMS")]
    upstream_id: String,

    /// Heartbeat interval announced to booting stations, in seconds
    #[arg(long, default_value = "300")]
    heartbeat_interval: i32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Node - Networking Node                     ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  Listen:   {:<50} ║", args.listen);
    println!("║  Version:  {:<50} ║", args.ocpp_version.subprotocol());
    println!("║  Mode:     {:<50} ║", format!("{:?}", args.mode));
    println!(
        "║  Upstream: {:<50} ║",
        truncate(args.upstream.as_deref().unwrap_or("-"), 50)
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = NodeConfig::new(&args.name, args.listen)
        .with_version(args.ocpp_version)
        .with_networking_mode(args.mode.into())
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_answered_cache_size(args.answered_cache);

    if let Some(url) = &args.upstream {
        config = config.with_upstream(url).with_upstream_node_id(&args.upstream_id);
        info!("Upstream: {} via {}", args.upstream_id, url);
    }

    let node = NetworkingNode::new(config);
    install_handlers(node.router(), args.heartbeat_interval)?;
    install_observers(node.router());

    info!("Starting OCPP node...");
    node.run().await?;

    Ok(())
}

/// Accept every station, answer heartbeats with the local clock
fn install_handlers(router: &Router, heartbeat_interval: i32) -> Result<(), Box<dyn std::error::Error>> {
    router.on_request::<BootNotification, _, _>(move |ctx, request, _cancel| async move {
        info!(
            "BootNotification from {}: {} {} ({:?})",
            ctx.connection.remote_node,
            request.payload.charging_station.vendor_name,
            request.payload.charging_station.model,
            request.payload.reason
        );
        Ok::<_, HandlerError>(BootNotificationResponse {
            current_time: Utc::now(),
            interval: heartbeat_interval,
            status: RegistrationStatus::Accepted,
            status_info: None,
        })
    })?;

    router.on_request::<Heartbeat, _, _>(|_ctx, _request, _cancel| async move {
        Ok::<_, HandlerError>(HeartbeatResponse {
            current_time: Utc::now(),
        })
    })?;

    router.on_request::<StatusNotification, _, _>(|ctx, request, _cancel| async move {
        info!(
            "{} EVSE {} connector {}: {:?}",
            ctx.connection.remote_node,
            request.payload.evse_id,
            request.payload.connector_id,
            request.payload.connector_status
        );
        Ok::<_, HandlerError>(StatusNotificationResponse {})
    })?;

    Ok(())
}

fn install_observers(router: &Router) {
    if let Some(events) = router.events::<BootNotification>() {
        events.response_sent.subscribe(|event| async move {
            info!(
                "BootNotification {} answered in {:?}: {}",
                event.request.request_id,
                event.runtime,
                event.sent.result
            );
        });
    }

    router.frames_rejected().subscribe(|event| async move {
        warn!(
            "Rejected frame from {} (answered: {}): {}",
            event.connection.remote_node, event.answered, event.error
        );
    });

    router.unmatched_response_errors().subscribe(|event| async move {
        warn!(
            "{} rejected an unknown response {}: {}",
            event.connection.remote_node, event.error.request_id, event.error.error_description
        );
    });
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
