//! OCPP WebSocket transport
//!
//! Handles:
//! - Server accept loop with OCPP subprotocol negotiation
//! - Upstream client with automatic reconnection (exponential backoff)
//! - One writer task per link, one pipeline task per inbound text frame
//!
//! The peer's node id is the last path segment of the WebSocket URL
//! (`ws://host/ocpp/CS001` → `CS001`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Connection, ConnectionInfo, TransportError};
use crate::config::{OcppVersion, UpstreamConfig};
use crate::node::Router;
use crate::ocpp::{NodeId, OcppError};

/// Largest frame accepted on any link
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Time a closing link gets to flush frames already queued
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A WebSocket link; frames are queued to the link's writer task
pub struct WsConnection {
    info: ConnectionInfo,
    outgoing: mpsc::Sender<Message>,
}

#[async_trait]
impl Connection for WsConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, node_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

/// Node id announced by a connecting peer
fn node_id_from_path(path: &str) -> Option<String> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Accept links until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    router: Router,
    version: OcppVersion,
    shutdown: CancellationToken,
) -> Result<(), OcppError> {
    info!(
        "Accepting {} connections on {}",
        version.subprotocol(),
        listener.local_addr()?
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        continue;
                    }
                };

                let router = router.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(stream, addr, router, version, shutdown).await {
                        warn!("Connection from {} failed: {}", addr, e);
                    }
                });
            }
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Router,
    version: OcppVersion,
    shutdown: CancellationToken,
) -> Result<(), OcppError> {
    let mut remote_node = None;
    let mut negotiated = false;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let Some(node) = node_id_from_path(request.uri().path()) else {
            let mut rejection = ErrorResponse::new(Some("Missing node id in URL path".to_string()));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            return Err(rejection);
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if offered.split(',').any(|p| p.trim() == version.subprotocol()) {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(version.subprotocol()),
            );
            negotiated = true;
        }

        remote_node = Some(node);
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;

    let remote_node = remote_node.ok_or(OcppError::ConnectionClosed)?;
    if !negotiated {
        warn!(
            "{} did not offer {}, continuing without subprotocol",
            remote_node,
            version.subprotocol()
        );
    }
    info!("{} connected from {}", remote_node, addr);

    let info = ConnectionInfo::new(remote_node, router.networking_mode()).with_remote_addr(addr);
    run_link(ws_stream, info, router, shutdown).await
}

/// Keep a link to the upstream node alive until `shutdown` fires
pub async fn connect_upstream(
    config: UpstreamConfig,
    node_id: NodeId,
    version: OcppVersion,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), OcppError> {
    let url = build_ocpp_url(&config.url, node_id.as_str());
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        info!("Connecting to upstream {}: {}", config.node_id, url);

        let backoff = match connect_once(&url, &config, version, &router, &shutdown).await {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                info!("Upstream connection closed");
                reconnect_delay = config.reconnect_delay;
                false
            }
            Err(e) => {
                error!("Upstream connection error: {}", e);
                true
            }
        };

        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(reconnect_delay) => {}
        }

        // Exponential backoff
        if backoff {
            reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
        }
    }
}

async fn connect_once(
    url: &str,
    config: &UpstreamConfig,
    version: OcppVersion,
    router: &Router,
    shutdown: &CancellationToken,
) -> Result<(), OcppError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(version.subprotocol()),
    );

    let (ws_stream, response) = connect_async_with_config(request, Some(ws_config()), false)
        .await
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;

    // Verify subprotocol
    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(version.subprotocol()) {
        warn!(
            "Upstream did not accept {}, got: {:?}",
            version.subprotocol(),
            accepted_protocol
        );
    }

    info!("WebSocket connected to {}", url);

    let upstream = NodeId::new(config.node_id.clone());
    router.set_upstream(Some(upstream.clone()));
    let info = ConnectionInfo::new(upstream, router.networking_mode());
    run_link(ws_stream, info, router.clone(), shutdown.child_token()).await
}

/// Pump one established link until it closes
async fn run_link<S>(
    ws_stream: WebSocketStream<S>,
    info: ConnectionInfo,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), OcppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(64);

    let connection: Arc<dyn Connection> = Arc::new(WsConnection {
        info: info.clone(),
        outgoing: outgoing.clone(),
    });
    router.register_connection(connection.clone());

    // Spawn writer task
    let remote = info.remote_node.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_tx.send(message).await {
                // The peer may have completed the close handshake first
                if !closing {
                    error!("Failed to send WebSocket message to {}: {}", remote, e);
                }
                break;
            }
            if closing {
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let router = router.clone();
                    let connection = connection.clone();
                    let token = cancel.child_token();
                    tokio::spawn(async move {
                        router.handle_text(connection, &text, token).await;
                    });
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", info.remote_node);
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is queued by tungstenite
                    debug!("Received ping from {}", info.remote_node);
                }
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket closed by {}", info.remote_node);
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(OcppError::WebSocket(e.to_string())),
                None => {
                    info!("WebSocket stream from {} ended", info.remote_node);
                    break Ok(());
                }
            }
        }
    };

    // In-flight pipelines of this link observe the cancellation
    cancel.cancel();
    router.unregister_connection(&info);

    // Replies queued before the Close still go out
    let drained = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, async {
        let _ = outgoing.send(Message::Close(None)).await;
        let _ = (&mut writer).await;
    })
    .await;
    if drained.is_err() {
        warn!("Writer for {} did not drain in time", info.remote_node);
        writer.abort();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::HandlerError;
    use crate::ocpp::actions::Heartbeat;
    use crate::ocpp::types::HeartbeatResponse;
    use crate::ocpp::OcppMessage;
    use chrono::{TimeZone, Utc};
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:9000/ocpp", "CS001");
        assert_eq!(url, "ws://localhost:9000/ocpp/CS001");

        let url = build_ocpp_url("ws://localhost:9000/ocpp/", "CS001");
        assert_eq!(url, "ws://localhost:9000/ocpp/CS001");
    }

    #[test]
    fn test_node_id_from_path() {
        assert_eq!(node_id_from_path("/ocpp/CS001"), Some("CS001".to_string()));
        assert_eq!(node_id_from_path("/ocpp/CS001/"), Some("CS001".to_string()));
        assert_eq!(node_id_from_path("/"), None);
        assert_eq!(node_id_from_path(""), None);
    }

    #[tokio::test]
    async fn test_heartbeat_over_websocket() {
        let router = Router::builder("CSMS").with_default_actions().build();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        router
            .on_request::<Heartbeat, _, _>(move |_ctx, _request, _cancel| async move {
                Ok::<_, HandlerError>(HeartbeatResponse { current_time: now })
            })
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, router.clone(), OcppVersion::V2_1, shutdown.clone()));

        let mut request = format!("ws://{}/ocpp/CS001", addr)
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("ocpp2.1"),
        );
        let (mut ws, response) = connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "ocpp2.1"
        );

        ws.send(Message::Text(r#"[2, "hb-1", "Heartbeat", {}]"#.to_string().into()))
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break text,
                _ => continue,
            }
        };
        match OcppMessage::parse(reply.as_bytes()).unwrap() {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id.as_str(), "hb-1");
                assert_eq!(result.payload["currentTime"], "2025-01-01T12:00:00Z");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(router.connection(&"CS001".into()).is_some());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_sends_close_frame() {
        let router = Router::builder("CSMS").with_default_actions().build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, router.clone(), OcppVersion::V2_1, shutdown.clone()));

        let (mut ws, _) = connect_async(format!("ws://{}/ocpp/CS001", addr))
            .await
            .unwrap();

        for _ in 0..200 {
            if router.connection(&"CS001".into()).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(router.connection(&"CS001".into()).is_some());

        shutdown.cancel();

        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        assert!(matches!(frame, Some(Ok(Message::Close(_)))), "{:?}", frame);

        for _ in 0..200 {
            if router.connection(&"CS001".into()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(router.connection(&"CS001".into()).is_none());
    }
}
