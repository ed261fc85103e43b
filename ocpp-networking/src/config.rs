//! Configuration for an OCPP networking node

use std::net::SocketAddr;
use std::time::Duration;

use crate::ocpp::NetworkingMode;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node identity, used in network paths and as reply source
    pub node_id: String,

    /// WebSocket listen address
    pub listen_addr: SocketAddr,

    /// Protocol version, selects the WebSocket subprotocol
    pub ocpp_version: OcppVersion,

    /// Frame layout on links this node opens
    pub networking_mode: NetworkingMode,

    /// Default timeout for requests this node initiates
    pub request_timeout: Duration,

    /// Answered exchanges remembered for late CALLRESULTERRORs
    pub answered_cache_size: usize,

    /// Optional upstream node (CSMS or another networking node)
    pub upstream: Option<UpstreamConfig>,
}

/// Supported protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OcppVersion {
    V2_0_1,
    #[default]
    V2_1,
}

impl OcppVersion {
    /// WebSocket subprotocol token
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V2_0_1 => "ocpp2.0.1",
            OcppVersion::V2_1 => "ocpp2.1",
        }
    }

    pub fn from_subprotocol(token: &str) -> Option<Self> {
        match token.trim() {
            "ocpp2.0.1" => Some(OcppVersion::V2_0_1),
            "ocpp2.1" => Some(OcppVersion::V2_1),
            _ => None,
        }
    }
}

impl std::str::FromStr for OcppVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2.0.1" | "ocpp2.0.1" => Ok(OcppVersion::V2_0_1),
            "2.1" | "ocpp2.1" => Ok(OcppVersion::V2_1),
            other => Err(format!("Unsupported OCPP version: {}", other)),
        }
    }
}

/// Upstream link configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URL (without node id)
    pub url: String,

    /// Node id of the upstream peer, used to route towards it
    pub node_id: String,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,
}

impl UpstreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            node_id: "CSMS".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "ocpp-node".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            ocpp_version: OcppVersion::default(),
            networking_mode: NetworkingMode::Standard,
            request_timeout: Duration::from_secs(30),
            answered_cache_size: 256,
            upstream: None,
        }
    }
}

impl NodeConfig {
    /// Create config with basic parameters
    pub fn new(node_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: OcppVersion) -> Self {
        self.ocpp_version = version;
        self
    }

    pub fn with_networking_mode(mut self, mode: NetworkingMode) -> Self {
        self.networking_mode = mode;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_answered_cache_size(mut self, size: usize) -> Self {
        self.answered_cache_size = size;
        self
    }

    /// Connect to an upstream node with default backoff
    pub fn with_upstream(mut self, url: impl Into<String>) -> Self {
        self.upstream = Some(UpstreamConfig::new(url));
        self
    }

    pub fn with_upstream_node_id(mut self, node_id: impl Into<String>) -> Self {
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.node_id = node_id.into();
        }
        self
    }

    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.reconnect_delay = initial;
            upstream.max_reconnect_delay = max;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("NN1", "127.0.0.1:9100".parse().unwrap())
            .with_version(OcppVersion::V2_0_1)
            .with_networking_mode(NetworkingMode::OverlayNetwork)
            .with_request_timeout(Duration::from_secs(5))
            .with_upstream("ws://localhost:9000/ocpp")
            .with_upstream_node_id("CSMS-1")
            .with_reconnect_delays(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(config.node_id, "NN1");
        assert_eq!(config.listen_addr.port(), 9100);
        assert_eq!(config.ocpp_version.subprotocol(), "ocpp2.0.1");
        assert_eq!(config.networking_mode, NetworkingMode::OverlayNetwork);
        assert_eq!(config.request_timeout, Duration::from_secs(5));

        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.url, "ws://localhost:9000/ocpp");
        assert_eq!(upstream.node_id, "CSMS-1");
        assert_eq!(upstream.max_reconnect_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("2.1".parse::<OcppVersion>().unwrap(), OcppVersion::V2_1);
        assert_eq!("ocpp2.0.1".parse::<OcppVersion>().unwrap(), OcppVersion::V2_0_1);
        assert!("1.6".parse::<OcppVersion>().is_err());
        assert_eq!(OcppVersion::from_subprotocol("ocpp2.1"), Some(OcppVersion::V2_1));
    }
}
