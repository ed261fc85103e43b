//! Identifiers and multi-hop addressing
//!
//! A networking node sits between charging stations and one or more CSMS.
//! Every message carries:
//! - a `RequestId` correlating a CALL with its CALLRESULT/CALLERROR
//! - an `EventTrackingId` correlating logs and events across a causal chain
//! - a `SourceRouting` destination naming the endpoint(s) it is addressed to
//! - a `NetworkPath` recording the nodes it has traversed

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a node in the charging network (station, networking node or CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// OCPP message id, unique among the outstanding requests of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random request id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Trace correlator shared by every event of one causal chain, forwards included
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventTrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventTrackingId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ordered record of the nodes a message has traversed, originating node first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    /// Empty path (message not yet sent anywhere)
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// A fresh path starting at `node`
    pub fn from_node(node: impl Into<NodeId>) -> Self {
        Self(vec![node.into()])
    }

    /// The originating node, if any hop was recorded
    pub fn source(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// The most recent hop
    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// Copy of this path with `node` appended as the newest hop
    pub fn append(&self, node: impl Into<NodeId>) -> Self {
        let mut hops = self.0.clone();
        hops.push(node.into());
        Self(hops)
    }

    /// Hops in reverse order, used to address a reply
    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON array of node ids
    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(|n| Value::String(n.0.clone())).collect())
    }

    /// Parse a JSON array of node ids
    pub fn from_json(json: &Value) -> Option<Self> {
        json.as_array()?
            .iter()
            .map(|hop| hop.as_str().map(NodeId::from))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }
}

impl FromIterator<NodeId> for NetworkPath {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Destination of a message: one or more endpoints, final destination last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRouting {
    endpoints: Vec<NodeId>,
}

impl SourceRouting {
    /// Address a single endpoint
    pub fn to(node: impl Into<NodeId>) -> Self {
        Self {
            endpoints: vec![node.into()],
        }
    }

    /// Address a chain of endpoints
    pub fn via(endpoints: Vec<NodeId>) -> Option<Self> {
        if endpoints.is_empty() {
            None
        } else {
            Some(Self { endpoints })
        }
    }

    /// Reply destination for a message that arrived along `path`
    ///
    /// Falls back to `fallback` (usually the connection peer) for an empty path.
    pub fn reply_to(path: &NetworkPath, fallback: &NodeId) -> Self {
        Self::to(path.source().unwrap_or(fallback).clone())
    }

    /// Final destination
    pub fn target(&self) -> &NodeId {
        // endpoints is never empty, see constructors
        &self.endpoints[self.endpoints.len() - 1]
    }

    pub fn endpoints(&self) -> &[NodeId] {
        &self.endpoints
    }

    /// Whether this node is the final destination
    pub fn is_local(&self, node: &NodeId) -> bool {
        self.target() == node
    }

    /// JSON string for one endpoint, array of strings for several
    pub fn to_json(&self) -> Value {
        match self.endpoints.as_slice() {
            [single] => Value::String(single.0.clone()),
            many => Value::Array(many.iter().map(|n| Value::String(n.0.clone())).collect()),
        }
    }

    pub fn from_json(json: &Value) -> Option<Self> {
        match json {
            Value::String(s) if !s.is_empty() => Some(Self::to(s.as_str())),
            Value::Array(items) => {
                let endpoints = items
                    .iter()
                    .map(|i| i.as_str().map(NodeId::from))
                    .collect::<Option<Vec<_>>>()?;
                Self::via(endpoints)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.endpoints.iter().map(|n| n.as_str()).collect();
        write!(f, "{}", names.join(" -> "))
    }
}
