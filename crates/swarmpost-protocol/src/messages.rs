//! Storage-server JSON-RPC messages and community server payloads.
//!
//! Every storage node exposes one endpoint accepting
//! `{"method": ..., "params": ...}`. Batched requests nest the same shape.

use serde::{Deserialize, Serialize};

use crate::namespace::Namespace;
use crate::SwarmNode;

pub const METHOD_RETRIEVE: &str = "retrieve";
pub const METHOD_STORE: &str = "store";
pub const METHOD_BATCH: &str = "batch";
pub const METHOD_INFO: &str = "info";
pub const METHOD_GET_SWARM: &str = "get_swarm";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest<P> {
    pub method: String,
    pub params: P,
}

impl<P> RpcRequest<P> {
    pub fn new(method: &str, params: P) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

/// Signature material attached to authenticated requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAuth {
    pub timestamp: u64,
    /// Base64 Ed25519 signature.
    pub signature: String,
    /// Hex Ed25519 public key of the signer.
    pub pubkey_ed25519: String,
}

// ============================================================================
// Retrieve
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub pubkey: String,
    /// Omitted for the default namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    /// Empty means "everything stored".
    #[serde(default)]
    pub last_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i64>,
    #[serde(flatten)]
    pub auth: Option<RequestAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    #[serde(default)]
    pub messages: Vec<RetrievedMessage>,
    #[serde(default)]
    pub more: bool,
    /// Network time on the responding node, ms.
    #[serde(default)]
    pub t: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMessage {
    pub hash: String,
    /// Base64 payload.
    pub data: String,
    /// Expiry, ms since epoch.
    #[serde(default)]
    pub expiration: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    pub pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    /// Base64 payload.
    pub data: String,
    pub ttl: u64,
    pub timestamp: u64,
    #[serde(flatten)]
    pub auth: Option<RequestAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub t: Option<u64>,
}

// ============================================================================
// Batch
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<RpcRequest<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<BatchSubResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubResponse {
    pub code: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl BatchSubResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

// ============================================================================
// Info (network time)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    /// Network time, ms since epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub version: Vec<u16>,
}

// ============================================================================
// Get swarm
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSwarmRequest {
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSwarmResponse {
    #[serde(default)]
    pub snodes: Vec<RawSnode>,
}

/// Node entry as the network reports it. Ports arrive as strings or numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnode {
    pub ip: String,
    pub port: PortValue,
    pub pubkey_ed25519: String,
    pub pubkey_x25519: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            PortValue::Number(p) => Some(*p),
            PortValue::Text(s) => s.parse().ok(),
        }
    }
}

impl GetSwarmResponse {
    /// Usable nodes. Entries with an unroutable address or a bad port are
    /// dropped (nodes still joining report `0.0.0.0`).
    pub fn into_nodes(self) -> Vec<SwarmNode> {
        self.snodes
            .into_iter()
            .filter_map(|raw| {
                let port = raw.port.as_u16().filter(|p| *p != 0)?;
                if raw.ip.is_empty() || raw.ip == "0.0.0.0" {
                    return None;
                }
                Some(SwarmNode::new(raw.ip, port, raw.pubkey_ed25519, raw.pubkey_x25519))
            })
            .collect()
    }
}

// ============================================================================
// Community server
// ============================================================================

/// A message in a community room, as returned by
/// `GET /room/{room}/messages/since/{seqno}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityMessage {
    pub id: i64,
    pub seqno: i64,
    pub session_id: String,
    /// Seconds since epoch, fractional.
    pub posted: f64,
    /// Base64 payload; absent for deleted messages.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}
