//! Swarmpost Protocol -- wire types shared by the client, storage and drain crates.
//!
//! Storage nodes speak JSON-RPC over HTTPS. Message payloads stored on a swarm
//! are protobuf-framed envelopes, optionally wrapped in a websocket request
//! frame, and base64 encoded inside the JSON.

pub mod account;
pub mod era;
pub mod messages;
pub mod namespace;
mod proto;
pub mod wrapper;

pub use account::{AccountId, AccountKind};
pub use era::{NetworkEra, CURRENT_ERA, ERA_0};
pub use messages::*;
pub use namespace::Namespace;
pub use wrapper::{Envelope, EnvelopeType, WrapperError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum number of nodes for a swarm to be considered usable (sourced from current era).
pub const MIN_SWARM_SIZE: usize = ERA_0.min_swarm_size;

/// Maximum size of a wrapped message (sourced from current era).
pub const MAX_MESSAGE_BYTES: usize = ERA_0.max_message_bytes;

/// Swarm public key: the hex account id whose messages a swarm stores.
pub type SwarmPublicKey = String;

/// A storage node. Immutable once fetched; two nodes are equal when every
/// identifying field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwarmNode {
    pub ip: String,
    pub port: u16,
    /// Hex Ed25519 public key.
    pub ed25519_pubkey: String,
    /// Hex X25519 public key.
    pub x25519_pubkey: String,
}

impl SwarmNode {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        ed25519_pubkey: impl Into<String>,
        x25519_pubkey: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            ed25519_pubkey: ed25519_pubkey.into(),
            x25519_pubkey: x25519_pubkey.into(),
        }
    }

    /// Storage RPC endpoint on this node.
    pub fn rpc_url(&self) -> String {
        format!("https://{}:{}/storage_rpc/v1", self.ip, self.port)
    }

    /// Parse the `ip:port:ed25519:x25519` form used in config files.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [ip, port, ed, x] => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::InvalidNode(s.to_string()))?;
                Ok(Self::new(*ip, port, *ed, *x))
            }
            _ => Err(ProtocolError::InvalidNode(s.to_string())),
        }
    }
}

impl fmt::Display for SwarmNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown namespace code: {0}")]
    UnknownNamespace(i32),
    #[error("invalid node descriptor: {0}")]
    InvalidNode(String),
    #[error("invalid account id: {0}")]
    InvalidAccountId(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
