//! Configuration types for swarmpost.
//! Parsed from ~/.swarmpost/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use swarmpost_protocol::{SwarmNode, ERA_0};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub poller: PollerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    /// Hex account id (`05...`) whose swarm the user poller reads.
    pub session_id: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkSection {
    #[serde(default)]
    pub seed_nodes: Vec<SeedNodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNodeEntry {
    /// `ip:port:ed25519_hex:x25519_hex`
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u8,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_path_build_timeout")]
    pub path_build_timeout_secs: u64,
    #[serde(default = "default_drain_reuse_count")]
    pub drain_reuse_count: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            default_retry_count: default_retry_count(),
            request_timeout_secs: default_request_timeout(),
            path_build_timeout_secs: default_path_build_timeout(),
            drain_reuse_count: default_drain_reuse_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_community_poll_interval")]
    pub community_poll_interval_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_swarm_refresh_after_failures")]
    pub swarm_refresh_after_failures: u32,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            community_poll_interval_ms: default_community_poll_interval(),
            backoff_max_ms: default_backoff_max(),
            swarm_refresh_after_failures: default_swarm_refresh_after_failures(),
        }
    }
}

// Default value functions
fn default_identity_key() -> String {
    "~/.swarmpost/identity.key".into()
}
fn default_database() -> String {
    "~/.swarmpost/swarmpost.db".into()
}
fn default_retry_count() -> u8 {
    ERA_0.default_retry_count
}
fn default_request_timeout() -> u64 {
    ERA_0.request_timeout_secs
}
fn default_path_build_timeout() -> u64 {
    ERA_0.path_build_timeout_secs
}
fn default_drain_reuse_count() -> usize {
    ERA_0.drain_reuse_count
}
fn default_poll_interval() -> u64 {
    ERA_0.poll_interval_ms
}
fn default_community_poll_interval() -> u64 {
    ERA_0.community_poll_interval_ms
}
fn default_backoff_max() -> u64 {
    ERA_0.poll_backoff_max_ms
}
fn default_swarm_refresh_after_failures() -> u32 {
    ERA_0.swarm_refresh_after_failures
}

impl ClientConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ClientConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Parsed seed nodes. Malformed entries are logged and skipped.
    pub fn seed_nodes(&self) -> Vec<SwarmNode> {
        self.network
            .seed_nodes
            .iter()
            .filter_map(|entry| match SwarmNode::parse(&entry.node) {
                Ok(node) => Some(node),
                Err(e) => {
                    tracing::warn!(entry = %entry.node, "config: skipping seed node: {e}");
                    None
                }
            })
            .collect()
    }
}

impl DispatcherSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn path_build_timeout(&self) -> Duration {
        Duration::from_secs(self.path_build_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSection {
                identity_key: default_identity_key(),
                session_id: None,
                database: default_database(),
            },
            network: NetworkSection::default(),
            dispatcher: DispatcherSection::default(),
            poller: PollerSection::default(),
        }
    }
}
