//! Swarm directory -- resolves and caches which nodes store an account's messages.
//!
//! One instance per process (or per network environment), shared by handle.
//! In-memory cache in front of storage; refreshes go through a unique-job
//! runner so concurrent callers for one key collapse into a single fetch.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use swarmpost_protocol::messages::{GetSwarmRequest, GetSwarmResponse, RpcRequest, METHOD_GET_SWARM};
use swarmpost_protocol::{SwarmNode, MIN_SWARM_SIZE};
use swarmpost_storage::{NodeRow, Storage};

use crate::jobs::UniqueJobRunner;
use crate::transport::Transport;

pub type Swarm = HashSet<SwarmNode>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwarmError {
    #[error("swarm for {key} has {found} nodes, need {required}")]
    InsufficientNodes {
        key: String,
        found: usize,
        required: usize,
    },
    #[error("empty swarm key")]
    InvalidSwarmKey,
    #[error("swarm fetch failed: {0}")]
    Fetch(String),
    #[error("swarm storage failed: {0}")]
    Storage(String),
    #[error("swarm refresh job failed: {0}")]
    Job(String),
}

/// Source of fresh swarm membership.
#[async_trait]
pub trait SwarmFetcher: Send + Sync {
    async fn fetch_swarm(&self, swarm_key: &str) -> Result<Swarm, SwarmError>;
}

#[derive(Clone)]
pub struct SwarmDirectory {
    cache: Arc<RwLock<HashMap<String, Swarm>>>,
    /// Keys already read from storage this process lifetime.
    loaded: Arc<RwLock<HashSet<String>>>,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn SwarmFetcher>,
    jobs: UniqueJobRunner<String, Result<Swarm, SwarmError>>,
    min_size: usize,
}

pub(crate) fn node_to_row(node: &SwarmNode) -> NodeRow {
    NodeRow {
        ip: node.ip.clone(),
        port: node.port,
        ed25519_pubkey: node.ed25519_pubkey.clone(),
        x25519_pubkey: node.x25519_pubkey.clone(),
    }
}

fn row_to_node(row: NodeRow) -> SwarmNode {
    SwarmNode::new(row.ip, row.port, row.ed25519_pubkey, row.x25519_pubkey)
}

impl SwarmDirectory {
    pub fn new(storage: Arc<dyn Storage>, fetcher: Arc<dyn SwarmFetcher>) -> Self {
        Self::with_min_size(storage, fetcher, MIN_SWARM_SIZE)
    }

    pub fn with_min_size(
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn SwarmFetcher>,
        min_size: usize,
    ) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            loaded: Arc::new(RwLock::new(HashSet::new())),
            storage,
            fetcher,
            jobs: UniqueJobRunner::new(),
            min_size,
        }
    }

    /// Nodes responsible for `swarm_key`, refreshed from the network when
    /// fewer than the minimum are known. Never returns an undersized swarm.
    pub async fn get_swarm(&self, swarm_key: &str) -> Result<Swarm, SwarmError> {
        if swarm_key.is_empty() {
            return Err(SwarmError::InvalidSwarmKey);
        }

        self.load_from_storage(swarm_key).await?;

        if let Some(swarm) = self.cache.read().await.get(swarm_key) {
            if swarm.len() >= self.min_size {
                return Ok(swarm.clone());
            }
        }

        let cache = self.cache.clone();
        let storage = self.storage.clone();
        let fetcher = self.fetcher.clone();
        let min_size = self.min_size;
        let key = swarm_key.to_string();

        self.jobs
            .run(key.clone(), move || async move {
                refresh(key, cache, storage, fetcher, min_size).await
            })
            .await
            .map_err(|e| SwarmError::Job(e.to_string()))?
    }

    async fn load_from_storage(&self, swarm_key: &str) -> Result<(), SwarmError> {
        if self.loaded.read().await.contains(swarm_key) {
            return Ok(());
        }

        let rows = self
            .storage
            .read_swarm(swarm_key)
            .map_err(|e| SwarmError::Storage(e.to_string()))?;

        let mut loaded = self.loaded.write().await;
        if !loaded.insert(swarm_key.to_string()) {
            return Ok(());
        }
        if !rows.is_empty() {
            let mut cache = self.cache.write().await;
            cache
                .entry(swarm_key.to_string())
                .or_insert_with(|| rows.into_iter().map(row_to_node).collect());
        }
        tracing::debug!(swarm = swarm_key, "swarm: loaded from storage");
        Ok(())
    }

    /// Remove a node that reported it no longer serves `swarm_key`.
    pub async fn drop_node(&self, swarm_key: &str, node: &SwarmNode) -> Result<(), SwarmError> {
        let remaining = {
            let mut cache = self.cache.write().await;
            cache.get_mut(swarm_key).map(|swarm| {
                swarm.remove(node);
                swarm.len()
            })
        };
        self.storage
            .delete_swarm_node(swarm_key, &node_to_row(node))
            .map_err(|e| SwarmError::Storage(e.to_string()))?;
        tracing::info!(swarm = swarm_key, %node, remaining = ?remaining, "swarm: node dropped");
        Ok(())
    }

    /// Forget everything known about one swarm; the next lookup fetches.
    pub async fn invalidate(&self, swarm_key: &str) -> Result<(), SwarmError> {
        self.cache.write().await.remove(swarm_key);
        self.storage
            .delete_swarm(swarm_key)
            .map_err(|e| SwarmError::Storage(e.to_string()))?;
        tracing::info!(swarm = swarm_key, "swarm: invalidated");
        Ok(())
    }

    /// Network environment change: drop every cached and persisted swarm.
    pub async fn clear(&self) -> Result<(), SwarmError> {
        self.cache.write().await.clear();
        self.loaded.write().await.clear();
        self.storage
            .clear_swarms()
            .map_err(|e| SwarmError::Storage(e.to_string()))?;
        tracing::info!("swarm: directory cleared");
        Ok(())
    }

    /// Cached membership, without triggering a load or refresh.
    pub async fn cached(&self, swarm_key: &str) -> Option<Swarm> {
        self.cache.read().await.get(swarm_key).cloned()
    }
}

async fn refresh(
    key: String,
    cache: Arc<RwLock<HashMap<String, Swarm>>>,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn SwarmFetcher>,
    min_size: usize,
) -> Result<Swarm, SwarmError> {
    let swarm = fetcher.fetch_swarm(&key).await?;
    if swarm.len() < min_size {
        tracing::warn!(swarm = %key, found = swarm.len(), "swarm: refresh returned too few nodes");
        return Err(SwarmError::InsufficientNodes {
            key,
            found: swarm.len(),
            required: min_size,
        });
    }

    let rows: Vec<NodeRow> = swarm.iter().map(node_to_row).collect();
    storage
        .write_swarm(&key, &rows)
        .map_err(|e| SwarmError::Storage(e.to_string()))?;
    cache.write().await.insert(key.clone(), swarm.clone());
    tracing::info!(swarm = %key, nodes = swarm.len(), "swarm: refreshed");
    Ok(swarm)
}

// ============================================================================
// Seed-node fetcher
// ============================================================================

/// Fetches swarms with `get_swarm` from the configured seed nodes, trying
/// them in random order until one answers.
pub struct SeedNodeFetcher {
    transport: Arc<dyn Transport>,
    seeds: Vec<SwarmNode>,
    timeout: Duration,
}

impl SeedNodeFetcher {
    pub fn new(transport: Arc<dyn Transport>, seeds: Vec<SwarmNode>, timeout: Duration) -> Self {
        Self {
            transport,
            seeds,
            timeout,
        }
    }
}

#[async_trait]
impl SwarmFetcher for SeedNodeFetcher {
    async fn fetch_swarm(&self, swarm_key: &str) -> Result<Swarm, SwarmError> {
        let body = serde_json::to_vec(&RpcRequest::new(
            METHOD_GET_SWARM,
            GetSwarmRequest {
                pubkey: swarm_key.to_string(),
            },
        ))
        .map_err(|e| SwarmError::Fetch(e.to_string()))?;

        let mut seeds = self.seeds.clone();
        seeds.shuffle(&mut rand::thread_rng());

        let mut last_error = SwarmError::Fetch("no seed nodes configured".into());
        for seed in seeds {
            match self
                .transport
                .send_to_snode(&seed, body.clone().into(), self.timeout)
                .await
            {
                Ok((_, bytes)) => {
                    let resp: GetSwarmResponse = serde_json::from_slice(&bytes)
                        .map_err(|e| SwarmError::Fetch(format!("bad get_swarm response: {e}")))?;
                    return Ok(resp.into_nodes().into_iter().collect());
                }
                Err(e) => {
                    tracing::warn!(%seed, "swarm: seed node failed: {e}");
                    last_error = SwarmError::Fetch(e.to_string());
                }
            }
        }
        Err(last_error)
    }
}
