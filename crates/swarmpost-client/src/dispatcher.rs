//! Dispatcher -- routes a request body to its target and owns retry policy.
//!
//! Server targets go straight to the transport. Node targets resolve their
//! swarm through the `SwarmDirectory`, pick nodes with the drain strategy and
//! retry against different nodes until the target's retry budget runs out.
//! Callers only ever see the final outcome.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swarmpost_drain::{select_node, DrainBehaviour};
use swarmpost_protocol::messages::{InfoRequest, InfoResponse, RpcRequest, METHOD_INFO};
use swarmpost_protocol::SwarmNode;

use crate::swarm_directory::{SwarmDirectory, SwarmError};
use crate::transport::{ResponseInfo, ServerRequest, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid prepared request: {0}")]
    InvalidPreparedRequest(&'static str),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no usable node left in swarm {0}")]
    NoNodesAvailable(String),
    #[error("failed to parse response: {0}")]
    Parsing(String),
    #[error("timed out resolving swarm {0}")]
    PathBuildTimeout(String),
}

impl DispatchError {
    pub fn is_clock_out_of_sync(&self) -> bool {
        matches!(self, DispatchError::Transport(e) if e.is_clock_out_of_sync())
    }
}

/// Re-renders a request body for a corrected network timestamp (ms), so
/// signatures cover the time the node will check against.
#[derive(Clone)]
pub struct TimestampRewriter(
    pub Arc<dyn Fn(&Bytes, u64) -> Result<Bytes, DispatchError> + Send + Sync>,
);

impl TimestampRewriter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Bytes, u64) -> Result<Bytes, DispatchError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for TimestampRewriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimestampRewriter")
    }
}

/// Where a request goes. Matched exhaustively by the dispatcher.
#[derive(Debug, Clone)]
pub enum Target {
    Server(ServerRequest),
    ServerUpload(ServerRequest),
    ServerDownload(ServerRequest),
    /// Resolves immediately with a canned response.
    Cached {
        info: ResponseInfo,
        body: Option<Bytes>,
    },
    /// One specific node; no selection, no retry.
    Snode { node: SwarmNode, swarm_key: String },
    /// Any node of the swarm, retried up to `retry_count` more times on failure.
    RandomSnode { swarm_key: String, retry_count: u8 },
    /// As `RandomSnode`, but each attempt first asks the chosen node for its
    /// network time and re-renders the body with it.
    RandomSnodeLatestNetworkTime {
        swarm_key: String,
        retry_count: u8,
        body_with_timestamp: TimestampRewriter,
    },
}

impl Target {
    pub fn retry_count(&self) -> u8 {
        match self {
            Target::RandomSnode { retry_count, .. }
            | Target::RandomSnodeLatestNetworkTime { retry_count, .. } => *retry_count,
            Target::Server(_)
            | Target::ServerUpload(_)
            | Target::ServerDownload(_)
            | Target::Cached { .. }
            | Target::Snode { .. } => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Target::Server(_) => "server",
            Target::ServerUpload(_) => "server_upload",
            Target::ServerDownload(_) => "server_download",
            Target::Cached { .. } => "cached",
            Target::Snode { .. } => "snode",
            Target::RandomSnode { .. } => "random_snode",
            Target::RandomSnodeLatestNetworkTime { .. } => "random_snode_latest_network_time",
        }
    }
}

/// Per-request timeouts. `request` bounds each transport call;
/// `request_and_path_build` additionally covers resolving the swarm first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    pub request: Duration,
    pub request_and_path_build: Duration,
}

impl RequestTimeouts {
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            request: timeout,
            request_and_path_build: timeout,
        }
    }
}

/// One attempt against a chosen node.
#[derive(Clone, Copy)]
enum Attempt<'a> {
    Plain(&'a Bytes),
    WithNetworkTime(&'a Bytes, &'a TimestampRewriter),
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    swarms: SwarmDirectory,
    /// Current drain behaviour per swarm. Swapped whole, never edited in place.
    drains: Arc<Mutex<HashMap<String, DrainBehaviour>>>,
    drain_reuse_count: usize,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, swarms: SwarmDirectory, drain_reuse_count: usize) -> Self {
        Self {
            transport,
            swarms,
            drains: Arc::new(Mutex::new(HashMap::new())),
            drain_reuse_count,
        }
    }

    pub fn swarms(&self) -> &SwarmDirectory {
        &self.swarms
    }

    pub async fn send(
        &self,
        body: Option<Bytes>,
        target: &Target,
        timeout: Duration,
    ) -> Result<(ResponseInfo, Option<Bytes>), DispatchError> {
        self.send_with_timeouts(body, target, RequestTimeouts::uniform(timeout))
            .await
    }

    pub async fn send_with_timeouts(
        &self,
        body: Option<Bytes>,
        target: &Target,
        timeouts: RequestTimeouts,
    ) -> Result<(ResponseInfo, Option<Bytes>), DispatchError> {
        match target {
            Target::Server(request) => Ok(self
                .transport
                .send_to_server(request, body, timeouts.request)
                .await?),
            Target::ServerUpload(request) => {
                let data = body.ok_or(DispatchError::InvalidPreparedRequest("upload without data"))?;
                Ok(self.transport.upload(request, data, timeouts.request).await?)
            }
            Target::ServerDownload(request) => {
                Ok(self.transport.download(request, timeouts.request).await?)
            }
            Target::Cached { info, body } => Ok((info.clone(), body.clone())),
            Target::Snode { node, swarm_key } => {
                let body = body.ok_or(DispatchError::InvalidPreparedRequest("snode request without body"))?;
                let (info, bytes) = self
                    .attempt(node, swarm_key, Attempt::Plain(&body), timeouts.request)
                    .await?;
                Ok((info, Some(bytes)))
            }
            Target::RandomSnode {
                swarm_key,
                retry_count,
            } => {
                let body = body.ok_or(DispatchError::InvalidPreparedRequest("snode request without body"))?;
                self.send_to_random_node(swarm_key, *retry_count, Attempt::Plain(&body), timeouts)
                    .await
            }
            Target::RandomSnodeLatestNetworkTime {
                swarm_key,
                retry_count,
                body_with_timestamp,
            } => {
                let body = body.ok_or(DispatchError::InvalidPreparedRequest("snode request without body"))?;
                self.send_to_random_node(
                    swarm_key,
                    *retry_count,
                    Attempt::WithNetworkTime(&body, body_with_timestamp),
                    timeouts,
                )
                .await
            }
        }
    }

    async fn send_to_random_node(
        &self,
        swarm_key: &str,
        retry_count: u8,
        attempt: Attempt<'_>,
        timeouts: RequestTimeouts,
    ) -> Result<(ResponseInfo, Option<Bytes>), DispatchError> {
        let swarm = tokio::time::timeout(
            timeouts.request_and_path_build,
            self.swarms.get_swarm(swarm_key),
        )
        .await
        .map_err(|_| DispatchError::PathBuildTimeout(swarm_key.to_string()))??;

        let mut failed: HashSet<SwarmNode> = HashSet::new();
        let mut last_error: Option<DispatchError> = None;

        for attempt_no in 0..=retry_count {
            let node = {
                let mut drains = self.lock_drains();
                let behaviour = drains
                    .remove(swarm_key)
                    .unwrap_or_else(|| DrainBehaviour::limited_reuse(self.drain_reuse_count));
                let picked = select_node(&swarm, &behaviour, &failed);
                let next = match &picked {
                    Some(node) => behaviour.use_node(node),
                    None => behaviour,
                };
                drains.insert(swarm_key.to_string(), next);
                picked
            };
            let Some(node) = node else {
                break;
            };

            match self.attempt(&node, swarm_key, attempt, timeouts.request).await {
                Ok((info, bytes)) => {
                    if attempt_no > 0 {
                        tracing::debug!(swarm = swarm_key, %node, attempt = attempt_no, "dispatch: succeeded after retry");
                    }
                    return Ok((info, Some(bytes)));
                }
                Err(e) => {
                    self.update_drain(swarm_key, DrainBehaviour::clear_target);
                    let retryable = match &e {
                        DispatchError::Transport(t) => t.is_retryable(),
                        DispatchError::Parsing(_) => true,
                        _ => false,
                    };
                    tracing::warn!(
                        swarm = swarm_key,
                        %node,
                        attempt = attempt_no,
                        retryable,
                        "dispatch: node request failed: {e}"
                    );
                    failed.insert(node);
                    if !retryable {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DispatchError::NoNodesAvailable(swarm_key.to_string())))
    }

    async fn attempt(
        &self,
        node: &SwarmNode,
        swarm_key: &str,
        attempt: Attempt<'_>,
        timeout: Duration,
    ) -> Result<(ResponseInfo, Bytes), DispatchError> {
        let result = match attempt {
            Attempt::Plain(body) => self.transport.send_to_snode(node, body.clone(), timeout).await,
            Attempt::WithNetworkTime(body, rewriter) => {
                let network_time = match self.network_time(node, timeout).await {
                    Ok(t) => t,
                    Err(e) => return self.note_failure(node, swarm_key, e).await,
                };
                let body = (rewriter.0)(body, network_time)?;
                self.transport
                    .send_to_snode(node, body, timeout)
                    .await
                    .map(|(mut info, bytes)| {
                        info.network_time_ms = Some(network_time);
                        (info, bytes)
                    })
            }
        };

        match result {
            Ok(ok) => Ok(ok),
            Err(e) => self.note_failure(node, swarm_key, e).await,
        }
    }

    /// Drop nodes that disowned the swarm, then hand the error back.
    async fn note_failure<T>(
        &self,
        node: &SwarmNode,
        swarm_key: &str,
        error: TransportError,
    ) -> Result<T, DispatchError> {
        if error.is_misdirected() {
            if let Err(e) = self.swarms.drop_node(swarm_key, node).await {
                tracing::warn!(swarm = swarm_key, %node, "dispatch: failed to drop node: {e}");
            }
        }
        Err(error.into())
    }

    async fn network_time(&self, node: &SwarmNode, timeout: Duration) -> Result<u64, TransportError> {
        let body = serde_json::to_vec(&RpcRequest::new(METHOD_INFO, InfoRequest::default()))
            .map_err(|e| TransportError::Parsing(e.to_string()))?;
        let (_, bytes) = self.transport.send_to_snode(node, body.into(), timeout).await?;
        let info: InfoResponse =
            serde_json::from_slice(&bytes).map_err(|e| TransportError::Parsing(e.to_string()))?;
        Ok(info.timestamp)
    }

    fn lock_drains(&self) -> std::sync::MutexGuard<'_, HashMap<String, DrainBehaviour>> {
        self.drains.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_drain(&self, swarm_key: &str, f: impl FnOnce(DrainBehaviour) -> DrainBehaviour) {
        let mut drains = self.lock_drains();
        if let Some(current) = drains.remove(swarm_key) {
            drains.insert(swarm_key.to_string(), f(current));
        }
    }

    /// Forget one swarm's membership and its drain state.
    pub async fn invalidate_swarm(&self, swarm_key: &str) -> Result<(), SwarmError> {
        self.lock_drains().remove(swarm_key);
        self.swarms.invalidate(swarm_key).await
    }

    /// Network environment change: drop every known swarm and all drain state.
    pub async fn clear_swarms(&self) -> Result<(), SwarmError> {
        self.lock_drains().clear();
        self.swarms.clear().await
    }

    /// Current drain behaviour for a swarm, if any request has used it.
    pub fn drain_behaviour(&self, swarm_key: &str) -> Option<DrainBehaviour> {
        self.lock_drains().get(swarm_key).cloned()
    }
}
