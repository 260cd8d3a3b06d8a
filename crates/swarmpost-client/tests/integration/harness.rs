//! Test harness for in-process swarmpost-client integration tests.
//!
//! Provides MockTransport (scripted node and server responses), StubFetcher
//! (counted swarm refreshes) and TestEnv (tempfile storage + dispatcher).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use swarmpost_client::swarm_directory::{Swarm, SwarmDirectory, SwarmError, SwarmFetcher};
use swarmpost_client::transport::{ResponseInfo, ServerRequest, Transport, TransportError, TransportResult};
use swarmpost_client::Dispatcher;
use swarmpost_protocol::{wrapper, EnvelopeType, SwarmNode};
use swarmpost_storage::{SqliteStorage, Storage};

pub const USER_KEY: &str = "05abababababababababababababababababababababababababababababababab";

pub fn node(i: u16) -> SwarmNode {
    SwarmNode::new(format!("10.1.0.{i}"), 20000 + i, format!("ed{i:02}"), format!("x{i:02}"))
}

pub fn nodes(n: u16) -> Vec<SwarmNode> {
    (1..=n).map(node).collect()
}

// ============================================================================
// Transport
// ============================================================================

type SnodeHandler = dyn Fn(&SwarmNode, &Bytes) -> TransportResult<(ResponseInfo, Bytes)> + Send + Sync;
type ServerHandler =
    dyn Fn(&ServerRequest) -> TransportResult<(ResponseInfo, Option<Bytes>)> + Send + Sync;

/// Transport whose responses come from closures. Every call is logged.
///
/// `hold` parks node calls (after logging them) until `release`.
pub struct MockTransport {
    snode: Box<SnodeHandler>,
    server: Box<ServerHandler>,
    snode_calls: Mutex<Vec<(SwarmNode, Bytes)>>,
    server_calls: Mutex<Vec<ServerRequest>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new<F>(snode: F) -> Arc<Self>
    where
        F: Fn(&SwarmNode, &Bytes) -> TransportResult<(ResponseInfo, Bytes)> + Send + Sync + 'static,
    {
        Arc::new(Self {
            snode: Box::new(snode),
            server: Box::new(|_: &ServerRequest| Err(TransportError::Network("no server handler".into()))),
            snode_calls: Mutex::new(Vec::new()),
            server_calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        })
    }

    pub fn with_server<F>(server: F) -> Arc<Self>
    where
        F: Fn(&ServerRequest) -> TransportResult<(ResponseInfo, Option<Bytes>)> + Send + Sync + 'static,
    {
        Arc::new(Self {
            snode: Box::new(|_: &SwarmNode, _: &Bytes| Err(TransportError::Network("no snode handler".into()))),
            server: Box::new(server),
            snode_calls: Mutex::new(Vec::new()),
            server_calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        })
    }

    pub fn snode_calls(&self) -> Vec<(SwarmNode, Bytes)> {
        self.snode_calls.lock().unwrap().clone()
    }

    pub fn nodes_called(&self) -> Vec<SwarmNode> {
        self.snode_calls().into_iter().map(|(n, _)| n).collect()
    }

    pub fn server_calls(&self) -> Vec<ServerRequest> {
        self.server_calls.lock().unwrap().clone()
    }

    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.close();
        }
    }

    /// Wait until at least `n` node calls have been made.
    pub async fn wait_for_snode_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.snode_calls.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("node calls never arrived");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_to_snode(
        &self,
        node: &SwarmNode,
        body: Bytes,
        _timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Bytes)> {
        self.snode_calls.lock().unwrap().push((node.clone(), body.clone()));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // Closed on release; the error just means "go".
            let _ = gate.acquire().await;
        }
        (self.snode)(node, &body)
    }

    async fn send_to_server(
        &self,
        request: &ServerRequest,
        _body: Option<Bytes>,
        _timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)> {
        self.server_calls.lock().unwrap().push(request.clone());
        (self.server)(request)
    }
}

pub fn ok_json(value: Value) -> TransportResult<(ResponseInfo, Bytes)> {
    Ok((ResponseInfo::ok(), Bytes::from(value.to_string())))
}

pub fn status(code: u16) -> TransportError {
    TransportError::Status { code, body: None }
}

// ============================================================================
// Simulated storage node
// ============================================================================

/// A stored message as a node returns it from `retrieve`.
pub fn stored_message(hash: &str, timestamp_ms: u64, content: &[u8]) -> Value {
    let wrapped = wrapper::wrap(EnvelopeType::SessionMessage, timestamp_ms, "", content, true)
        .expect("wrap test message");
    json!({ "hash": hash, "data": BASE64.encode(wrapped), "timestamp": timestamp_ms })
}

pub fn stored_config(hash: &str, blob: &[u8]) -> Value {
    json!({ "hash": hash, "data": BASE64.encode(blob) })
}

/// Answer `batch` calls of `retrieve` sub-requests from per-namespace message
/// lists, honouring `last_hash` the way a node does.
pub fn swarm_store(
    store: HashMap<i32, Vec<Value>>,
) -> impl Fn(&SwarmNode, &Bytes) -> TransportResult<(ResponseInfo, Bytes)> + Send + Sync + 'static {
    move |_, body| {
        let req: Value = serde_json::from_slice(body).map_err(|e| TransportError::Parsing(e.to_string()))?;
        if req["method"] != "batch" {
            return Err(status(400));
        }
        let requests = req["params"]["requests"].as_array().cloned().unwrap_or_default();
        let results: Vec<Value> = requests
            .iter()
            .map(|sub| {
                let ns = sub["params"]["namespace"].as_i64().unwrap_or(0) as i32;
                let last_hash = sub["params"]["last_hash"].as_str().unwrap_or("");
                let all = store.get(&ns).cloned().unwrap_or_default();
                let start = all
                    .iter()
                    .position(|m| m["hash"] == last_hash)
                    .map_or(0, |i| i + 1);
                json!({ "code": 200, "body": { "messages": all[start..].to_vec(), "more": false } })
            })
            .collect();
        ok_json(json!({ "results": results }))
    }
}

// ============================================================================
// Swarm fetcher
// ============================================================================

/// Fetcher returning a fixed swarm (or error) after an optional delay.
pub struct StubFetcher {
    result: Result<Vec<SwarmNode>, SwarmError>,
    delay: Duration,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl StubFetcher {
    pub fn returning(nodes: Vec<SwarmNode>) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(nodes),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(error: SwarmError) -> Arc<Self> {
        Arc::new(Self {
            result: Err(error),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(nodes: Vec<SwarmNode>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(nodes),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmFetcher for StubFetcher {
    async fn fetch_swarm(&self, _swarm_key: &str) -> Result<Swarm, SwarmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone().map(|nodes| nodes.into_iter().collect())
    }
}

// ============================================================================
// Environment
// ============================================================================

pub struct TestEnv {
    pub storage: Arc<dyn Storage>,
    pub fetcher: Arc<StubFetcher>,
    pub transport: Arc<MockTransport>,
    pub dispatcher: Dispatcher,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new(transport: Arc<MockTransport>, fetcher: Arc<StubFetcher>) -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::open(&tempdir.path().join("swarmpost.db")).unwrap());
        let swarms = SwarmDirectory::new(storage.clone(), fetcher.clone());
        let dispatcher = Dispatcher::new(transport.clone(), swarms, 3);
        Self {
            storage,
            fetcher,
            transport,
            dispatcher,
            _tempdir: tempdir,
        }
    }

    pub fn swarms(&self) -> &SwarmDirectory {
        self.dispatcher.swarms()
    }
}
