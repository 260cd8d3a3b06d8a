//! Poller -- long-running retrieval loop for one swarm or community room.
//!
//! Lifecycle: idle -> polling -> stopped. While polling, each cycle resolves
//! the swarm, picks a node, sends one batched retrieve over the target's
//! namespaces, drops already-seen messages, hands the rest to the consumer and
//! then commits dedup records and cursors in one storage transaction. Cycles
//! of one poller never overlap; separate pollers run independently.
//!
//! Delivery is at-least-once: a cycle cancelled between hand-over and commit
//! is retrieved again by the next cycle.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use swarmpost_crypto::{retrieve_verification_data, sign_base64, SigningIdentity};
use swarmpost_drain::{select_node, DrainBehaviour};
use swarmpost_protocol::messages::{
    BatchRequest, BatchResponse, CommunityMessage, RequestAuth, RetrieveRequest,
    RetrieveResponse, RpcRequest, METHOD_RETRIEVE,
};
use swarmpost_protocol::{wrapper, AccountId, AccountKind, Envelope, Namespace, ERA_0};
use swarmpost_storage::{CursorUpdate, ReceivedMessageRow, Storage, StorageError};

use crate::config::ClientConfig;
use crate::dispatcher::{DispatchError, Dispatcher, Target};
use crate::request::{Endpoint, PreparedRequest};
use crate::swarm_directory::SwarmError;
use crate::transport::HttpMethod;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Targets, events, errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    /// The local user's own swarm: messages plus user config namespaces.
    UserSwarm { public_key: String },
    /// A group swarm. `03` ids are new-style groups, anything else legacy.
    GroupSwarm { public_key: String },
    Community { server: String, room: String },
}

impl PollTarget {
    pub fn namespaces(&self) -> Vec<Namespace> {
        match self {
            PollTarget::UserSwarm { .. } => Namespace::USER.to_vec(),
            PollTarget::GroupSwarm { public_key } => {
                if AccountId::kind_of(public_key) == Some(AccountKind::Group) {
                    vec![Namespace::Default, Namespace::ConfigClosedGroupInfo]
                } else {
                    vec![Namespace::LegacyClosedGroup]
                }
            }
            PollTarget::Community { .. } => Vec::new(),
        }
    }

    pub fn swarm_key(&self) -> Option<&str> {
        match self {
            PollTarget::UserSwarm { public_key } | PollTarget::GroupSwarm { public_key } => {
                Some(public_key)
            }
            PollTarget::Community { .. } => None,
        }
    }
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollTarget::UserSwarm { public_key } => write!(f, "user:{public_key}"),
            PollTarget::GroupSwarm { public_key } => write!(f, "group:{public_key}"),
            PollTarget::Community { server, room } => write!(f, "community:{server}/{room}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedMessage {
    /// A message envelope from a message namespace.
    Swarm {
        namespace: Namespace,
        hash: String,
        envelope: Envelope,
    },
    /// A raw config blob; merged by the consumer, never deduplicated here.
    Config {
        namespace: Namespace,
        hash: String,
        data: Vec<u8>,
    },
    Community {
        seqno: i64,
        sender: String,
        posted_ms: i64,
        /// `None` for deleted messages.
        data: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone)]
pub enum PollerEvent {
    Messages {
        target: PollTarget,
        messages: Vec<ReceivedMessage>,
    },
    /// The poller hit a terminal error and will not run again until restarted.
    Stopped { target: PollTarget, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("no signing identity for authenticated namespaces")]
    MissingIdentity,
    #[error("invalid poll target: {0}")]
    InvalidTarget(String),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error("no node available in swarm {0}")]
    NoNodesAvailable(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("event receiver dropped")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorDisposition {
    /// Back off and try again next cycle.
    Transient,
    /// Stop the poller and report it.
    Terminal,
}

impl PollError {
    pub fn disposition(&self) -> PollErrorDisposition {
        match self {
            PollError::MissingIdentity
            | PollError::InvalidTarget(_)
            | PollError::Storage(_)
            | PollError::ChannelClosed
            | PollError::Swarm(SwarmError::InvalidSwarmKey) => PollErrorDisposition::Terminal,
            PollError::Swarm(_) | PollError::NoNodesAvailable(_) | PollError::Dispatch(_) => {
                PollErrorDisposition::Transient
            }
        }
    }
}

// ============================================================================
// Settings and state
// ============================================================================

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures before the swarm is invalidated. 0 disables.
    pub swarm_refresh_after_failures: u32,
    pub request_timeout: Duration,
    /// Dedup record lifetime for messages without a server expiry.
    pub message_ttl_ms: i64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(ERA_0.poll_interval_ms),
            backoff_max: Duration::from_millis(ERA_0.poll_backoff_max_ms),
            swarm_refresh_after_failures: ERA_0.swarm_refresh_after_failures,
            request_timeout: Duration::from_secs(ERA_0.request_timeout_secs),
            message_ttl_ms: ERA_0.default_message_ttl_ms as i64,
        }
    }
}

impl PollerSettings {
    pub fn from_config(config: &ClientConfig, target: &PollTarget) -> Self {
        let interval_ms = match target {
            PollTarget::Community { .. } => config.poller.community_poll_interval_ms,
            PollTarget::UserSwarm { .. } | PollTarget::GroupSwarm { .. } => {
                config.poller.poll_interval_ms
            }
        };
        Self {
            poll_interval: Duration::from_millis(interval_ms),
            backoff_max: Duration::from_millis(config.poller.backoff_max_ms),
            swarm_refresh_after_failures: config.poller.swarm_refresh_after_failures,
            request_timeout: config.dispatcher.request_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct PollState {
    failure_count: u32,
    last_poll_started: Option<Instant>,
    drain: DrainBehaviour,
}

struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

/// Result of one cycle.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// New messages found this cycle.
    pub received: usize,
    /// The messages themselves, when processing was requested synchronously.
    pub messages: Vec<ReceivedMessage>,
}

/// Storage writes that finish a cycle once its messages are handed over.
enum PendingCommit {
    Swarm {
        swarm_key: String,
        received: Vec<ReceivedMessageRow>,
        cursors: Vec<CursorUpdate>,
    },
    Community {
        server: String,
        room: String,
        seqno: Option<i64>,
    },
}

struct PollerInner {
    target: PollTarget,
    dispatcher: Dispatcher,
    storage: Arc<dyn Storage>,
    identity: Option<Arc<SigningIdentity>>,
    settings: PollerSettings,
    events: mpsc::Sender<PollerEvent>,
    state: Mutex<PollState>,
    /// Held for the whole of a cycle so cycles never overlap.
    cycle: tokio::sync::Mutex<()>,
    task: Mutex<Option<PollTask>>,
    generation: AtomicU64,
    foreground: AtomicBool,
}

#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ms() -> i64 {
    crate::now_ms()
}

impl Poller {
    pub fn new(
        target: PollTarget,
        dispatcher: Dispatcher,
        storage: Arc<dyn Storage>,
        identity: Option<Arc<SigningIdentity>>,
        settings: PollerSettings,
    ) -> (Self, mpsc::Receiver<PollerEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poller = Self {
            inner: Arc::new(PollerInner {
                target,
                dispatcher,
                storage,
                identity,
                settings,
                events,
                state: Mutex::new(PollState::default()),
                cycle: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
                generation: AtomicU64::new(0),
                foreground: AtomicBool::new(true),
            }),
        };
        (poller, rx)
    }

    pub fn target(&self) -> &PollTarget {
        &self.inner.target
    }

    /// Number of polling tasks started so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished() && !t.token.is_cancelled())
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.inner.foreground.store(foreground, Ordering::SeqCst);
    }

    pub fn failure_count(&self) -> u32 {
        lock(&self.inner.state).failure_count
    }

    pub fn last_poll_started(&self) -> Option<Instant> {
        lock(&self.inner.state).last_poll_started
    }

    /// Start the polling task unless one is running. In the background this
    /// is a no-op unless `force_start_in_background` is set. Returns whether
    /// a task was started.
    pub fn start_if_needed(&self, force_start_in_background: bool) -> bool {
        if !force_start_in_background && !self.inner.foreground.load(Ordering::SeqCst) {
            tracing::debug!(poller = %self.inner.target, "poll: in background, not starting");
            return false;
        }

        let mut task = lock(&self.inner.task);
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() && !running.token.is_cancelled() {
                return false;
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.inner.state) = PollState::default();
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run(token.clone(), generation));
        *task = Some(PollTask {
            token,
            handle,
            generation,
        });
        tracing::info!(poller = %self.inner.target, generation, "poll: started");
        true
    }

    /// Cancel the polling task. State is reset so a later start begins fresh.
    pub fn stop(&self) {
        let Some(task) = lock(&self.inner.task).take() else {
            return;
        };
        task.token.cancel();
        *lock(&self.inner.state) = PollState::default();
        tracing::info!(poller = %self.inner.target, generation = task.generation, "poll: stopped");
    }

    /// Delay before the next cycle: the base interval doubled per consecutive
    /// failure, capped at the backoff maximum.
    pub fn next_poll_delay(&self) -> Duration {
        let failures = lock(&self.inner.state).failure_count;
        let base = self.inner.settings.poll_interval;
        let factor = 1u32 << failures.min(16);
        base.saturating_mul(factor)
            .min(self.inner.settings.backoff_max.max(base))
    }

    /// Record a failed cycle and classify it.
    pub async fn handle_poll_error(&self, error: &PollError) -> PollErrorDisposition {
        let disposition = error.disposition();
        let failures = {
            let mut state = lock(&self.inner.state);
            state.failure_count += 1;
            state.drain = std::mem::take(&mut state.drain).clear_target();
            state.failure_count
        };
        tracing::warn!(
            poller = %self.inner.target,
            failures,
            disposition = ?disposition,
            "poll: cycle failed: {error}"
        );

        let threshold = self.inner.settings.swarm_refresh_after_failures;
        if disposition == PollErrorDisposition::Transient && threshold > 0 && failures % threshold == 0 {
            if let Some(swarm_key) = self.inner.target.swarm_key() {
                tracing::info!(swarm = swarm_key, failures, "poll: invalidating swarm");
                if let Err(e) = self.inner.dispatcher.invalidate_swarm(swarm_key).await {
                    tracing::warn!(swarm = swarm_key, "poll: failed to invalidate swarm: {e}");
                }
                lock(&self.inner.state).drain = DrainBehaviour::default();
            }
        }
        disposition
    }

    async fn run(self, token: CancellationToken, generation: u64) {
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                r = self.poll(false) => r,
            };

            if let Err(e) = result {
                // A stopped generation must not touch state a restart now owns.
                let disposition = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    d = self.handle_poll_error(&e) => d,
                };
                if disposition == PollErrorDisposition::Terminal {
                    let stopped = PollerEvent::Stopped {
                        target: self.inner.target.clone(),
                        reason: e.to_string(),
                    };
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {}
                        _ = self.inner.events.send(stopped) => {}
                    }
                    self.release_task(generation);
                    break;
                }
            }

            let delay = self.next_poll_delay();
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(poller = %self.inner.target, generation, "poll: loop exited");
    }

    fn release_task(&self, generation: u64) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|t| t.generation == generation) {
            *task = None;
        }
    }

    /// Run exactly one cycle now. With `force_synchronous_processing` the
    /// messages are returned instead of sent on the event channel.
    pub async fn poll(&self, force_synchronous_processing: bool) -> Result<PollOutcome, PollError> {
        let _cycle = self.inner.cycle.lock().await;
        lock(&self.inner.state).last_poll_started = Some(Instant::now());

        let (messages, pending) = match &self.inner.target {
            PollTarget::UserSwarm { public_key } | PollTarget::GroupSwarm { public_key } => {
                self.poll_swarm(public_key).await?
            }
            PollTarget::Community { server, room } => self.poll_community(server, room).await?,
        };
        let received = messages.len();

        let messages = if force_synchronous_processing {
            messages
        } else {
            if !messages.is_empty() {
                self.inner
                    .events
                    .send(PollerEvent::Messages {
                        target: self.inner.target.clone(),
                        messages,
                    })
                    .await
                    .map_err(|_| PollError::ChannelClosed)?;
            }
            Vec::new()
        };

        self.commit(pending)?;
        lock(&self.inner.state).failure_count = 0;
        tracing::debug!(poller = %self.inner.target, received, "poll: cycle complete");
        Ok(PollOutcome { received, messages })
    }

    fn commit(&self, pending: PendingCommit) -> Result<(), PollError> {
        let storage = &self.inner.storage;
        match pending {
            PendingCommit::Swarm {
                swarm_key,
                received,
                cursors,
            } => {
                storage.commit_poll_cycle(&swarm_key, &received, &cursors)?;
                let pruned = storage.prune_expired_messages(now_ms())?;
                if pruned > 0 {
                    tracing::debug!(swarm = %swarm_key, pruned, "poll: pruned expired dedup records");
                }
            }
            PendingCommit::Community { server, room, seqno } => {
                if let Some(seqno) = seqno {
                    storage.update_open_group_sequence(&server, &room, seqno)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Swarm cycle
    // ========================================================================

    async fn poll_swarm(
        &self,
        swarm_key: &str,
    ) -> Result<(Vec<ReceivedMessage>, PendingCommit), PollError> {
        let namespaces = self.inner.target.namespaces();
        let storage = &self.inner.storage;
        let identity = if namespaces.iter().any(|ns| ns.requires_read_authentication()) {
            Some(self.inner.identity.as_deref().ok_or(PollError::MissingIdentity)?)
        } else {
            None
        };

        let swarm = self.inner.dispatcher.swarms().get_swarm(swarm_key).await?;
        let node = {
            let mut state = lock(&self.inner.state);
            let picked = select_node(&swarm, &state.drain, &HashSet::new());
            if let Some(node) = &picked {
                state.drain = std::mem::take(&mut state.drain).use_node(node);
            }
            picked
        }
        .ok_or_else(|| PollError::NoNodesAvailable(swarm_key.to_string()))?;

        let max_sizes = Namespace::max_size_map(&namespaces);
        let timestamp = now_ms().max(0) as u64;
        let mut requests = Vec::with_capacity(namespaces.len());
        for ns in &namespaces {
            let last_hash = if ns.should_fetch_since_last_hash() {
                storage.read_cursor(swarm_key, ns.code())?.unwrap_or_default()
            } else {
                String::new()
            };
            let auth = match identity {
                Some(identity) if ns.requires_read_authentication() => {
                    let data = retrieve_verification_data(&ns.verification_string(), timestamp);
                    Some(RequestAuth {
                        timestamp,
                        signature: sign_base64(identity, &data),
                        pubkey_ed25519: identity.public_key_hex(),
                    })
                }
                _ => None,
            };
            let params = RetrieveRequest {
                pubkey: swarm_key.to_string(),
                namespace: (*ns != Namespace::Default).then_some(*ns),
                last_hash,
                max_size: max_sizes.get(ns).copied(),
                auth,
            };
            let params = serde_json::to_value(&params)
                .map_err(|e| DispatchError::InvalidBody(e.to_string()))?;
            requests.push(RpcRequest::new(METHOD_RETRIEVE, params));
        }

        let request: PreparedRequest<BatchResponse> = PreparedRequest::rpc(
            Target::Snode {
                node: node.clone(),
                swarm_key: swarm_key.to_string(),
            },
            Endpoint::Batch,
            &BatchRequest { requests },
            self.inner.settings.request_timeout,
        )?;
        let (_, response) = request.send(&self.inner.dispatcher).await?;
        if response.results.len() != namespaces.len() {
            tracing::warn!(
                swarm = swarm_key,
                %node,
                expected = namespaces.len(),
                got = response.results.len(),
                "poll: batch result count mismatch"
            );
        }

        let mut messages = Vec::new();
        let mut received = Vec::new();
        let mut cursors = Vec::new();
        let now = now_ms();

        for (ns, result) in namespaces.iter().zip(response.results) {
            if !result.is_success() {
                tracing::warn!(swarm = swarm_key, namespace = %ns, code = result.code, "poll: namespace retrieve failed");
                continue;
            }
            let retrieved: RetrieveResponse = serde_json::from_value(result.body)
                .map_err(|e| DispatchError::Parsing(e.to_string()))?;
            let Some(last) = retrieved.messages.last() else {
                continue;
            };
            if ns.should_fetch_since_last_hash() {
                cursors.push(CursorUpdate {
                    namespace: ns.code(),
                    last_hash: last.hash.clone(),
                });
            }

            let fresh: HashSet<String> = if ns.requires_deduplication() {
                let hashes: Vec<String> = retrieved.messages.iter().map(|m| m.hash.clone()).collect();
                storage
                    .filter_unseen(swarm_key, ns.code(), &hashes)?
                    .into_iter()
                    .collect()
            } else {
                retrieved.messages.iter().map(|m| m.hash.clone()).collect()
            };

            for msg in retrieved.messages {
                if !fresh.contains(&msg.hash) {
                    continue;
                }
                if ns.requires_deduplication() {
                    let expiration_ms = msg
                        .expiration
                        .map(|e| e as i64)
                        .unwrap_or(now + self.inner.settings.message_ttl_ms);
                    received.push(ReceivedMessageRow {
                        namespace: ns.code(),
                        hash: msg.hash.clone(),
                        expiration_ms,
                    });
                }
                match decode_swarm_message(*ns, msg.hash.clone(), &msg.data) {
                    Ok(message) => messages.push(message),
                    // Undecodable messages stay recorded so they are not retried forever.
                    Err(e) => {
                        tracing::warn!(swarm = swarm_key, namespace = %ns, hash = %msg.hash, "poll: dropping message: {e}")
                    }
                }
            }
        }

        Ok((
            messages,
            PendingCommit::Swarm {
                swarm_key: swarm_key.to_string(),
                received,
                cursors,
            },
        ))
    }

    // ========================================================================
    // Community cycle
    // ========================================================================

    async fn poll_community(
        &self,
        server: &str,
        room: &str,
    ) -> Result<(Vec<ReceivedMessage>, PendingCommit), PollError> {
        let open_group = self
            .inner
            .storage
            .read_open_group(server, room)?
            .ok_or_else(|| PollError::InvalidTarget(format!("unknown community {server}/{room}")))?;

        let request: PreparedRequest<Option<Vec<CommunityMessage>>> = PreparedRequest::server(
            HttpMethod::Get,
            server,
            open_group.public_key.clone(),
            format!("/room/{room}/messages/since/{}", open_group.sequence_number),
            self.inner.settings.request_timeout,
        );
        let (_, response) = request.send(&self.inner.dispatcher).await?;
        let posts = response.unwrap_or_default();

        let seqno = posts
            .iter()
            .map(|m| m.seqno)
            .max()
            .filter(|s| *s > open_group.sequence_number);
        let messages = posts
            .into_iter()
            .map(|m| {
                let data = m.data.as_deref().and_then(|d| match BASE64.decode(d) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::warn!(server, room, seqno = m.seqno, "poll: bad community payload: {e}");
                        None
                    }
                });
                ReceivedMessage::Community {
                    seqno: m.seqno,
                    sender: m.session_id,
                    posted_ms: (m.posted * 1000.0) as i64,
                    data,
                }
            })
            .collect();

        Ok((
            messages,
            PendingCommit::Community {
                server: server.to_string(),
                room: room.to_string(),
                seqno,
            },
        ))
    }
}

#[derive(Debug, thiserror::Error)]
enum MessageDecodeError {
    #[error("bad base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Wrapper(#[from] wrapper::WrapperError),
}

fn decode_swarm_message(
    namespace: Namespace,
    hash: String,
    data: &str,
) -> Result<ReceivedMessage, MessageDecodeError> {
    let bytes = BASE64.decode(data)?;
    if namespace.is_config() {
        return Ok(ReceivedMessage::Config {
            namespace,
            hash,
            data: bytes,
        });
    }
    let envelope = wrapper::unwrap(&bytes, namespace, namespace.wraps_in_websocket_message())?;
    Ok(ReceivedMessage::Swarm {
        namespace,
        hash,
        envelope,
    })
}
