//! Message sender -- stores outgoing payloads on the swarm that serves them.
//!
//! Every store goes through the latest-network-time target: the node picked
//! for an attempt first reports its clock, and the request timestamp (plus
//! the signature over it) is rendered against that time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use swarmpost_crypto::{request_verification_data, sign_base64, SigningIdentity};
use swarmpost_protocol::messages::{RequestAuth, RpcRequest, StoreRequest, StoreResponse};
use swarmpost_protocol::{wrapper, EnvelopeType, Namespace, WrapperError, ERA_0};

use crate::config::ClientConfig;
use crate::destination::{Destination, ThreadVariant};
use crate::dispatcher::{DispatchError, Dispatcher, RequestTimeouts, Target, TimestampRewriter};
use crate::request::{Endpoint, PreparedRequest};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("cannot store messages for {0} destinations")]
    UnsupportedDestination(&'static str),
    #[error("namespace {0} is not a user config namespace")]
    NotUserConfig(Namespace),
    #[error("namespace {0} requires a signing identity")]
    MissingIdentity(Namespace),
    #[error(transparent)]
    Wrap(#[from] WrapperError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Outcome of a successful store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub swarm_key: String,
    pub namespace: Namespace,
    /// Hash assigned by the node, when it reported one.
    pub hash: Option<String>,
    /// Network time the request was rendered with.
    pub network_time_ms: Option<u64>,
}

/// Everything a store request needs except its timestamp.
struct StoreTemplate {
    swarm_key: String,
    namespace: Namespace,
    data: String,
    ttl_ms: u64,
    identity: Option<Arc<SigningIdentity>>,
}

impl StoreTemplate {
    fn request(&self, timestamp_ms: u64) -> StoreRequest {
        let auth = self
            .identity
            .as_ref()
            .filter(|_| self.namespace.requires_write_authentication())
            .map(|identity| {
                let data = request_verification_data(
                    Endpoint::Store.path(),
                    &self.namespace.verification_string(),
                    timestamp_ms,
                );
                RequestAuth {
                    timestamp: timestamp_ms,
                    signature: sign_base64(identity, &data),
                    pubkey_ed25519: identity.public_key_hex(),
                }
            });
        StoreRequest {
            pubkey: self.swarm_key.clone(),
            namespace: (self.namespace != Namespace::Default).then_some(self.namespace),
            data: self.data.clone(),
            ttl: self.ttl_ms,
            timestamp: timestamp_ms,
            auth,
        }
    }

    fn body(&self, timestamp_ms: u64) -> Result<Bytes, DispatchError> {
        serde_json::to_vec(&RpcRequest::new(Endpoint::Store.path(), self.request(timestamp_ms)))
            .map(Bytes::from)
            .map_err(|e| DispatchError::InvalidBody(e.to_string()))
    }
}

#[derive(Clone)]
pub struct MessageSender {
    dispatcher: Dispatcher,
    identity: Option<Arc<SigningIdentity>>,
    /// Our own account id. Sync messages and config are stored in its swarm.
    user_public_key: String,
    retry_count: u8,
    timeouts: RequestTimeouts,
    ttl_ms: u64,
}

impl MessageSender {
    pub fn new(
        dispatcher: Dispatcher,
        identity: Option<Arc<SigningIdentity>>,
        user_public_key: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            identity,
            user_public_key: user_public_key.into(),
            retry_count: ERA_0.default_retry_count,
            timeouts: RequestTimeouts {
                request: Duration::from_secs(ERA_0.request_timeout_secs),
                request_and_path_build: Duration::from_secs(ERA_0.path_build_timeout_secs),
            },
            ttl_ms: ERA_0.default_message_ttl_ms,
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        dispatcher: Dispatcher,
        identity: Option<Arc<SigningIdentity>>,
        user_public_key: impl Into<String>,
    ) -> Self {
        Self {
            retry_count: config.dispatcher.default_retry_count,
            timeouts: RequestTimeouts {
                request: config.dispatcher.request_timeout(),
                request_and_path_build: config.dispatcher.path_build_timeout(),
            },
            ..Self::new(dispatcher, identity, user_public_key)
        }
    }

    /// Wrap `content` for `destination` and store it in the destination's
    /// swarm and default namespace.
    pub async fn send(
        &self,
        destination: &Destination,
        content: &[u8],
        sent_timestamp_ms: u64,
    ) -> Result<SentMessage, SendError> {
        let namespace = destination
            .default_namespace()
            .ok_or(SendError::UnsupportedDestination("community"))?;
        let (swarm_key, kind, source) = match destination {
            Destination::Contact { public_key } => {
                (public_key.as_str(), EnvelopeType::SessionMessage, "")
            }
            Destination::SyncMessage { .. } => {
                (self.user_public_key.as_str(), EnvelopeType::SessionMessage, "")
            }
            Destination::ClosedGroup { group_public_key } => {
                let source = match destination.thread_variant() {
                    ThreadVariant::LegacyGroup => group_public_key.as_str(),
                    _ => "",
                };
                (group_public_key.as_str(), EnvelopeType::ClosedGroupMessage, source)
            }
            Destination::Community { .. } | Destination::CommunityInbox { .. } => {
                return Err(SendError::UnsupportedDestination("community"));
            }
        };

        let payload = wrapper::wrap(
            kind,
            sent_timestamp_ms,
            source,
            content,
            namespace.wraps_in_websocket_message(),
        )?;
        self.store(swarm_key, namespace, &payload).await
    }

    /// Store a config blob in one of our own config namespaces. Config is
    /// stored unwrapped and always signed.
    pub async fn store_config(&self, namespace: Namespace, data: &[u8]) -> Result<SentMessage, SendError> {
        if !namespace.is_config() || !Namespace::USER.contains(&namespace) {
            return Err(SendError::NotUserConfig(namespace));
        }
        let swarm_key = self.user_public_key.clone();
        self.store(&swarm_key, namespace, data).await
    }

    async fn store(
        &self,
        swarm_key: &str,
        namespace: Namespace,
        payload: &[u8],
    ) -> Result<SentMessage, SendError> {
        if namespace.requires_write_authentication() && self.identity.is_none() {
            return Err(SendError::MissingIdentity(namespace));
        }

        let template = Arc::new(StoreTemplate {
            swarm_key: swarm_key.to_string(),
            namespace,
            data: BASE64.encode(payload),
            ttl_ms: self.ttl_ms,
            identity: self.identity.clone(),
        });
        let local_now = u64::try_from(crate::now_ms()).unwrap_or_default();
        let rewrite = template.clone();
        let target = Target::RandomSnodeLatestNetworkTime {
            swarm_key: swarm_key.to_string(),
            retry_count: self.retry_count,
            body_with_timestamp: TimestampRewriter::new(move |_, timestamp_ms| rewrite.body(timestamp_ms)),
        };

        let request: PreparedRequest<StoreResponse> =
            PreparedRequest::rpc(target, Endpoint::Store, &template.request(local_now), self.timeouts.request)?
                .with_path_build_timeout(self.timeouts.request_and_path_build);
        let (info, response) = request.send(&self.dispatcher).await?;

        tracing::debug!(
            swarm = swarm_key,
            namespace = %namespace,
            hash = ?response.hash,
            "send: stored"
        );
        Ok(SentMessage {
            swarm_key: swarm_key.to_string(),
            namespace,
            hash: response.hash,
            network_time_ms: info.network_time_ms,
        })
    }
}
