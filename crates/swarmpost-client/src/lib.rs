//! Swarmpost Client -- swarm-aware request dispatch and message polling.
//!
//! Library half of the `swarmpost` binary. Embedders build a [`Dispatcher`]
//! over their own [`Transport`] and run a [`Poller`] per destination.

pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod jobs;
pub mod poller;
pub mod request;
pub mod sender;
pub mod swarm_directory;
pub mod transport;

pub use destination::{Destination, DestinationError, ThreadVariant};
pub use dispatcher::{DispatchError, Dispatcher, RequestTimeouts, Target, TimestampRewriter};
pub use poller::{PollError, PollTarget, Poller, PollerEvent, PollerSettings, ReceivedMessage};
pub use request::{Endpoint, PreparedRequest, RequestBody};
pub use sender::{MessageSender, SendError, SentMessage};
pub use swarm_directory::{SeedNodeFetcher, Swarm, SwarmDirectory, SwarmError, SwarmFetcher};
pub use transport::{HttpTransport, ResponseInfo, Transport, TransportError};

use std::path::PathBuf;
use std::sync::Arc;

use swarmpost_storage::Storage;

/// Wire a dispatcher from config: seed-node swarm fetcher over `transport`,
/// swarms persisted in `storage`.
pub fn build_dispatcher(
    cfg: &config::ClientConfig,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
) -> Dispatcher {
    let fetcher = Arc::new(SeedNodeFetcher::new(
        transport.clone(),
        cfg.seed_nodes(),
        cfg.dispatcher.request_timeout(),
    ));
    let swarms = SwarmDirectory::new(storage, fetcher);
    Dispatcher::new(transport, swarms, cfg.dispatcher.drain_reuse_count)
}

/// Current wall-clock time, ms since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
