//! Swarmpost -- command line front end for the swarm client core.
//!
//! Usage:
//!   swarmpost swarm <pubkey>            # Resolve and print a swarm
//!   swarmpost poll [--once]             # Poll the configured account
//!   swarmpost send <recipient> <text>   # Store a message for a contact
//!   swarmpost network-time              # Print corrected network time
//!   swarmpost identity [generate|show]  # Signing identity

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use swarmpost_client::config::ClientConfig;
use swarmpost_client::poller::{PollTarget, Poller, PollerEvent, PollerSettings, ReceivedMessage};
use swarmpost_client::{
    build_dispatcher, expand_tilde, Destination, Dispatcher, HttpTransport, MessageSender, Target,
    TimestampRewriter,
};
use swarmpost_crypto::SigningIdentity;
use swarmpost_protocol::messages::{InfoRequest, RpcRequest, METHOD_INFO};
use swarmpost_storage::{SqliteStorage, Storage};

#[derive(Parser)]
#[command(name = "swarmpost", about = "Swarm-aware storage network client")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.swarmpost/config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the swarm storing an account's messages
    Swarm {
        /// Hex account id
        pubkey: String,
    },
    /// Poll for messages
    Poll {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Poll a group swarm instead of the configured account
        #[arg(long)]
        group: Option<String>,
    },
    /// Store a plaintext payload in a contact's swarm
    Send {
        /// Hex account id of the recipient
        recipient: String,
        /// Payload to store
        message: String,
    },
    /// Print the network time reported by a swarm node
    NetworkTime {
        /// Swarm to ask (defaults to the configured account)
        #[arg(long)]
        swarm: Option<String>,
    },
    /// Show or generate the signing identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity keypair
    Generate,
    /// Show the current identity
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "swarmpost_client=info".into());
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config_path = expand_tilde(&cli.config);
    let cfg = ClientConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Identity { action } => {
            let key_path = expand_tilde(&cfg.client.identity_key);
            match action {
                Some(IdentityAction::Generate) | None => {
                    let identity = SigningIdentity::load_or_create(&key_path)?;
                    println!("Ed25519 key: {}", identity.public_key_hex());
                    println!("Key file: {}", key_path.display());
                }
                Some(IdentityAction::Show) => {
                    if key_path.exists() {
                        let identity = SigningIdentity::from_file(&key_path)?;
                        println!("Ed25519 key: {}", identity.public_key_hex());
                    } else {
                        eprintln!("No identity found at {}", key_path.display());
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Swarm { pubkey } => {
            let (dispatcher, _) = open(&cfg)?;
            let swarm = dispatcher.swarms().get_swarm(&pubkey).await?;
            let mut nodes: Vec<_> = swarm.into_iter().collect();
            nodes.sort();
            for node in nodes {
                println!("{node}  ed25519={}", node.ed25519_pubkey);
            }
        }
        Commands::Send { recipient, message } => {
            let session_id = cfg
                .client
                .session_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("client.session_id is not configured"))?;
            let identity = SigningIdentity::load_or_create(&expand_tilde(&cfg.client.identity_key))?;
            let (dispatcher, _) = open(&cfg)?;
            let sender = MessageSender::from_config(&cfg, dispatcher, Some(Arc::new(identity)), session_id);
            let sent_at = u64::try_from(swarmpost_client::now_ms())?;
            let sent = sender
                .send(
                    &Destination::Contact {
                        public_key: recipient,
                    },
                    message.as_bytes(),
                    sent_at,
                )
                .await?;
            println!(
                "Stored in {} (ns {}) hash={}",
                sent.swarm_key,
                sent.namespace,
                sent.hash.as_deref().unwrap_or("-")
            );
        }
        Commands::NetworkTime { swarm } => {
            let swarm_key = swarm
                .or_else(|| cfg.client.session_id.clone())
                .ok_or_else(|| anyhow::anyhow!("no swarm given and no session_id configured"))?;
            let (dispatcher, _) = open(&cfg)?;
            network_time(&cfg, &dispatcher, swarm_key).await?;
        }
        Commands::Poll { once, group } => {
            let target = match group {
                Some(public_key) => PollTarget::GroupSwarm { public_key },
                None => PollTarget::UserSwarm {
                    public_key: cfg
                        .client
                        .session_id
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("client.session_id is not configured"))?,
                },
            };
            let identity = SigningIdentity::load_or_create(&expand_tilde(&cfg.client.identity_key))?;
            let (dispatcher, storage) = open(&cfg)?;
            run_poller(&cfg, dispatcher, storage, Arc::new(identity), target, once).await?;
        }
    }

    Ok(())
}

fn open(cfg: &ClientConfig) -> anyhow::Result<(Dispatcher, Arc<dyn Storage>)> {
    let db_path = expand_tilde(&cfg.client.database);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&db_path)?);
    let transport = Arc::new(HttpTransport::new()?);
    Ok((build_dispatcher(cfg, transport, storage.clone()), storage))
}

async fn network_time(
    cfg: &ClientConfig,
    dispatcher: &Dispatcher,
    swarm_key: String,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&RpcRequest::new(METHOD_INFO, InfoRequest::default()))?;
    let target = Target::RandomSnodeLatestNetworkTime {
        swarm_key,
        retry_count: cfg.dispatcher.default_retry_count,
        // `info` carries no timestamp of its own.
        body_with_timestamp: TimestampRewriter::new(|body, _| Ok(body.clone())),
    };
    let (info, _) = dispatcher
        .send_with_timeouts(
            Some(body.into()),
            &target,
            swarmpost_client::RequestTimeouts {
                request: cfg.dispatcher.request_timeout(),
                request_and_path_build: cfg.dispatcher.path_build_timeout(),
            },
        )
        .await?;
    match info.network_time_ms {
        Some(ms) => {
            let local = swarmpost_client::now_ms();
            println!("Network time: {ms} ms (local offset {} ms)", local - ms as i64);
        }
        None => println!("Node did not report a network time"),
    }
    Ok(())
}

async fn run_poller(
    cfg: &ClientConfig,
    dispatcher: Dispatcher,
    storage: Arc<dyn Storage>,
    identity: Arc<SigningIdentity>,
    target: PollTarget,
    once: bool,
) -> anyhow::Result<()> {
    let settings = PollerSettings::from_config(cfg, &target);
    let (poller, mut events) = Poller::new(target, dispatcher, storage, Some(identity), settings);

    if once {
        let outcome = poller.poll(true).await?;
        for message in &outcome.messages {
            print_message(message);
        }
        println!("{} new message(s)", outcome.received);
        return Ok(());
    }

    poller.start_if_needed(false);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PollerEvent::Messages { messages, .. }) => {
                    for message in &messages {
                        print_message(message);
                    }
                }
                Some(PollerEvent::Stopped { reason, .. }) => {
                    anyhow::bail!("poller stopped: {reason}");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("poll: interrupted, shutting down");
                poller.stop();
                // Let the loop observe cancellation before the runtime exits.
                tokio::time::sleep(Duration::from_millis(50)).await;
                break;
            }
        }
    }
    Ok(())
}

fn print_message(message: &ReceivedMessage) {
    match message {
        ReceivedMessage::Swarm {
            namespace,
            hash,
            envelope,
        } => println!(
            "[ns {namespace}] {hash} {:?} ts={} {} bytes",
            envelope.kind,
            envelope.timestamp_ms,
            envelope.content.len()
        ),
        ReceivedMessage::Config {
            namespace,
            hash,
            data,
        } => println!("[ns {namespace}] {hash} config {} bytes", data.len()),
        ReceivedMessage::Community {
            seqno,
            sender,
            data,
            ..
        } => println!(
            "[#{seqno}] {sender} {}",
            data.as_ref().map_or("deleted".to_string(), |d| format!("{} bytes", d.len()))
        ),
    }
}
