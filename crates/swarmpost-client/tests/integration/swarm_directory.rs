//! Swarm resolution: storage fallback, coalesced refreshes, node removal.

use std::time::Duration;

use swarmpost_client::swarm_directory::SwarmError;
use swarmpost_storage::NodeRow;

use crate::harness::{node, nodes, MockTransport, StubFetcher, TestEnv, USER_KEY};

fn rows(n: u16) -> Vec<NodeRow> {
    nodes(n)
        .into_iter()
        .map(|n| NodeRow {
            ip: n.ip,
            port: n.port,
            ed25519_pubkey: n.ed25519_pubkey,
            x25519_pubkey: n.x25519_pubkey,
        })
        .collect()
}

fn env(fetcher: std::sync::Arc<StubFetcher>) -> TestEnv {
    TestEnv::new(MockTransport::new(|_, _| unreachable!("no node calls expected")), fetcher)
}

/// Three callers racing on an undersized swarm share a single refresh.
#[tokio::test]
async fn test_concurrent_callers_coalesce_refresh() {
    let env = env(StubFetcher::slow(nodes(5), Duration::from_millis(100)));
    env.storage.write_swarm(USER_KEY, &rows(2)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let swarms = env.swarms().clone();
        handles.push(tokio::spawn(async move { swarms.get_swarm(USER_KEY).await }));
    }

    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap().unwrap());
    }

    assert_eq!(env.fetcher.calls(), 1);
    assert!(results.iter().all(|s| s.len() == 5));
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(env.storage.read_swarm(USER_KEY).unwrap().len(), 5);
}

/// A failing refresh reaches every waiting caller as the same error.
#[tokio::test]
async fn test_concurrent_callers_share_refresh_error() {
    let env = env(StubFetcher::failing(SwarmError::Fetch("seed down".into())));
    env.storage.write_swarm(USER_KEY, &rows(2)).unwrap();

    let (a, b, c) = tokio::join!(
        env.swarms().get_swarm(USER_KEY),
        env.swarms().get_swarm(USER_KEY),
        env.swarms().get_swarm(USER_KEY),
    );
    let expected = SwarmError::Fetch("seed down".into());
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(c.unwrap_err(), expected);
    assert_eq!(env.fetcher.calls(), 1);
}

/// Dropping a node below the minimum makes the next lookup refresh.
#[tokio::test]
async fn test_drop_node_below_minimum_triggers_refresh() {
    let env = env(StubFetcher::returning(nodes(6)));
    env.storage.write_swarm(USER_KEY, &rows(3)).unwrap();

    assert_eq!(env.swarms().get_swarm(USER_KEY).await.unwrap().len(), 3);
    assert_eq!(env.fetcher.calls(), 0);

    env.swarms().drop_node(USER_KEY, &node(1)).await.unwrap();
    assert_eq!(env.storage.read_swarm(USER_KEY).unwrap().len(), 2);

    let swarm = env.swarms().get_swarm(USER_KEY).await.unwrap();
    assert_eq!(swarm.len(), 6);
    assert_eq!(env.fetcher.calls(), 1);
}

#[tokio::test]
async fn test_clear_forgets_everything() {
    let env = env(StubFetcher::returning(nodes(4)));
    env.swarms().get_swarm(USER_KEY).await.unwrap();
    env.swarms().clear().await.unwrap();

    assert!(env.swarms().cached(USER_KEY).await.is_none());
    assert!(env.storage.read_swarm(USER_KEY).unwrap().is_empty());

    env.swarms().get_swarm(USER_KEY).await.unwrap();
    assert_eq!(env.fetcher.calls(), 2);
}

#[tokio::test]
async fn test_empty_key_rejected() {
    let env = env(StubFetcher::returning(nodes(4)));
    assert_eq!(
        env.swarms().get_swarm("").await.unwrap_err(),
        SwarmError::InvalidSwarmKey
    );
    assert_eq!(env.fetcher.calls(), 0);
}
