//! Poller cycles, lifecycle and failure handling.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use swarmpost_client::poller::{PollErrorDisposition, PollOutcome};
use swarmpost_client::transport::{ResponseInfo, TransportError};
use swarmpost_client::{PollError, PollTarget, Poller, PollerEvent, PollerSettings, ReceivedMessage};
use swarmpost_crypto::{retrieve_verification_data, verify_base64, SigningIdentity};
use swarmpost_protocol::Namespace;
use swarmpost_storage::OpenGroupRow;

use crate::harness::{
    nodes, status, stored_config, stored_message, swarm_store, MockTransport, StubFetcher, TestEnv,
    USER_KEY,
};

fn identity() -> Arc<SigningIdentity> {
    Arc::new(SigningIdentity::from_seed(&[7u8; 32]).unwrap())
}

fn fast_settings() -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
        swarm_refresh_after_failures: 2,
        ..PollerSettings::default()
    }
}

fn user_store() -> HashMap<i32, Vec<Value>> {
    HashMap::from([
        (
            0,
            vec![
                stored_message("m1", 1_700_000_000_001, b"first"),
                stored_message("m2", 1_700_000_000_002, b"second"),
            ],
        ),
        (3, vec![stored_config("c1", b"contacts blob")]),
    ])
}

fn user_poller(env: &TestEnv, identity: Option<Arc<SigningIdentity>>) -> (Poller, tokio::sync::mpsc::Receiver<PollerEvent>) {
    Poller::new(
        PollTarget::UserSwarm {
            public_key: USER_KEY.to_string(),
        },
        env.dispatcher.clone(),
        env.storage.clone(),
        identity,
        fast_settings(),
    )
}

fn swarm_hashes(outcome: &PollOutcome) -> Vec<String> {
    outcome
        .messages
        .iter()
        .filter_map(|m| match m {
            ReceivedMessage::Swarm { hash, .. } | ReceivedMessage::Config { hash, .. } => {
                Some(hash.clone())
            }
            ReceivedMessage::Community { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn test_poll_returns_new_messages_once() {
    let env = TestEnv::new(MockTransport::new(swarm_store(user_store())), StubFetcher::returning(nodes(3)));
    let (poller, _events) = user_poller(&env, Some(identity()));

    let first = poller.poll(true).await.unwrap();
    let mut hashes = swarm_hashes(&first);
    hashes.sort();
    assert_eq!(hashes, vec!["c1", "m1", "m2"]);
    assert_eq!(first.received, 3);

    let envelope = first
        .messages
        .iter()
        .find_map(|m| match m {
            ReceivedMessage::Swarm { hash, envelope, .. } if hash == "m1" => Some(envelope),
            _ => None,
        })
        .unwrap();
    assert_eq!(envelope.content, b"first");
    assert_eq!(envelope.timestamp_ms, 1_700_000_000_001);

    // Dedup records filter the default namespace; the config cursor skips c1.
    let second = poller.poll(true).await.unwrap();
    assert_eq!(second.received, 0);
    assert_eq!(
        env.storage.read_cursor(USER_KEY, Namespace::ConfigContacts.code()).unwrap(),
        Some("c1".to_string())
    );
    assert_eq!(poller.failure_count(), 0);
}

#[tokio::test]
async fn test_retrieve_requests_are_signed() {
    let env = TestEnv::new(MockTransport::new(swarm_store(user_store())), StubFetcher::returning(nodes(3)));
    let id = identity();
    let (poller, _events) = user_poller(&env, Some(id.clone()));
    poller.poll(true).await.unwrap();

    let (_, body) = &env.transport.snode_calls()[0];
    let batch: Value = serde_json::from_slice(body).unwrap();
    let requests = batch["params"]["requests"].as_array().unwrap();
    assert_eq!(requests.len(), Namespace::USER.len());

    for sub in requests {
        let params = &sub["params"];
        assert_eq!(sub["method"], "retrieve");
        assert_eq!(params["pubkey"], USER_KEY);
        assert!(params["max_size"].as_i64().unwrap() < 0);
        let ns = params["namespace"].as_i64().map(|c| c as i32).unwrap_or(0);
        let ns = Namespace::from_code(ns).unwrap();
        let data = retrieve_verification_data(
            &ns.verification_string(),
            params["timestamp"].as_u64().unwrap(),
        );
        verify_base64(
            params["pubkey_ed25519"].as_str().unwrap(),
            &data,
            params["signature"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(params["pubkey_ed25519"], id.public_key_hex());
    }
}

#[tokio::test]
async fn test_background_poll_emits_event() {
    let env = TestEnv::new(MockTransport::new(swarm_store(user_store())), StubFetcher::returning(nodes(3)));
    let (poller, mut events) = user_poller(&env, Some(identity()));

    let outcome = poller.poll(false).await.unwrap();
    assert_eq!(outcome.received, 3);
    assert!(outcome.messages.is_empty());

    match events.recv().await.unwrap() {
        PollerEvent::Messages { target, messages } => {
            assert_eq!(target, *poller.target());
            assert_eq!(messages.len(), 3);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_namespace_is_treated_as_empty() {
    let transport = MockTransport::new(|_, body| {
        let req: Value = serde_json::from_slice(body).unwrap();
        let n = req["params"]["requests"].as_array().unwrap().len();
        let mut results = vec![json!({ "code": 200, "body": { "messages": [stored_message("m1", 5, b"x")] } })];
        results.extend((1..n).map(|_| json!({ "code": 401, "body": "unauthorized" })));
        Ok((ResponseInfo::ok(), Bytes::from(json!({ "results": results }).to_string())))
    });
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));
    let (poller, _events) = user_poller(&env, Some(identity()));

    let outcome = poller.poll(true).await.unwrap();
    assert_eq!(swarm_hashes(&outcome), vec!["m1"]);
}

#[tokio::test]
async fn test_start_is_idempotent_and_restart_is_fresh() {
    let env = TestEnv::new(MockTransport::new(swarm_store(HashMap::new())), StubFetcher::returning(nodes(3)));
    let (poller, _events) = user_poller(&env, Some(identity()));

    assert!(poller.start_if_needed(false));
    assert!(!poller.start_if_needed(false));
    assert_eq!(poller.generation(), 1);
    assert!(poller.is_polling());

    poller.stop();
    assert!(!poller.is_polling());
    assert!(poller.start_if_needed(false));
    assert_eq!(poller.generation(), 2);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(poller.is_polling());
    assert!(!env.transport.snode_calls().is_empty());
    poller.stop();
}

/// Stopping mid-cycle leaves no cursor or dedup record behind, so the next
/// cycle delivers the same messages again.
#[tokio::test]
async fn test_stop_mid_cycle_commits_nothing() {
    let env = TestEnv::new(MockTransport::new(swarm_store(user_store())), StubFetcher::returning(nodes(3)));
    let (poller, mut events) = user_poller(&env, Some(identity()));

    env.transport.hold();
    assert!(poller.start_if_needed(false));
    env.transport.wait_for_snode_calls(1).await;
    poller.stop();
    env.transport.release();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(events.try_recv().is_err());
    assert_eq!(
        env.storage.read_cursor(USER_KEY, Namespace::ConfigContacts.code()).unwrap(),
        None
    );
    let unseen = env
        .storage
        .filter_unseen(USER_KEY, Namespace::Default.code(), &["m1".to_string(), "m2".to_string()])
        .unwrap();
    assert_eq!(unseen.len(), 2);

    let outcome = poller.poll(true).await.unwrap();
    assert_eq!(outcome.received, 3);
}

/// A restart sends its own request instead of waiting on the cancelled one,
/// and only the new generation delivers.
#[tokio::test]
async fn test_restart_after_stop_runs_fresh_cycle() {
    let env = TestEnv::new(MockTransport::new(swarm_store(user_store())), StubFetcher::returning(nodes(3)));
    let (poller, mut events) = user_poller(&env, Some(identity()));

    env.transport.hold();
    assert!(poller.start_if_needed(false));
    env.transport.wait_for_snode_calls(1).await;
    poller.stop();

    assert!(poller.start_if_needed(false));
    assert_eq!(poller.generation(), 2);
    env.transport.wait_for_snode_calls(2).await;
    env.transport.release();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PollerEvent::Messages { messages, .. } => assert_eq!(messages.len(), 3),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(poller.failure_count(), 0);
    poller.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_spawns_one_task() {
    let env = TestEnv::new(MockTransport::new(swarm_store(HashMap::new())), StubFetcher::returning(nodes(3)));
    let (poller, _events) = user_poller(&env, Some(identity()));

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let poller = poller.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            poller.start_if_needed(false)
        }));
    }
    let mut started = 0;
    for h in handles {
        if h.await.unwrap() {
            started += 1;
        }
    }

    assert_eq!(started, 1);
    assert_eq!(poller.generation(), 1);
    assert!(poller.is_polling());
    poller.stop();
}

#[tokio::test]
async fn test_background_start_needs_force() {
    let env = TestEnv::new(MockTransport::new(swarm_store(HashMap::new())), StubFetcher::returning(nodes(3)));
    let (poller, _events) = user_poller(&env, Some(identity()));

    poller.set_foreground(false);
    assert!(!poller.start_if_needed(false));
    assert_eq!(poller.generation(), 0);
    assert!(poller.start_if_needed(true));
    poller.stop();
}

#[tokio::test]
async fn test_missing_identity_stops_poller() {
    let env = TestEnv::new(MockTransport::new(swarm_store(HashMap::new())), StubFetcher::returning(nodes(3)));
    let (poller, mut events) = user_poller(&env, None);

    assert!(poller.start_if_needed(false));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PollerEvent::Stopped { reason, .. } => assert!(reason.contains("identity")),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(env.transport.snode_calls().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!poller.is_polling());
}

#[tokio::test]
async fn test_failures_back_off_and_refresh_swarm() {
    let env = TestEnv::new(
        MockTransport::new(|_, _| Err(status(503))),
        StubFetcher::returning(nodes(3)),
    );
    let (poller, _events) = user_poller(&env, Some(identity()));
    assert_eq!(poller.next_poll_delay(), Duration::from_millis(20));

    let err = poller.poll(true).await.unwrap_err();
    assert!(matches!(err, PollError::Dispatch(_)));
    assert_eq!(poller.handle_poll_error(&err).await, PollErrorDisposition::Transient);
    assert_eq!(poller.failure_count(), 1);
    assert_eq!(poller.next_poll_delay(), Duration::from_millis(40));
    assert!(env.swarms().cached(USER_KEY).await.is_some());

    let err = poller.poll(true).await.unwrap_err();
    poller.handle_poll_error(&err).await;
    assert_eq!(poller.failure_count(), 2);
    assert!(env.swarms().cached(USER_KEY).await.is_none());

    for _ in 0..6 {
        let err = poller.poll(true).await.unwrap_err();
        poller.handle_poll_error(&err).await;
    }
    assert_eq!(poller.next_poll_delay(), Duration::from_millis(200));
    // Each invalidation forces a fresh fetch on the next cycle.
    assert!(env.fetcher.calls() >= 4);
}

#[tokio::test]
async fn test_community_poll_advances_sequence() {
    let transport = MockTransport::with_server(|req| {
        assert!(req.url.ends_with("/room/lobby/messages/since/10"), "{}", req.url);
        let posts = json!([
            { "id": 1, "seqno": 11, "session_id": "15aa", "posted": 1700000000.5, "data": "aGk=" },
            { "id": 2, "seqno": 12, "session_id": "15bb", "posted": 1700000001.0 },
        ]);
        Ok((ResponseInfo::ok(), Some(Bytes::from(posts.to_string()))))
    });
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));
    env.storage
        .write_open_group(&OpenGroupRow {
            server: "https://chat.example".into(),
            room: "lobby".into(),
            public_key: "aa".repeat(32),
            sequence_number: 10,
        })
        .unwrap();

    let (poller, _events) = Poller::new(
        PollTarget::Community {
            server: "https://chat.example".into(),
            room: "lobby".into(),
        },
        env.dispatcher.clone(),
        env.storage.clone(),
        None,
        fast_settings(),
    );
    let outcome = poller.poll(true).await.unwrap();
    assert_eq!(outcome.received, 2);
    assert!(matches!(
        &outcome.messages[0],
        ReceivedMessage::Community { seqno: 11, posted_ms: 1_700_000_000_500, data: Some(d), .. } if d == b"hi"
    ));
    assert!(matches!(
        &outcome.messages[1],
        ReceivedMessage::Community { data: None, .. }
    ));

    let row = env.storage.read_open_group("https://chat.example", "lobby").unwrap().unwrap();
    assert_eq!(row.sequence_number, 12);
}

#[tokio::test]
async fn test_unknown_community_is_terminal() {
    let env = TestEnv::new(
        MockTransport::with_server(|_| Err(TransportError::Timeout)),
        StubFetcher::returning(nodes(3)),
    );
    let (poller, _events) = Poller::new(
        PollTarget::Community {
            server: "https://chat.example".into(),
            room: "nowhere".into(),
        },
        env.dispatcher.clone(),
        env.storage.clone(),
        None,
        fast_settings(),
    );
    let err = poller.poll(true).await.unwrap_err();
    assert_eq!(err.disposition(), PollErrorDisposition::Terminal);
    assert!(env.transport.server_calls().is_empty());
}
