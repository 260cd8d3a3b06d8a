//! Dispatcher routing and retry behaviour against a scripted transport.

use bytes::Bytes;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarmpost_client::transport::{HttpMethod, ResponseInfo, ServerRequest, TransportError};
use swarmpost_client::{DispatchError, Endpoint, PreparedRequest, Target, TimestampRewriter};
use swarmpost_protocol::messages::InfoResponse;

use crate::harness::{node, nodes, ok_json, status, MockTransport, StubFetcher, TestEnv, USER_KEY};

const TIMEOUT: Duration = Duration::from_secs(5);

fn random(retry_count: u8) -> Target {
    Target::RandomSnode {
        swarm_key: USER_KEY.to_string(),
        retry_count,
    }
}

fn body() -> Option<Bytes> {
    Some(Bytes::from_static(b"{\"method\":\"store\",\"params\":{}}"))
}

/// Two failing nodes then a good one: the caller only sees the success.
#[tokio::test]
async fn test_random_snode_retries_on_different_nodes() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = MockTransport::new(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(TransportError::Network("connection reset".into()))
        } else {
            ok_json(json!({ "hash": "abc" }))
        }
    });
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let (info, bytes) = env.dispatcher.send(body(), &random(2), TIMEOUT).await.unwrap();
    assert_eq!(info.code, 200);
    assert_eq!(bytes.unwrap(), Bytes::from(json!({ "hash": "abc" }).to_string()));

    let called = env.transport.nodes_called();
    assert_eq!(called.len(), 3);
    let distinct: HashSet<_> = called.into_iter().collect();
    assert_eq!(distinct.len(), 3, "a failed node must not be retried");
}

#[tokio::test]
async fn test_exhausted_retries_surface_last_error() {
    let transport = MockTransport::new(|_, _| Err(status(502)));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(5)));

    let err = env.dispatcher.send(body(), &random(2), TIMEOUT).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transport(TransportError::Status { code: 502, .. })
    ));
    assert_eq!(env.transport.snode_calls().len(), 3);
}

/// Fewer nodes than attempts: selection runs dry before the retry budget.
#[tokio::test]
async fn test_retries_stop_when_swarm_is_exhausted() {
    let transport = MockTransport::new(|_, _| Err(TransportError::Timeout));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let err = env.dispatcher.send(body(), &random(6), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, DispatchError::Transport(TransportError::Timeout)));
    assert_eq!(env.transport.snode_calls().len(), 3);
}

#[tokio::test]
async fn test_misdirected_node_is_dropped_from_swarm() {
    let bad = Arc::new(std::sync::Mutex::new(None));
    let first = bad.clone();
    let transport = MockTransport::new(move |n, _| {
        let mut first = first.lock().unwrap();
        match first.as_ref() {
            None => {
                *first = Some(n.clone());
                Err(status(421))
            }
            Some(_) => ok_json(json!({})),
        }
    });
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(4)));

    env.dispatcher.send(body(), &random(1), TIMEOUT).await.unwrap();

    let dropped = bad.lock().unwrap().clone().unwrap();
    let cached = env.swarms().cached(USER_KEY).await.unwrap();
    assert_eq!(cached.len(), 3);
    assert!(!cached.contains(&dropped));
    assert!(env
        .storage
        .read_swarm(USER_KEY)
        .unwrap()
        .iter()
        .all(|r| r.ed25519_pubkey != dropped.ed25519_pubkey));
}

#[tokio::test]
async fn test_clearing_swarms_drops_drain_state() {
    let transport = MockTransport::new(|_, _| ok_json(json!({})));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));
    let other = "05cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";

    env.dispatcher.send(body(), &random(0), TIMEOUT).await.unwrap();
    let other_target = Target::RandomSnode {
        swarm_key: other.to_string(),
        retry_count: 0,
    };
    env.dispatcher.send(body(), &other_target, TIMEOUT).await.unwrap();
    assert!(env.dispatcher.drain_behaviour(USER_KEY).is_some());
    assert!(env.dispatcher.drain_behaviour(other).is_some());

    env.dispatcher.invalidate_swarm(USER_KEY).await.unwrap();
    assert!(env.dispatcher.drain_behaviour(USER_KEY).is_none());
    assert!(env.swarms().cached(USER_KEY).await.is_none());
    assert!(env.dispatcher.drain_behaviour(other).is_some());

    env.dispatcher.clear_swarms().await.unwrap();
    assert!(env.dispatcher.drain_behaviour(other).is_none());
    assert!(env.swarms().cached(other).await.is_none());
}

#[tokio::test]
async fn test_clock_out_of_sync_is_not_retried() {
    let transport = MockTransport::new(|_, _| Err(status(406)));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(5)));

    let err = env.dispatcher.send(body(), &random(3), TIMEOUT).await.unwrap_err();
    assert!(err.is_clock_out_of_sync());
    assert_eq!(env.transport.snode_calls().len(), 1);
}

#[tokio::test]
async fn test_node_targets_require_body() {
    let transport = MockTransport::new(|_, _| ok_json(json!({})));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let snode = Target::Snode {
        node: node(1),
        swarm_key: USER_KEY.to_string(),
    };
    for target in [random(2), snode] {
        let err = env.dispatcher.send(None, &target, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPreparedRequest(_)));
    }
    assert!(env.transport.snode_calls().is_empty());
    assert_eq!(env.fetcher.calls(), 0);
}

#[tokio::test]
async fn test_specific_snode_is_not_retried() {
    let transport = MockTransport::new(|_, _| Err(status(500)));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let target = Target::Snode {
        node: node(2),
        swarm_key: USER_KEY.to_string(),
    };
    assert!(env.dispatcher.send(body(), &target, TIMEOUT).await.is_err());
    assert_eq!(env.transport.nodes_called(), vec![node(2)]);
    assert_eq!(env.fetcher.calls(), 0);
}

#[tokio::test]
async fn test_cached_target_skips_transport() {
    let transport = MockTransport::new(|_, _| unreachable!("cached target hit the network"));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let target = Target::Cached {
        info: ResponseInfo {
            code: 203,
            ..Default::default()
        },
        body: Some(Bytes::from_static(b"canned")),
    };
    let (info, bytes) = env.dispatcher.send(None, &target, TIMEOUT).await.unwrap();
    assert_eq!(info.code, 203);
    assert_eq!(bytes.unwrap(), Bytes::from_static(b"canned"));
}

/// The info round trip happens on the chosen node, the body is re-rendered
/// with its time, and the time comes back in the response info.
#[tokio::test]
async fn test_latest_network_time_rewrites_body() {
    const NETWORK_TIME: u64 = 1_700_000_123_456;
    let transport = MockTransport::new(|_, body| {
        let req: serde_json::Value = serde_json::from_slice(body).unwrap();
        if req["method"] == "info" {
            ok_json(json!({ "timestamp": NETWORK_TIME, "version": [2, 8, 0] }))
        } else {
            assert_eq!(req["params"]["timestamp"], NETWORK_TIME);
            ok_json(json!({ "hash": "stored" }))
        }
    });
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let target = Target::RandomSnodeLatestNetworkTime {
        swarm_key: USER_KEY.to_string(),
        retry_count: 2,
        body_with_timestamp: TimestampRewriter::new(|_, ts| {
            Ok(Bytes::from(
                json!({ "method": "store", "params": { "timestamp": ts } }).to_string(),
            ))
        }),
    };
    let (info, _) = env.dispatcher.send(body(), &target, TIMEOUT).await.unwrap();
    assert_eq!(info.network_time_ms, Some(NETWORK_TIME));

    let called = env.transport.nodes_called();
    assert_eq!(called.len(), 2);
    assert_eq!(called[0], called[1], "time must come from the node receiving the request");
}

#[tokio::test]
async fn test_prepared_request_decodes_response() {
    let transport = MockTransport::new(|_, _| ok_json(json!({ "timestamp": 42, "version": [2, 8, 0] })));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let request: PreparedRequest<InfoResponse> =
        PreparedRequest::rpc(random(1), Endpoint::Info, &json!({}), TIMEOUT).unwrap();
    let (_, info) = request.send(&env.dispatcher).await.unwrap();
    assert_eq!(info.timestamp, 42);

    let (_, sent) = &env.transport.snode_calls()[0];
    let sent: serde_json::Value = serde_json::from_slice(sent).unwrap();
    assert_eq!(sent["method"], "info");
}

#[tokio::test]
async fn test_prepared_request_parse_failure() {
    let transport = MockTransport::new(|_, _| Ok((ResponseInfo::ok(), Bytes::from_static(b"not json"))));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let request: PreparedRequest<InfoResponse> =
        PreparedRequest::rpc(random(0), Endpoint::Info, &json!({}), TIMEOUT).unwrap();
    assert!(matches!(
        request.send(&env.dispatcher).await,
        Err(DispatchError::Parsing(_))
    ));
}

#[tokio::test]
async fn test_server_target_goes_to_server() {
    let transport = MockTransport::with_server(|req| {
        assert_eq!(req.url, "https://files.example/capabilities");
        Ok((ResponseInfo::ok(), Some(Bytes::from_static(b"{\"capabilities\":[\"sogs\"]}"))))
    });
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let target = Target::Server(ServerRequest {
        method: HttpMethod::Get,
        url: "https://files.example/capabilities".into(),
        headers: HashMap::new(),
        server_public_key: "aa".repeat(32),
    });
    let request: PreparedRequest<serde_json::Value> = PreparedRequest::new(
        HttpMethod::Get,
        target,
        Endpoint::Server("/capabilities".into()),
        TIMEOUT,
    );
    let (_, value) = request.send(&env.dispatcher).await.unwrap();
    assert_eq!(value["capabilities"][0], "sogs");
    assert_eq!(env.transport.server_calls().len(), 1);
    assert_eq!(env.fetcher.calls(), 0);
}

/// Method and headers set on the prepared request win over the target's.
#[tokio::test]
async fn test_prepared_request_headers_reach_server() {
    let transport = MockTransport::with_server(|_| Ok((ResponseInfo::ok(), Some(Bytes::from_static(b"{}")))));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let target = Target::Server(ServerRequest {
        method: HttpMethod::Get,
        url: "https://chat.example/room/lobby/message".into(),
        headers: HashMap::from([("Accept".to_string(), "application/json".to_string())]),
        server_public_key: "aa".repeat(32),
    });
    let request: PreparedRequest<serde_json::Value> = PreparedRequest::new(
        HttpMethod::Post,
        target,
        Endpoint::Server("/room/lobby/message".into()),
        TIMEOUT,
    )
    .with_header("X-SOGS-Pubkey", "00aa");
    request.send(&env.dispatcher).await.unwrap();

    let sent = &env.transport.server_calls()[0];
    assert_eq!(sent.method, HttpMethod::Post);
    assert_eq!(sent.headers.get("X-SOGS-Pubkey").map(String::as_str), Some("00aa"));
    assert_eq!(sent.headers.get("Accept").map(String::as_str), Some("application/json"));
}

#[tokio::test]
async fn test_upload_unsupported_by_transport() {
    let transport = MockTransport::with_server(|_| Ok((ResponseInfo::ok(), None)));
    let env = TestEnv::new(transport, StubFetcher::returning(nodes(3)));

    let target = Target::ServerUpload(ServerRequest {
        method: HttpMethod::Post,
        url: "https://files.example/file".into(),
        headers: HashMap::new(),
        server_public_key: String::new(),
    });
    let err = env
        .dispatcher
        .send(Some(Bytes::from_static(b"data")), &target, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transport(TransportError::UnsupportedTarget("upload"))
    ));
}
