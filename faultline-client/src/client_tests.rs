use crate::{ClientConfig, ClientError, McpClient};
use faultline_transport::testing::MemoryTransport;
use faultline_transport::{ConnectionState, Target, Transport, TransportError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn connected_client() -> (Arc<MemoryTransport>, McpClient) {
    let memory = Arc::new(MemoryTransport::new());
    memory.connect(&Target::process("fake")).await.unwrap();
    let client = McpClient::new(memory.clone());
    (memory, client)
}

/// Spin until the dispatch task has drained the event it was handed
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn echo_tool_call_resolves_with_the_peer_result_unchanged() {
    let (memory, client) = connected_client().await;
    memory.set_responder(|request| {
        if request["method"] != "tools/call" {
            return None;
        }
        Some(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {"content": [{"type": "text", "text": "hi"}]}
        }))
    });

    let result = client
        .call_tool("echo", Some(json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(result.content.len(), 1);
    assert_eq!(
        result.content[0],
        faultline_protocol::Content::text("hi")
    );
    assert_eq!(client.pending_count(), 0);

    // The outbound envelope carried the tool name and arguments.
    let sent = memory.sent_json();
    assert_eq!(sent[0]["method"], "tools/call");
    assert_eq!(sent[0]["params"]["name"], "echo");
    assert_eq!(sent[0]["params"]["arguments"]["message"], "hi");
}

#[tokio::test]
async fn correlation_ids_are_unique_and_monotonic() {
    let (memory, client) = connected_client().await;
    memory.set_responder(|request| {
        Some(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
    });

    client.request("a", None).await.unwrap();
    client.request("b", None).await.unwrap();
    client.request("c", None).await.unwrap();

    let ids: Vec<i64> = memory
        .sent_json()
        .iter()
        .map(|m| m["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_is_evicted() {
    let (_, client) = connected_client().await;

    let result = client.request("tools/list", None).await;
    match result {
        Err(ClientError::RequestTimeout { method, elapsed_ms }) => {
            assert_eq!(method, "tools/list");
            assert!(elapsed_ms >= 15_000, "elapsed {elapsed_ms}ms");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_is_configurable() {
    let memory = Arc::new(MemoryTransport::new());
    memory.connect(&Target::process("fake")).await.unwrap();
    let client = McpClient::with_config(
        memory.clone(),
        ClientConfig {
            request_timeout: Duration::from_millis(250),
            ..ClientConfig::default()
        },
    );

    let started = tokio::time::Instant::now();
    let result = client.request("ping", None).await;
    assert!(matches!(result, Err(ClientError::RequestTimeout { .. })));
    assert_eq!(started.elapsed(), Duration::from_millis(250));
}

#[tokio::test]
async fn failing_write_evicts_immediately() {
    let (memory, client) = connected_client().await;
    memory.fail_sends(true);

    let result = client.request("ping", None).await;
    match result {
        Err(ClientError::Transport(TransportError::Write(_))) => {}
        other => panic!("expected write error, got {other:?}"),
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn peer_error_objects_surface_as_protocol_errors() {
    let (memory, client) = connected_client().await;
    memory.set_responder(|request| {
        Some(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32601, "message": "Method not found"}
        }))
    });

    let result = client.request("nope/nothing", None).await;
    match result {
        Err(ClientError::Protocol { method, error }) => {
            assert_eq!(method, "nope/nothing");
            assert_eq!(error.code, -32601);
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_error_rejects_every_pending_call() {
    let (memory, client) = connected_client().await;
    let client = Arc::new(client);

    let mut calls = Vec::new();
    for method in ["a", "b", "c"] {
        let client = client.clone();
        calls.push(tokio::spawn(
            async move { client.request(method, None).await },
        ));
    }
    while client.pending_count() < 3 {
        tokio::task::yield_now().await;
    }

    memory.inject_error("wire snapped");

    for call in calls {
        match call.await.unwrap() {
            Err(ClientError::ConnectionLost(reason)) => {
                assert!(reason.contains("wire snapped"));
            }
            other => panic!("expected connection lost, got {other:?}"),
        }
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn transport_close_rejects_pending_calls_naming_the_event() {
    let (memory, client) = connected_client().await;
    let client = Arc::new(client);

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", None).await })
    };
    while client.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    memory.inject_close();

    match call.await.unwrap() {
        Err(ClientError::ConnectionLost(reason)) => assert!(reason.contains("closed")),
        other => panic!("expected connection lost, got {other:?}"),
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_calls_resolve_to_their_own_callers() {
    let (memory, client) = connected_client().await;
    let client = Arc::new(client);

    let mut calls = Vec::new();
    for method in ["m-a", "m-b", "m-c"] {
        let client = client.clone();
        calls.push((
            method,
            tokio::spawn(async move { client.request(method, None).await }),
        ));
    }
    while client.pending_count() < 3 {
        tokio::task::yield_now().await;
    }

    // Answer in reverse arrival order; each response names its request.
    let sent = memory.sent_json();
    for envelope in sent.iter().rev() {
        memory.inject_message(json!({
            "jsonrpc": "2.0",
            "id": envelope["id"],
            "result": {"for": envelope["method"]}
        }));
    }

    for (method, call) in calls {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["for"], method);
    }
}

#[tokio::test]
async fn notifications_fan_out_and_survive_panicking_handlers() {
    let (memory, client) = connected_client().await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    client.on_notification(|_| panic!("handler bug"));
    {
        let seen = seen.clone();
        client.on_notification(move |notification| {
            seen.lock().unwrap().push(notification.method.clone());
        });
    }

    memory.inject_message(json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"progress": 50}
    }));
    settle().await;

    assert_eq!(seen.lock().unwrap().as_slice(), ["notifications/progress"]);
}

#[tokio::test]
async fn unrecognized_response_ids_do_not_disturb_real_calls() {
    let (memory, client) = connected_client().await;

    memory.inject_message(json!({"jsonrpc": "2.0", "id": 999, "result": {}}));
    settle().await;

    memory.set_responder(|request| {
        Some(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}))
    });
    let value = client.request("ping", None).await.unwrap();
    assert_eq!(value["ok"], true);
}

#[tokio::test]
async fn initialize_handshake_sends_the_initialized_notification() {
    let (memory, client) = connected_client().await;
    memory.set_responder(|request| {
        if request["method"] != "initialize" {
            return None;
        }
        Some(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "fixture-server", "version": "1.0.0"}
            }
        }))
    });

    let result = client.initialize().await.unwrap();
    assert_eq!(result.protocol_version, "2025-06-18");
    assert_eq!(result.server_info.name, "fixture-server");

    let sent = memory.sent_json();
    assert_eq!(sent[0]["method"], "initialize");
    assert_eq!(sent[0]["params"]["clientInfo"]["name"], "faultline");
    assert_eq!(sent[1]["method"], "notifications/initialized");
    // The acknowledgement is a notification, not a request.
    assert_eq!(sent[1].get("id"), None);
}

#[tokio::test]
async fn initialize_rejects_an_unsupported_protocol_version() {
    let (memory, client) = connected_client().await;
    memory.set_responder(|request| {
        Some(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "protocolVersion": "1999-01-01",
                "capabilities": {},
                "serverInfo": {"name": "ancient-server", "version": "0.0.1"}
            }
        }))
    });

    let result = client.initialize().await;
    match result {
        Err(ClientError::InvalidResponse { method, reason }) => {
            assert_eq!(method, "initialize");
            assert!(reason.contains("1999-01-01"), "missing version in: {reason}");
        }
        other => panic!("expected invalid response, got {other:?}"),
    }
    // The handshake never completed, so no initialized acknowledgement.
    assert_eq!(memory.sent_json().len(), 1);
}

#[tokio::test]
async fn close_cancels_pending_then_closes_the_transport() {
    let (memory, client) = connected_client().await;
    let client = Arc::new(client);

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", None).await })
    };
    while client.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    client.close().await.unwrap();

    match call.await.unwrap() {
        Err(ClientError::ConnectionLost(reason)) => assert!(reason.contains("client closed")),
        other => panic!("expected connection lost, got {other:?}"),
    }
    assert_eq!(memory.state(), ConnectionState::Disconnected);
}

// End to end: client over the chaos decorator over the memory transport.

#[tokio::test]
async fn chaos_wrapped_client_observes_skewed_timestamps() {
    use faultline_chaos::{ChaosConfig, ChaosContext, ChaosController, ChaosTransport};

    let memory = Arc::new(MemoryTransport::new());
    memory.set_responder(|request| {
        Some(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            // Echo back what actually arrived over the (chaotic) wire.
            "result": {"observed": request["params"]["timestamp"]}
        }))
    });

    let chaos = Arc::new(ChaosTransport::new(
        memory.clone(),
        ChaosController::with_builtin_plugins(),
    ));
    let mut config = ChaosConfig {
        enabled: true,
        seed: 7,
        intensity: 1.25,
        ..ChaosConfig::default()
    };
    config.timing.clock_skew_ms = (500, 500);
    chaos.initialize(&ChaosContext::new(config, "memory")).await;
    chaos.connect(&Target::process("fake")).await.unwrap();

    let client = McpClient::new(chaos);
    let value: Value = client
        .request("log", Some(json!({"timestamp": 1000})))
        .await
        .unwrap();
    // The outbound pipeline shifted the timestamp before the wire.
    assert_eq!(value["observed"], 1500);
}

#[tokio::test]
async fn chaos_drop_surfaces_through_the_client() {
    use faultline_chaos::{ChaosConfig, ChaosContext, ChaosController, ChaosTransport};

    let memory = Arc::new(MemoryTransport::new());
    let chaos = Arc::new(ChaosTransport::new(
        memory.clone(),
        ChaosController::with_builtin_plugins(),
    ));
    let mut config = ChaosConfig {
        enabled: true,
        seed: 42,
        intensity: 1.25,
        ..ChaosConfig::default()
    };
    config.network.drop_probability = 1.0;
    chaos.initialize(&ChaosContext::new(config, "memory")).await;
    chaos.connect(&Target::process("fake")).await.unwrap();

    let client = McpClient::new(chaos);
    let result = client.request("ping", None).await;
    match result {
        Err(ClientError::Transport(TransportError::ChaosInjectedDrop(plugin))) => {
            assert_eq!(plugin, "network");
        }
        other => panic!("expected injected drop, got {other:?}"),
    }
    // The failed write evicted the pending entry.
    assert_eq!(client.pending_count(), 0);
    assert!(memory.sent().is_empty());
}
