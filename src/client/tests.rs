use super::*;
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::AtomicBool;

/// In-memory transport: frames the client sends land on `sent_rx`, frames
/// pushed into `inbound_tx` come back out of `receive`.
struct MockTransport {
    connected: AtomicBool,
    fail_connect: bool,
    sent_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    inbound_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
}

struct MockHarness {
    inbound_tx: mpsc::UnboundedSender<String>,
    sent_rx: mpsc::UnboundedReceiver<String>,
}

impl MockTransport {
    fn pair() -> (Arc<MockTransport>, MockHarness) {
        Self::pair_with(false)
    }

    fn pair_with(fail_connect: bool) -> (Arc<MockTransport>, MockHarness) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            connected: AtomicBool::new(false),
            fail_connect,
            sent_tx,
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx: std::sync::Mutex::new(Some(inbound_tx.clone())),
        });
        (transport, MockHarness { inbound_tx, sent_rx })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), McpError> {
        if self.fail_connect {
            return Err(McpError::Connection("mock connect refused".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(McpError::Connection("already connected".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.inbound_tx.lock() {
            guard.take();
        }
    }

    async fn send(&self, frame: &str) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::Connection("mock is not connected".to_string()));
        }
        let _ = self.sent_tx.send(frame.to_string());
        Ok(())
    }

    async fn receive(&self) -> Result<String, McpError> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(McpError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn test_config() -> McpServerConfig {
    McpServerConfig {
        id: "alpha".to_string(),
        transport: Some("stdio".to_string()),
        command: Some("unused".to_string()),
        ..McpServerConfig::default()
    }
}

fn parse_frame(frame: &str) -> Value {
    serde_json::from_str(frame).expect("sent frame should be JSON")
}

fn initialize_response(id: Value, protocol_version: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": protocol_version,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock", "version": "0.0.1"}
        }
    })
    .to_string()
}

/// Connects a client against the mock, answering the handshake with the
/// given protocol version. Returns the harness with the handshake frames
/// already consumed.
async fn ready_client(
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
) -> (Arc<McpClient>, MockHarness) {
    let (transport, mut harness) = MockTransport::pair();
    let client = Arc::new(McpClient::new(test_config(), transport, events));

    let inbound = harness.inbound_tx.clone();
    let driver = tokio::spawn(async move {
        let frame = harness.sent_rx.recv().await.expect("initialize frame");
        let value = parse_frame(&frame);
        assert_eq!(value["method"], "initialize");
        inbound
            .send(initialize_response(value["id"].clone(), "2025-11-25"))
            .expect("handshake response should queue");
        let frame = harness.sent_rx.recv().await.expect("initialized frame");
        let value = parse_frame(&frame);
        assert_eq!(value["method"], "notifications/initialized");
        assert!(value.get("id").is_none());
        harness
    });

    client.connect().await.expect("connect should succeed");
    assert_eq!(client.state(), ClientState::Ready);
    let harness = driver.await.expect("handshake driver should join");
    (client, harness)
}

#[tokio::test]
async fn permuted_response_delivery_resolves_each_caller() {
    let (client, mut harness) = ready_client(None).await;

    let calls: Vec<_> = (0..3)
        .map(|index| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(
                        &format!("probe/{index}"),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
            })
        })
        .collect();

    // Collect the three requests, then answer them in reverse send order.
    let mut sent = Vec::new();
    for _ in 0..3 {
        let frame = harness.sent_rx.recv().await.expect("request frame");
        sent.push(parse_frame(&frame));
    }
    for request in sent.iter().rev() {
        harness
            .inbound_tx
            .send(
                json!({
                    "jsonrpc": "2.0",
                    "id": request["id"].clone(),
                    "result": {"method": request["method"].clone()}
                })
                .to_string(),
            )
            .expect("response should queue");
    }

    for (index, call) in calls.into_iter().enumerate() {
        let value = call
            .await
            .expect("call task should join")
            .expect("call should succeed");
        assert_eq!(value["method"], format!("probe/{index}"));
    }
}

#[tokio::test]
async fn zero_timeout_fails_without_disturbing_other_calls() {
    let (client, mut harness) = ready_client(None).await;

    let err = client
        .call("slow/op", None, Duration::ZERO)
        .await
        .expect_err("zero timeout must expire");
    assert!(matches!(err, McpError::Timeout { .. }));

    // The timed-out entry is gone; a concurrent normal call still resolves.
    let fast = {
        let client = client.clone();
        tokio::spawn(async move { client.call("fast/op", None, Duration::from_secs(5)).await })
    };

    // Skip the slow/op frame (it was still sent), answer fast/op.
    loop {
        let frame = harness.sent_rx.recv().await.expect("request frame");
        let value = parse_frame(&frame);
        if value["method"] == "fast/op" {
            harness
                .inbound_tx
                .send(
                    json!({"jsonrpc": "2.0", "id": value["id"].clone(), "result": {"ok": true}})
                        .to_string(),
                )
                .expect("response should queue");
            break;
        }
    }

    let value = fast
        .await
        .expect("call task should join")
        .expect("fast call should succeed");
    assert_eq!(value["ok"], true);
    assert!(client.pending.lock().await.is_empty());
}

#[tokio::test]
async fn close_fails_every_outstanding_call() {
    let (client, mut harness) = ready_client(None).await;

    let calls: Vec<_> = (0..4)
        .map(|index| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(&format!("hang/{index}"), None, Duration::from_secs(30))
                    .await
            })
        })
        .collect();
    for _ in 0..4 {
        harness.sent_rx.recv().await.expect("request frame");
    }

    client.close().await;
    assert_eq!(client.state(), ClientState::Closed);

    for call in calls {
        let err = call
            .await
            .expect("call task should join")
            .expect_err("pending call must fail on close");
        assert!(matches!(err, McpError::ConnectionClosed));
    }
}

#[tokio::test]
async fn unknown_response_id_is_dropped_without_killing_the_loop() {
    let (client, mut harness) = ready_client(None).await;

    harness
        .inbound_tx
        .send(json!({"jsonrpc": "2.0", "id": 9999, "result": {}}).to_string())
        .expect("stray response should queue");

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("after/stray", None, Duration::from_secs(5)).await })
    };
    let frame = harness.sent_rx.recv().await.expect("request frame");
    let value = parse_frame(&frame);
    harness
        .inbound_tx
        .send(json!({"jsonrpc": "2.0", "id": value["id"].clone(), "result": {"ok": 1}}).to_string())
        .expect("response should queue");

    let value = call
        .await
        .expect("call task should join")
        .expect("call after stray response should succeed");
    assert_eq!(value["ok"], 1);
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn undecodable_frame_fails_the_connection_and_flushes_pending() {
    let (client, mut harness) = ready_client(None).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("doomed", None, Duration::from_secs(30)).await })
    };
    harness.sent_rx.recv().await.expect("request frame");

    harness
        .inbound_tx
        .send("this is not json".to_string())
        .expect("garbage should queue");

    let err = call
        .await
        .expect("call task should join")
        .expect_err("pending call must fail after decode error");
    assert!(matches!(err, McpError::ConnectionClosed));
    assert_eq!(client.state(), ClientState::Failed);
}

#[tokio::test]
async fn rpc_error_response_surfaces_to_the_caller() {
    let (client, mut harness) = ready_client(None).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("tools/call", None, Duration::from_secs(5)).await })
    };
    let frame = harness.sent_rx.recv().await.expect("request frame");
    let value = parse_frame(&frame);
    harness
        .inbound_tx
        .send(
            json!({
                "jsonrpc": "2.0",
                "id": value["id"].clone(),
                "error": {"code": -32602, "message": "bad arguments"}
            })
            .to_string(),
        )
        .expect("error response should queue");

    let err = call
        .await
        .expect("call task should join")
        .expect_err("rpc error must surface");
    match err {
        McpError::Rpc(error) => {
            assert_eq!(error.code, -32602);
            assert_eq!(error.message, "bad arguments");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn unsupported_protocol_version_fails_the_handshake() {
    let (transport, mut harness) = MockTransport::pair();
    let client = McpClient::new(test_config(), transport.clone(), None);

    let inbound = harness.inbound_tx.clone();
    let driver = tokio::spawn(async move {
        let frame = harness.sent_rx.recv().await.expect("initialize frame");
        let value = parse_frame(&frame);
        inbound
            .send(initialize_response(value["id"].clone(), "1999-01-01"))
            .expect("handshake response should queue");
    });

    let err = client.connect().await.expect_err("handshake must fail");
    assert!(matches!(err, McpError::IncompatibleVersion { .. }));
    assert_eq!(client.state(), ClientState::Failed);
    assert!(!transport.is_connected());
    driver.await.expect("driver should join");
}

#[tokio::test]
async fn failed_transport_connect_leaves_the_client_failed() {
    let (transport, _harness) = MockTransport::pair_with(true);
    let client = McpClient::new(test_config(), transport, None);
    let err = client.connect().await.expect_err("connect must fail");
    assert!(matches!(err, McpError::Connection(_)));
    assert_eq!(client.state(), ClientState::Failed);
}

#[tokio::test]
async fn call_before_connect_is_rejected() {
    let (transport, _harness) = MockTransport::pair();
    let client = McpClient::new(test_config(), transport, None);
    let err = client
        .call("ping", None, Duration::from_secs(1))
        .await
        .expect_err("call must be rejected");
    assert!(matches!(err, McpError::Connection(_)));
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let (client, _harness) = ready_client(None).await;
    let err = client.connect().await.expect_err("reconnect must fail");
    assert!(matches!(err, McpError::Connection(_)));
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn notifications_are_forwarded_to_the_event_channel() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (client, harness) = ready_client(Some(events_tx)).await;

    harness
        .inbound_tx
        .send(
            json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}).to_string(),
        )
        .expect("notification should queue");

    let event = events_rx.recv().await.expect("event should arrive");
    assert_eq!(event.server_id, "alpha");
    match event.kind {
        ClientEventKind::Notification { method, .. } => {
            assert_eq!(method, "notifications/tools/list_changed");
        }
        other => panic!("expected notification event, got {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn server_request_without_handler_gets_method_not_found() {
    let (client, mut harness) = ready_client(None).await;

    harness
        .inbound_tx
        .send(
            json!({
                "jsonrpc": "2.0",
                "id": "srv-1",
                "method": "sampling/createMessage",
                "params": {}
            })
            .to_string(),
        )
        .expect("server request should queue");

    let frame = harness.sent_rx.recv().await.expect("auto reply frame");
    let value = parse_frame(&frame);
    assert_eq!(value["id"], "srv-1");
    assert_eq!(value["error"]["code"], crate::message::METHOD_NOT_FOUND);
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn batched_responses_resolve_in_array_order() {
    let (client, mut harness) = ready_client(None).await;

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.call("batch/a", None, Duration::from_secs(5)).await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.call("batch/b", None, Duration::from_secs(5)).await })
    };

    let mut ids = HashMap::new();
    for _ in 0..2 {
        let value = parse_frame(&harness.sent_rx.recv().await.expect("request frame"));
        ids.insert(
            value["method"].as_str().expect("method").to_string(),
            value["id"].clone(),
        );
    }

    harness
        .inbound_tx
        .send(
            json!([
                {"jsonrpc": "2.0", "id": ids["batch/b"], "result": {"tag": "b"}},
                {"jsonrpc": "2.0", "id": ids["batch/a"], "result": {"tag": "a"}}
            ])
            .to_string(),
        )
        .expect("batch should queue");

    let a = first
        .await
        .expect("task should join")
        .expect("call a should succeed");
    let b = second
        .await
        .expect("task should join")
        .expect("call b should succeed");
    assert_eq!(a["tag"], "a");
    assert_eq!(b["tag"], "b");
}

#[tokio::test]
async fn list_tools_follows_cursors_and_caps_the_aggregate() {
    let (client, mut harness) = ready_client(None).await;

    let listing = {
        let client = client.clone();
        tokio::spawn(async move { client.list_tools().await })
    };

    // First page: 60 tools and a cursor; second page: 60 more. The
    // aggregate must stop at the cap with the cursor preserved.
    for (expected_cursor, start) in [(None, 0), (Some("c1"), 60)] {
        let value = parse_frame(&harness.sent_rx.recv().await.expect("list frame"));
        assert_eq!(value["method"], "tools/list");
        let cursor = value
            .get("params")
            .and_then(|params| params.get("cursor"))
            .and_then(Value::as_str);
        assert_eq!(cursor, expected_cursor);
        let tools: Vec<Value> = (start..start + 60)
            .map(|index| json!({"name": format!("tool-{index}")}))
            .collect();
        harness
            .inbound_tx
            .send(
                json!({
                    "jsonrpc": "2.0",
                    "id": value["id"].clone(),
                    "result": {"tools": tools, "nextCursor": format!("c{}", start / 60 + 1)}
                })
                .to_string(),
            )
            .expect("page should queue");
    }

    let listing = listing
        .await
        .expect("task should join")
        .expect("listing should succeed");
    assert_eq!(listing.tools.len(), 100);
    assert_eq!(listing.next_cursor.as_deref(), Some("c2"));
}
