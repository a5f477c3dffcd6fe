// End-to-end WebSocket flows against an in-process gateway.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_common::protocol::ws::WsMessage;
use parley_gateway::auth::jwt::{current_unix_timestamp, ACCESS_TOKEN_TTL_SECONDS};
use parley_gateway::config::GatewayConfig;
use parley_gateway::run::EventPayload;
use parley_gateway::server::{self, AppState};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
    addr: SocketAddr,
    state: AppState,
}

async fn spawn_gateway(config: GatewayConfig) -> Gateway {
    let state = server::build_state(&config).await.expect("state should build");
    let app = server::build_router(state.clone());
    let listener =
        tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("gateway should serve");
    });
    Gateway { addr, state }
}

async fn spawn_default_gateway() -> Gateway {
    spawn_gateway(GatewayConfig::default()).await
}

impl Gateway {
    fn token_for(&self, user_id: Uuid) -> String {
        self.state
            .verifier
            .issue(user_id, &["read", "write"])
            .expect("token should be issued")
    }

    fn expired_token_for(&self, user_id: Uuid) -> String {
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 60;
        self.state
            .verifier
            .issue_at(user_id, &["read"], issued_at, ACCESS_TOKEN_TTL_SECONDS)
            .expect("token should be issued")
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/v1/ws", self.addr)
    }

    async fn connect_with_bearer_header(&self, token: &str) -> WsClient {
        let mut request =
            self.ws_url().into_client_request().expect("request should build");
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header should build"),
        );
        let (client, _response) =
            connect_async(request).await.expect("websocket handshake should succeed");
        client
    }

    async fn wait_for_registration(&self, user_id: Uuid, connections: usize) {
        wait_for(
            || self.state.registry.user_connection_count(user_id) == connections,
            "connection registration",
        )
        .await;
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn recv_message(client: &mut WsClient) -> WsMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream should yield a frame")
            .expect("frame should be readable");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("frame should decode")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(client: &mut WsClient, payload: serde_json::Value) {
    client
        .send(Message::Text(payload.to_string().into()))
        .await
        .expect("send should succeed");
}

fn rejection_status(error: tokio_tungstenite::tungstenite::Error) -> u16 {
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection before upgrade, got {other:?}"),
    }
}

// ── Authentication ──────────────────────────────────────────────────

#[tokio::test]
async fn valid_token_connects_and_ping_round_trips() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let token = gateway.token_for(user_id);

    let mut client = gateway.connect_with_bearer_header(&token).await;
    gateway.wait_for_registration(user_id, 1).await;

    send_json(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(recv_message(&mut client).await, WsMessage::Pong);
}

#[tokio::test]
async fn credential_failures_are_rejected_uniformly_before_upgrade() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();

    let mut statuses = Vec::new();
    for token in [
        gateway.expired_token_for(user_id),
        "garbage".to_string(),
        format!("{}x", gateway.token_for(user_id)),
    ] {
        let mut request =
            gateway.ws_url().into_client_request().expect("request should build");
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header should build"),
        );
        let error = connect_async(request)
            .await
            .expect_err("invalid credential must refuse the handshake");
        statuses.push(rejection_status(error));
    }

    // Every cause maps to the same refusal; nothing distinguishes them.
    assert_eq!(statuses, vec![401, 401, 401]);
    assert_eq!(gateway.state.registry.connection_count(), 0, "no registry entry is created");
}

#[tokio::test]
async fn missing_credential_is_rejected_before_upgrade() {
    let gateway = spawn_default_gateway().await;

    let request = gateway.ws_url().into_client_request().expect("request should build");
    let error = connect_async(request)
        .await
        .expect_err("anonymous connect must refuse the handshake");
    assert_eq!(rejection_status(error), 401);
}

#[tokio::test]
async fn token_in_query_parameter_authenticates() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let token = gateway.token_for(user_id);

    let url = format!("{}?token={token}", gateway.ws_url());
    let (mut client, _response) =
        connect_async(url).await.expect("query-parameter credential should authenticate");
    gateway.wait_for_registration(user_id, 1).await;

    send_json(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(recv_message(&mut client).await, WsMessage::Pong);
}

#[tokio::test]
async fn token_in_subprotocol_authenticates_and_is_echoed() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let token = gateway.token_for(user_id);
    let subprotocol = format!("bearer.{token}");

    let mut request = gateway.ws_url().into_client_request().expect("request should build");
    request.headers_mut().insert(
        "sec-websocket-protocol",
        HeaderValue::from_str(&subprotocol).expect("header should build"),
    );

    let (_client, response) =
        connect_async(request).await.expect("subprotocol credential should authenticate");
    gateway.wait_for_registration(user_id, 1).await;

    let echoed = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .expect("handshake response must select the credential subprotocol");
    assert_eq!(echoed, subprotocol);
}

#[tokio::test]
async fn bypass_header_connects_only_when_the_gate_is_open() {
    let user_id = Uuid::new_v4();

    let closed = spawn_default_gateway().await;
    let mut request = closed.ws_url().into_client_request().expect("request should build");
    request.headers_mut().insert(
        "x-parley-test-user",
        HeaderValue::from_str(&user_id.to_string()).expect("header should build"),
    );
    let error = connect_async(request)
        .await
        .expect_err("bypass must be inert while the gate is closed");
    assert_eq!(rejection_status(error), 401);

    let open = spawn_gateway(GatewayConfig {
        test_bypass_enabled: true,
        ..GatewayConfig::default()
    })
    .await;
    let mut request = open.ws_url().into_client_request().expect("request should build");
    request.headers_mut().insert(
        "x-parley-test-user",
        HeaderValue::from_str(&user_id.to_string()).expect("header should build"),
    );
    connect_async(request).await.expect("bypass should connect while the gate is open");
    open.wait_for_registration(user_id, 1).await;
}

#[tokio::test]
async fn unsupported_protocol_version_is_refused() {
    let gateway = spawn_default_gateway().await;
    let token = gateway.token_for(Uuid::new_v4());

    let url = format!("{}?token={token}&protocol=parley-chat.v99", gateway.ws_url());
    let error = connect_async(url)
        .await
        .expect_err("unsupported protocol version must refuse the handshake");
    assert_eq!(rejection_status(error), 426);
}

// ── Lifecycle delivery & isolation ──────────────────────────────────

#[tokio::test]
async fn lifecycle_events_arrive_in_order_and_stay_invisible_to_other_users() {
    let gateway = spawn_default_gateway().await;
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();

    let mut client_a = gateway.connect_with_bearer_header(&gateway.token_for(user_a)).await;
    let mut client_b = gateway.connect_with_bearer_header(&gateway.token_for(user_b)).await;
    gateway.wait_for_registration(user_a, 1).await;
    gateway.wait_for_registration(user_b, 1).await;

    let run_id = Uuid::new_v4();
    let invocation_id = Uuid::new_v4();
    let emitter = &gateway.state.emitter;
    emitter.begin_run(run_id, Uuid::new_v4(), user_a).await.expect("begin");
    emitter
        .emit(run_id, EventPayload::Thinking { text: "planning".to_string() })
        .await
        .expect("thinking");
    emitter
        .emit(
            run_id,
            EventPayload::ExecutingTool {
                invocation_id,
                tool_name: "search".to_string(),
                arguments: json!({ "q": "weather" }),
            },
        )
        .await
        .expect("executing_tool");
    emitter
        .emit(run_id, EventPayload::ToolResult { invocation_id, output: json!({ "ok": true }) })
        .await
        .expect("tool_result");
    emitter.emit(run_id, EventPayload::Completed).await.expect("completed");

    let mut types = Vec::new();
    let mut sequences = Vec::new();
    for _ in 0..5 {
        let frame = recv_message(&mut client_a).await;
        assert_eq!(frame.run_id(), Some(run_id));
        types.push(frame.message_type().to_string());
        sequences.push(frame.seq().expect("lifecycle frame should carry seq"));
    }
    assert_eq!(types, vec!["started", "thinking", "executing_tool", "tool_result", "completed"]);
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    // User B, sniffing for anything mentioning A's run, sees nothing.
    let sniffed = tokio::time::timeout(Duration::from_millis(500), client_b.next()).await;
    assert!(sniffed.is_err(), "user B must not observe user A's run events");
}

#[tokio::test]
async fn multiple_devices_of_one_user_each_receive_the_stream() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();

    let mut tab_1 = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    let mut tab_2 = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 2).await;

    let run_id = Uuid::new_v4();
    gateway.state.emitter.begin_run(run_id, Uuid::new_v4(), user_id).await.expect("begin");

    assert_eq!(recv_message(&mut tab_1).await.message_type(), "started");
    assert_eq!(recv_message(&mut tab_2).await.message_type(), "started");
}

// ── Reconnection & outbox replay ────────────────────────────────────

#[tokio::test]
async fn events_generated_while_disconnected_replay_in_order_before_live_traffic() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let run_id = Uuid::new_v4();
    let emitter = &gateway.state.emitter;

    let mut client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    emitter.begin_run(run_id, Uuid::new_v4(), user_id).await.expect("begin");
    emitter
        .emit(run_id, EventPayload::Thinking { text: "before drop".to_string() })
        .await
        .expect("thinking");
    assert_eq!(recv_message(&mut client).await.seq(), Some(1));
    assert_eq!(recv_message(&mut client).await.seq(), Some(2));

    // Forcibly drop the connection mid-run.
    client.close(None).await.expect("close should succeed");
    drop(client);
    wait_for(|| gateway.state.registry.connection_count() == 0, "connection teardown").await;

    // Three more events while disconnected.
    for text in ["offline one", "offline two", "offline three"] {
        emitter
            .emit(run_id, EventPayload::Thinking { text: text.to_string() })
            .await
            .expect("offline thinking");
    }
    assert_eq!(gateway.state.outbox.depth(user_id), 3);

    // Reconnect with the same (still valid) identity: the backlog replays in
    // order before anything new.
    let mut client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    assert_eq!(recv_message(&mut client).await.seq(), Some(3));
    assert_eq!(recv_message(&mut client).await.seq(), Some(4));
    assert_eq!(recv_message(&mut client).await.seq(), Some(5));

    // Live traffic resumes after the replay.
    emitter
        .emit(run_id, EventPayload::Thinking { text: "live again".to_string() })
        .await
        .expect("live thinking");
    assert_eq!(recv_message(&mut client).await.seq(), Some(6));
    assert!(!gateway.state.outbox.has_pending(user_id));
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test]
async fn fifty_concurrent_authentications_with_zero_cross_assignment() {
    let gateway = spawn_default_gateway().await;
    let users: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();

    let mut handles = Vec::new();
    for user_id in users.clone() {
        let token = gateway.token_for(user_id);
        let url = format!("{}?token={token}", gateway.ws_url());
        handles.push(tokio::spawn(async move {
            let (client, _response) =
                connect_async(url).await.expect("concurrent connect should authenticate");
            (user_id, client)
        }));
    }

    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.expect("connect task should complete"));
    }
    assert_eq!(gateway.state.registry.connection_count(), 50);

    // Every user's stream carries only their own identity.
    for (user_id, client) in &mut clients {
        let run_id = Uuid::new_v4();
        gateway
            .state
            .emitter
            .begin_run(run_id, Uuid::new_v4(), *user_id)
            .await
            .expect("begin");
        match recv_message(client).await {
            WsMessage::Started { user_id: delivered_to, run_id: delivered_run, .. } => {
                assert_eq!(delivered_to, *user_id);
                assert_eq!(delivered_run, run_id);
            }
            other => panic!("expected started frame, got {other:?}"),
        }
    }
}

// ── Protocol errors & liveness ──────────────────────────────────────

#[tokio::test]
async fn a_malformed_frame_is_tolerated_and_ping_still_succeeds() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let mut client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    client
        .send(Message::Text("{\"malformed\": json}".to_string().into()))
        .await
        .expect("send should succeed");

    match recv_message(&mut client).await {
        WsMessage::Error { code, .. } => assert_eq!(code, "CHAT_INVALID_MESSAGE"),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_json(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(recv_message(&mut client).await, WsMessage::Pong);
}

#[tokio::test]
async fn sustained_malformed_traffic_closes_the_connection() {
    let gateway = spawn_gateway(GatewayConfig {
        malformed_frame_limit: 3,
        ..GatewayConfig::default()
    })
    .await;
    let user_id = Uuid::new_v4();
    let mut client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    for _ in 0..3 {
        client
            .send(Message::Text("not json".to_string().into()))
            .await
            .expect("send should succeed");
    }

    let mut saw_limit_error = false;
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for teardown");
        match frame {
            Some(Ok(Message::Text(text))) => {
                if text.as_str().contains("CHAT_MALFORMED_LIMIT") {
                    saw_limit_error = true;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
    assert!(saw_limit_error, "teardown must be announced before the close frame");
    wait_for(|| gateway.state.registry.connection_count() == 0, "connection teardown").await;
}

#[tokio::test]
async fn unsupported_client_frames_are_rejected_without_teardown() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let mut client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    // Lifecycle frames are server -> client only.
    send_json(
        &mut client,
        json!({
            "type": "completed",
            "run_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "seq": 1,
            "ts": "2026-08-01T00:00:00Z",
        }),
    )
    .await;

    match recv_message(&mut client).await {
        WsMessage::Error { code, .. } => assert_eq!(code, "CHAT_UNSUPPORTED_MESSAGE"),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_json(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(recv_message(&mut client).await, WsMessage::Pong);
}

#[tokio::test]
async fn mid_connection_reauthentication_acks_same_user_and_rejects_others() {
    let gateway = spawn_default_gateway().await;
    let user_id = Uuid::new_v4();
    let mut client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    send_json(&mut client, json!({ "type": "authenticate", "token": gateway.token_for(user_id) }))
        .await;
    match recv_message(&mut client).await {
        WsMessage::AuthenticateAck { user_id: acked, .. } => assert_eq!(acked, user_id),
        other => panic!("expected authenticate_ack, got {other:?}"),
    }

    // A valid credential for someone else must not rebind the connection.
    let other_token = gateway.token_for(Uuid::new_v4());
    send_json(&mut client, json!({ "type": "authenticate", "token": other_token })).await;
    match recv_message(&mut client).await {
        WsMessage::Error { code, .. } => assert_eq!(code, "AUTH_REJECTED"),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_json(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(recv_message(&mut client).await, WsMessage::Pong);
}

#[tokio::test]
async fn silent_connections_are_declared_dead_and_removed() {
    let gateway = spawn_gateway(GatewayConfig {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(300),
        ..GatewayConfig::default()
    })
    .await;
    let user_id = Uuid::new_v4();
    let client = gateway.connect_with_bearer_header(&gateway.token_for(user_id)).await;
    gateway.wait_for_registration(user_id, 1).await;

    // Never read from the socket: transport pongs stop flowing and the
    // heartbeat monitor declares the connection dead.
    std::mem::forget(client);
    wait_for(|| gateway.state.registry.connection_count() == 0, "heartbeat teardown").await;

    // Later emissions fall through to the outbox instead of a phantom entry.
    let run_id = Uuid::new_v4();
    gateway.state.emitter.begin_run(run_id, Uuid::new_v4(), user_id).await.expect("begin");
    assert_eq!(gateway.state.outbox.depth(user_id), 1);
}
