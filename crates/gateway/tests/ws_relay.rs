//! End-to-end tests driving the gateway over a real WebSocket against an
//! in-process platform double.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    secrecy::Secret,
    serde_json::{Value, json},
    tokio::net::TcpListener,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

use {
    guildrelay_common::hooks::HookRegistry,
    guildrelay_config::{RelayConfig, TokenGrant},
    guildrelay_gateway::{GatewayState, StaticTokenAuth, build_gateway_app},
    guildrelay_relay::{
        ChannelInfo, ChannelKind, Endpoint, MemoryDeliveryStore, PlatformClient, PlatformResult,
        Route, SentMessage, formatter::FormattedMessage,
    },
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Accepts every call and hands out sequential message ids.
#[derive(Default)]
struct EchoPlatform {
    sent: Mutex<Vec<FormattedMessage>>,
}

impl EchoPlatform {
    fn record(&self, message: &FormattedMessage) -> SentMessage {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        SentMessage {
            remote_id: format!("r{}", sent.len()),
        }
    }
}

#[async_trait]
impl PlatformClient for EchoPlatform {
    async fn resolve_channel(&self, channel_id: &str) -> PlatformResult<ChannelInfo> {
        Ok(ChannelInfo {
            id: channel_id.to_string(),
            guild_id: Some("g1".into()),
            kind: ChannelKind::Text,
        })
    }

    async fn create_endpoint(&self, channel_id: &str) -> PlatformResult<String> {
        Ok(format!("https://hooks.test/{channel_id}"))
    }

    async fn send_via_endpoint(
        &self,
        _endpoint: &Endpoint,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        Ok(self.record(message))
    }

    async fn send_direct(
        &self,
        _channel_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        Ok(self.record(message))
    }

    async fn edit_message(
        &self,
        _route: &Route,
        remote_id: &str,
        _message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        Ok(SentMessage {
            remote_id: remote_id.to_string(),
        })
    }

    async fn delete_message(&self, _route: &Route, _remote_id: &str) -> PlatformResult<()> {
        Ok(())
    }
}

fn grant(token: &str, user: &str, roles: &[&str]) -> TokenGrant {
    TokenGrant {
        token: Secret::new(token.to_string()),
        user_id: user.into(),
        display_name: None,
        roles: roles.iter().map(|r| r.to_string()).collect(),
    }
}

async fn start_server() -> (SocketAddr, Arc<GatewayState>, Arc<EchoPlatform>) {
    let mut config = RelayConfig::default();
    config.server.max_payload_bytes = 1024;
    let auth = StaticTokenAuth::new(vec![
        grant("tok-alice", "alice", &["staff"]),
        grant("tok-bob", "bob", &[]),
        grant("tok-mirror", "mirror-bot", &["mirror"]),
    ]);
    let platform = Arc::new(EchoPlatform::default());
    let state = Arc::new(GatewayState::new(
        &config,
        Arc::clone(&platform) as Arc<dyn PlatformClient>,
        Arc::new(MemoryDeliveryStore::new()),
        Arc::new(auth),
        Arc::new(HookRegistry::new()),
    ));

    let app = build_gateway_app(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state, platform)
}

async fn connect(addr: SocketAddr, token: &str) -> Socket {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn next_frame(ws: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Connect, consume `ready`, and subscribe to `channel`.
async fn subscribed(addr: SocketAddr, token: &str, channel: &str) -> Socket {
    let mut ws = connect(addr, token).await;
    assert_eq!(next_frame(&mut ws).await["op"], "ready");
    send(&mut ws, json!({"op": "sub", "channels": [{"id": channel}]})).await;
    let resync = next_frame(&mut ws).await;
    assert_eq!(resync["op"], "resync");
    assert_eq!(resync["channel"], channel);
    ws
}

async fn post_mirror(addr: SocketAddr, token: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/mirror"))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_reports_protocol_and_connections() {
    let (addr, _state, _platform) = start_server().await;
    let mut ws = connect(addr, "tok-bob").await;
    assert_eq!(next_frame(&mut ws).await["op"], "ready");

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["protocol"], 1);
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn unauthenticated_upgrade_is_rejected() {
    let (addr, _state, _platform) = start_server().await;
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    assert!(
        connect_async(format!("ws://{addr}/ws?token=nope"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn ready_frame_carries_session() {
    let (addr, _state, _platform) = start_server().await;
    let mut ws = connect(addr, "tok-bob").await;
    let ready = next_frame(&mut ws).await;
    assert_eq!(ready["op"], "ready");
    assert_eq!(ready["protocol"], 1);
    assert!(ready["session"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn send_is_relayed_and_echo_is_discarded() {
    let (addr, _state, platform) = start_server().await;
    let mut alice = subscribed(addr, "tok-alice", "c1").await;
    let mut bob = subscribed(addr, "tok-bob", "c1").await;

    send(
        &mut alice,
        json!({"op": "send", "channel": "c1", "payload": {"action": "create", "content": "hello"}}),
    )
    .await;

    let batch = next_frame(&mut bob).await;
    assert_eq!(batch["op"], "batch");
    assert_eq!(batch["channel"], "c1");
    let event = &batch["events"][0];
    assert_eq!(event["op"], "created");
    assert_eq!(event["sequence"], 1);
    assert_eq!(event["data"]["content"], "hello");
    assert_eq!(event["data"]["remoteId"], "r1");
    let token = event["data"]["correlationToken"].as_str().unwrap().to_string();
    assert_eq!(next_frame(&mut alice).await["events"][0]["sequence"], 1);

    // The platform echoes the relayed message back with the token in a footer.
    let echo = json!({
        "t": "MESSAGE_CREATE",
        "d": {
            "id": "r1",
            "channel_id": "c1",
            "guild_id": "g1",
            "author": {"id": "w1", "username": "alice"},
            "content": "hello",
            "embeds": [{"description": "hello", "footer": {"text": format!("relay-ref:{token}")}}],
        }
    });
    let response = post_mirror(addr, "tok-mirror", echo).await;
    assert_eq!(response.status(), 200);
    let counts: Value = response.json().await.unwrap();
    assert_eq!(counts["discarded"], 1);

    // Nothing else was broadcast: the next frame is the answer to our ping.
    send(&mut bob, json!({"op": "ping"})).await;
    assert_eq!(next_frame(&mut bob).await["op"], "pong");
    assert_eq!(platform.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn external_messages_are_ingested() {
    let (addr, _state, _platform) = start_server().await;
    let mut bob = subscribed(addr, "tok-bob", "c1").await;

    let external = json!([{
        "t": "MESSAGE_CREATE",
        "d": {
            "id": "ext-1",
            "channel_id": "c1",
            "guild_id": "g1",
            "author": {"id": "u9", "username": "carol", "global_name": "Carol"},
            "content": "from the platform",
        }
    }]);
    let counts: Value = post_mirror(addr, "tok-mirror", external)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(counts["ingested"], 1);

    let batch = next_frame(&mut bob).await;
    let event = &batch["events"][0];
    assert_eq!(event["op"], "created");
    assert_eq!(event["data"]["external"], true);
    assert_eq!(event["data"]["author"]["displayName"], "Carol");
    assert_eq!(event["data"]["content"], "from the platform");
}

#[tokio::test]
async fn mirror_requires_the_mirror_role() {
    let (addr, _state, _platform) = start_server().await;
    let body = json!({"t": "MESSAGE_DELETE", "d": {"id": "r1", "channel_id": "c1"}});
    assert_eq!(post_mirror(addr, "tok-bob", body.clone()).await.status(), 401);
    assert_eq!(post_mirror(addr, "tok-mirror", body).await.status(), 200);
    assert_eq!(
        post_mirror(addr, "tok-mirror", json!({"d": {}}))
            .await
            .status(),
        400
    );
}

#[tokio::test]
async fn restricted_channels_are_dropped_silently() {
    let (addr, _state, _platform) = start_server().await;
    let mut bob = connect(addr, "tok-bob").await;
    next_frame(&mut bob).await;

    send(
        &mut bob,
        json!({"op": "sub", "channels": [{"id": "staff-room", "restricted": true}]}),
    )
    .await;
    send(&mut bob, json!({"op": "ping"})).await;
    assert_eq!(next_frame(&mut bob).await["op"], "pong");

    send(
        &mut bob,
        json!({"op": "send", "channel": "staff-room", "payload": {"action": "create", "content": "hi"}}),
    )
    .await;
    let error = next_frame(&mut bob).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "NOT_SUBSCRIBED");
    assert_eq!(error["channel"], "staff-room");

    // Staff can join the same channel.
    let mut alice = connect(addr, "tok-alice").await;
    next_frame(&mut alice).await;
    send(
        &mut alice,
        json!({"op": "sub", "channels": [{"id": "staff-room", "restricted": true}]}),
    )
    .await;
    assert_eq!(next_frame(&mut alice).await["op"], "resync");
}

#[tokio::test]
async fn malformed_and_oversized_frames_get_error_frames() {
    let (addr, _state, _platform) = start_server().await;
    let mut ws = connect(addr, "tok-bob").await;
    next_frame(&mut ws).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await["code"], "INVALID_FRAME");

    let big = json!({"op": "resync", "channel": "x".repeat(2048)});
    send(&mut ws, big).await;
    assert_eq!(next_frame(&mut ws).await["code"], "PAYLOAD_TOO_LARGE");

    // The session survives both.
    send(&mut ws, json!({"op": "ping"})).await;
    assert_eq!(next_frame(&mut ws).await["op"], "pong");
}

#[tokio::test]
async fn invalid_sends_are_rejected_synchronously() {
    let (addr, _state, platform) = start_server().await;
    let mut alice = subscribed(addr, "tok-alice", "c1").await;

    send(
        &mut alice,
        json!({"op": "send", "channel": "c1", "payload": {"action": "create", "content": "x".repeat(9000)}}),
    )
    .await;
    // The frame cap configured for this server is hit before the content cap.
    assert_eq!(next_frame(&mut alice).await["code"], "PAYLOAD_TOO_LARGE");

    send(
        &mut alice,
        json!({"op": "send", "channel": "c1", "payload": {"action": "edit", "messageId": "missing", "content": "x"}}),
    )
    .await;
    let error = next_frame(&mut alice).await;
    assert_eq!(error["code"], "NOT_FOUND");
    assert_eq!(error["channel"], "c1");

    send(
        &mut alice,
        json!({"op": "send", "channel": "c1", "payload": {"action": "create", "content": "   "}}),
    )
    .await;
    assert_eq!(next_frame(&mut alice).await["code"], "INVALID_REQUEST");
    assert!(platform.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ack_and_resync_require_subscription() {
    let (addr, _state, _platform) = start_server().await;
    let mut ws = subscribed(addr, "tok-bob", "c1").await;

    send(&mut ws, json!({"op": "ack", "channel": "c2", "cursor": 3})).await;
    let error = next_frame(&mut ws).await;
    assert_eq!(error["code"], "NOT_SUBSCRIBED");
    assert_eq!(error["channel"], "c2");

    send(&mut ws, json!({"op": "resync", "channel": "c1"})).await;
    let resync = next_frame(&mut ws).await;
    assert_eq!(resync["op"], "resync");
    assert_eq!(resync["cursor"], 0);
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let (addr, state, _platform) = start_server().await;
    let mut ws = connect(addr, "tok-bob").await;
    next_frame(&mut ws).await;

    state.hub.shutdown();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(state.hub.session_count(), 0);
}
