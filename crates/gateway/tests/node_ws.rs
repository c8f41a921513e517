//! Node WebSocket tests against a live listener.

use std::{f32::consts::PI, net::SocketAddr, sync::Arc, time::Duration};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    futures::{SinkExt, StreamExt},
    hana_config::HanaConfig,
    hana_gateway::{GatewayState, InMemoryBus, build_gateway_app},
    hana_protocol::Message,
    secrecy::Secret,
    serde_json::{Map, Value, json},
    tokio::net::{TcpListener, TcpStream},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{Error as WsError, Message as WsMessage},
    },
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config() -> HanaConfig {
    let mut config = HanaConfig::default();
    config.auth.node_username = Some("node".into());
    config.auth.node_password = Some(Secret::new("secret".into()));
    config.streaming.attach_retries = 20;
    config.streaming.attach_retry_interval_ms = 50;
    config
}

async fn spawn_server(config: HanaConfig) -> (SocketAddr, Arc<GatewayState>, Arc<InMemoryBus>) {
    let bus = Arc::new(InMemoryBus::new());
    let state = GatewayState::new(config, bus.clone());
    state.backend.spawn_response_loop().await.unwrap();
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
    (addr, state, bus)
}

fn node_token(state: &GatewayState, client_id: &str) -> String {
    state
        .clients
        .check_auth_request(client_id, "node", Some("secret"), "127.0.0.1")
        .unwrap()
        .access_token
}

async fn connect(addr: SocketAddr, path: &str, token: &str) -> Result<Socket, WsError> {
    connect_async(format!("ws://{addr}{path}?token={token}"))
        .await
        .map(|(socket, _)| socket)
}

fn rejected_status(result: Result<Socket, WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connection was accepted"),
    }
}

async fn next_frame(socket: &mut Socket) -> WsMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if matches!(msg, WsMessage::Text(_) | WsMessage::Binary(_)) {
            return msg;
        }
    }
}

async fn next_json(socket: &mut Socket) -> Value {
    match next_frame(socket).await {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn wait_for_published(bus: &InMemoryBus, msg_type: &str) -> Message {
    for _ in 0..200 {
        if let Some(msg) = bus.published().into_iter().find(|m| m.msg_type == msg_type) {
            return msg;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("nothing published as {msg_type}");
}

async fn wait_for_session(state: &GatewayState, session_id: &str) {
    for _ in 0..200 {
        if state.sessions.contains(session_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session_id} never registered");
}

fn response_for(session_id: &str, data: Value) -> Message {
    let mut context = Map::new();
    context.insert("session".into(), json!({"session_id": session_id}));
    Message::new("klat.response", data.as_object().cloned().unwrap()).with_context(context)
}

/// One second of a loud tone followed by one second of silence, 16 bit LE.
fn spoken_audio() -> Vec<u8> {
    let rate = 16_000;
    let mut pcm = Vec::with_capacity(rate * 4);
    for i in 0..rate {
        let sample = (8000.0 * (2.0 * PI * 440.0 * i as f32 / rate as f32).sin()) as i16;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    pcm.resize(rate * 4, 0);
    pcm
}

#[tokio::test]
async fn control_socket_forwards_input_and_routes_responses() {
    let (addr, state, bus) = spawn_server(config()).await;
    let token = node_token(&state, "node-1");
    let mut socket = connect(addr, "/node/v1", &token).await.unwrap();

    socket
        .send(WsMessage::text(
            json!({
                "type": "recognizer_loop:utterance",
                "data": {"utterances": ["hello"], "lang": "en-us"},
                "context": {},
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let published = wait_for_published(&bus, "recognizer_loop:utterance").await;
    assert_eq!(published.session_id(), Some("node-1"));
    assert_eq!(published.context["client"], "neon_node_websocket");

    bus.respond(response_for(
        "node-1",
        json!({"responses": {"en-us": {"sentence": "Hi", "audio": {}}}}),
    ));
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["msg_type"], "klat.response");
    assert_eq!(frame["data"]["responses"]["en-us"]["sentence"], "Hi");
}

#[tokio::test]
async fn control_socket_reports_bad_input() {
    let (addr, state, bus) = spawn_server(config()).await;
    let token = node_token(&state, "node-1");
    let mut socket = connect(addr, "/node/v1", &token).await.unwrap();

    socket.send(WsMessage::text("not json")).await.unwrap();
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["msg_type"], "hana.error");
    assert_eq!(frame["data"]["status"], 400);

    socket
        .send(WsMessage::text(
            json!({"msg_type": "neon.audio_input", "data": {"lang": "en-us"}}).to_string(),
        ))
        .await
        .unwrap();
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["msg_type"], "hana.error");
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn closing_control_socket_ends_session() {
    let (addr, state, _bus) = spawn_server(config()).await;
    let token = node_token(&state, "node-1");
    let mut socket = connect(addr, "/node/v1", &token).await.unwrap();
    wait_for_session(&state, "node-1").await;

    socket.close(None).await.unwrap();
    for _ in 0..200 {
        if !state.sessions.contains("node-1").await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session outlived its socket");
}

#[tokio::test]
async fn node_socket_requires_node_permission() {
    let (addr, state, _bus) = spawn_server(config()).await;
    let guest = state
        .clients
        .check_auth_request("guest-1", "guest", None, "127.0.0.1")
        .unwrap()
        .access_token;
    assert_eq!(rejected_status(connect(addr, "/node/v1", &guest).await), 401);
    assert_eq!(rejected_status(connect(addr, "/node/v1", "garbage").await), 403);
}

#[tokio::test]
async fn stream_without_control_session_is_unknown() {
    let (addr, state, _bus) = spawn_server(config()).await;
    let token = node_token(&state, "node-1");
    let result = connect(addr, "/node/v1/stream", &token).await;
    assert_eq!(rejected_status(result), 401);
    assert_eq!(state.clients.active_streams(), 0);
}

#[tokio::test]
async fn stream_cap_refuses_extra_streams() {
    let mut config = config();
    config.auth.max_streaming_clients = Some(0);
    let (addr, state, _bus) = spawn_server(config).await;
    let token = node_token(&state, "node-1");
    let _control = connect(addr, "/node/v1", &token).await.unwrap();
    wait_for_session(&state, "node-1").await;

    let result = connect(addr, "/node/v1/stream", &token).await;
    assert_eq!(rejected_status(result), 503);
}

#[tokio::test]
async fn stream_audio_round_trip() {
    let (addr, state, bus) = spawn_server(config()).await;
    let token = node_token(&state, "node-1");
    let _control = connect(addr, "/node/v1", &token).await.unwrap();
    wait_for_session(&state, "node-1").await;

    let mut stream = connect(addr, "/node/v1/stream", &token).await.unwrap();
    for chunk in spoken_audio().chunks(4096) {
        stream.send(WsMessage::binary(chunk.to_vec())).await.unwrap();
    }

    let input = wait_for_published(&bus, "neon.audio_input").await;
    assert_eq!(input.session_id(), Some("node-1"));
    assert_eq!(input.data["lang"], "en-us");
    let wav = STANDARD
        .decode(input.data["audio_data"].as_str().unwrap())
        .unwrap();
    assert_eq!(&wav[..4], b"RIFF");
    assert_eq!(state.clients.active_streams(), 1);

    bus.respond(response_for(
        "node-1",
        json!({"responses": {"en-us": {
            "sentence": "ok",
            "audio": {"female": STANDARD.encode(b"RIFF-reply")},
        }}}),
    ));
    match next_frame(&mut stream).await {
        WsMessage::Binary(bytes) => assert_eq!(bytes.as_ref(), b"RIFF-reply"),
        other => panic!("expected binary frame, got {other:?}"),
    }

    stream.close(None).await.unwrap();
    for _ in 0..200 {
        if state.clients.active_streams() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stream slot was not released");
}
