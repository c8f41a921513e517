//! Node WebSocket endpoints.
//!
//! `/node/v1` carries JSON messages in both directions. `/node/v1/stream`
//! carries raw PCM audio in and WAV audio out, and may only connect once the
//! client's `/node/v1` session exists. The client id in the token is the
//! session id for both sockets.

use std::{sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{
            Query, State, WebSocketUpgrade,
            ws::{Message as WsMessage, WebSocket},
        },
        response::Response,
        routing::get,
    },
    futures::{SinkExt, StreamExt},
    hana_protocol::{Message, msg_types},
    hana_voice::{StreamRouter, VoiceError},
    serde::Deserialize,
    serde_json::{Map, Value, json},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{
    auth::{OriginIp, StreamSlot, require_permission},
    error::GatewayError,
    state::GatewayState,
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/node/v1", get(node_socket))
        .route("/node/v1/stream", get(stream_socket))
}

/// Resolve and validate the token of a node socket.
fn authorize_node(
    state: &GatewayState,
    token: &str,
    origin_ip: &str,
) -> Result<String, GatewayError> {
    let client_id = state
        .clients
        .get_client_id(token)
        .map_err(|_| GatewayError::invalid_token())?;
    if !state.clients.validate_auth(token, origin_ip)? {
        return Err(GatewayError::invalid_token());
    }
    require_permission(state, &client_id, "node")?;
    Ok(client_id)
}

fn error_frame(err: &GatewayError) -> String {
    let mut data = Map::new();
    data.insert("error".into(), Value::String(err.to_string()));
    data.insert("status".into(), json!(err.status().as_u16()));
    Message::new(msg_types::GATEWAY_ERROR, data).to_json()
}

// ── Control socket ───────────────────────────────────────────────────────────

async fn node_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    OriginIp(origin_ip): OriginIp,
    Query(TokenQuery { token }): Query<TokenQuery>,
) -> Result<Response, GatewayError> {
    let session_id = authorize_node(&state, &token, &origin_ip)?;
    Ok(ws.on_upgrade(move |socket| run_node_session(socket, state, session_id)))
}

async fn run_node_session(socket: WebSocket, state: Arc<GatewayState>, session_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = state.sessions.new_connection(&session_id, tx.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "node socket read failed");
                break;
            },
        };
        match msg {
            WsMessage::Text(text) => {
                let result = match serde_json::from_str::<Value>(text.as_str()) {
                    Ok(value) => state.backend.handle_client_input(value, &session_id).await,
                    Err(e) => Err(GatewayError::BadRequest(format!("invalid JSON: {e}"))),
                };
                if let Err(e) = result {
                    warn!(session_id = %session_id, error = %e, "rejected node input");
                    let _ = tx.send(error_frame(&e));
                }
            },
            WsMessage::Binary(_) => {
                debug!(session_id = %session_id, "ignoring binary frame on control socket");
            },
            WsMessage::Close(_) => break,
            _ => {},
        }
    }

    state.sessions.end_connection(&session_id, conn_id).await;
    drop(tx);
    finish_writer(writer, &session_id).await;
}

/// Wait for a writer whose senders are gone to flush queued frames, error
/// replies included. Aborts it after [`WRITER_DRAIN_TIMEOUT`].
async fn finish_writer(mut writer: JoinHandle<()>, session_id: &str) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!(session_id, "node socket writer did not drain in time");
        writer.abort();
    }
}

// ── Audio stream socket ──────────────────────────────────────────────────────

async fn stream_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    OriginIp(origin_ip): OriginIp,
    Query(TokenQuery { token }): Query<TokenQuery>,
) -> Result<Response, GatewayError> {
    let session_id = authorize_node(&state, &token, &origin_ip)?;
    state.sessions.wait_for_session(&session_id).await?;
    let slot = StreamSlot::acquire(&state)?;
    Ok(ws.on_upgrade(move |socket| run_stream(socket, state, session_id, slot)))
}

async fn run_stream(
    socket: WebSocket,
    state: Arc<GatewayState>,
    session_id: String,
    slot: StreamSlot,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let router = Arc::new(StreamRouter::new(
        session_id.clone(),
        state.stream_settings.clone(),
        events_tx,
        audio_tx,
    ));
    let consumer = state.backend.spawn_stream_consumer(events_rx);

    if let Err(e) = state
        .sessions
        .attach_stream(Arc::clone(&router), (state.detectors)())
        .await
    {
        warn!(session_id = %session_id, error = %e, "could not attach audio stream");
        consumer.abort();
        drop(slot);
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(clip) = audio_rx.recv().await {
            if ws_tx.send(WsMessage::Binary(clip.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Binary(chunk)) => match router.push_audio(chunk.to_vec()) {
                Ok(()) | Err(VoiceError::QueueFull) => {},
                Err(e) => {
                    info!(session_id = %session_id, error = %e, "audio stream closed under client");
                    break;
                },
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {},
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "stream socket read failed");
                break;
            },
        }
    }

    state.sessions.detach_stream(&session_id, &router).await;
    writer.abort();
    // Events still queued drain to the backend once the router is gone.
    drop(router);
    drop(slot);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::Mutex,
        tokio::time::{Instant, sleep},
    };

    #[tokio::test(start_paused = true)]
    async fn queued_frames_are_written_before_close() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&written);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                sleep(Duration::from_millis(100)).await;
                sink.lock().unwrap().push(frame);
            }
        });

        tx.send("first".into()).unwrap();
        tx.send(error_frame(&GatewayError::BadRequest("bad".into())))
            .unwrap();
        drop(tx);
        finish_writer(writer, "s1").await;

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[1].contains("hana.error"));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_writer_is_aborted() {
        let writer = tokio::spawn(std::future::pending::<()>());
        let started = Instant::now();
        finish_writer(writer, "s1").await;
        assert!(started.elapsed() >= WRITER_DRAIN_TIMEOUT);
    }
}
