//! Registry of node sessions.
//!
//! One entry per session id: the client's outbound frame channel, the last
//! session context reported by the backend, the latest user profile, and the
//! audio stream attached from the secondary socket, if any.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    hana_protocol::Message,
    hana_voice::{Detectors, StreamRouter},
    serde_json::{Map, Value, json},
    tokio::sync::{RwLock, mpsc},
    tracing::{debug, info, warn},
};

use crate::error::GatewayError;

// ── Entry ────────────────────────────────────────────────────────────────────

pub struct SessionEntry {
    pub session_id: String,
    /// Last `context.session` reported by the backend.
    pub context: Map<String, Value>,
    /// Last `context.user_profiles[0]` reported by the backend.
    pub user: Option<Value>,
    pub connected_at: Instant,
    sender: mpsc::UnboundedSender<String>,
    stream: Option<Arc<StreamRouter>>,
    conn_id: u64,
}

impl SessionEntry {
    fn fresh_context(session_id: &str) -> Map<String, Value> {
        let mut context = Map::new();
        context.insert("session_id".into(), Value::String(session_id.to_string()));
        context
    }

    /// Send a serialized frame to the client's write loop.
    pub fn send(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Shut a stream down off the async runtime and wait for its worker to exit.
async fn stop_stream(stream: Arc<StreamRouter>) {
    let session_id = stream.session_id().to_string();
    if tokio::task::spawn_blocking(move || stream.shutdown())
        .await
        .is_err()
    {
        warn!(session_id = %session_id, "stream shutdown task failed");
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_conn: AtomicU64,
    attach_retries: u32,
    attach_interval: Duration,
}

impl SessionRegistry {
    pub fn new(attach_retries: u32, attach_interval: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            attach_retries,
            attach_interval,
        }
    }

    /// Register the control connection for `session_id`, replacing any
    /// previous one. Cached context resets to `{session_id}`. Returns a
    /// connection id for [`Self::end_connection`].
    pub async fn new_connection(
        &self,
        session_id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> u64 {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let entry = SessionEntry {
            session_id: session_id.to_string(),
            context: SessionEntry::fresh_context(session_id),
            user: None,
            connected_at: Instant::now(),
            sender,
            stream: None,
            conn_id,
        };
        let previous = self
            .sessions
            .write()
            .await
            .insert(session_id.to_string(), entry);
        info!(session_id, conn_id, "node session connected");
        if let Some(stream) = previous.and_then(|p| p.stream) {
            stop_stream(stream).await;
        }
        conn_id
    }

    /// Remove a session. Any attached stream is stopped and its worker
    /// joined before this returns.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        let Some(entry) = removed else {
            return false;
        };
        if let Some(stream) = entry.stream {
            stop_stream(stream).await;
        }
        info!(session_id, "node session ended");
        true
    }

    /// End the session only if it still belongs to connection `conn_id`.
    /// A reconnect under the same session id is left alone.
    pub async fn end_connection(&self, session_id: &str, conn_id: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(session_id) {
                Some(entry) if entry.conn_id == conn_id => sessions.remove(session_id),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            debug!(session_id, conn_id, "connection already replaced");
            return false;
        };
        if let Some(stream) = entry.stream {
            stop_stream(stream).await;
        }
        info!(session_id, "node session ended");
        true
    }

    /// Last known session context, or an empty map.
    pub async fn get_session(&self, session_id: &str) -> Map<String, Value> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.context.clone())
            .unwrap_or_default()
    }

    /// Latest user profile for the session, or a guest profile.
    pub async fn get_user_config(&self, session_id: &str) -> Value {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|e| e.user.clone())
            .unwrap_or_else(|| json!({"user": {"username": "guest"}}))
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Apply `context.session` and `context.user_profiles[0]` from a backend
    /// response. Returns false if the response names no known session.
    pub async fn update_from_response(&self, message: &Message) -> bool {
        let Some(session_id) = message.session_id() else {
            return false;
        };
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        if let Some(Value::Object(session)) = message.context.get("session") {
            entry.context = session.clone();
        }
        if let Some(profile) = message
            .context
            .get("user_profiles")
            .and_then(Value::as_array)
            .and_then(|p| p.first())
        {
            entry.user = Some(profile.clone());
        }
        true
    }

    /// Forward a message to the client owning its session.
    pub async fn send_to_client(&self, message: &Message) -> bool {
        let Some(session_id) = message.session_id() else {
            return false;
        };
        self.send_frame(session_id, message.to_json()).await
    }

    pub async fn send_frame(&self, session_id: &str, frame: String) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(entry) => entry.send(frame),
            None => false,
        }
    }

    // ── Streams ──────────────────────────────────────────────────────────────

    /// Poll for the control session, `attach_retries` times after the first
    /// check with `attach_interval` between polls.
    pub async fn wait_for_session(&self, session_id: &str) -> Result<(), GatewayError> {
        for attempt in 0..=self.attach_retries {
            if self.contains(session_id).await {
                return Ok(());
            }
            if attempt < self.attach_retries {
                debug!(session_id, attempt, "waiting for control session");
                tokio::time::sleep(self.attach_interval).await;
            }
        }
        warn!(session_id, "no control session for stream");
        Err(GatewayError::SessionNotFound(session_id.to_string()))
    }

    /// Attach `stream` to its session and start it. A stream already attached
    /// to the session is stopped first.
    pub async fn attach_stream(
        &self,
        stream: Arc<StreamRouter>,
        detectors: Detectors,
    ) -> Result<(), GatewayError> {
        let session_id = stream.session_id().to_string();
        stream.begin_attach();
        if let Err(e) = self.wait_for_session(&session_id).await {
            stop_stream(stream).await;
            return Err(e);
        }

        let previous = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(&session_id) else {
                drop(sessions);
                stop_stream(stream).await;
                return Err(GatewayError::SessionNotFound(session_id));
            };
            entry.stream.replace(Arc::clone(&stream))
        };
        if let Some(old) = previous {
            info!(session_id = %session_id, "replacing attached stream");
            stop_stream(old).await;
        }

        if let Err(e) = stream.start(detectors) {
            self.detach_stream(&session_id, &stream).await;
            return Err(GatewayError::Backend(format!("start stream: {e}")));
        }
        Ok(())
    }

    /// Detach and stop `stream` if it is still the one attached.
    pub async fn detach_stream(&self, session_id: &str, stream: &Arc<StreamRouter>) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(session_id)
                && entry
                    .stream
                    .as_ref()
                    .is_some_and(|s| Arc::ptr_eq(s, stream))
            {
                entry.stream = None;
            }
        }
        stop_stream(Arc::clone(stream)).await;
    }

    pub async fn stream_for(&self, session_id: &str) -> Option<Arc<StreamRouter>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|e| e.stream.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stream_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| e.stream.is_some())
            .count()
    }

    /// Drop every session, stopping all streams.
    pub async fn clear(&self) {
        let drained: Vec<SessionEntry> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, e)| e)
            .collect();
        for stream in drained.into_iter().filter_map(|e| e.stream) {
            stop_stream(stream).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        hana_voice::{StreamSettings, StreamState},
    };

    fn registry() -> SessionRegistry {
        SessionRegistry::new(3, Duration::from_secs(1))
    }

    fn router(session_id: &str) -> Arc<StreamRouter> {
        let (events, _) = mpsc::unbounded_channel();
        let (audio_out, _) = mpsc::unbounded_channel();
        Arc::new(StreamRouter::new(
            session_id,
            StreamSettings::default(),
            events,
            audio_out,
        ))
    }

    fn response(session_id: &str, session: Value) -> Message {
        let mut session = session;
        session["session_id"] = json!(session_id);
        Message::new("klat.response", Map::new()).with_context(
            json!({
                "session": session,
                "user_profiles": [{"user": {"username": "neon"}}],
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn new_connection_resets_context() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.new_connection("s1", tx.clone()).await;
        assert!(reg.update_from_response(&response("s1", json!({"turn": 3}))).await);
        assert_eq!(reg.get_session("s1").await["turn"], 3);

        reg.new_connection("s1", tx).await;
        let ctx = reg.get_session("s1").await;
        assert_eq!(Value::Object(ctx), json!({"session_id": "s1"}));
        assert!(reg.get_session("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn update_tracks_user_profile() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.new_connection("s1", tx).await;
        assert_eq!(reg.get_user_config("s1").await["user"]["username"], "guest");
        reg.update_from_response(&response("s1", json!({}))).await;
        assert_eq!(reg.get_user_config("s1").await["user"]["username"], "neon");
        assert!(!reg.update_from_response(&response("other", json!({}))).await);
    }

    #[tokio::test]
    async fn send_to_client_routes_by_session() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.new_connection("s1", tx).await;
        assert!(reg.send_to_client(&response("s1", json!({}))).await);
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("klat.response"));
        assert!(!reg.send_to_client(&response("s2", json!({}))).await);
    }

    #[tokio::test]
    async fn stale_connection_does_not_end_new_one() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = reg.new_connection("s1", tx.clone()).await;
        let second = reg.new_connection("s1", tx).await;
        assert!(!reg.end_connection("s1", first).await);
        assert!(reg.contains("s1").await);
        assert!(reg.end_connection("s1", second).await);
        assert!(!reg.contains("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_to_unknown_session_fails_after_retries() {
        let reg = registry();
        let stream = router("ghost");
        let start = tokio::time::Instant::now();
        let err = reg
            .attach_stream(Arc::clone(&stream), Detectors::energy(500.0))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(ref id) if id == "ghost"));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_waits_for_late_control_session() {
        let reg = Arc::new(registry());
        let stream = router("late");
        let attach = {
            let reg = Arc::clone(&reg);
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { reg.attach_stream(stream, Detectors::energy(500.0)).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.new_connection("late", tx).await;
        attach.await.unwrap().unwrap();
        assert_eq!(stream.state(), StreamState::Active);
        assert_eq!(reg.stream_count().await, 1);
        reg.end_session("late").await;
    }

    #[tokio::test]
    async fn end_session_stops_stream() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.new_connection("s1", tx).await;
        let stream = router("s1");
        reg.attach_stream(Arc::clone(&stream), Detectors::energy(500.0))
            .await
            .unwrap();
        assert_eq!(stream.state(), StreamState::Active);

        assert!(reg.end_session("s1").await);
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.push_audio(vec![0; 4]).is_err());
        assert_eq!(reg.session_count().await, 0);
    }

    #[tokio::test]
    async fn reattach_replaces_previous_stream() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.new_connection("s1", tx).await;
        let first = router("s1");
        let second = router("s1");
        reg.attach_stream(Arc::clone(&first), Detectors::energy(500.0))
            .await
            .unwrap();
        reg.attach_stream(Arc::clone(&second), Detectors::energy(500.0))
            .await
            .unwrap();
        assert_eq!(first.state(), StreamState::Stopped);
        assert!(Arc::ptr_eq(&reg.stream_for("s1").await.unwrap(), &second));

        // Detaching the stale one leaves the current stream in place.
        reg.detach_stream("s1", &first).await;
        assert!(reg.stream_for("s1").await.is_some());
        reg.detach_stream("s1", &second).await;
        assert!(reg.stream_for("s1").await.is_none());
        assert_eq!(second.state(), StreamState::Stopped);
    }
}
