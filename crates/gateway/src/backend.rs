//! Translation between node sessions and backend messages.
//!
//! [`MessageGateway`] enriches node inputs with the gateway's context before
//! publishing them, routes backend responses back to the owning session, and
//! implements the request/response calls behind the assist endpoints.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    futures::StreamExt,
    hana_auth::now_ts,
    hana_config::MqConfig,
    hana_protocol::{
        Envelope, GetResponseRequest, KlatResponseData, Message, MessageKind, SttRequest,
        TtsRequest, msg_types,
    },
    hana_voice::StreamEvent,
    serde_json::{Map, Value, json},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{bus::MessageBus, error::GatewayError, sessions::SessionRegistry};

/// Client name reported in the context of every node input.
const CLIENT: &str = "neon_node_websocket";
/// Source tag on assist requests.
const SOURCE: &str = "hana";

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub struct MessageGateway {
    bus: Arc<dyn MessageBus>,
    sessions: Arc<SessionRegistry>,
    /// Routing key for responses addressed to this gateway.
    client_id: String,
    client_name: String,
    request_subject: String,
    timeout: Duration,
    stt_max_length: usize,
    tts_max_words: usize,
    /// Backend session context per device, for `get_response`.
    device_sessions: std::sync::Mutex<HashMap<String, Value>>,
}

impl MessageGateway {
    pub fn new(bus: Arc<dyn MessageBus>, sessions: Arc<SessionRegistry>, mq: &MqConfig) -> Self {
        let client_id = mq
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            bus,
            sessions,
            client_name: format!("hana-{client_id}"),
            client_id,
            request_subject: mq.request_subject.clone(),
            timeout: mq.timeout(),
            stt_max_length: mq.stt_max_length_encoded,
            tts_max_words: mq.tts_max_words,
            device_sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn ident(&self) -> String {
        format!("{}{}", self.client_id, now_ts())
    }

    // ── Node input ───────────────────────────────────────────────────────────

    /// Parse a JSON frame from a node client and forward it.
    pub async fn handle_client_input(
        &self,
        value: Value,
        session_id: &str,
    ) -> Result<(), GatewayError> {
        let message =
            Message::from_client(value).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        if matches!(
            message.kind(),
            MessageKind::AudioInput
                | MessageKind::GetStt
                | MessageKind::GetTts
                | MessageKind::Utterance
        ) {
            Envelope::try_from(&message).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        }
        self.forward_input(message, session_id).await
    }

    /// Enrich a node input with the gateway context and publish it.
    pub async fn forward_input(
        &self,
        mut message: Message,
        session_id: &str,
    ) -> Result<(), GatewayError> {
        let mut context = std::mem::take(&mut message.context);
        for (key, value) in self.default_context(session_id).await {
            context.insert(key, value);
        }
        context.insert(
            "session".into(),
            Value::Object(self.sessions.get_session(session_id).await),
        );
        message.context = context;
        debug!(session_id, msg_type = %message.msg_type, "forwarding node input");
        self.bus.publish(&message).await
    }

    async fn default_context(&self, session_id: &str) -> Map<String, Value> {
        let user_config = self.sessions.get_user_config(session_id).await;
        let username = user_config["user"]["username"].clone();
        object(json!({
            "client_name": self.client_name,
            "client": CLIENT,
            "ident": self.ident(),
            "username": username,
            "user_profiles": [user_config],
            "neon_should_respond": true,
            "timing": {},
            "mq": {
                "routing_key": self.client_id,
                "message_id": uuid::Uuid::new_v4().to_string(),
            },
        }))
    }

    /// Tell the client that its stream heard a wake word.
    pub async fn handle_ww_detected(&self, session_id: &str, ww_context: Map<String, Value>) {
        let mut context = Map::new();
        context.insert(
            "session".into(),
            Value::Object(self.sessions.get_session(session_id).await),
        );
        let message = Message::new(msg_types::WW_DETECTED, ww_context).with_context(context);
        if !self.sessions.send_to_client(&message).await {
            debug!(session_id, "wake word for disconnected session");
        }
    }

    pub async fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::WakeWord {
                session_id,
                context,
            } => self.handle_ww_detected(&session_id, context).await,
            StreamEvent::Utterance {
                session_id,
                message,
            } => {
                if let Err(e) = self.forward_input(message, &session_id).await {
                    warn!(session_id = %session_id, error = %e, "failed to forward stream utterance");
                }
            },
        }
    }

    // ── Backend responses ────────────────────────────────────────────────────

    /// Route one backend message to its session.
    pub async fn handle_response(&self, message: Message) {
        match message.kind() {
            MessageKind::KlatResponse => {
                self.sessions.update_from_response(&message).await;
                let stream = match message.session_id() {
                    Some(id) => self.sessions.stream_for(id).await,
                    None => None,
                };
                if let Some(stream) = stream {
                    let audio = KlatResponseData::from_data(&message.data);
                    let sent = stream.deliver_response_audio(&audio);
                    debug!(session_id = %stream.session_id(), frames = sent, "delivered response audio");
                }
            },
            MessageKind::IntentFailure => {
                self.sessions.update_from_response(&message).await;
            },
            MessageKind::ApiResponse(request) if request == msg_types::AUDIO_INPUT => {
                info!(transcripts = %message.data.get("transcripts").unwrap_or(&serde_json::Value::Null), "audio input transcribed");
            },
            _ => {},
        }
        if !self.sessions.send_to_client(&message).await {
            warn!(
                msg_type = %message.msg_type,
                session_id = message.session_id().unwrap_or_default(),
                "response for unknown session"
            );
        }
    }

    /// Consume backend messages until the bus closes.
    pub async fn spawn_response_loop(self: &Arc<Self>) -> Result<JoinHandle<()>, GatewayError> {
        let mut responses = self.bus.responses().await?;
        let gateway = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = responses.next().await {
                gateway.handle_response(message).await;
            }
            info!("backend response stream closed");
        }))
    }

    /// Forward events from one audio stream until it closes.
    pub fn spawn_stream_consumer(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                gateway.handle_stream_event(event).await;
            }
        })
    }

    // ── Assist calls ─────────────────────────────────────────────────────────

    async fn call(&self, payload: Value) -> Result<Value, GatewayError> {
        self.bus
            .call(&self.request_subject, payload, self.timeout)
            .await
    }

    pub async fn get_stt(&self, req: &SttRequest) -> Result<Value, GatewayError> {
        if self.stt_max_length > 0 && req.encoded_audio.len() > self.stt_max_length {
            return Err(GatewayError::BadRequest(format!(
                "Audio exceeds maximum encoded length of {}",
                self.stt_max_length
            )));
        }
        let payload = json!({
            "msg_type": msg_types::GET_STT,
            "data": {
                "audio_data": req.encoded_audio,
                "utterances": [""],
                "lang": req.lang_code,
            },
            "context": {"source": SOURCE, "ident": self.ident()},
        });
        let mut response = self.call(payload).await?;
        match response.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => Err(GatewayError::Backend("STT response has no data".into())),
        }
    }

    pub async fn get_tts(&self, req: &TtsRequest) -> Result<Value, GatewayError> {
        if self.tts_max_words > 0 && req.to_speak.split_whitespace().count() > self.tts_max_words {
            return Err(GatewayError::BadRequest(format!(
                "Text exceeds maximum word count of {}",
                self.tts_max_words
            )));
        }
        let payload = json!({
            "msg_type": msg_types::GET_TTS,
            "data": {
                "text": req.to_speak,
                "utterance": "",
                "speaker": {"name": "Neon", "gender": req.gender, "lang": req.lang_code},
                "lang": req.lang_code,
            },
            "context": {"source": SOURCE, "ident": self.ident()},
        });
        let response = self.call(payload).await?;
        let audio = response["data"][req.lang_code.as_str()]["audio"][req.gender.as_str()].clone();
        if audio.is_null() {
            return Err(GatewayError::Backend(format!(
                "no {} audio for {} in TTS response",
                req.gender, req.lang_code
            )));
        }
        Ok(json!({ "encoded_audio": audio }))
    }

    /// Cached backend session for a device, seeded with its site id.
    fn device_session(&self, device_id: &str, node_data: &Value) -> Value {
        self.device_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id.to_string())
            .or_insert_with(|| {
                json!({
                    "session_id": device_id,
                    "site_id": node_data["location"]["site_id"],
                })
            })
            .clone()
    }

    /// Ask the backend for a text answer to `req.utterance`. `fallback_id`
    /// stands in for the device id when the request carries none.
    pub async fn get_response(
        &self,
        req: &GetResponseRequest,
        fallback_id: &str,
    ) -> Result<Value, GatewayError> {
        let node_data = req.node_data.clone().unwrap_or_else(|| json!({}));
        let device_id = node_data["device_id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .unwrap_or(fallback_id)
            .to_string();
        let session = self.device_session(&device_id, &node_data);

        let mut profile = req
            .user_profile
            .clone()
            .unwrap_or_else(|| json!({"user": {}}));
        let username = match profile["user"]["username"].as_str() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.client_id.clone(),
        };
        if let Some(user) = profile.get_mut("user").and_then(Value::as_object_mut) {
            user.insert("username".into(), Value::String(username.clone()));
        }

        let payload = json!({
            "msg_type": msg_types::UTTERANCE,
            "data": {"utterances": [req.utterance], "lang": req.lang_code},
            "context": {
                "username": username,
                "user_profiles": [profile],
                "source": SOURCE,
                "session": session,
                "node_data": node_data,
                "ident": self.ident(),
            },
        });
        let response = self.call(payload).await?;

        if let Some(updated) = response["context"].get("session").filter(|s| s.is_object()) {
            self.device_sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(device_id, updated.clone());
        }
        let sentence = response["data"]["responses"][req.lang_code.as_str()]["sentence"].clone();
        if sentence.is_null() {
            return Err(GatewayError::Backend(format!(
                "no {} response in backend reply",
                req.lang_code
            )));
        }
        Ok(json!({ "answer": sentence, "lang_code": req.lang_code }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    fn setup(mq: MqConfig) -> (Arc<InMemoryBus>, Arc<SessionRegistry>, Arc<MessageGateway>) {
        let bus = Arc::new(InMemoryBus::new());
        let sessions = Arc::new(SessionRegistry::new(0, Duration::from_millis(10)));
        let gateway = Arc::new(MessageGateway::new(
            bus.clone(),
            Arc::clone(&sessions),
            &mq,
        ));
        (bus, sessions, gateway)
    }

    fn mq() -> MqConfig {
        MqConfig {
            client_id: Some("gw1".into()),
            default_timeout: 1,
            ..MqConfig::default()
        }
    }

    #[tokio::test]
    async fn forward_input_injects_context() {
        let (bus, sessions, gateway) = setup(mq());
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.new_connection("node-1", tx).await;

        gateway
            .handle_client_input(
                json!({
                    "type": "recognizer_loop:utterance",
                    "data": {"utterances": ["what time is it"], "lang": "en-us"},
                    "context": {"client": "spoofed", "custom": 1},
                }),
                "node-1",
            )
            .await
            .unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        let ctx = &published[0].context;
        assert_eq!(ctx["client"], CLIENT);
        assert_eq!(ctx["custom"], 1);
        assert_eq!(ctx["session"], json!({"session_id": "node-1"}));
        assert_eq!(ctx["mq"]["routing_key"], "gw1");
        assert_eq!(ctx["username"], "guest");
        assert_eq!(ctx["neon_should_respond"], true);
    }

    #[tokio::test]
    async fn malformed_known_input_is_rejected() {
        let (bus, _sessions, gateway) = setup(mq());
        let err = gateway
            .handle_client_input(
                json!({"msg_type": "neon.get_tts", "data": {"lang": "en-us"}}),
                "node-1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(bus.published().is_empty());

        // Unknown types pass through untouched.
        gateway
            .handle_client_input(json!({"msg_type": "skill.custom", "data": {"x": 1}}), "node-1")
            .await
            .unwrap();
        assert_eq!(bus.published()[0].data["x"], 1);
    }

    #[tokio::test]
    async fn klat_response_updates_session_and_reaches_client() {
        let (_bus, sessions, gateway) = setup(mq());
        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.new_connection("node-1", tx).await;

        let response = Message::new(
            msg_types::KLAT_RESPONSE,
            object(json!({"responses": {"en-us": {"sentence": "It is noon", "audio": {}}}})),
        )
        .with_context(object(json!({
            "session": {"session_id": "node-1", "turns": 1},
            "user_profiles": [{"user": {"username": "daniel"}}],
        })));
        gateway.handle_response(response).await;

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["msg_type"], "klat.response");
        assert_eq!(sessions.get_session("node-1").await["turns"], 1);
        assert_eq!(
            sessions.get_user_config("node-1").await["user"]["username"],
            "daniel"
        );
    }

    #[tokio::test]
    async fn get_tts_enforces_word_limit() {
        let (_bus, _sessions, gateway) = setup(MqConfig {
            tts_max_words: 2,
            ..mq()
        });
        let err = gateway
            .get_tts(&TtsRequest {
                to_speak: "one two three".into(),
                lang_code: "en-us".into(),
                gender: "female".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Text exceeds maximum word count of 2");
    }

    #[tokio::test]
    async fn get_tts_extracts_requested_voice() {
        let (bus, _sessions, gateway) = setup(mq());
        bus.on_call("neon_chat_api_request", |payload| {
            assert_eq!(payload["data"]["speaker"]["gender"], "male");
            Some(json!({"data": {"en-us": {"audio": {"male": "UklGRg==", "female": "x"}}}}))
        });
        let out = gateway
            .get_tts(&TtsRequest {
                to_speak: "hello".into(),
                lang_code: "en-us".into(),
                gender: "male".into(),
            })
            .await
            .unwrap();
        assert_eq!(out, json!({"encoded_audio": "UklGRg=="}));
    }

    #[tokio::test(start_paused = true)]
    async fn get_stt_times_out() {
        let (_bus, _sessions, gateway) = setup(mq());
        let err = gateway
            .get_stt(&SttRequest {
                encoded_audio: "AAAA".into(),
                lang_code: "en-us".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendTimeout { .. }));
    }

    #[tokio::test]
    async fn get_response_caches_device_session() {
        let (bus, _sessions, gateway) = setup(mq());
        bus.on_call("neon_chat_api_request", |payload| {
            let turn = payload["context"]["session"]["turn"].as_u64().unwrap_or(0);
            Some(json!({
                "data": {"responses": {"en-us": {"sentence": format!("turn {turn}")}}},
                "context": {"session": {"session_id": "dev-1", "turn": turn + 1}},
            }))
        });
        let req = GetResponseRequest {
            utterance: "hi".into(),
            lang_code: "en-us".into(),
            user_profile: None,
            node_data: Some(json!({"device_id": "dev-1", "location": {"site_id": "home"}})),
        };
        let first = gateway.get_response(&req, "client-a").await.unwrap();
        assert_eq!(first, json!({"answer": "turn 0", "lang_code": "en-us"}));
        let second = gateway.get_response(&req, "client-a").await.unwrap();
        assert_eq!(second["answer"], "turn 1");
    }
}
