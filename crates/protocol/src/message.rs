use {
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::{Map, Value},
};

use crate::{ProtocolError, msg_types};

// ── Raw message ──────────────────────────────────────────────────────────────

/// A bus message as it travels over the node socket and the backend queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(alias = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Message {
    pub fn new(msg_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Parse client input, accepting either `type` or `msg_type` for the
    /// message type. `type` wins when both are present.
    pub fn from_client(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let msg_type = match obj.remove("type") {
            Some(Value::String(t)) => t,
            _ => match obj.remove("msg_type") {
                Some(Value::String(t)) => t,
                _ => return Err(ProtocolError::MissingType),
            },
        };
        let data = match obj.remove("data") {
            Some(Value::Object(d)) => d,
            _ => Map::new(),
        };
        let context = match obj.remove("context") {
            Some(Value::Object(c)) => c,
            _ => Map::new(),
        };
        Ok(Self {
            msg_type,
            data,
            context,
        })
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::of(&self.msg_type)
    }

    /// Session id carried in `context.session.session_id`, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.context
            .get("session")
            .and_then(|s| s.get("session_id"))
            .and_then(Value::as_str)
    }

    /// Serialize to the JSON text sent to node clients.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|source| {
            ProtocolError::InvalidPayload {
                msg_type: self.msg_type.clone(),
                source,
            }
        })
    }
}

// ── Message kinds ────────────────────────────────────────────────────────────

/// Classification of a message type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    AudioInput,
    GetStt,
    GetTts,
    Utterance,
    WakeWordDetected,
    KlatResponse,
    IntentFailure,
    KlatError,
    ClearData,
    AlertExpired,
    /// `<request>.response` reply to an API-style request.
    ApiResponse(String),
    Other(String),
}

impl MessageKind {
    pub fn of(msg_type: &str) -> Self {
        match msg_type {
            msg_types::AUDIO_INPUT => Self::AudioInput,
            msg_types::GET_STT => Self::GetStt,
            msg_types::GET_TTS => Self::GetTts,
            msg_types::UTTERANCE => Self::Utterance,
            msg_types::WW_DETECTED => Self::WakeWordDetected,
            msg_types::KLAT_RESPONSE => Self::KlatResponse,
            msg_types::INTENT_FAILURE => Self::IntentFailure,
            msg_types::KLAT_ERROR => Self::KlatError,
            msg_types::CLEAR_DATA => Self::ClearData,
            msg_types::ALERT_EXPIRED => Self::AlertExpired,
            other => match other.strip_suffix(msg_types::RESPONSE_SUFFIX) {
                Some(request) if !request.is_empty() => Self::ApiResponse(request.to_string()),
                _ => Self::Other(other.to_string()),
            },
        }
    }

    /// Whether a response of this kind carries an updated session context.
    pub fn updates_session(&self) -> bool {
        matches!(self, Self::KlatResponse | Self::IntentFailure)
    }
}

// ── Typed payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInputData {
    /// Base64-encoded WAV audio.
    pub audio_data: String,
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextInputData {
    pub text: String,
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceInputData {
    pub utterances: Vec<String>,
    pub lang: String,
}

/// One language entry of a `klat.response`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LangResponse {
    #[serde(default)]
    pub sentence: String,
    /// Speaker gender → base64 WAV.
    #[serde(default)]
    pub audio: Map<String, Value>,
}

/// Payload of a `klat.response`, keyed by language in the order the backend
/// sent them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KlatResponseData {
    pub responses: Vec<(String, LangResponse)>,
}

impl KlatResponseData {
    /// Accepts both `{responses: {lang: ...}}` and a bare `{lang: ...}` map.
    /// Entries that are not objects are skipped.
    pub fn from_data(data: &Map<String, Value>) -> Self {
        let langs = match data.get("responses") {
            Some(Value::Object(r)) => r,
            _ => data,
        };
        let responses = langs
            .iter()
            .filter(|(_, v)| v.is_object())
            .filter_map(|(lang, v)| {
                serde_json::from_value::<LangResponse>(v.clone())
                    .ok()
                    .map(|r| (lang.clone(), r))
            })
            .collect();
        Self { responses }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A message with its payload decoded for the types the gateway interprets.
/// Anything else stays opaque in [`Envelope::Passthrough`].
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    AudioInput(AudioInputData),
    GetStt(AudioInputData),
    GetTts(TextInputData),
    Utterance(UtteranceInputData),
    WakeWordDetected(Map<String, Value>),
    KlatResponse(KlatResponseData),
    IntentFailure(Map<String, Value>),
    KlatError(Map<String, Value>),
    ClearData(Map<String, Value>),
    AlertExpired(Map<String, Value>),
    ApiResponse {
        request: String,
        data: Map<String, Value>,
    },
    Passthrough {
        msg_type: String,
        data: Map<String, Value>,
    },
}

impl TryFrom<&Message> for Envelope {
    type Error = ProtocolError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let data = || message.data.clone();
        Ok(match message.kind() {
            MessageKind::AudioInput => Self::AudioInput(message.data_as()?),
            MessageKind::GetStt => Self::GetStt(message.data_as()?),
            MessageKind::GetTts => Self::GetTts(message.data_as()?),
            MessageKind::Utterance => Self::Utterance(message.data_as()?),
            MessageKind::WakeWordDetected => Self::WakeWordDetected(data()),
            MessageKind::KlatResponse => {
                Self::KlatResponse(KlatResponseData::from_data(&message.data))
            },
            MessageKind::IntentFailure => Self::IntentFailure(data()),
            MessageKind::KlatError => Self::KlatError(data()),
            MessageKind::ClearData => Self::ClearData(data()),
            MessageKind::AlertExpired => Self::AlertExpired(data()),
            MessageKind::ApiResponse(request) => Self::ApiResponse {
                request,
                data: data(),
            },
            MessageKind::Other(msg_type) => Self::Passthrough {
                msg_type,
                data: data(),
            },
        })
    }
}
