//! Wire types shared by the gateway and its backend.
//!
//! Node clients and the backend exchange JSON messages shaped
//! `{msg_type, data, context}`. The gateway interprets a small, fixed set of
//! message types and forwards everything else untouched.

pub mod message;
pub mod requests;

pub use {
    message::{
        AudioInputData, Envelope, KlatResponseData, LangResponse, Message, MessageKind,
        TextInputData, UtteranceInputData,
    },
    requests::{
        AuthenticationRequest, GetResponseRequest, PermissionsRequest, RefreshRequest,
        SttRequest, TtsRequest,
    },
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Message types the gateway understands.
pub mod msg_types {
    pub const AUDIO_INPUT: &str = "neon.audio_input";
    pub const GET_STT: &str = "neon.get_stt";
    pub const GET_TTS: &str = "neon.get_tts";
    pub const UTTERANCE: &str = "recognizer_loop:utterance";
    pub const WW_DETECTED: &str = "neon.ww_detected";
    pub const KLAT_RESPONSE: &str = "klat.response";
    pub const INTENT_FAILURE: &str = "complete.intent.failure";
    pub const KLAT_ERROR: &str = "klat.error";
    pub const CLEAR_DATA: &str = "neon.clear_data";
    pub const ALERT_EXPIRED: &str = "neon.alert_expired";
    /// Suffix of backend replies to API-style requests.
    pub const RESPONSE_SUFFIX: &str = ".response";
    /// Gateway-generated error sent back to a node client.
    pub const GATEWAY_ERROR: &str = "hana.error";
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no msg_type")]
    MissingType,
    #[error("invalid {msg_type} payload: {source}")]
    InvalidPayload {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}
