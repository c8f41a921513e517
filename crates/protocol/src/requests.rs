//! HTTP request bodies.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

fn guest() -> String {
    "guest".into()
}

/// `POST /auth/login`. A missing `client_id` is generated by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    #[serde(default = "guest")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
}

/// `POST /auth/permissions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsRequest {
    #[serde(default)]
    pub access_token: Option<String>,
    pub client_id: String,
}

/// `POST /neon/get_stt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttRequest {
    pub encoded_audio: String,
    pub lang_code: String,
}

/// `POST /neon/get_tts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub to_speak: String,
    pub lang_code: String,
    #[serde(default = "female")]
    pub gender: String,
}

fn female() -> String {
    "female".into()
}

/// `POST /neon/get_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponseRequest {
    pub utterance: String,
    pub lang_code: String,
    #[serde(default)]
    pub user_profile: Option<Value>,
    #[serde(default)]
    pub node_data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn login_defaults_to_guest() {
        let req: AuthenticationRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.username, "guest");
        assert!(req.password.is_none());
        assert!(req.client_id.is_none());
    }

    #[test]
    fn tts_defaults_gender() {
        let req: TtsRequest =
            serde_json::from_value(json!({"to_speak": "hi", "lang_code": "en-us"})).unwrap();
        assert_eq!(req.gender, "female");
    }
}
