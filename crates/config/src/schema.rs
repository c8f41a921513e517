//! Config schema types (server, auth, streaming, message queue).

use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HanaConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub streaming: StreamingConfig,
    pub mq: MqConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Title reported by `/health`.
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            title: "HANA: HTTP API for Neon Applications".into(),
        }
    }
}

/// Credential issuance and request throttling.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Access token lifetime in seconds.
    pub access_token_ttl: i64,
    /// Refresh token lifetime in seconds.
    pub refresh_token_ttl: i64,
    #[serde(serialize_with = "serialize_option_secret")]
    pub access_token_secret: Option<Secret<String>>,
    #[serde(serialize_with = "serialize_option_secret")]
    pub refresh_token_secret: Option<Secret<String>>,
    /// General API requests per minute per origin. Zero or negative disables
    /// limiting.
    pub requests_per_minute: i64,
    /// Login attempts per minute per origin.
    pub auth_requests_per_minute: i64,
    pub disable_auth: bool,
    pub node_username: Option<String>,
    #[serde(serialize_with = "serialize_option_secret")]
    pub node_password: Option<Secret<String>>,
    /// Cap on concurrent audio streams. Unset or negative means unlimited.
    pub max_streaming_clients: Option<i64>,
    /// Upper bound on rate-limiter buckets kept in memory.
    pub max_tracked_identities: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: 3600 * 24,
            refresh_token_ttl: 3600 * 24 * 7,
            access_token_secret: None,
            refresh_token_secret: None,
            requests_per_minute: 60,
            auth_requests_per_minute: 6,
            disable_auth: false,
            node_username: None,
            node_password: None,
            max_streaming_clients: None,
            max_tracked_identities: 10_000,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("access_token_secret", &redacted(&self.access_token_secret))
            .field("refresh_token_secret", &redacted(&self.refresh_token_secret))
            .field("requests_per_minute", &self.requests_per_minute)
            .field("auth_requests_per_minute", &self.auth_requests_per_minute)
            .field("disable_auth", &self.disable_auth)
            .field("node_username", &self.node_username)
            .field("node_password", &redacted(&self.node_password))
            .field("max_streaming_clients", &self.max_streaming_clients)
            .field("max_tracked_identities", &self.max_tracked_identities)
            .finish()
    }
}

fn redacted(secret: &Option<Secret<String>>) -> Option<&'static str> {
    secret.as_ref().map(|_| "[REDACTED]")
}

/// Audio stream pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Polls made while waiting for the control session of a new stream.
    pub attach_retries: u32,
    pub attach_retry_interval_ms: u64,
    /// Audio chunks buffered per stream before new chunks are dropped.
    pub queue_capacity: usize,
    pub sample_rate: u32,
    pub sample_width: u16,
    /// Minimum speech needed for a recording to count as an utterance.
    pub speech_seconds: f32,
    /// Trailing silence that ends an utterance.
    pub silence_seconds: f32,
    pub max_utterance_seconds: f32,
    /// RMS level above which a frame counts as speech.
    pub vad_threshold: f64,
    pub default_lang: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            attach_retries: 3,
            attach_retry_interval_ms: 1000,
            queue_capacity: 256,
            sample_rate: 16_000,
            sample_width: 2,
            speech_seconds: 0.5,
            silence_seconds: 0.8,
            max_utterance_seconds: 15.0,
            vad_threshold: 500.0,
            default_lang: "en-us".into(),
        }
    }
}

impl StreamingConfig {
    pub fn attach_retry_interval(&self) -> Duration {
        Duration::from_millis(self.attach_retry_interval_ms)
    }

    /// Only 16-bit and 32-bit little-endian PCM can be decoded.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.sample_width, 2 | 4),
            "streaming.sample_width must be 2 or 4 bytes, got {}",
            self.sample_width
        );
        Ok(())
    }
}

/// Backend message queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    /// NATS server url. When unset the gateway runs on an in-process bus.
    pub url: Option<String>,
    /// RPC deadline in seconds.
    pub default_timeout: u64,
    /// Routing identity of this gateway. Generated when unset.
    pub client_id: Option<String>,
    pub stt_max_length_encoded: usize,
    pub tts_max_words: usize,
    /// Subject node inputs are published on.
    pub request_subject: String,
    /// Subject backend responses for this gateway arrive on.
    pub response_subject: String,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_timeout: 10,
            client_id: None,
            stt_max_length_encoded: 500_000,
            tts_max_words: 128,
            request_subject: "neon_chat_api_request".into(),
            response_subject: "neon_chat_api_response".into(),
        }
    }
}

impl MqConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }
}

/// Serialize an optional secret as its redacted placeholder.
pub fn serialize_option_secret<S: Serializer>(
    value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("[REDACTED]"),
        None => serializer.serialize_none(),
    }
}

/// Expose an optional secret as a plain string slice.
pub fn expose(value: &Option<Secret<String>>) -> Option<&str> {
    value.as_ref().map(|s| s.expose_secret().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HanaConfig::default();
        assert_eq!(cfg.auth.access_token_ttl, 86_400);
        assert_eq!(cfg.auth.refresh_token_ttl, 604_800);
        assert_eq!(cfg.auth.requests_per_minute, 60);
        assert_eq!(cfg.auth.auth_requests_per_minute, 6);
        assert!(!cfg.auth.disable_auth);
        assert!(cfg.auth.max_streaming_clients.is_none());
        assert_eq!(cfg.streaming.attach_retries, 3);
        assert_eq!(cfg.mq.default_timeout, 10);
    }

    #[test]
    fn debug_redacts_secrets() {
        let auth = AuthConfig {
            access_token_secret: Some(Secret::new("hunter2".into())),
            node_password: Some(Secret::new("node-pass".into())),
            ..Default::default()
        };
        let printed = format!("{auth:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("node-pass"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn serialized_config_hides_secrets() {
        let mut cfg = HanaConfig::default();
        cfg.auth.refresh_token_secret = Some(Secret::new("refresh-secret".into()));
        let out = toml::to_string_pretty(&cfg).unwrap();
        assert!(!out.contains("refresh-secret"));
        assert!(out.contains("[REDACTED]"));
    }
}
