use std::{collections::HashMap, sync::Mutex};

use {
    hana_config::{AuthConfig, expose},
    rand::{Rng, distr::Alphanumeric},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::{
    AuthError, ClientPermissions, RateLimiter,
    tokens::{TokenCodec, now_ts},
};

// ── Types ────────────────────────────────────────────────────────────────────

/// Credentials issued to one client, as returned by login and refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub username: String,
    pub client_id: String,
    pub permissions: ClientPermissions,
    pub access_token: String,
    /// Unknown when the record was learned from a bare access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token expiry, Unix seconds.
    pub expiration: f64,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

fn random_secret() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

fn secret_or_random(secret: &Option<Secret<String>>, name: &str) -> String {
    match expose(secret) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            warn!(
                secret = name,
                "no signing secret configured, generated one for this process; tokens will not survive a restart"
            );
            random_secret()
        },
    }
}

// ── Client manager ───────────────────────────────────────────────────────────

/// Issues, validates and refreshes client credentials, and throttles callers.
pub struct ClientManager {
    codec: TokenCodec,
    clients: Mutex<HashMap<String, CredentialRecord>>,
    auth_limiter: RateLimiter,
    request_limiter: RateLimiter,
    disable_auth: bool,
    node_username: Option<String>,
    node_password: Option<Secret<String>>,
    max_streams: Option<i64>,
    active_streams: Mutex<usize>,
}

impl ClientManager {
    pub fn new(config: &AuthConfig) -> Self {
        let access_secret = secret_or_random(&config.access_token_secret, "access_token_secret");
        let refresh_secret =
            secret_or_random(&config.refresh_token_secret, "refresh_token_secret");
        if config.disable_auth {
            warn!("authentication is disabled, every token is accepted");
        }
        Self {
            codec: TokenCodec::new(
                &access_secret,
                &refresh_secret,
                config.access_token_ttl,
                config.refresh_token_ttl,
            ),
            clients: Mutex::new(HashMap::new()),
            auth_limiter: RateLimiter::per_minute(
                config.auth_requests_per_minute,
                config.max_tracked_identities,
            ),
            request_limiter: RateLimiter::per_minute(
                config.requests_per_minute,
                config.max_tracked_identities,
            ),
            disable_auth: config.disable_auth,
            node_username: config.node_username.clone(),
            node_password: config.node_password.clone(),
            max_streams: config.max_streaming_clients,
            active_streams: Mutex::new(0),
        }
    }

    pub fn is_auth_disabled(&self) -> bool {
        self.disable_auth
    }

    /// Number of clients with a cached credential record.
    pub fn authorized_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Log in `client_id`.
    ///
    /// A client that already holds an unexpired record gets that record back
    /// unchanged, without being charged against the login rate limit.
    pub fn check_auth_request(
        &self,
        client_id: &str,
        username: &str,
        password: Option<&str>,
        origin_ip: &str,
    ) -> Result<CredentialRecord, AuthError> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = clients.get(client_id) {
            if record.expiration > now_ts() {
                debug!(client_id, "using cached client credentials");
                return Ok(record.clone());
            }
            clients.remove(client_id);
        }

        let identity = format!("auth{origin_ip}");
        if let Err(wait) = self.auth_limiter.check(&identity) {
            warn!(origin_ip, "login rate limit exceeded");
            return Err(AuthError::RateLimited {
                message: format!(
                    "Too many auth requests from: {origin_ip}. Wait {}s.",
                    wait.as_secs_f64().round()
                ),
                retry_after: wait,
            });
        }

        let permissions = ClientPermissions::with_node(self.is_node_login(username, password));
        let pair = self.codec.mint(client_id, username, password, permissions)?;
        let record = CredentialRecord {
            username: username.to_string(),
            client_id: client_id.to_string(),
            permissions,
            access_token: pair.access_token,
            refresh_token: Some(pair.refresh_token),
            expiration: pair.expiration,
        };
        clients.insert(client_id.to_string(), record.clone());
        info!(client_id, username, node = permissions.node, "issued credentials");
        Ok(record)
    }

    /// Exchange a matching access/refresh pair for a new pair.
    pub fn check_refresh_request(
        &self,
        access_token: &str,
        refresh_token: &str,
        client_id: &str,
    ) -> Result<CredentialRecord, AuthError> {
        let refresh = self.codec.decode_refresh(refresh_token)?;
        if refresh.access_token != access_token {
            return Err(AuthError::MismatchedPair("Refresh and access token mismatch"));
        }
        if now_ts() >= refresh.expire {
            return Err(AuthError::ExpiredCredential("refresh"));
        }
        // The access token may itself be expired; the refresh token vouches
        // for it.
        let access = self.codec.decode_access(access_token)?;
        if access.client_id != client_id {
            return Err(AuthError::MismatchedPair(
                "Access token does not match client_id",
            ));
        }

        let permissions = access.permissions();
        let pair = self.codec.mint(
            &access.client_id,
            &access.username,
            access.password.as_deref(),
            permissions,
        )?;
        let record = CredentialRecord {
            username: access.username,
            client_id: access.client_id,
            permissions,
            access_token: pair.access_token,
            refresh_token: Some(pair.refresh_token),
            expiration: pair.expiration,
        };
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.client_id.clone(), record.clone());
        info!(client_id, "refreshed credentials");
        Ok(record)
    }

    /// Rate-limit the caller, then check `token`.
    ///
    /// Returns `Ok(false)` for a bad or expired token. An expired token also
    /// drops the client's cached record.
    pub fn validate_auth(&self, token: &str, origin_ip: &str) -> Result<bool, AuthError> {
        if let Err(wait) = self.request_limiter.check(origin_ip) {
            warn!(origin_ip, "request rate limit exceeded");
            return Err(AuthError::RateLimited {
                message: format!(
                    "Requests limited to {}/min per client connection",
                    self.request_limiter.capacity()
                ),
                retry_after: wait,
            });
        }
        if self.disable_auth {
            return Ok(true);
        }

        let Ok(claims) = self.codec.decode_access(token) else {
            debug!(origin_ip, "rejected invalid access token");
            return Ok(false);
        };
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if claims.expire <= now_ts() {
            clients.remove(&claims.client_id);
            debug!(client_id = %claims.client_id, "rejected expired access token");
            return Ok(false);
        }

        let permissions = claims.permissions();
        let learned = CredentialRecord {
            username: claims.username.clone(),
            client_id: claims.client_id.clone(),
            permissions,
            access_token: token.to_string(),
            refresh_token: None,
            expiration: claims.expire,
        };
        match clients.get_mut(&claims.client_id) {
            Some(record) if record.access_token == token => {
                record.expiration = claims.expire;
                record.permissions = permissions;
            },
            // An older token still in use must not shadow a refreshed pair.
            Some(record) if record.expiration >= claims.expire => {},
            Some(record) => *record = learned,
            None => {
                clients.insert(claims.client_id.clone(), learned);
            },
        }
        Ok(true)
    }

    pub fn get_permissions(&self, client_id: &str) -> ClientPermissions {
        if self.disable_auth {
            return ClientPermissions::all();
        }
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        match clients.get(client_id) {
            Some(record) => record.permissions,
            None => {
                warn!(client_id, "client not known to this server");
                ClientPermissions::none()
            },
        }
    }

    /// Client id carried by an access token. Expiry is not checked.
    pub fn get_client_id(&self, token: &str) -> Result<String, AuthError> {
        Ok(self.codec.decode_access(token)?.client_id)
    }

    // ── Stream admission ─────────────────────────────────────────────────────

    /// Reserve a streaming slot. Returns `false` when the cap is reached.
    pub fn check_connect_stream(&self) -> bool {
        let mut active = self.active_streams.lock().unwrap_or_else(|e| e.into_inner());
        match self.max_streams {
            Some(max) if max >= 0 && *active as i64 >= max => {
                warn!(active = *active, max, "streaming client limit reached");
                false
            },
            _ => {
                *active += 1;
                true
            },
        }
    }

    /// Release a slot taken by [`check_connect_stream`](Self::check_connect_stream).
    pub fn disconnect_stream(&self) {
        let mut active = self.active_streams.lock().unwrap_or_else(|e| e.into_inner());
        *active = active.saturating_sub(1);
    }

    pub fn active_streams(&self) -> usize {
        *self.active_streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_node_login(&self, username: &str, password: Option<&str>) -> bool {
        match (&self.node_username, &self.node_password, password) {
            (Some(user), Some(expected), Some(given)) => {
                safe_equal(username, user) && safe_equal(given, expected.expose_secret())
            },
            _ => false,
        }
    }
}
