//! Request authentication for the HTTP and WebSocket routes.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use {
    axum::{
        extract::{ConnectInfo, FromRequestParts},
        http::{header::AUTHORIZATION, request::Parts},
    },
    hana_auth::{AuthError, ClientPermissions},
    tracing::debug,
};

use crate::{error::GatewayError, state::GatewayState};

// ── Origin ───────────────────────────────────────────────────────────────────

/// Remote address of the caller, used as the rate-limit identity.
#[derive(Debug, Clone)]
pub struct OriginIp(pub String);

impl OriginIp {
    fn from_parts(parts: &Parts) -> Self {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self(ip.to_string())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for OriginIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

// ── Bearer token ─────────────────────────────────────────────────────────────

/// A validated `Authorization: Bearer` credential.
///
/// Validation charges the caller's general rate limit. `client_id` is `None`
/// only when auth is disabled and the token does not decode.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    pub token: String,
    pub client_id: Option<String>,
}

impl BearerAuth {
    /// Fail with 401 unless the client holds the given capability.
    pub fn require(
        &self,
        state: &GatewayState,
        capability: &'static str,
    ) -> Result<ClientPermissions, GatewayError> {
        let Some(client_id) = self.client_id.as_deref() else {
            return if state.clients.is_auth_disabled() {
                Ok(ClientPermissions::all())
            } else {
                Err(GatewayError::invalid_token())
            };
        };
        require_permission(state, client_id, capability)
    }
}

impl FromRequestParts<Arc<GatewayState>> for BearerAuth {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::Forbidden("Invalid or missing auth credentials.".into()))?;
        let (scheme, token) = header
            .split_once(' ')
            .ok_or_else(|| GatewayError::Forbidden("Invalid or missing auth credentials.".into()))?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(GatewayError::Forbidden(
                "Invalid authentication scheme.".into(),
            ));
        }
        let token = token.trim();
        let OriginIp(origin_ip) = OriginIp::from_parts(parts);
        if !state.clients.validate_auth(token, &origin_ip)? {
            debug!(origin_ip = %origin_ip, "rejected bearer token");
            return Err(GatewayError::invalid_token());
        }
        Ok(Self {
            token: token.to_string(),
            client_id: state.clients.get_client_id(token).ok(),
        })
    }
}

/// Check one capability flag of `client_id`.
pub fn require_permission(
    state: &GatewayState,
    client_id: &str,
    capability: &'static str,
) -> Result<ClientPermissions, GatewayError> {
    let permissions = state.clients.get_permissions(client_id);
    let allowed = match capability {
        "assist" => permissions.assist,
        "backend" => permissions.backend,
        "node" => permissions.node,
        _ => false,
    };
    if allowed {
        Ok(permissions)
    } else {
        debug!(client_id, capability, "permission denied");
        Err(AuthError::NotAuthorized(capability).into())
    }
}

// ── Stream admission ─────────────────────────────────────────────────────────

/// An admitted audio stream. Dropping it releases the slot.
pub struct StreamSlot {
    state: Arc<GatewayState>,
}

impl StreamSlot {
    pub fn acquire(state: &Arc<GatewayState>) -> Result<Self, GatewayError> {
        if state.clients.check_connect_stream() {
            Ok(Self {
                state: Arc::clone(state),
            })
        } else {
            Err(GatewayError::StreamsExhausted)
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.state.clients.disconnect_stream();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::bus::InMemoryBus,
        axum::http::Request,
        hana_config::HanaConfig,
        secrecy::Secret,
    };

    fn state(config: HanaConfig) -> Arc<GatewayState> {
        GatewayState::new(config, Arc::new(InMemoryBus::new()))
    }

    fn parts(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/neon/get_tts");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn bearer_rejections() {
        let state = state(HanaConfig::default());

        let err = BearerAuth::from_request_parts(&mut parts(None), &state)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or missing auth credentials.");

        let err = BearerAuth::from_request_parts(&mut parts(Some("Basic abc")), &state)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid authentication scheme.");

        let err = BearerAuth::from_request_parts(&mut parts(Some("Bearer junk")), &state)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired token.");
    }

    #[tokio::test]
    async fn bearer_accepts_issued_token() {
        let state = state(HanaConfig::default());
        let record = state
            .clients
            .check_auth_request("c1", "guest", None, "127.0.0.1")
            .unwrap();
        let header = format!("Bearer {}", record.access_token);
        let auth = BearerAuth::from_request_parts(&mut parts(Some(&header)), &state)
            .await
            .unwrap();
        assert_eq!(auth.client_id.as_deref(), Some("c1"));
        assert!(auth.require(&state, "assist").is_ok());
        assert!(matches!(
            auth.require(&state, "node"),
            Err(GatewayError::Auth(AuthError::NotAuthorized("node")))
        ));
    }

    #[tokio::test]
    async fn node_credentials_grant_node_permission() {
        let mut config = HanaConfig::default();
        config.auth.node_username = Some("node".into());
        config.auth.node_password = Some(Secret::new("pass".into()));
        let state = state(config);
        state
            .clients
            .check_auth_request("n1", "node", Some("pass"), "127.0.0.1")
            .unwrap();
        assert!(require_permission(&state, "n1", "node").is_ok());
    }

    #[tokio::test]
    async fn stream_slot_releases_on_drop() {
        let mut config = HanaConfig::default();
        config.auth.max_streaming_clients = Some(1);
        let state = state(config);
        let slot = StreamSlot::acquire(&state).unwrap();
        assert!(matches!(
            StreamSlot::acquire(&state),
            Err(GatewayError::StreamsExhausted)
        ));
        drop(slot);
        assert!(StreamSlot::acquire(&state).is_ok());
    }
}
