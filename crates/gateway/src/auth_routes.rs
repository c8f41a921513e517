//! `/auth` routes: login, refresh and permission lookup.

use std::sync::Arc;

use {
    axum::{
        Json, Router,
        extract::State,
        routing::post,
    },
    hana_auth::{ClientPermissions, CredentialRecord},
    hana_protocol::{AuthenticationRequest, PermissionsRequest, RefreshRequest},
    serde::Serialize,
    tracing::info,
};

use crate::{
    auth::{BearerAuth, OriginIp},
    error::GatewayError,
    state::GatewayState,
};

/// Body returned by login and refresh.
#[derive(Debug, Serialize)]
pub struct AuthenticationResponse {
    pub username: String,
    pub client_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expiration: f64,
}

impl From<CredentialRecord> for AuthenticationResponse {
    fn from(record: CredentialRecord) -> Self {
        Self {
            username: record.username,
            client_id: record.client_id,
            access_token: record.access_token,
            refresh_token: record.refresh_token.unwrap_or_default(),
            expiration: record.expiration,
        }
    }
}

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/permissions", post(permissions))
}

async fn login(
    State(state): State<Arc<GatewayState>>,
    OriginIp(origin_ip): OriginIp,
    Json(req): Json<AuthenticationRequest>,
) -> Result<Json<AuthenticationResponse>, GatewayError> {
    let client_id = req
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let record = state.clients.check_auth_request(
        &client_id,
        &req.username,
        req.password.as_deref(),
        &origin_ip,
    )?;
    info!(client_id = %record.client_id, username = %record.username, "client logged in");
    Ok(Json(record.into()))
}

async fn refresh(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<AuthenticationResponse>, GatewayError> {
    let record =
        state
            .clients
            .check_refresh_request(&req.access_token, &req.refresh_token, &req.client_id)?;
    info!(client_id = %record.client_id, "credentials refreshed");
    Ok(Json(record.into()))
}

async fn permissions(
    State(state): State<Arc<GatewayState>>,
    _auth: BearerAuth,
    Json(req): Json<PermissionsRequest>,
) -> Json<ClientPermissions> {
    Json(state.clients.get_permissions(&req.client_id))
}
