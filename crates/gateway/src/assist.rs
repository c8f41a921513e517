//! `/neon` assist routes, answered by backend calls.

use std::sync::Arc;

use {
    axum::{Json, Router, extract::State, routing::post},
    hana_protocol::{GetResponseRequest, SttRequest, TtsRequest},
    serde_json::{Value, json},
};

use crate::{
    auth::{BearerAuth, OriginIp},
    error::GatewayError,
    state::GatewayState,
};

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/neon/get_stt", post(get_stt))
        .route("/neon/get_tts", post(get_tts))
        .route("/neon/get_response", post(get_response))
}

async fn get_stt(
    State(state): State<Arc<GatewayState>>,
    auth: BearerAuth,
    Json(req): Json<SttRequest>,
) -> Result<Json<Value>, GatewayError> {
    auth.require(&state, "assist")?;
    Ok(Json(state.backend.get_stt(&req).await?))
}

async fn get_tts(
    State(state): State<Arc<GatewayState>>,
    auth: BearerAuth,
    Json(req): Json<TtsRequest>,
) -> Result<Json<Value>, GatewayError> {
    auth.require(&state, "assist")?;
    Ok(Json(state.backend.get_tts(&req).await?))
}

async fn get_response(
    State(state): State<Arc<GatewayState>>,
    auth: BearerAuth,
    OriginIp(origin_ip): OriginIp,
    Json(mut req): Json<GetResponseRequest>,
) -> Result<Json<Value>, GatewayError> {
    auth.require(&state, "assist")?;
    let node_data = req.node_data.get_or_insert_with(|| json!({}));
    if let Some(node) = node_data.as_object_mut() {
        let networking = node
            .entry("networking")
            .or_insert_with(|| json!({}));
        let has_ip = networking
            .get("public_ip")
            .and_then(Value::as_str)
            .is_some_and(|ip| !ip.is_empty());
        if !has_ip && let Some(net) = networking.as_object_mut() {
            net.insert("public_ip".into(), Value::String(origin_ip));
        }
    }
    let fallback_id = auth.client_id.as_deref().unwrap_or_default();
    Ok(Json(state.backend.get_response(&req, fallback_id).await?))
}
