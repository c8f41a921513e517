use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::State,
        response::{IntoResponse, Json},
        routing::get,
    },
    hana_config::HanaConfig,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{
    assist, auth_routes,
    bus::{InMemoryBus, MessageBus},
    node,
    state::GatewayState,
};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .merge(auth_routes::router())
        .merge(assist::router())
        .merge(node::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Connect the backend bus named by `[mq]`, or an in-process bus when no
/// url is configured.
pub async fn connect_bus(config: &HanaConfig) -> anyhow::Result<Arc<dyn MessageBus>> {
    match config.mq.url.as_deref() {
        #[cfg(feature = "nats")]
        Some(url) => {
            let bus = crate::nats::NatsBus::connect(
                url,
                config.mq.request_subject.clone(),
                config.mq.response_subject.clone(),
            )
            .await
            .with_context(|| format!("failed to connect to message bus at {url}"))?;
            Ok(Arc::new(bus))
        },
        #[cfg(not(feature = "nats"))]
        Some(url) => {
            warn!(url, "built without NATS support, using in-process bus");
            Ok(Arc::new(InMemoryBus::new()))
        },
        None => {
            warn!("no message bus configured, node inputs will not reach a backend");
            Ok(Arc::new(InMemoryBus::new()))
        },
    }
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: HanaConfig) -> anyhow::Result<()> {
    config.streaming.validate()?;
    let bus = connect_bus(&config).await?;
    let bus_kind = if config.mq.url.is_some() {
        "nats"
    } else {
        "in-process"
    };
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let state = GatewayState::new(config, bus);
    let responses = state.backend.spawn_response_loop().await?;
    let app = build_gateway_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let lines = [
        format!("{} v{}", state.config.server.title, state.version),
        format!(
            "protocol v{}, listening on {}",
            hana_protocol::PROTOCOL_VERSION,
            addr
        ),
        format!(
            "bus: {bus_kind}, routing key {}",
            state.backend.client_id()
        ),
        format!(
            "auth: {}",
            if state.clients.is_auth_disabled() {
                "disabled"
            } else {
                "enabled"
            }
        ),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down, closing node sessions");
    state.sessions.clear().await;
    responses.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "title": state.config.server.title,
        "version": state.version,
        "protocol": hana_protocol::PROTOCOL_VERSION,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.sessions.session_count().await,
        "streams": state.sessions.stream_count().await,
        "clients": state.clients.authorized_clients(),
    }))
}
