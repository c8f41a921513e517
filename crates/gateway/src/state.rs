use std::{sync::Arc, time::Instant};

use {
    hana_auth::ClientManager,
    hana_config::HanaConfig,
    hana_voice::{DetectorFactory, Detectors, StreamSettings},
};

use crate::{backend::MessageGateway, bus::MessageBus, sessions::SessionRegistry};

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    pub config: HanaConfig,
    /// Credentials, permissions, rate limits and stream admission.
    pub clients: ClientManager,
    /// Connected node sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Backend message path.
    pub backend: Arc<MessageGateway>,
    /// Detection engines for each new audio stream.
    pub detectors: DetectorFactory,
    pub stream_settings: StreamSettings,
    /// Server version string.
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    /// Build state with the energy VAD and no wake word engine.
    pub fn new(config: HanaConfig, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let threshold = config.streaming.vad_threshold;
        Self::with_detectors(
            config,
            bus,
            Arc::new(move || Detectors::energy(threshold)),
        )
    }

    pub fn with_detectors(
        config: HanaConfig,
        bus: Arc<dyn MessageBus>,
        detectors: DetectorFactory,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new(
            config.streaming.attach_retries,
            config.streaming.attach_retry_interval(),
        ));
        let backend = Arc::new(MessageGateway::new(
            bus,
            Arc::clone(&sessions),
            &config.mq,
        ));
        Arc::new(Self {
            clients: ClientManager::new(&config.auth),
            stream_settings: StreamSettings::from(&config.streaming),
            config,
            sessions,
            backend,
            detectors,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        })
    }
}
