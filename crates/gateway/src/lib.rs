//! Gateway: HTTP/WebSocket server in front of the backend message bus.
//!
//! Lifecycle:
//! 1. Load config, connect the message bus
//! 2. Build client manager, session registry and message gateway
//! 3. Start the backend response loop
//! 4. Serve `/auth`, `/neon` and `/node` routes until ctrl-c
//! 5. Close every node session and stream

pub mod assist;
pub mod auth;
pub mod auth_routes;
pub mod backend;
pub mod bus;
pub mod error;
#[cfg(feature = "nats")]
pub mod nats;
pub mod node;
pub mod server;
pub mod sessions;
pub mod state;

pub use {
    backend::MessageGateway,
    bus::{InMemoryBus, MessageBus},
    error::GatewayError,
    server::{build_gateway_app, connect_bus, start_gateway},
    sessions::SessionRegistry,
    state::GatewayState,
};
