//! Client credentials, permissions and request throttling.

pub mod error;
pub mod manager;
pub mod permissions;
pub mod rate_limit;
pub mod tokens;

pub use {
    error::AuthError,
    manager::{ClientManager, CredentialRecord},
    permissions::ClientPermissions,
    rate_limit::RateLimiter,
    tokens::{AccessClaims, RefreshClaims, TokenCodec, TokenPair, now_ts},
};
