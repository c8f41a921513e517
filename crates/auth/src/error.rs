use std::time::Duration;

/// Failures surfaced by credential handling and request throttling.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
    },
    #[error("invalid {0} token supplied")]
    InvalidCredential(&'static str),
    #[error("{0} token is expired")]
    ExpiredCredential(&'static str),
    #[error("{0}")]
    MismatchedPair(&'static str),
    #[error("client is not authorized for {0} access")]
    NotAuthorized(&'static str),
    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

impl AuthError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::InvalidCredential(_) => 400,
            Self::ExpiredCredential(_) => 401,
            Self::MismatchedPair(_) => 403,
            Self::NotAuthorized(_) => 401,
            Self::Signing(_) => 500,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
