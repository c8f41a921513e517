use std::time::Duration;

use {
    axum::{
        Json,
        http::{HeaderValue, StatusCode, header::RETRY_AFTER},
        response::{IntoResponse, Response},
    },
    hana_auth::AuthError,
    serde_json::json,
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("Client not known ({0})")]
    SessionNotFound(String),
    #[error("Server is not accepting any more streams")]
    StreamsExhausted,
    #[error("backend did not answer {topic} within {}s", timeout.as_secs_f64())]
    BackendTimeout { topic: String, timeout: Duration },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            },
            Self::SessionNotFound(_) => StatusCode::UNAUTHORIZED,
            Self::StreamsExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendTimeout { .. } | Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    pub fn invalid_token() -> Self {
        Self::Forbidden("Invalid or expired token.".into())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            Self::Auth(AuthError::RateLimited { retry_after, .. }) => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        let mut response = (status, Json(json!({ "detail": self.to_string() }))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
