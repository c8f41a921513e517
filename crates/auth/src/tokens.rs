//! Signed access/refresh token pairs.
//!
//! Both tokens are HS256 JWTs signed with independent secrets. Expiry is an
//! absolute Unix timestamp in the `expire` claim and is checked by the
//! caller, not by the decoder.

use std::time::{SystemTime, UNIX_EPOCH};

use {
    jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
};

use crate::{AuthError, ClientPermissions};

/// Current Unix time in fractional seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub client_id: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Absent in tokens minted before permissions were tracked.
    #[serde(default)]
    pub permissions: Option<ClientPermissions>,
    pub expire: f64,
}

impl AccessClaims {
    pub fn permissions(&self) -> ClientPermissions {
        self.permissions.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub client_id: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub permissions: Option<ClientPermissions>,
    pub expire: f64,
    /// The access token this refresh token was issued with.
    pub access_token: String,
}

/// A freshly minted pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry.
    pub expiration: f64,
}

pub struct TokenCodec {
    access_secret: Vec<u8>,
    refresh_secret: Vec<u8>,
    access_ttl: f64,
    refresh_ttl: f64,
}

impl TokenCodec {
    pub fn new(access_secret: &str, refresh_secret: &str, access_ttl: i64, refresh_ttl: i64) -> Self {
        Self {
            access_secret: access_secret.as_bytes().to_vec(),
            refresh_secret: refresh_secret.as_bytes().to_vec(),
            access_ttl: access_ttl as f64,
            refresh_ttl: refresh_ttl as f64,
        }
    }

    /// Mint an access token expiring `access_ttl` from now and a refresh
    /// token embedding it.
    pub fn mint(
        &self,
        client_id: &str,
        username: &str,
        password: Option<&str>,
        permissions: ClientPermissions,
    ) -> Result<TokenPair, AuthError> {
        let now = now_ts();
        let access = AccessClaims {
            client_id: client_id.to_string(),
            username: username.to_string(),
            password: password.map(str::to_string),
            permissions: Some(permissions),
            expire: now + self.access_ttl,
        };
        let access_token = sign(&access, &self.access_secret)?;
        let refresh = RefreshClaims {
            client_id: access.client_id,
            username: access.username,
            password: access.password,
            permissions: access.permissions,
            expire: now + self.refresh_ttl,
            access_token: access_token.clone(),
        };
        let refresh_token = sign(&refresh, &self.refresh_secret)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expiration: access.expire,
        })
    }

    /// Verify the signature of an access token. Expiry is not checked.
    pub fn decode_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        verify(token, &self.access_secret).map_err(|_| AuthError::InvalidCredential("access"))
    }

    /// Verify the signature of a refresh token. Expiry is not checked.
    pub fn decode_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        verify(token, &self.refresh_secret).map_err(|_| AuthError::InvalidCredential("refresh"))
    }
}

fn sign<T: Serialize>(claims: &T, secret: &[u8]) -> Result<String, AuthError> {
    Ok(encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )?)
}

fn verify<T: DeserializeOwned>(token: &str, secret: &[u8]) -> jsonwebtoken::errors::Result<T> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;
    decode::<T>(token, &DecodingKey::from_secret(secret), &validation).map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new("access-secret", "refresh-secret", 3600, 7200)
    }

    #[test]
    fn refresh_embeds_access_token() {
        let codec = codec();
        let pair = codec
            .mint("client", "guest", None, ClientPermissions::default())
            .unwrap();
        let refresh = codec.decode_refresh(&pair.refresh_token).unwrap();
        assert_eq!(refresh.access_token, pair.access_token);
        assert!(refresh.expire > pair.expiration);

        let access = codec.decode_access(&pair.access_token).unwrap();
        assert_eq!(access.client_id, "client");
        assert_eq!(access.expire, pair.expiration);
    }

    #[test]
    fn secrets_are_not_interchangeable() {
        let codec = codec();
        let pair = codec
            .mint("client", "guest", None, ClientPermissions::default())
            .unwrap();
        assert!(codec.decode_access(&pair.refresh_token).is_err());
        assert!(codec.decode_refresh(&pair.access_token).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let codec = codec();
        let pair = codec
            .mint("client", "guest", None, ClientPermissions::default())
            .unwrap();
        let other = TokenCodec::new("other", "other", 3600, 7200);
        assert!(other.decode_access(&pair.access_token).is_err());
        assert!(matches!(
            codec.decode_access("not.a.token"),
            Err(AuthError::InvalidCredential("access"))
        ));
    }

    #[test]
    fn expired_tokens_still_decode() {
        let codec = TokenCodec::new("a", "r", -10, -10);
        let pair = codec
            .mint("client", "guest", None, ClientPermissions::default())
            .unwrap();
        let access = codec.decode_access(&pair.access_token).unwrap();
        assert!(access.expire < now_ts());
    }

    #[test]
    fn missing_permissions_default() {
        let legacy = sign(
            &serde_json::json!({"client_id": "c", "username": "u", "expire": 1.0}),
            b"a",
        )
        .unwrap();
        let codec = TokenCodec::new("a", "r", 1, 1);
        let claims = codec.decode_access(&legacy).unwrap();
        assert_eq!(claims.permissions(), ClientPermissions::default());
    }
}
