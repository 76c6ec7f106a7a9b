//! Connection-time authentication.
//!
//! A device proves which user it belongs to with a signed bearer token
//! (HS256 JWT) passed as the `token` query parameter of the upgrade URL.  The
//! relay only validates tokens; issuing them is the HTTP login endpoint's job.
//! [`TokenIssuer`] exists so that endpoint, the relay's `--mint-token`
//! command, and tests share one claim layout.
//!
//! Validation is stateless: there is no revocation list, so a token stays
//! good until it expires.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::UserId;

/// Lifetime of tokens minted by [`TokenIssuer::new`] when no TTL is given.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// JWT claims.  `sub` carries the user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
}

/// Why a credential was rejected.  All variants map to close code 4001.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no token supplied")]
    Missing,

    #[error("token expired")]
    Expired,

    #[error("token invalid: {0}")]
    Invalid(String),
}

/// Maps a bearer credential to the user it authenticates.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError>;
}

/// Validates HS256 JWTs signed with a shared secret.
#[derive(Clone)]
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".to_string()));
        }
        Ok(UserId::new(data.claims.sub))
    }
}

/// Mints tokens that [`JwtAuthenticator`] accepts.
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self::with_ttl(secret, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(secret: &[u8], ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Signs a token for `user`, valid from now for the issuer's TTL.
    pub fn issue(&self, user: &UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let iat = unix_now();
        self.sign(&Claims {
            sub: user.as_str().to_string(),
            iat,
            exp: iat + self.ttl.as_secs(),
        })
    }

    /// Signs arbitrary claims.  Used for tokens with custom timestamps.
    pub fn sign(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claims, &self.key)
    }
}

/// Seconds since the Unix epoch.  A clock before 1970 reads as 0.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
