//! JWT Authentication
//!
//! Validates tokens issued by the wallet sign-in service. The server does
//! NOT issue tokens; it hands out single-use nonces for the wallet to sign
//! and trusts only the subject of a token that verifies.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{random_seed_hex, Address};

/// How long an issued nonce stays redeemable.
pub const NONCE_TTL: Duration = Duration::from_secs(5 * 60);

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
    /// Trust the client-claimed address without a token (development only).
    pub skip_verification: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: flag("AUTH_SKIP_EXPIRY"),
            skip_verification: flag("SKIP_AUTH_VERIFICATION"),
        }
    }

    /// Check if token validation is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims we expect from the sign-in service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the verified wallet address.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Signed matchmaking rating.
    #[serde(default)]
    pub rating: Option<u32>,
    /// Nonce the wallet signed.
    #[serde(default)]
    pub nonce: Option<String>,
}

impl TokenClaims {
    /// The verified address.
    pub fn address(&self) -> &str {
        &self.sub
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Nonce unknown, expired or already used.
    #[error("nonce rejected")]
    NonceRejected,
    /// Claimed address differs from the token subject.
    #[error("address does not match token")]
    AddressMismatch,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    if !config.is_configured() {
        return Err(AuthError::NotConfigured);
    }

    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // Manual expiry check (in case validation was skipped)
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// NONCE CHALLENGE
// =============================================================================

/// Single-use sign-in nonces.
#[derive(Debug, Default)]
pub struct NonceStore {
    issued: Mutex<BTreeMap<String, Instant>>,
}

impl NonceStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh nonce, purging expired ones.
    pub fn issue(&self, now: Instant) -> String {
        let nonce = random_seed_hex();
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        issued.retain(|_, at| now.saturating_duration_since(*at) < NONCE_TTL);
        issued.insert(nonce.clone(), now);
        nonce
    }

    /// Redeem `nonce`. Succeeds at most once, and only within the TTL.
    pub fn consume(&self, nonce: &str, now: Instant) -> bool {
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        match issued.remove(nonce) {
            Some(at) => now.saturating_duration_since(at) < NONCE_TTL,
            None => false,
        }
    }

    /// Outstanding nonces.
    pub fn len(&self) -> usize {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no nonces are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of an `auth` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Address verified.
    Verified {
        /// Wallet address to trust from now on.
        address: Address,
        /// Rating carried by the token.
        rating: Option<u32>,
    },
    /// Client must sign this nonce and come back with a token.
    Challenge {
        /// Nonce to sign.
        nonce: String,
    },
}

/// Resolve an `auth` message into a verified address or a challenge.
pub fn authenticate(
    config: &AuthConfig,
    nonces: &NonceStore,
    claimed: Option<&str>,
    token: Option<&str>,
    now: Instant,
) -> Result<AuthOutcome, AuthError> {
    let Some(token) = token else {
        return match claimed {
            Some(address) if config.skip_verification && !address.is_empty() => {
                Ok(AuthOutcome::Verified {
                    address: address.to_string(),
                    rating: None,
                })
            }
            _ => Ok(AuthOutcome::Challenge {
                nonce: nonces.issue(now),
            }),
        };
    };

    let claims = validate_token(token, config)?;
    if let Some(nonce) = &claims.nonce {
        if !nonces.consume(nonce, now) {
            return Err(AuthError::NonceRejected);
        }
    }
    if claimed.map_or(false, |c| c != claims.address()) {
        return Err(AuthError::AddressMismatch);
    }

    Ok(AuthOutcome::Verified {
        address: claims.sub,
        rating: claims.rating,
    })
}

// =============================================================================
// TESTS
// =============================================================================
