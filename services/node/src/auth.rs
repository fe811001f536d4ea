//! Bearer-token verification.
//!
//! One RSA key is loaded from the configured PEM path at process start and
//! shared read-only for the process lifetime.  Tokens are short-lived and
//! typically seen once per connection, so no token -> claims cache exists.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::path::Path;

/// Decoded token claims.  Immutable once parsed; `jti` carries the
/// participant identifier.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
    pub aud: Option<String>,
    pub jti: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: i64,
    pub nbf: Option<i64>,
    pub iat: Option<i64>,
}

impl Claims {
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn has_roles(&self, wanted: &[&str]) -> bool {
        self.roles.iter().any(|r| wanted.contains(&r.as_str()))
    }

    pub fn has_permissions(&self, wanted: &[&str]) -> bool {
        self.permissions
            .iter()
            .any(|p| wanted.contains(&p.as_str()))
    }
}

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token could not be decrypted")]
    Decryption,
    #[error("token is expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
}

impl TokenError {
    /// Human-readable details carried in the IDENTITY_REJECTION response.
    pub fn details(self) -> &'static str {
        match self {
            TokenError::Malformed => "Claim was invalid",
            TokenError::Decryption => "Token could not be decrypted",
            TokenError::Expired => "This token is already expired",
            TokenError::NotYetValid => "This token is not valid yet",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyLoadError {
    #[error("reading token key '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("token key is not a valid RSA PEM: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),
}

/// Process-wide token verifier.  The key is immutable after load.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyLoadError> {
        let key = DecodingKey::from_rsa_pem(pem)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        Ok(TokenVerifier { key, validation })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, KeyLoadError> {
        let pem = std::fs::read(path).map_err(|source| KeyLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_pem(&pem)
    }

    /// Verify a bearer token and extract its claims.
    ///
    /// Expiry and not-before checks use system UTC with zero leeway; a token
    /// whose expiry is at or before now fails with [`TokenError::Expired`].
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::ImmatureSignature => TokenError::NotYetValid,
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidRsaKey(_)
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::Crypto(_) => TokenError::Decryption,
                _ => TokenError::Malformed,
            })
    }
}
