//! HMAC JWT verification.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

use crate::claims::{AuthClaim, Role, TokenClaims};
use crate::errors::{AuthError, Result};

/// Turns an opaque bearer credential into an [`AuthClaim`].
///
/// Implementations must be side-effect free.
pub trait CredentialVerifier: Send + Sync {
    /// Verify `credential`, returning the claim it asserts.
    fn verify(&self, credential: &str) -> Result<AuthClaim>;
}

/// Verifies shared-secret JWTs (`HS256`, `HS384`, `HS512`).
///
/// Expiry is always enforced; a token must carry `exp` and a non-empty `role`.
pub struct JwtVerifier {
    algorithm: Algorithm,
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    leeway_secs: u64,
}

impl JwtVerifier {
    /// Build a verifier for `algorithm` keyed by `secret`.
    pub fn new(secret: &str, algorithm: &str, leeway_secs: u64) -> Result<Self> {
        let algorithm = parse_hmac_algorithm(algorithm)?;
        Ok(Self {
            algorithm,
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            leeway_secs,
        })
    }

    /// Configured algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Mint a token in the account service's format.
    ///
    /// Used by tests and local tooling; this service exposes no issuance endpoint.
    pub fn issue(&self, role: &Role, subject: Option<&str>, ttl: Duration) -> Result<String> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            sub: subject.map(str::to_string),
            role: Some(role.as_str().to_string()),
            user_id: None,
            exp: Utc::now().timestamp().saturating_add(ttl),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(self.algorithm),
            &claims,
            &self.encoding_key,
        )?)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.leeway_secs;
        validation.validate_aud = false;
        validation
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<AuthClaim> {
        let data =
            jsonwebtoken::decode::<TokenClaims>(credential, &self.decoding_key, &self.validation())
                .inspect_err(|e| debug!(error = %e, "token rejected"))?;
        let claims = data.claims;
        let role = claims
            .role
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(Role::parse)
            .ok_or(AuthError::MissingRole)?;
        Ok(AuthClaim {
            role,
            subject: claims.subject(),
        })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("algorithm", &self.algorithm)
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

fn parse_hmac_algorithm(name: &str) -> Result<Algorithm> {
    match Algorithm::from_str(name) {
        Ok(alg @ (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)) => Ok(alg),
        _ => Err(AuthError::UnsupportedAlgorithm(name.to_string())),
    }
}
