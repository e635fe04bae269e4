//! Credential verification errors.

use thiserror::Error;

/// Why a credential was rejected.
///
/// Callers map every variant to "no access"; none of them is fatal.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed token, bad signature, expired, or wrong algorithm.
    #[error("invalid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    /// The token verified but carries no `role` claim.
    #[error("token has no role claim")]
    MissingRole,
    /// The configured algorithm is not an HMAC algorithm.
    #[error("unsupported JWT algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Result type for credential operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(AuthError::MissingRole.to_string(), "token has no role claim");
        assert_eq!(
            AuthError::UnsupportedAlgorithm("RS256".into()).to_string(),
            "unsupported JWT algorithm: RS256"
        );
    }

    #[test]
    fn jwt_error_converts() {
        let jwt_err: jsonwebtoken::errors::Error =
            jsonwebtoken::errors::ErrorKind::InvalidToken.into();
        let err: AuthError = jwt_err.into();
        assert!(matches!(err, AuthError::Jwt(_)));
        assert!(err.to_string().starts_with("invalid token"));
    }
}
