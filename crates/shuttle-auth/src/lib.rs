//! # shuttle-auth
//!
//! Identity verification for bus viewers. A bearer token issued by the
//! account service is checked (signature, algorithm, expiry) and reduced to
//! an [`AuthClaim`] carrying the viewer's [`Role`].
//!
//! Only `student` and `admin` may watch a bus; see [`Role::can_view`].

#![deny(unsafe_code)]

pub mod claims;
pub mod errors;
pub mod verifier;

pub use claims::{AuthClaim, Role};
pub use errors::{AuthError, Result};
pub use verifier::{CredentialVerifier, JwtVerifier};
