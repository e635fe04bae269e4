//! Decoded identity claims.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role asserted by a verified token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// A rider following a bus.
    Student,
    /// Operations staff.
    Admin,
    /// A bus driver. Publishes locations, never watches them.
    Driver,
    /// Any role this service does not recognize.
    Other(String),
}

impl Role {
    /// Parse a role claim. Matching is exact; unknown values become [`Role::Other`].
    pub fn parse(value: &str) -> Self {
        match value {
            "student" => Self::Student,
            "admin" => Self::Admin,
            "driver" => Self::Driver,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name of the role.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Student => "student",
            Self::Admin => "admin",
            Self::Driver => "driver",
            Self::Other(s) => s,
        }
    }

    /// Whether this role may subscribe to a bus channel.
    pub fn can_view(&self) -> bool {
        matches!(self, Self::Student | Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity extracted from a verified credential.
///
/// Lives only for the duration of an admission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthClaim {
    /// Asserted role.
    pub role: Role,
    /// Subject identifier, when the token carries one.
    pub subject: Option<String>,
}

impl AuthClaim {
    /// Claim with a role and no subject.
    pub fn with_role(role: Role) -> Self {
        Self {
            role,
            subject: None,
        }
    }
}

/// JWT body as issued by the account service.
///
/// `user_id` is numeric in tokens minted by the account service but
/// tolerated as any JSON value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<serde_json::Value>,
    pub exp: i64,
}

impl TokenClaims {
    /// Subject from `sub`, falling back to `user_id`.
    pub(crate) fn subject(&self) -> Option<String> {
        if let Some(sub) = self.sub.as_ref().filter(|s| !s.is_empty()) {
            return Some(sub.clone());
        }
        match self.user_id.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
