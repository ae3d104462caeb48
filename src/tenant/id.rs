//! Tenant identifiers.

use serde::{Deserialize, Serialize};

/// Identifier of the tenant backing "any connection" requests when the
/// provider is built without an explicit base tenant.
pub const DEFAULT_BASE_TENANT: &str = "_baseTenant";

/// Opaque tenant key. Two tenants are the same tenant iff their ids are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default base tenant identifier.
    pub fn base() -> Self {
        Self::new(DEFAULT_BASE_TENANT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
