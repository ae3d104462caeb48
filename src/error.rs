//! Error types for the tenant connection provider.
//!
//! Every failure the provider can report is a variant of [`ProviderError`].
//! Configuration and acquisition errors are always surfaced to the caller;
//! only a bootstrap failure is fatal to the provider as a whole.

use crate::tenant::TenantId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("The tenant '{tenant}' is not known")]
    UnknownTenant { tenant: TenantId },

    #[error("Invalid configuration for tenant '{tenant}': {reason}")]
    InvalidTenantConfiguration { tenant: TenantId, reason: String },

    #[error("Could not acquire a connection for tenant '{tenant}': {message}")]
    ConnectionAcquisition {
        tenant: TenantId,
        message: String,
        suggestion: String,
    },

    #[error(
        "There is no connection pool for tenant '{tenant}'; the connection being released was never acquired through this provider"
    )]
    UnknownTenantOnRelease { tenant: TenantId },

    #[error("Unable to bootstrap the base tenant: {message}")]
    ProviderBootstrap {
        message: String,
        #[source]
        source: Box<ProviderError>,
    },

    #[error("Schema initialization failed for tenant '{tenant}': {message}")]
    Initialization { tenant: TenantId, message: String },

    #[error("Settings lookup failed for tenant '{tenant}': {message}")]
    Resolver { tenant: TenantId, message: String },

    #[error("The provider has been stopped")]
    ProviderStopped,

    #[error("{} pool(s) failed to stop", failures.len())]
    ShutdownFailed { failures: Vec<ShutdownFailure> },
}

/// A single pool that could not be stopped during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownFailure {
    pub tenant: TenantId,
    pub message: String,
}

impl std::fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tenant, self.message)
    }
}

impl ProviderError {
    /// Create an unknown tenant error.
    pub fn unknown_tenant(tenant: &TenantId) -> Self {
        Self::UnknownTenant {
            tenant: tenant.clone(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(tenant: &TenantId, reason: impl Into<String>) -> Self {
        Self::InvalidTenantConfiguration {
            tenant: tenant.clone(),
            reason: reason.into(),
        }
    }

    /// Create an acquisition error with a helpful suggestion.
    pub fn acquisition(
        tenant: &TenantId,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::ConnectionAcquisition {
            tenant: tenant.clone(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an unknown-tenant-on-release error.
    pub fn unknown_tenant_on_release(tenant: &TenantId) -> Self {
        Self::UnknownTenantOnRelease {
            tenant: tenant.clone(),
        }
    }

    /// Wrap the error that prevented the base tenant from coming up.
    pub fn bootstrap(message: impl Into<String>, source: ProviderError) -> Self {
        Self::ProviderBootstrap {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Create a schema initialization error.
    pub fn initialization(tenant: &TenantId, message: impl Into<String>) -> Self {
        Self::Initialization {
            tenant: tenant.clone(),
            message: message.into(),
        }
    }

    /// Create a settings resolver error.
    pub fn resolver(tenant: &TenantId, message: impl Into<String>) -> Self {
        Self::Resolver {
            tenant: tenant.clone(),
            message: message.into(),
        }
    }

    /// Tenant the error refers to, if any.
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            Self::UnknownTenant { tenant }
            | Self::InvalidTenantConfiguration { tenant, .. }
            | Self::ConnectionAcquisition { tenant, .. }
            | Self::UnknownTenantOnRelease { tenant }
            | Self::Initialization { tenant, .. }
            | Self::Resolver { tenant, .. } => Some(tenant),
            Self::ProviderBootstrap { source, .. } => source.tenant(),
            Self::ProviderStopped | Self::ShutdownFailed { .. } => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionAcquisition { suggestion, .. } => Some(suggestion),
            Self::ProviderBootstrap { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Acquisition failures leave the pool registered and initialization
    /// failures leave the tenant uninitialized, so both may succeed on a
    /// later request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionAcquisition { .. } | Self::Initialization { .. } | Self::Resolver { .. }
        )
    }

    /// Convert an sqlx error raised while acquiring a connection.
    pub fn from_acquire(tenant: &TenantId, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::acquisition(
                tenant,
                "timed out waiting for a pooled connection",
                "The pool is exhausted or the database is slow; raise max_connections or acquire_timeout",
            ),
            sqlx::Error::PoolClosed => Self::acquisition(
                tenant,
                "connection pool is closed",
                "The provider is shutting down; retry against a running provider",
            ),
            sqlx::Error::Io(io_err) => Self::acquisition(
                tenant,
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => Self::acquisition(
                tenant,
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Configuration(msg) => Self::acquisition(
                tenant,
                msg.to_string(),
                "Check the tenant's connection URL and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let message = match db_err.code() {
                    Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
                    None => db_err.message().to_string(),
                };
                Self::acquisition(
                    tenant,
                    message,
                    "Verify the tenant's username, password and database name",
                )
            }
            other => Self::acquisition(
                tenant,
                other.to_string(),
                "Check that the tenant's database server is running and accessible",
            ),
        }
    }
}

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
