//! Tenant identity and per-tenant connection settings.
//!
//! - [`TenantId`]: opaque tenant key, including the base tenant constant
//! - [`TenantSettings`] / [`TenantCredentials`]: identity fields as resolved and as validated
//! - [`SettingsResolver`]: capability mapping a tenant to its settings
//! - [`InMemorySettingsResolver`]: runtime-configurable resolver owned by one provider

pub mod id;
pub mod settings;

pub use id::{DEFAULT_BASE_TENANT, TenantId};
pub use settings::{InMemorySettingsResolver, SettingsResolver, TenantCredentials, TenantSettings};
