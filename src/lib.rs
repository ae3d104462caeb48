//! Tenant Pool Library
//!
//! This library hands out database connections keyed by tenant. Each tenant
//! gets its own connection pool, created on first use from settings supplied
//! by a [`SettingsResolver`](tenant::SettingsResolver), and its schema is
//! checked once before its first connection is returned.

pub mod config;
pub mod db;
pub mod error;
pub mod provider;
pub mod tenant;

pub use config::{Config, PoolSettings};
pub use error::{ProviderError, ProviderResult};
pub use provider::{ProviderBuilder, TenantConnectionProvider};
pub use tenant::TenantId;
