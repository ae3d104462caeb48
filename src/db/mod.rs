//! Database layer.
//!
//! This module provides tenant pool management:
//! - Pool and factory capabilities with the sqlx implementation
//! - Schema initialization gate implementations
//! - Tenant registry coordinating pool creation and initialization per tenant

pub mod initializer;
pub mod pool;
pub mod registry;

pub use initializer::{DEFAULT_MARKER_TABLE, NoopInitializer, SchemaInitializer, ScriptInitializer};
pub use pool::{
    ConnectionOf, DatabaseType, DbConnection, DbPool, PoolFactory, SqlxPoolFactory, TenantPool,
};
pub use registry::{SharedInitializer, TenantRegistry};
