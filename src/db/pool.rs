//! Connection pool capabilities and the sqlx-backed implementation.
//!
//! The registry only talks to pools through [`TenantPool`] and builds them
//! through [`PoolFactory`]. [`SqlxPoolFactory`] provides database-specific
//! pools (MySqlPool, PgPool, SqlitePool) to keep full type support for the
//! connection consumer.

use crate::config::{PoolOptions, PoolSettings};
use crate::error::{ProviderError, ProviderResult};
use crate::tenant::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::{
    MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, mysql::MySqlConnectOptions,
    mysql::MySqlPoolOptions, postgres::PgConnectOptions, postgres::PgPoolOptions,
    sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions,
};
use std::str::FromStr;
use tracing::debug;

/// A connection pool owned by exactly one tenant.
#[async_trait]
pub trait TenantPool: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Acquire a connection, waiting at most the pool's own acquire timeout.
    async fn acquire(&self) -> ProviderResult<Self::Connection>;

    /// Hand a connection back to the pool.
    async fn release(&self, connection: Self::Connection);

    /// Close the pool. Connections still borrowed are closed when released.
    async fn stop(&self) -> ProviderResult<()>;

    fn supports_aggressive_release(&self) -> bool;
}

/// Builds a configured pool from a tenant's effective settings.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Pool: TenantPool;

    async fn create(&self, tenant: &TenantId, settings: &PoolSettings)
    -> ProviderResult<Self::Pool>;
}

/// Connection type handed out by the pools of factory `F`.
pub type ConnectionOf<F> = <<F as PoolFactory>::Pool as TenantPool>::Connection;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse a driver name as found in tenant settings.
    pub fn from_driver(driver: &str) -> Option<Self> {
        match driver.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Database-specific connection pool for one tenant.
#[derive(Debug, Clone)]
pub struct DbPool {
    tenant: TenantId,
    inner: DbPoolInner,
    aggressive_release: bool,
}

#[derive(Debug, Clone)]
enum DbPoolInner {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn db_type(&self) -> DatabaseType {
        match &self.inner {
            DbPoolInner::MySql(_) => DatabaseType::MySQL,
            DbPoolInner::Postgres(_) => DatabaseType::PostgreSQL,
            DbPoolInner::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Number of open connections, idle or in use.
    pub fn size(&self) -> u32 {
        match &self.inner {
            DbPoolInner::MySql(pool) => pool.size(),
            DbPoolInner::Postgres(pool) => pool.size(),
            DbPoolInner::SQLite(pool) => pool.size(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            DbPoolInner::MySql(pool) => pool.is_closed(),
            DbPoolInner::Postgres(pool) => pool.is_closed(),
            DbPoolInner::SQLite(pool) => pool.is_closed(),
        }
    }
}

/// A pooled connection. Returned to its pool when released or dropped.
#[derive(Debug)]
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbConnection::MySql(_) => DatabaseType::MySQL,
            DbConnection::Postgres(_) => DatabaseType::PostgreSQL,
            DbConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

#[async_trait]
impl TenantPool for DbPool {
    type Connection = DbConnection;

    async fn acquire(&self) -> ProviderResult<DbConnection> {
        let acquired = match &self.inner {
            DbPoolInner::MySql(pool) => pool.acquire().await.map(DbConnection::MySql),
            DbPoolInner::Postgres(pool) => pool.acquire().await.map(DbConnection::Postgres),
            DbPoolInner::SQLite(pool) => pool.acquire().await.map(DbConnection::SQLite),
        };
        acquired.map_err(|e| ProviderError::from_acquire(&self.tenant, e))
    }

    async fn release(&self, connection: DbConnection) {
        // sqlx returns the connection to its originating pool on drop.
        debug!(tenant = %self.tenant, db_type = %connection.db_type(), "Releasing connection");
        drop(connection);
    }

    async fn stop(&self) -> ProviderResult<()> {
        match &self.inner {
            DbPoolInner::MySql(pool) => pool.close().await,
            DbPoolInner::Postgres(pool) => pool.close().await,
            DbPoolInner::SQLite(pool) => pool.close().await,
        }
        Ok(())
    }

    fn supports_aggressive_release(&self) -> bool {
        self.aggressive_release
    }
}

/// Creates sqlx pools from tenant settings.
///
/// Pools are created lazily: no connection is opened until the first
/// acquire, so a database that is down surfaces as an acquisition error and
/// the pool stays registered for later attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxPoolFactory;

impl SqlxPoolFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PoolFactory for SqlxPoolFactory {
    type Pool = DbPool;

    async fn create(&self, tenant: &TenantId, settings: &PoolSettings) -> ProviderResult<DbPool> {
        let url = settings
            .url()
            .ok_or_else(|| ProviderError::unknown_tenant(tenant))?;
        let driver = settings.driver().unwrap_or_default();
        let db_type = DatabaseType::from_driver(driver).ok_or_else(|| {
            ProviderError::invalid_configuration(
                tenant,
                format!("unsupported driver '{driver}' (expected postgres, mysql, mariadb or sqlite)"),
            )
        })?;
        let username = settings.username().unwrap_or_default();
        let password = settings.password().unwrap_or_default();
        let opts = settings.pool_options(tenant)?;

        debug!(
            tenant = %tenant,
            db_type = %db_type,
            url = %settings.masked_url(),
            "Creating connection pool"
        );

        let inner = match db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(url)
                    .map_err(|e| invalid_url(tenant, db_type, e))?
                    .username(username)
                    .password(password)
                    .charset("utf8mb4");
                DbPoolInner::MySql(pool_options::<MySql>(&opts, false).connect_lazy_with(options))
            }
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(url)
                    .map_err(|e| invalid_url(tenant, db_type, e))?
                    .username(username)
                    .password(password);
                DbPoolInner::Postgres(
                    pool_options::<Postgres>(&opts, false).connect_lazy_with(options),
                )
            }
            DatabaseType::SQLite => {
                // SQLite has no authentication; the credentials are validated but unused.
                let options =
                    SqliteConnectOptions::from_str(url).map_err(|e| invalid_url(tenant, db_type, e))?;
                DbPoolInner::SQLite(pool_options::<Sqlite>(&opts, true).connect_lazy_with(options))
            }
        };

        Ok(DbPool {
            tenant: tenant.clone(),
            inner,
            aggressive_release: opts.aggressive_release_or_default(),
        })
    }
}

fn pool_options<DB: sqlx::Database>(opts: &PoolOptions, is_sqlite: bool) -> sqlx::pool::PoolOptions<DB> {
    sqlx::pool::PoolOptions::<DB>::new()
        .min_connections(opts.min_connections_or_default())
        .max_connections(opts.max_connections_or_default(is_sqlite))
        .acquire_timeout(opts.acquire_timeout())
        .idle_timeout(Some(opts.idle_timeout()))
        .test_before_acquire(opts.test_before_acquire_or_default())
}

fn invalid_url(tenant: &TenantId, db_type: DatabaseType, err: sqlx::Error) -> ProviderError {
    let expected = match db_type {
        DatabaseType::PostgreSQL => "postgres://host:5432/db",
        DatabaseType::MySQL => "mysql://host:3306/db",
        DatabaseType::SQLite => "sqlite:path/to/db.sqlite",
    };
    ProviderError::invalid_configuration(
        tenant,
        format!("invalid {db_type} connection URL ({err}); expected a URL like {expected}"),
    )
}
