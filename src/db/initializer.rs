//! Schema initialization capability.
//!
//! A tenant's database is checked once, against a live connection, before the
//! first connection for that tenant is handed out. Deployments plug in their
//! own [`SchemaInitializer`]; two are provided:
//!
//! - [`NoopInitializer`]: never needs initialization
//! - [`ScriptInitializer`]: runs a SQL script when a marker table is missing

use crate::db::pool::DbConnection;
use crate::error::{ProviderError, ProviderResult};
use crate::tenant::TenantId;
use async_trait::async_trait;
use sqlx::{Connection, Executor};
use tracing::{debug, info};

/// Table checked by [`ScriptInitializer`] unless configured otherwise.
pub const DEFAULT_MARKER_TABLE: &str = "i_exists";

/// Detects and performs one-time schema setup for a tenant.
///
/// Errors should be reported as [`ProviderError::Initialization`]; a tenant
/// is only marked initialized when both calls succeed.
#[async_trait]
pub trait SchemaInitializer<C: Send>: Send + Sync {
    async fn needs_initialization(&self, tenant: &TenantId, conn: &mut C) -> ProviderResult<bool>;

    async fn initialize(&self, tenant: &TenantId, conn: &mut C) -> ProviderResult<()>;
}

/// Initializer for deployments whose schemas are managed elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInitializer;

#[async_trait]
impl<C: Send> SchemaInitializer<C> for NoopInitializer {
    async fn needs_initialization(&self, _tenant: &TenantId, _conn: &mut C) -> ProviderResult<bool> {
        Ok(false)
    }

    async fn initialize(&self, _tenant: &TenantId, _conn: &mut C) -> ProviderResult<()> {
        Ok(())
    }
}

/// SQL queries used to detect the marker table.
pub mod queries {
    pub const POSTGRES_TABLE_EXISTS: &str = r#"
        SELECT COUNT(*) FROM information_schema.tables
        WHERE table_schema = current_schema()
        AND table_name = $1
        "#;

    pub const MYSQL_TABLE_EXISTS: &str = r#"
        SELECT COUNT(*) FROM information_schema.TABLES
        WHERE TABLE_SCHEMA = DATABASE()
        AND TABLE_NAME = ?
        "#;

    pub const SQLITE_TABLE_EXISTS: &str = r#"
        SELECT COUNT(*) FROM sqlite_master
        WHERE type = 'table'
        AND name = ?
        "#;
}

/// Initializes a tenant by running SQL statements when a marker table is absent.
///
/// The statements run in a single transaction, so a failing script leaves the
/// tenant's database as it was and the next request retries it. The script
/// is expected to create the marker table.
#[derive(Debug, Clone)]
pub struct ScriptInitializer {
    marker_table: String,
    statements: Vec<String>,
}

impl ScriptInitializer {
    pub fn new(marker_table: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            marker_table: marker_table.into(),
            statements,
        }
    }

    /// Build from a script with `;`-separated statements. Blank statements
    /// and `--` comment lines are dropped.
    pub fn from_script(marker_table: impl Into<String>, script: &str) -> Self {
        Self::new(marker_table, split_statements(script))
    }

    pub fn marker_table(&self) -> &str {
        &self.marker_table
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }
}

/// Run `$statements` inside one transaction on a pooled sqlx connection.
macro_rules! run_in_transaction {
    ($conn:expr, $statements:expr, $tenant:expr) => {{
        let mut tx = $conn.begin().await.map_err(|e| init_error($tenant, e))?;
        for (index, statement) in $statements.iter().enumerate() {
            debug!(tenant = %$tenant, statement = index + 1, "Running initialization statement");
            (&mut *tx)
                .execute(statement.as_str())
                .await
                .map_err(|e| {
                    ProviderError::initialization(
                        $tenant,
                        format!("statement {} failed: {}", index + 1, e),
                    )
                })?;
        }
        tx.commit().await.map_err(|e| init_error($tenant, e))
    }};
}

#[async_trait]
impl SchemaInitializer<DbConnection> for ScriptInitializer {
    async fn needs_initialization(
        &self,
        tenant: &TenantId,
        conn: &mut DbConnection,
    ) -> ProviderResult<bool> {
        let table = self.marker_table.as_str();
        let count = match conn {
            DbConnection::MySql(c) => {
                sqlx::query_scalar::<_, i64>(queries::MYSQL_TABLE_EXISTS)
                    .bind(table)
                    .fetch_one(&mut **c)
                    .await
            }
            DbConnection::Postgres(c) => {
                sqlx::query_scalar::<_, i64>(queries::POSTGRES_TABLE_EXISTS)
                    .bind(table)
                    .fetch_one(&mut **c)
                    .await
            }
            DbConnection::SQLite(c) => {
                sqlx::query_scalar::<_, i64>(queries::SQLITE_TABLE_EXISTS)
                    .bind(table)
                    .fetch_one(&mut **c)
                    .await
            }
        }
        .map_err(|e| init_error(tenant, e))?;

        debug!(tenant = %tenant, marker_table = %table, found = (count > 0), "Checked marker table");
        Ok(count == 0)
    }

    async fn initialize(&self, tenant: &TenantId, conn: &mut DbConnection) -> ProviderResult<()> {
        info!(
            tenant = %tenant,
            statements = self.statements.len(),
            "Running schema initialization script"
        );
        match conn {
            DbConnection::MySql(c) => run_in_transaction!(c, self.statements, tenant),
            DbConnection::Postgres(c) => run_in_transaction!(c, self.statements, tenant),
            DbConnection::SQLite(c) => run_in_transaction!(c, self.statements, tenant),
        }
    }
}

fn init_error(tenant: &TenantId, err: sqlx::Error) -> ProviderError {
    ProviderError::initialization(tenant, err.to_string())
}

fn split_statements(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|statement| !statement.is_empty())
        .collect()
}
