//! Integration tests against real SQLite databases.
//!
//! Tests verify that:
//! - The script initializer creates a tenant schema exactly once, across restarts
//! - The base tenant schema is initialized during startup
//! - A failing script is rolled back and leaves the tenant uninitialized

use sqlx::{Connection, SqliteConnection};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tenant_pool::config::{DRIVER_KEY, PASSWORD_KEY, PoolSettings, URL_KEY, USERNAME_KEY};
use tenant_pool::db::{
    DEFAULT_MARKER_TABLE, DatabaseType, DbConnection, ScriptInitializer, SqlxPoolFactory,
};
use tenant_pool::error::ProviderError;
use tenant_pool::provider::TenantConnectionProvider;
use tenant_pool::tenant::{InMemorySettingsResolver, TenantId, TenantSettings};

const SCHEMA: &str = "
    -- tenant schema
    CREATE TABLE i_exists (id INTEGER);
    CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
";

fn sqlite_url(file: &NamedTempFile) -> String {
    format!("sqlite:{}", file.path().display())
}

fn host_settings(base: &NamedTempFile) -> PoolSettings {
    PoolSettings::new()
        .with(URL_KEY, sqlite_url(base))
        .with(DRIVER_KEY, "sqlite")
        .with(USERNAME_KEY, "app")
        .with(PASSWORD_KEY, "unused")
}

fn resolver(tenants: &[(&str, &NamedTempFile)]) -> Arc<InMemorySettingsResolver> {
    let resolver = Arc::new(InMemorySettingsResolver::new());
    for (tenant, file) in tenants {
        resolver.set_tenant(
            *tenant,
            TenantSettings::new(sqlite_url(file), "sqlite", *tenant, "unused"),
        );
    }
    resolver
}

async fn start(
    base: &NamedTempFile,
    resolver: Arc<InMemorySettingsResolver>,
    script: &str,
) -> Result<TenantConnectionProvider<SqlxPoolFactory>, ProviderError> {
    TenantConnectionProvider::builder(SqlxPoolFactory, resolver, host_settings(base))
        .initializer(Arc::new(ScriptInitializer::from_script(
            DEFAULT_MARKER_TABLE,
            script,
        )))
        .start()
        .await
}

fn sqlite(conn: &mut DbConnection) -> &mut SqliteConnection {
    match conn {
        DbConnection::SQLite(c) => &mut **c,
        other => panic!("expected a SQLite connection, got {}", other.db_type()),
    }
}

async fn table_exists(file: &NamedTempFile, table: &str) -> bool {
    let mut conn = SqliteConnection::connect(&sqlite_url(file)).await.unwrap();
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&mut conn)
            .await
            .unwrap();
    conn.close().await.unwrap();
    count > 0
}

#[tokio::test]
async fn test_script_initializes_tenant_once() {
    let base = NamedTempFile::new().unwrap();
    let acme_db = NamedTempFile::new().unwrap();
    let acme = TenantId::new("acme");

    let provider = start(&base, resolver(&[("acme", &acme_db)]), SCHEMA)
        .await
        .unwrap();
    let mut conn = provider.get_connection(&acme).await.unwrap();
    assert_eq!(conn.db_type(), DatabaseType::SQLite);
    sqlx::query("INSERT INTO notes (body) VALUES (?)")
        .bind("first")
        .execute(sqlite(&mut conn))
        .await
        .unwrap();
    provider.release_connection(&acme, conn).await.unwrap();
    provider.stop().await.unwrap();

    // A restarted provider finds the marker table and leaves the data alone.
    let provider = start(&base, resolver(&[("acme", &acme_db)]), SCHEMA)
        .await
        .unwrap();
    let mut conn = provider.get_connection(&acme).await.unwrap();
    let notes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notes")
        .fetch_one(sqlite(&mut conn))
        .await
        .unwrap();
    assert_eq!(notes, 1);
    provider.release_connection(&acme, conn).await.unwrap();
    provider.stop().await.unwrap();
}

#[tokio::test]
async fn test_base_schema_initialized_at_start() {
    let base = NamedTempFile::new().unwrap();

    let provider = start(&base, resolver(&[]), SCHEMA).await.unwrap();
    assert!(provider.registry().is_initialized(&TenantId::base()).await);
    provider.stop().await.unwrap();

    assert!(table_exists(&base, DEFAULT_MARKER_TABLE).await);
    assert!(table_exists(&base, "notes").await);
}

#[tokio::test]
async fn test_failing_script_rolled_back() {
    let base = NamedTempFile::new().unwrap();
    let acme_db = NamedTempFile::new().unwrap();
    let acme = TenantId::new("acme");

    // The base schema already exists, so only the tenant runs the script.
    let mut conn = SqliteConnection::connect(&sqlite_url(&base)).await.unwrap();
    sqlx::query("CREATE TABLE i_exists (id INTEGER)")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    let broken = "CREATE TABLE i_exists (id INTEGER); INSERT INTO missing_table VALUES (1);";
    let provider = start(&base, resolver(&[("acme", &acme_db)]), broken)
        .await
        .unwrap();

    let err = provider.get_connection(&acme).await.unwrap_err();
    match &err {
        ProviderError::Initialization { tenant, message } => {
            assert_eq!(tenant, &acme);
            assert!(message.contains("statement 2"));
        }
        other => panic!("expected Initialization, got {other:?}"),
    }
    assert!(provider.registry().pool(&acme).await.is_some());
    assert!(!provider.registry().is_initialized(&acme).await);

    // The retry hits the same failure instead of treating the tenant as ready.
    assert!(matches!(
        provider.get_connection(&acme).await,
        Err(ProviderError::Initialization { .. })
    ));
    provider.stop().await.unwrap();

    assert!(!table_exists(&acme_db, DEFAULT_MARKER_TABLE).await);
}
