//! Tenant connection provider.
//!
//! The entry point for connection consumers: hands out connections keyed by
//! tenant, creating each tenant's pool on first use and running the schema
//! initialization gate before a tenant's first connection is returned.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_pool::config::{DRIVER_KEY, PASSWORD_KEY, PoolSettings, URL_KEY, USERNAME_KEY};
//! use tenant_pool::db::SqlxPoolFactory;
//! use tenant_pool::provider::TenantConnectionProvider;
//! use tenant_pool::tenant::{InMemorySettingsResolver, TenantId, TenantSettings};
//!
//! # async fn run() -> tenant_pool::error::ProviderResult<()> {
//! let resolver = Arc::new(InMemorySettingsResolver::new());
//! resolver.set_tenant(
//!     "acme",
//!     TenantSettings::new("postgres://db/acme", "postgres", "acme", "secret"),
//! );
//! let host = PoolSettings::new()
//!     .with(URL_KEY, "postgres://db/base")
//!     .with(DRIVER_KEY, "postgres")
//!     .with(USERNAME_KEY, "base")
//!     .with(PASSWORD_KEY, "secret");
//!
//! let provider = TenantConnectionProvider::builder(SqlxPoolFactory, resolver, host)
//!     .start()
//!     .await?;
//! let acme = TenantId::new("acme");
//! let conn = provider.get_connection(&acme).await?;
//! provider.release_connection(&acme, conn).await?;
//! provider.stop().await
//! # }
//! ```

use crate::config::PoolSettings;
use crate::db::pool::{ConnectionOf, PoolFactory, TenantPool};
use crate::db::registry::{SharedInitializer, TenantRegistry};
use crate::error::{ProviderError, ProviderResult};
use crate::tenant::{SettingsResolver, TenantId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configures and starts a [`TenantConnectionProvider`].
pub struct ProviderBuilder<F: PoolFactory> {
    factory: F,
    resolver: Arc<dyn SettingsResolver>,
    host: PoolSettings,
    base_tenant: TenantId,
    initializer: Option<SharedInitializer<F>>,
}

impl<F: PoolFactory> ProviderBuilder<F> {
    /// Override the identifier reserved for the base tenant.
    pub fn base_tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.base_tenant = tenant.into();
        self
    }

    /// Install the schema initializer run for every tenant, base included.
    pub fn initializer(mut self, initializer: SharedInitializer<F>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Bootstrap the provider.
    ///
    /// Creates the base tenant's pool from the host settings, acquires a base
    /// connection and runs the initialization gate against it before any
    /// request is served. Any failure is reported as
    /// [`ProviderError::ProviderBootstrap`] and nothing is left running.
    pub async fn start(self) -> ProviderResult<TenantConnectionProvider<F>> {
        let base_tenant = self.base_tenant.clone();
        info!(base_tenant = %base_tenant, "Starting tenant connection provider");

        let registry = TenantRegistry::new(
            self.base_tenant,
            self.host,
            self.resolver,
            self.factory,
            self.initializer,
        )
        .await
        .map_err(|e| ProviderError::bootstrap("cannot create the base tenant pool", e))?;

        let pool = registry.base_pool()?;
        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                abandon(&registry).await;
                return Err(ProviderError::bootstrap(
                    "cannot acquire a base tenant connection",
                    e,
                ));
            }
        };

        let gate = registry.ensure_initialized(&base_tenant, &mut conn).await;
        pool.release(conn).await;
        if let Err(e) = gate {
            abandon(&registry).await;
            return Err(ProviderError::bootstrap(
                "cannot initialize the base tenant schema",
                e,
            ));
        }

        info!(base_tenant = %base_tenant, "Tenant connection provider started");
        Ok(TenantConnectionProvider { registry })
    }
}

async fn abandon<F: PoolFactory>(registry: &TenantRegistry<F>) {
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Failed to stop pools after unsuccessful start");
    }
}

/// Hands out per-tenant connections. Share it through `Arc`.
pub struct TenantConnectionProvider<F: PoolFactory> {
    registry: TenantRegistry<F>,
}

impl<F: PoolFactory> TenantConnectionProvider<F> {
    /// Begin configuring a provider.
    ///
    /// `host` carries the base tenant's identity keys and the pooling
    /// parameters shared by every tenant.
    pub fn builder(
        factory: F,
        resolver: Arc<dyn SettingsResolver>,
        host: PoolSettings,
    ) -> ProviderBuilder<F> {
        ProviderBuilder {
            factory,
            resolver,
            host,
            base_tenant: TenantId::base(),
            initializer: None,
        }
    }

    pub fn base_tenant(&self) -> &TenantId {
        self.registry.base_tenant()
    }

    pub fn registry(&self) -> &TenantRegistry<F> {
        &self.registry
    }

    /// A connection from the base pool, for tenant-agnostic work.
    pub async fn get_any_connection(&self) -> ProviderResult<ConnectionOf<F>> {
        let pool = self.registry.base_pool()?;
        let conn = pool.acquire().await?;
        debug!(tenant = %self.registry.base_tenant(), "Acquired base connection");
        Ok(conn)
    }

    /// A connection for `tenant`, creating its pool and initializing its
    /// schema on first use.
    pub async fn get_connection(&self, tenant: &TenantId) -> ProviderResult<ConnectionOf<F>> {
        if self.registry.is_base(tenant) {
            return self.get_any_connection().await;
        }

        let pool = self.registry.get_or_create_pool(tenant).await?;
        let mut conn = pool.acquire().await?;

        if let Err(e) = self.registry.ensure_initialized(tenant, &mut conn).await {
            warn!(tenant = %tenant, error = %e, "Tenant schema initialization failed");
            pool.release(conn).await;
            return Err(e);
        }

        debug!(tenant = %tenant, "Acquired tenant connection");
        Ok(conn)
    }

    /// Return a connection to `tenant`'s pool.
    ///
    /// Works after [`stop`](Self::stop) as well, so borrowed connections can
    /// always be handed back.
    pub async fn release_connection(
        &self,
        tenant: &TenantId,
        conn: ConnectionOf<F>,
    ) -> ProviderResult<()> {
        match self.registry.pool(tenant).await {
            Some(pool) => {
                pool.release(conn).await;
                Ok(())
            }
            None => Err(ProviderError::unknown_tenant_on_release(tenant)),
        }
    }

    /// Return a connection obtained from [`get_any_connection`](Self::get_any_connection).
    pub async fn release_any_connection(&self, conn: ConnectionOf<F>) {
        if let Some(pool) = self.registry.pool(self.registry.base_tenant()).await {
            pool.release(conn).await;
        }
    }

    pub fn supports_aggressive_release(&self) -> bool {
        self.registry.supports_aggressive_release()
    }

    /// Stop every pool. Subsequent `get_*` calls fail with
    /// [`ProviderError::ProviderStopped`]; stopping twice is a no-op.
    pub async fn stop(&self) -> ProviderResult<()> {
        info!("Stopping tenant connection provider");
        self.registry.shutdown().await
    }
}

impl<F: PoolFactory> std::fmt::Debug for TenantConnectionProvider<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnectionProvider")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DRIVER_KEY, PASSWORD_KEY, URL_KEY, USERNAME_KEY};
    use crate::db::{DatabaseType, SqlxPoolFactory};
    use crate::tenant::{InMemorySettingsResolver, TenantSettings};

    fn sqlite_host() -> PoolSettings {
        PoolSettings::new()
            .with(URL_KEY, "sqlite::memory:")
            .with(DRIVER_KEY, "sqlite")
            .with(USERNAME_KEY, "base")
            .with(PASSWORD_KEY, "unused")
    }

    #[tokio::test]
    async fn test_start_with_default_base_tenant() {
        let provider = TenantConnectionProvider::builder(
            SqlxPoolFactory,
            Arc::new(InMemorySettingsResolver::new()),
            sqlite_host(),
        )
        .start()
        .await
        .unwrap();

        assert_eq!(provider.base_tenant(), &TenantId::base());
        let conn = provider.get_any_connection().await.unwrap();
        assert_eq!(conn.db_type(), DatabaseType::SQLite);
        provider.release_any_connection(conn).await;
        assert!(provider.registry().is_initialized(&TenantId::base()).await);
        provider.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_base_tenant_by_id_uses_base_pool() {
        let provider = TenantConnectionProvider::builder(
            SqlxPoolFactory,
            Arc::new(InMemorySettingsResolver::new()),
            sqlite_host(),
        )
        .base_tenant("root")
        .start()
        .await
        .unwrap();

        let root = TenantId::new("root");
        let conn = provider.get_connection(&root).await.unwrap();
        provider.release_connection(&root, conn).await.unwrap();
        assert_eq!(provider.registry().pool_count().await, 0);
        provider.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tenant_pool_created_on_demand() {
        let resolver = Arc::new(InMemorySettingsResolver::new());
        resolver.set_tenant(
            "acme",
            TenantSettings::new("sqlite::memory:", "sqlite", "acme", "unused"),
        );
        let provider = TenantConnectionProvider::builder(SqlxPoolFactory, resolver, sqlite_host())
            .start()
            .await
            .unwrap();

        let acme = TenantId::new("acme");
        assert!(provider.registry().pool(&acme).await.is_none());
        let conn = provider.get_connection(&acme).await.unwrap();
        provider.release_connection(&acme, conn).await.unwrap();
        assert_eq!(provider.registry().tenants().await, vec![acme]);
        provider.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_host_settings_fail_start() {
        let host = sqlite_host().with(DRIVER_KEY, "");
        let err = TenantConnectionProvider::builder(
            SqlxPoolFactory,
            Arc::new(InMemorySettingsResolver::new()),
            host,
        )
        .start()
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::ProviderBootstrap { .. }));
        assert_eq!(err.tenant(), Some(&TenantId::base()));
    }
}
