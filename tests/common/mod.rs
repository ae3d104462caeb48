//! Shared test doubles: an in-memory pool factory that records what the
//! provider asks of it, and a counting schema initializer.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tenant_pool::config::{DRIVER_KEY, PASSWORD_KEY, PoolSettings, URL_KEY, USERNAME_KEY};
use tenant_pool::db::{PoolFactory, SchemaInitializer, TenantPool};
use tenant_pool::error::{ProviderError, ProviderResult};
use tenant_pool::provider::TenantConnectionProvider;
use tenant_pool::tenant::{InMemorySettingsResolver, TenantId, TenantSettings};

/// Everything the mock pools observed, shared between the factory and the test.
#[derive(Default)]
pub struct MockState {
    pub created: Mutex<Vec<TenantId>>,
    pub settings: Mutex<HashMap<TenantId, PoolSettings>>,
    pub create_delays: Mutex<HashMap<TenantId, Duration>>,
    pub failing_acquire: Mutex<HashSet<TenantId>>,
    pub failing_stop: Mutex<HashSet<TenantId>>,
    pub stopped: Mutex<Vec<TenantId>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl MockState {
    pub fn created_count(&self, tenant: &str) -> usize {
        let tenant = TenantId::new(tenant);
        self.created.lock().unwrap().iter().filter(|t| **t == tenant).count()
    }

    pub fn settings_for(&self, tenant: &str) -> Option<PoolSettings> {
        self.settings.lock().unwrap().get(&TenantId::new(tenant)).cloned()
    }

    pub fn delay_creation(&self, tenant: &str, delay: Duration) {
        self.create_delays.lock().unwrap().insert(TenantId::new(tenant), delay);
    }

    pub fn fail_acquire(&self, tenant: &str) {
        self.failing_acquire.lock().unwrap().insert(TenantId::new(tenant));
    }

    pub fn heal_acquire(&self, tenant: &str) {
        self.failing_acquire.lock().unwrap().remove(&TenantId::new(tenant));
    }

    pub fn fail_stop(&self, tenant: &str) {
        self.failing_stop.lock().unwrap().insert(TenantId::new(tenant));
    }

    pub fn stopped(&self) -> Vec<TenantId> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn outstanding(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolFactory for MockFactory {
    type Pool = MockPool;

    async fn create(&self, tenant: &TenantId, settings: &PoolSettings) -> ProviderResult<MockPool> {
        let delay = self.state.create_delays.lock().unwrap().get(tenant).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        // Pool options are validated the same way the sqlx factory does.
        let options = settings.pool_options(tenant)?;
        self.state.created.lock().unwrap().push(tenant.clone());
        self.state
            .settings
            .lock()
            .unwrap()
            .insert(tenant.clone(), settings.clone());
        Ok(MockPool {
            tenant: tenant.clone(),
            aggressive_release: options.aggressive_release_or_default(),
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockPool {
    tenant: TenantId,
    aggressive_release: bool,
    state: Arc<MockState>,
}

#[derive(Debug)]
pub struct MockConnection {
    pub tenant: TenantId,
}

#[async_trait]
impl TenantPool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> ProviderResult<MockConnection> {
        if self.state.failing_acquire.lock().unwrap().contains(&self.tenant) {
            return Err(ProviderError::acquisition(
                &self.tenant,
                "connection refused",
                "Check that the database server is running",
            ));
        }
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            tenant: self.tenant.clone(),
        })
    }

    async fn release(&self, connection: MockConnection) {
        assert_eq!(connection.tenant, self.tenant, "connection released to a foreign pool");
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self) -> ProviderResult<()> {
        self.state.stopped.lock().unwrap().push(self.tenant.clone());
        if self.state.failing_stop.lock().unwrap().contains(&self.tenant) {
            return Err(ProviderError::acquisition(&self.tenant, "close timed out", ""));
        }
        Ok(())
    }

    fn supports_aggressive_release(&self) -> bool {
        self.aggressive_release
    }
}

/// Initializer that counts its calls and remembers which tenants it set up.
#[derive(Default)]
pub struct MockInitializer {
    pub checks: Mutex<Vec<TenantId>>,
    pub runs: Mutex<Vec<TenantId>>,
    pub initialized: Mutex<HashSet<TenantId>>,
    pub failures_left: AtomicUsize,
    pub check_delay: Option<Duration>,
}

impl MockInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_delay(delay: Duration) -> Self {
        Self {
            check_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make the next `n` calls to `initialize` fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn mark_initialized(&self, tenant: &str) {
        self.initialized.lock().unwrap().insert(TenantId::new(tenant));
    }

    pub fn is_initialized(&self, tenant: &str) -> bool {
        self.initialized.lock().unwrap().contains(&TenantId::new(tenant))
    }

    pub fn checks_for(&self, tenant: &str) -> usize {
        let tenant = TenantId::new(tenant);
        self.checks.lock().unwrap().iter().filter(|t| **t == tenant).count()
    }

    pub fn runs_for(&self, tenant: &str) -> usize {
        let tenant = TenantId::new(tenant);
        self.runs.lock().unwrap().iter().filter(|t| **t == tenant).count()
    }
}

#[async_trait]
impl SchemaInitializer<MockConnection> for MockInitializer {
    async fn needs_initialization(
        &self,
        tenant: &TenantId,
        conn: &mut MockConnection,
    ) -> ProviderResult<bool> {
        assert_eq!(&conn.tenant, tenant, "gate ran on another tenant's connection");
        self.checks.lock().unwrap().push(tenant.clone());
        if let Some(delay) = self.check_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(!self.initialized.lock().unwrap().contains(tenant))
    }

    async fn initialize(&self, tenant: &TenantId, _conn: &mut MockConnection) -> ProviderResult<()> {
        self.runs.lock().unwrap().push(tenant.clone());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::initialization(tenant, "migration script failed"));
        }
        self.initialized.lock().unwrap().insert(tenant.clone());
        Ok(())
    }
}

pub fn host_settings() -> PoolSettings {
    PoolSettings::new()
        .with(URL_KEY, "mock://base")
        .with(DRIVER_KEY, "mock")
        .with(USERNAME_KEY, "base_user")
        .with(PASSWORD_KEY, "base_secret")
        .with("max_connections", "4")
}

pub fn tenant_settings(tenant: &str) -> TenantSettings {
    TenantSettings::new(
        format!("mock://{tenant}"),
        "mock",
        format!("{tenant}_user"),
        format!("{tenant}_secret"),
    )
}

/// Resolver knowing the given tenants with complete settings.
pub fn resolver_with(tenants: &[&str]) -> Arc<InMemorySettingsResolver> {
    let resolver = Arc::new(InMemorySettingsResolver::new());
    for tenant in tenants {
        resolver.set_tenant(*tenant, tenant_settings(tenant));
    }
    resolver
}

pub async fn start_provider(
    factory: &MockFactory,
    resolver: Arc<InMemorySettingsResolver>,
    initializer: Option<Arc<MockInitializer>>,
) -> TenantConnectionProvider<MockFactory> {
    let mut builder = TenantConnectionProvider::builder(factory.clone(), resolver, host_settings());
    if let Some(initializer) = initializer {
        builder = builder.initializer(initializer);
    }
    builder.start().await.unwrap()
}
