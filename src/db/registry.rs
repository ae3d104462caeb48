//! Tenant registry: the single authority over pool existence and schema
//! initialization state per tenant.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per tenant for the pool**: single-flight creation, concurrent
//!   first requests for the same tenant wait for one construction
//! - **`OnceCell` per tenant for the schema**: the initialization gate runs at
//!   most once to completion, and waiters only proceed after it finished
//! - **Map lock only guards slot handles**: settings resolution, pool
//!   construction and schema initialization all run outside the map lock, so
//!   unrelated tenants never wait on each other
//! - **Base tenant outside the map**: its pool is created eagerly and can never
//!   be missing
//!
//! # Failure Handling
//!
//! - A failed construction leaves the pool cell empty; waiting callers retry
//!   the construction themselves, and the empty slot is dropped from the map
//!   once no caller holds it
//! - A failed initialization leaves the schema cell empty; the next request
//!   for the tenant runs the gate again
//! - Shutdown stops every pool and collects failures instead of aborting

use crate::config::PoolSettings;
use crate::db::initializer::SchemaInitializer;
use crate::db::pool::{ConnectionOf, PoolFactory, TenantPool};
use crate::error::{ProviderError, ProviderResult, ShutdownFailure};
use crate::tenant::{SettingsResolver, TenantId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

/// Schema initializer shared by all tenants of a registry.
pub type SharedInitializer<F> = Arc<dyn SchemaInitializer<ConnectionOf<F>>>;

/// Per-tenant coordination unit.
struct TenantSlot<P> {
    pool: OnceCell<Arc<P>>,
    schema_ready: OnceCell<()>,
}

impl<P> TenantSlot<P> {
    fn empty() -> Self {
        Self {
            pool: OnceCell::new(),
            schema_ready: OnceCell::new(),
        }
    }

    fn with_pool(pool: P) -> Self {
        Self {
            pool: OnceCell::new_with(Some(Arc::new(pool))),
            schema_ready: OnceCell::new(),
        }
    }
}

pub struct TenantRegistry<F: PoolFactory> {
    base_tenant: TenantId,
    base: Arc<TenantSlot<F::Pool>>,
    host: PoolSettings,
    resolver: Arc<dyn SettingsResolver>,
    factory: F,
    initializer: Option<SharedInitializer<F>>,
    tenants: TokioRwLock<HashMap<TenantId, Arc<TenantSlot<F::Pool>>>>,
    stopped: AtomicBool,
}

impl<F: PoolFactory> TenantRegistry<F> {
    /// Create the registry and, eagerly, the base tenant's pool.
    ///
    /// The base pool is configured from the host settings as they are; their
    /// identity keys must be complete like any tenant's.
    pub async fn new(
        base_tenant: TenantId,
        host: PoolSettings,
        resolver: Arc<dyn SettingsResolver>,
        factory: F,
        initializer: Option<SharedInitializer<F>>,
    ) -> ProviderResult<Self> {
        host.tenant_settings().into_credentials(&base_tenant)?;
        let base_pool = factory.create(&base_tenant, &host).await?;
        info!(
            tenant = %base_tenant,
            url = %host.masked_url(),
            "Created base tenant pool"
        );

        Ok(Self {
            base_tenant,
            base: Arc::new(TenantSlot::with_pool(base_pool)),
            host,
            resolver,
            factory,
            initializer,
            tenants: TokioRwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn base_tenant(&self) -> &TenantId {
        &self.base_tenant
    }

    pub fn is_base(&self, tenant: &TenantId) -> bool {
        *tenant == self.base_tenant
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The base tenant's pool.
    pub fn base_pool(&self) -> ProviderResult<Arc<F::Pool>> {
        if self.is_stopped() {
            return Err(ProviderError::ProviderStopped);
        }
        self.base
            .pool
            .get()
            .cloned()
            .ok_or(ProviderError::ProviderStopped)
    }

    /// Whether the consumer may release connections after every statement.
    /// The base pool's answer holds for every tenant.
    pub fn supports_aggressive_release(&self) -> bool {
        self.base
            .pool
            .get()
            .is_some_and(|pool| pool.supports_aggressive_release())
    }

    /// Get the tenant's pool, creating it on first use.
    ///
    /// Concurrent first requests for the same tenant construct exactly one
    /// pool: one caller resolves settings and builds it, the others wait and
    /// receive the same instance.
    pub async fn get_or_create_pool(&self, tenant: &TenantId) -> ProviderResult<Arc<F::Pool>> {
        if self.is_base(tenant) {
            return self.base_pool();
        }
        if self.is_stopped() {
            return Err(ProviderError::ProviderStopped);
        }

        let slot = self.slot_or_insert(tenant).await;

        if let Some(pool) = slot.pool.get() {
            return Ok(Arc::clone(pool));
        }

        let created = slot
            .pool
            .get_or_try_init(|| async {
                let settings = self.resolve_pool_settings(tenant).await?;
                let pool = self.factory.create(tenant, &settings).await?;
                if self.is_stopped() {
                    // Shutdown already collected the pools to stop.
                    let _ = pool.stop().await;
                    return Err(ProviderError::ProviderStopped);
                }
                info!(
                    tenant = %tenant,
                    url = %settings.masked_url(),
                    "Created tenant pool"
                );
                Ok::<_, ProviderError>(Arc::new(pool))
            })
            .await
            .map(Arc::clone);

        match created {
            Ok(pool) => Ok(pool),
            Err(e) => {
                debug!(tenant = %tenant, error = %e, "Tenant pool creation failed");
                self.discard_empty_slot(tenant, slot).await;
                Err(e)
            }
        }
    }

    /// Look up a tenant's pool without creating it.
    pub async fn pool(&self, tenant: &TenantId) -> Option<Arc<F::Pool>> {
        if self.is_base(tenant) {
            return self.base.pool.get().cloned();
        }
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant)
            .and_then(|slot| slot.pool.get())
            .cloned()
    }

    /// Run the schema initialization gate for `tenant` against `conn`.
    ///
    /// Returns immediately once the tenant is initialized. Otherwise exactly
    /// one caller runs the gate while concurrent callers for the same tenant
    /// wait for its outcome. A failure is returned to the caller that ran the
    /// gate and the tenant stays uninitialized.
    pub async fn ensure_initialized(
        &self,
        tenant: &TenantId,
        conn: &mut ConnectionOf<F>,
    ) -> ProviderResult<()> {
        let slot = if self.is_base(tenant) {
            Arc::clone(&self.base)
        } else {
            let tenants = self.tenants.read().await;
            match tenants.get(tenant) {
                Some(slot) if slot.pool.initialized() => Arc::clone(slot),
                _ => return Err(ProviderError::unknown_tenant(tenant)),
            }
        };

        if slot.schema_ready.initialized() {
            return Ok(());
        }

        slot.schema_ready
            .get_or_try_init(move || self.run_gate(tenant, conn))
            .await?;
        Ok(())
    }

    /// Whether the tenant's schema has passed the initialization gate.
    pub async fn is_initialized(&self, tenant: &TenantId) -> bool {
        if self.is_base(tenant) {
            return self.base.schema_ready.initialized();
        }
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant)
            .is_some_and(|slot| slot.schema_ready.initialized())
    }

    /// Tenants with a registered pool, base tenant excluded, sorted.
    pub async fn tenants(&self) -> Vec<TenantId> {
        let tenants = self.tenants.read().await;
        let mut ids: Vec<TenantId> = tenants
            .iter()
            .filter(|(_, slot)| slot.pool.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered tenant pools, base tenant excluded.
    pub async fn pool_count(&self) -> usize {
        let tenants = self.tenants.read().await;
        tenants
            .values()
            .filter(|slot| slot.pool.initialized())
            .count()
    }

    /// Stop the base pool and every tenant pool.
    ///
    /// Every pool is attempted even when some fail; the failures are reported
    /// together. Calling this again is a no-op.
    pub async fn shutdown(&self) -> ProviderResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Registry already stopped");
            return Ok(());
        }

        // Collect under lock, stop outside lock
        let mut pools: Vec<(TenantId, Arc<F::Pool>)> = Vec::new();
        if let Some(base) = self.base.pool.get() {
            pools.push((self.base_tenant.clone(), Arc::clone(base)));
        }
        {
            let tenants = self.tenants.read().await;
            pools.extend(
                tenants
                    .iter()
                    .filter_map(|(id, slot)| slot.pool.get().map(|p| (id.clone(), Arc::clone(p)))),
            );
        }

        let mut failures = Vec::new();
        for (tenant, pool) in pools {
            match pool.stop().await {
                Ok(()) => info!(tenant = %tenant, "Stopped tenant pool"),
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "Failed to stop tenant pool");
                    failures.push(ShutdownFailure {
                        tenant,
                        message: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            info!("All tenant pools stopped");
            Ok(())
        } else {
            Err(ProviderError::ShutdownFailed { failures })
        }
    }

    async fn slot_or_insert(&self, tenant: &TenantId) -> Arc<TenantSlot<F::Pool>> {
        {
            let tenants = self.tenants.read().await;
            if let Some(slot) = tenants.get(tenant) {
                return Arc::clone(slot);
            }
        }
        let mut tenants = self.tenants.write().await;
        // Double-check after acquiring write lock
        Arc::clone(
            tenants
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(TenantSlot::empty())),
        )
    }

    /// Drop a slot whose pool could not be created, unless another caller
    /// still holds it and may yet fill it. Slot handles are only cloned under
    /// the map lock, so the count cannot grow while the write lock is held.
    async fn discard_empty_slot(&self, tenant: &TenantId, slot: Arc<TenantSlot<F::Pool>>) {
        let mut tenants = self.tenants.write().await;
        let removable = tenants.get(tenant).is_some_and(|current| {
            // One reference in the map, one held here.
            Arc::ptr_eq(current, &slot) && !slot.pool.initialized() && Arc::strong_count(&slot) == 2
        });
        if removable {
            tenants.remove(tenant);
        }
        // Released under the lock so the next failing caller sees an exact count.
        drop(slot);
    }

    async fn resolve_pool_settings(&self, tenant: &TenantId) -> ProviderResult<PoolSettings> {
        let settings = self.resolver.resolve(tenant).await?;
        let credentials = settings.into_credentials(tenant)?;
        Ok(self.host.with_credentials(&credentials))
    }

    async fn run_gate(&self, tenant: &TenantId, conn: &mut ConnectionOf<F>) -> ProviderResult<()> {
        let Some(initializer) = &self.initializer else {
            debug!(tenant = %tenant, "No schema initializer configured");
            return Ok(());
        };

        let as_init_error = |e: ProviderError| match e {
            ProviderError::Initialization { .. } => e,
            other => ProviderError::initialization(tenant, other.to_string()),
        };

        if initializer
            .needs_initialization(tenant, conn)
            .await
            .map_err(as_init_error)?
        {
            initializer
                .initialize(tenant, conn)
                .await
                .map_err(as_init_error)?;
            info!(tenant = %tenant, "Tenant schema initialized");
        } else {
            debug!(tenant = %tenant, "Tenant schema already initialized");
        }
        Ok(())
    }
}

impl<F: PoolFactory> std::fmt::Debug for TenantRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("base_tenant", &self.base_tenant)
            .field("host", &self.host)
            .field("has_initializer", &self.initializer.is_some())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
