//! Per-tenant connection settings and the resolver capability that supplies them.

use crate::error::{ProviderError, ProviderResult};
use crate::tenant::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Identity fields of a tenant as reported by a [`SettingsResolver`].
///
/// Every field may be missing. A field holding only whitespace counts as missing.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Sensitive - never logged or serialized
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl TenantSettings {
    pub fn new(
        url: impl Into<String>,
        driver: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: Some(url.into()),
            driver: Some(driver.into()),
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Validate the settings for `tenant`.
    ///
    /// A missing url means the tenant is unknown. A url with any other field
    /// missing is an invalid configuration, reported with the missing field names.
    pub fn into_credentials(self, tenant: &TenantId) -> ProviderResult<TenantCredentials> {
        let Some(url) = non_blank(self.url) else {
            return Err(ProviderError::unknown_tenant(tenant));
        };
        let driver = non_blank(self.driver);
        let username = non_blank(self.username);
        let password = non_blank(self.password);

        match (driver, username, password) {
            (Some(driver), Some(username), Some(password)) => Ok(TenantCredentials {
                url,
                driver,
                username,
                password,
            }),
            (driver, username, password) => {
                let missing: Vec<&str> = [
                    ("driver", driver.is_none()),
                    ("username", username.is_none()),
                    ("password", password.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, is_missing)| is_missing.then_some(name))
                .collect();
                Err(ProviderError::invalid_configuration(
                    tenant,
                    format!("missing {}", missing.join(", ")),
                ))
            }
        }
    }
}

impl std::fmt::Debug for TenantSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSettings")
            .field("url", &self.url)
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validated identity fields: all four are present and non-blank.
#[derive(Clone, PartialEq, Eq)]
pub struct TenantCredentials {
    pub url: String,
    pub driver: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("url", &self.url)
            .field("driver", &self.driver)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Maps a tenant to its connection settings.
///
/// Implementations may be backed by anything: an in-memory map, a table in
/// the base tenant's database, a remote configuration service. Returning
/// default (empty) settings reports the tenant as unknown; `Err` is reserved
/// for failures of the backing store itself.
#[async_trait]
pub trait SettingsResolver: Send + Sync {
    async fn resolve(&self, tenant: &TenantId) -> ProviderResult<TenantSettings>;
}

/// Resolver over a tenant map owned by this instance.
///
/// Tenants can be added or changed at runtime; the change is picked up the
/// next time a tenant without a pool is requested.
#[derive(Debug, Default)]
pub struct InMemorySettingsResolver {
    tenants: RwLock<HashMap<TenantId, TenantSettings>>,
}

impl InMemorySettingsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from a JSON object keyed by tenant id.
    ///
    /// ```text
    /// { "acme": { "url": "postgres://db/acme", "driver": "postgres",
    ///             "username": "acme", "password": "secret" } }
    /// ```
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let tenants: HashMap<TenantId, TenantSettings> = serde_json::from_str(json)?;
        Ok(Self {
            tenants: RwLock::new(tenants),
        })
    }

    /// Replace all settings of a tenant.
    pub fn set_tenant(&self, tenant: impl Into<TenantId>, settings: TenantSettings) {
        self.write().insert(tenant.into(), settings);
    }

    pub fn set_url(&self, tenant: impl Into<TenantId>, url: impl Into<String>) {
        self.update(tenant.into(), |s| s.url = Some(url.into()));
    }

    pub fn set_driver(&self, tenant: impl Into<TenantId>, driver: impl Into<String>) {
        self.update(tenant.into(), |s| s.driver = Some(driver.into()));
    }

    pub fn set_username(&self, tenant: impl Into<TenantId>, username: impl Into<String>) {
        self.update(tenant.into(), |s| s.username = Some(username.into()));
    }

    pub fn set_password(&self, tenant: impl Into<TenantId>, password: impl Into<String>) {
        self.update(tenant.into(), |s| s.password = Some(password.into()));
    }

    /// Forget a tenant. Pools already created for it are not affected.
    pub fn remove_tenant(&self, tenant: &TenantId) -> Option<TenantSettings> {
        self.write().remove(tenant)
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.read().contains_key(tenant)
    }

    /// Configured tenant ids, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn update(&self, tenant: TenantId, apply: impl FnOnce(&mut TenantSettings)) {
        apply(self.write().entry(tenant).or_default());
    }

    // A poisoned map is still structurally valid: every mutation is a single insert.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TenantId, TenantSettings>> {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TenantId, TenantSettings>> {
        self.tenants.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SettingsResolver for InMemorySettingsResolver {
    async fn resolve(&self, tenant: &TenantId) -> ProviderResult<TenantSettings> {
        Ok(self.read().get(tenant).cloned().unwrap_or_default())
    }
}
