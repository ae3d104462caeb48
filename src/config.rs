//! Configuration handling for the tenant connection provider.
//!
//! - [`PoolSettings`]: the host configuration object (string-keyed properties)
//!   and its per-tenant derivative
//! - [`PoolOptions`]: pooling parameters parsed from the properties
//! - [`TenantSpec`]: `id=url` tenant declarations
//! - [`Config`]: CLI arguments and environment variables of the binary

use crate::db::initializer::DEFAULT_MARKER_TABLE;
use crate::error::{ProviderError, ProviderResult};
use crate::tenant::{DEFAULT_BASE_TENANT, TenantCredentials, TenantId, TenantSettings};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const URL_KEY: &str = "url";
pub const DRIVER_KEY: &str = "driver";
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// String-keyed connection properties.
///
/// The host supplies one instance at startup: the four identity keys
/// (`url`, `driver`, `username`, `password`) describe the base tenant and
/// every other key is a pooling parameter shared by all tenants. A tenant's
/// effective settings are the host settings with exactly the identity keys
/// replaced, see [`PoolSettings::with_credentials`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolSettings {
    properties: BTreeMap<String, String>,
}

impl PoolSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn url(&self) -> Option<&str> {
        self.get(URL_KEY)
    }

    pub fn driver(&self) -> Option<&str> {
        self.get(DRIVER_KEY)
    }

    pub fn username(&self) -> Option<&str> {
        self.get(USERNAME_KEY)
    }

    pub fn password(&self) -> Option<&str> {
        self.get(PASSWORD_KEY)
    }

    /// Identity fields held by these settings, as a resolver would report them.
    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            url: self.url().map(String::from),
            driver: self.driver().map(String::from),
            username: self.username().map(String::from),
            password: self.password().map(String::from),
        }
    }

    /// Copy of these settings with the four identity keys taken from `credentials`.
    pub fn with_credentials(&self, credentials: &TenantCredentials) -> Self {
        let mut settings = self.clone();
        settings.set(URL_KEY, credentials.url.clone());
        settings.set(DRIVER_KEY, credentials.driver.clone());
        settings.set(USERNAME_KEY, credentials.username.clone());
        settings.set(PASSWORD_KEY, credentials.password.clone());
        settings
    }

    /// Parse and validate the pooling parameters.
    ///
    /// Values that do not parse are ignored and the default applies.
    pub fn pool_options(&self, tenant: &TenantId) -> ProviderResult<PoolOptions> {
        let options = PoolOptions {
            max_connections: self.get("max_connections").and_then(|v| v.parse().ok()),
            min_connections: self.get("min_connections").and_then(|v| v.parse().ok()),
            idle_timeout_secs: self.get("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: self.get("acquire_timeout").and_then(|v| v.parse().ok()),
            test_before_acquire: self.get("test_before_acquire").and_then(parse_bool),
            aggressive_release: self.get("aggressive_release").and_then(parse_bool),
        };
        options
            .validate()
            .map_err(|reason| ProviderError::invalid_configuration(tenant, reason))?;
        Ok(options)
    }

    /// The url with any password replaced by `****`, safe for logs.
    pub fn masked_url(&self) -> String {
        let Some(url) = self.url() else {
            return String::new();
        };
        let authority_start = url.find("://").map_or(0, |pos| pos + 3);
        if let Some(at_pos) = url.rfind('@').filter(|pos| *pos > authority_start) {
            if let Some(colon_pos) = url[authority_start..at_pos].find(':') {
                let colon_pos = authority_start + colon_pos;
                return format!("{}****{}", &url[..colon_pos + 1], &url[at_pos..]);
            }
        }
        url.to_string()
    }
}

impl std::fmt::Debug for PoolSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in self.iter() {
            if key == PASSWORD_KEY {
                map.entry(&key, &"****");
            } else if key == URL_KEY {
                map.entry(&key, &self.masked_url());
            } else {
                map.entry(&key, &value);
            }
        }
        map.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PoolSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            properties: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    if v.eq_ignore_ascii_case("true") {
        Some(true)
    } else if v.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None // Invalid value ignored
    }
}

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum idle connections kept open (default: 0)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
    /// Whether the connection consumer may release after every statement (default: false)
    pub aggressive_release: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    pub fn aggressive_release_or_default(&self) -> bool {
        self.aggressive_release.unwrap_or(false)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// A tenant declared on the command line.
#[derive(Debug, Clone)]
pub struct TenantSpec {
    pub id: TenantId,
    pub settings: TenantSettings,
}

impl TenantSpec {
    /// Identity keys that may be given as URL query parameters.
    const IDENTITY_KEYS: &'static [&'static str] = &[DRIVER_KEY, USERNAME_KEY, PASSWORD_KEY];

    /// Parse a tenant declaration.
    ///
    /// # Format
    ///
    /// `id=url`, where the driver defaults to the URL scheme and the
    /// username/password default to the URL user info. Each can be given
    /// explicitly as a query parameter, which is removed from the URL:
    ///
    /// ```text
    /// acme=postgres://acme:secret@db:5432/acme
    /// beta=sqlite:data/beta.db?username=app&password=secret
    /// gamma=mysql://db:3306/gamma?driver=mariadb&username=g&password=p
    /// ```
    pub fn parse(s: &str) -> Result<Self, String> {
        // Split id=url format (only if '=' before '://')
        let scheme_pos = s.find("://").unwrap_or(s.len());
        let Some(idx) = s[..scheme_pos].find('=') else {
            return Err(format!("Tenant declaration must be 'id=url', got: {s}"));
        };
        let id = s[..idx].trim();
        if id.is_empty() {
            return Err("Tenant id cannot be empty".to_string());
        }
        Ok(Self {
            id: TenantId::new(id),
            settings: settings_from_url(&s[idx + 1..])?,
        })
    }
}

/// Split a connection URL into the four identity fields.
pub fn settings_from_url(url_str: &str) -> Result<TenantSettings, String> {
    let mut url = Url::parse(url_str).map_err(|e| format!("Invalid URL: {e}"))?;
    let mut opts = extract_options(&mut url, TenantSpec::IDENTITY_KEYS);

    let driver = opts
        .remove(DRIVER_KEY)
        .unwrap_or_else(|| url.scheme().to_string());
    let username = opts
        .remove(USERNAME_KEY)
        .or_else(|| Some(url.username().to_string()).filter(|u| !u.is_empty()));
    let password = opts
        .remove(PASSWORD_KEY)
        .or_else(|| url.password().map(String::from));

    // Credentials travel separately from the url. Urls without an authority
    // (`sqlite:path`) have no user info to clear.
    let _ = url.set_password(None);
    let _ = url.set_username("");

    Ok(TenantSettings {
        url: Some(url.to_string()),
        driver: Some(driver),
        username,
        password,
    })
}

/// Extract options from URL query params, keeping others for the driver.
/// Uses proper URL encoding to preserve special characters in remaining params.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

/// Configuration for the `tenant-pool` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tenant-pool",
    about = "Provision and verify per-tenant database connection pools",
    version,
    author
)]
pub struct Config {
    /// Base tenant connection URL.
    /// Credentials come from the URL user info or ?username=&password= parameters.
    #[arg(short = 'b', long = "base-url", value_name = "URL", env = "TENANT_POOL_BASE_URL")]
    pub base_url: String,

    /// Identifier reserved for the base tenant
    #[arg(
        long,
        default_value = DEFAULT_BASE_TENANT,
        env = "TENANT_POOL_BASE_TENANT"
    )]
    pub base_tenant: String,

    /// Tenant declarations, format "id=url".
    /// Can be specified multiple times or as comma-separated values.
    #[arg(
        short = 't',
        long = "tenant",
        value_name = "ID=URL",
        env = "TENANT_POOL_TENANTS",
        value_delimiter = ','
    )]
    pub tenants: Vec<String>,

    /// JSON file mapping tenant ids to {url, driver, username, password}
    #[arg(long, value_name = "PATH", env = "TENANT_POOL_TENANTS_FILE")]
    pub tenants_file: Option<PathBuf>,

    /// Pooling parameters shared by every tenant, format "key=value"
    /// (max_connections, min_connections, idle_timeout, acquire_timeout,
    /// test_before_acquire, aggressive_release)
    #[arg(
        short = 'o',
        long = "pool-option",
        value_name = "KEY=VALUE",
        env = "TENANT_POOL_OPTIONS",
        value_delimiter = ','
    )]
    pub pool_options: Vec<String>,

    /// Table whose presence marks a tenant schema as initialized
    #[arg(
        long,
        default_value = DEFAULT_MARKER_TABLE,
        env = "TENANT_POOL_MARKER_TABLE"
    )]
    pub marker_table: String,

    /// SQL script run once against every tenant lacking the marker table.
    /// Without it, no schema initialization is performed.
    #[arg(long, value_name = "PATH", env = "TENANT_POOL_INIT_SCRIPT")]
    pub init_script: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TENANT_POOL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "TENANT_POOL_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Host settings: base tenant identity plus the shared pooling parameters.
    pub fn host_settings(&self) -> Result<PoolSettings, String> {
        let base = settings_from_url(&self.base_url)?;
        let mut settings = PoolSettings::new();
        for option in &self.pool_options {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| format!("Pool option must be 'key=value', got: {option}"))?;
            let key = key.trim().to_ascii_lowercase();
            if [URL_KEY, DRIVER_KEY, USERNAME_KEY, PASSWORD_KEY].contains(&key.as_str()) {
                return Err(format!(
                    "'{key}' is part of the base URL and cannot be set as a pool option"
                ));
            }
            settings.set(key, value.trim());
        }
        for (key, value) in [
            (URL_KEY, base.url),
            (DRIVER_KEY, base.driver),
            (USERNAME_KEY, base.username),
            (PASSWORD_KEY, base.password),
        ] {
            if let Some(value) = value {
                settings.set(key, value);
            }
        }
        Ok(settings)
    }

    /// Parse all tenant declarations given on the command line.
    pub fn parse_tenants(&self) -> Result<Vec<TenantSpec>, String> {
        self.tenants.iter().map(|s| TenantSpec::parse(s)).collect()
    }

    pub fn base_tenant_id(&self) -> TenantId {
        TenantId::new(self.base_tenant.clone())
    }
}
