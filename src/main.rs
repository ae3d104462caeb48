//! Tenant Pool - Main entry point.
//!
//! Bootstraps a tenant connection provider from the command line and
//! environment, provisions every declared tenant (pool creation plus schema
//! initialization) and reports the outcome per tenant.

use clap::Parser;
use std::sync::Arc;
use tenant_pool::config::Config;
use tenant_pool::db::{ScriptInitializer, SqlxPoolFactory};
use tenant_pool::provider::TenantConnectionProvider;
use tenant_pool::tenant::InMemorySettingsResolver;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn load_resolver(config: &Config) -> Result<InMemorySettingsResolver, Box<dyn std::error::Error>> {
    let resolver = match &config.tenants_file {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("Cannot read tenants file {}: {e}", path.display()))?;
            InMemorySettingsResolver::from_json(&json)
                .map_err(|e| format!("Invalid tenants file {}: {e}", path.display()))?
        }
        None => InMemorySettingsResolver::new(),
    };

    // Command-line declarations override the file
    for spec in config.parse_tenants()? {
        resolver.set_tenant(spec.id, spec.settings);
    }
    Ok(resolver)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        base_tenant = %config.base_tenant,
        "Starting tenant-pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    let host = config.host_settings()?;
    let resolver = Arc::new(load_resolver(&config).await?);
    let tenants = resolver.tenants();
    info!(count = tenants.len(), "Loaded tenant settings");

    let mut builder = TenantConnectionProvider::builder(SqlxPoolFactory, resolver.clone(), host)
        .base_tenant(config.base_tenant_id());

    if let Some(path) = &config.init_script {
        let script = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Cannot read init script {}: {e}", path.display()))?;
        let initializer = ScriptInitializer::from_script(&config.marker_table, &script);
        info!(
            marker_table = %initializer.marker_table(),
            statements = initializer.statements().len(),
            "Schema initialization enabled"
        );
        builder = builder.initializer(Arc::new(initializer));
    }

    let provider = builder.start().await?;
    info!(
        aggressive_release = provider.supports_aggressive_release(),
        "Provider ready"
    );

    let mut failed = 0usize;
    for tenant in &tenants {
        match provider.get_connection(tenant).await {
            Ok(conn) => {
                info!(tenant = %tenant, db_type = %conn.db_type(), "Tenant ready");
                provider.release_connection(tenant, conn).await?;
            }
            Err(e) => {
                failed += 1;
                error!(
                    tenant = %tenant,
                    error = %e,
                    suggestion = e.suggestion().unwrap_or_default(),
                    "Tenant provisioning failed"
                );
            }
        }
    }

    provider.stop().await?;

    if failed > 0 {
        return Err(format!("{failed} of {} tenants could not be provisioned", tenants.len()).into());
    }

    info!(count = tenants.len(), "All tenants provisioned");
    Ok(())
}
