use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use keystone_license::{
    FileTenantStore, HttpLicenseAuthorityClient, LicenseConfig, LicenseStore, LicenseSyncService,
    LicenseValidator,
};

use super::utils::{create_spinner, error as print_error, info as print_info, success};

#[derive(Parser)]
pub struct LicenseArgs {
    #[command(subcommand)]
    pub command: LicenseCommand,
}

#[derive(Subcommand)]
pub enum LicenseCommand {
    /// Fetch the tenant's license from the authority and fold it into the local cache
    Sync,

    /// Validate the tenant's license, online by default with offline fallback
    Validate(ValidateArgs),

    /// Show the locally cached license's quick-access fields
    Status,
}

#[derive(Parser)]
pub struct ValidateArgs {
    /// Validate entirely from the local cache, never contacting the authority
    #[arg(long)]
    pub offline: bool,
}

pub async fn execute(args: LicenseArgs) -> Result<()> {
    match args.command {
        LicenseCommand::Sync => execute_sync().await,
        LicenseCommand::Validate(validate_args) => execute_validate(validate_args).await,
        LicenseCommand::Status => execute_status().await,
    }
}

async fn execute_sync() -> Result<()> {
    let config = LicenseConfig::from_env().context("loading license configuration")?;
    let store = Arc::new(
        LicenseStore::open("licenses".into())
            .await
            .context("opening license store")?,
    );
    let client = Arc::new(
        HttpLicenseAuthorityClient::new(config.server_url.clone(), config.api_key.clone())
            .context("constructing license authority client")?,
    );
    let service = LicenseSyncService::new(store, client, config.integrity_secret.clone());

    let spinner = create_spinner("Syncing license from authority...");
    service.sync_tenant(&config.tenant_id).await?;
    spinner.finish_and_clear();

    success(&format!("synced license for tenant {}", config.tenant_id));
    Ok(())
}

async fn execute_validate(args: ValidateArgs) -> Result<()> {
    let config = LicenseConfig::from_env().context("loading license configuration")?;
    let store = Arc::new(
        LicenseStore::open("licenses".into())
            .await
            .context("opening license store")?,
    );
    let client = Arc::new(
        HttpLicenseAuthorityClient::new(config.server_url.clone(), config.api_key.clone())
            .context("constructing license authority client")?,
    );
    let tenant_store = Arc::new(FileTenantStore::open("licenses/tenant-state.json".into())?);
    let validator = LicenseValidator::new(store, client, tenant_store, config.integrity_secret.clone());

    let spinner = create_spinner("Validating license...");
    let outcome = if args.offline {
        validator.validate_offline(&config.tenant_id).await
    } else {
        validator.validate(&config.tenant_id, None).await
    };
    spinner.finish_and_clear();

    match outcome {
        Ok(outcome) if outcome.valid => {
            success(&format!("license is valid (online={})", outcome.online));
            Ok(())
        }
        Ok(outcome) => {
            print_error(&format!(
                "license is not valid: {:?}{}",
                outcome.kind,
                outcome.error.map(|e| format!(" ({e})")).unwrap_or_default()
            ));
            std::process::exit(1);
        }
        Err(e) => {
            print_error(&format!("validation failed: {e}"));
            std::process::exit(1);
        }
    }
}

async fn execute_status() -> Result<()> {
    let config = LicenseConfig::from_env().context("loading license configuration")?;
    let store = LicenseStore::open("licenses".into())
        .await
        .context("opening license store")?;

    let record = store
        .get(&config.tenant_id)
        .with_context(|| format!("no cached license for tenant {}", config.tenant_id))?;

    print_info(&format!("tenant: {}", record.tenant_id));
    print_info(&format!("license: {} ({})", record.license_number, record.license_id));
    print_info(&format!("type: {:?}", record.quick.license_type));
    print_info(&format!("status: {:?}", record.quick.status));
    print_info(&format!("expires at: {}", record.quick.expires_at.to_rfc3339()));
    print_info(&format!("max users: {}", record.quick.max_users));
    print_info(&format!("offline usable: {}", record.is_offline_usable()));
    print_info(&format!("tamper detected: {}", record.integrity.tamper_detected));
    Ok(())
}
