use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use keystone_backup::registry::{BackupRegistry, BackupTrigger, BackupType};
use keystone_backup::storage::create_storage_backend;
use keystone_backup::{BackupConfig, BackupEngine, FileDatabaseSource, RecoveryEngine};

use super::utils::{create_spinner, error as print_error, info as print_info, success, warning};

#[derive(Parser)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupCommand,
}

#[derive(Subcommand)]
pub enum BackupCommand {
    /// Run a backup now (steps 1..12 of the daily pipeline, §4.E)
    Run(RunArgs),

    /// Run the multi-phase verification pipeline against a recorded backup
    Verify(VerifyArgs),

    /// Restore a completed backup onto its primary and license-authority databases
    Restore(RestoreArgs),

    /// List recent backup runs from the registry
    List(ListArgs),

    /// Apply the daily/weekly/monthly retention policy
    Retain(RetainArgs),
}

#[derive(Parser)]
pub struct RunArgs {
    /// Kind of run to execute
    #[arg(short = 't', long, default_value = "daily")]
    pub run_type: RunTypeArg,

    /// User id to record as the trigger (implies a manual trigger)
    #[arg(short, long)]
    pub user: Option<String>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum RunTypeArg {
    Daily,
    Weekly,
    Monthly,
    Emergency,
}

impl From<RunTypeArg> for BackupType {
    fn from(value: RunTypeArg) -> Self {
        match value {
            RunTypeArg::Daily => BackupType::Daily,
            RunTypeArg::Weekly => BackupType::Weekly,
            RunTypeArg::Monthly => BackupType::Monthly,
            RunTypeArg::Emergency => BackupType::Emergency,
        }
    }
}

#[derive(Parser)]
pub struct VerifyArgs {
    /// Backup id to verify
    pub backup_id: String,

    /// Also run the restoration drill (phase 5, the most expensive phase)
    #[arg(long)]
    pub restoration: bool,
}

#[derive(Parser)]
pub struct RestoreArgs {
    /// Backup id to restore from
    pub backup_id: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser)]
pub struct ListArgs {
    /// Maximum number of recent runs to show
    #[arg(short, long, default_value = "10")]
    pub limit: usize,
}

#[derive(Parser)]
pub struct RetainArgs {}

#[derive(Tabled)]
struct RunRow {
    backup_id: String,
    #[tabled(rename = "type")]
    run_type: String,
    status: String,
    #[tabled(rename = "started at")]
    started_at: String,
    #[tabled(rename = "size (bytes)")]
    total_size: String,
    #[tabled(rename = "cloud")]
    cloud_uploaded: String,
}

pub async fn execute(args: BackupArgs) -> Result<()> {
    match args.command {
        BackupCommand::Run(run_args) => execute_run(run_args).await,
        BackupCommand::Verify(verify_args) => execute_verify(verify_args).await,
        BackupCommand::Restore(restore_args) => execute_restore(restore_args).await,
        BackupCommand::List(list_args) => execute_list(list_args).await,
        BackupCommand::Retain(_) => execute_retain().await,
    }
}

async fn execute_run(args: RunArgs) -> Result<()> {
    let config = BackupConfig::from_env().context("loading backup configuration")?;
    if !config.backups_enabled {
        bail!("backups are disabled (BACKUPS_ENABLED=false)");
    }

    let registry = Arc::new(
        BackupRegistry::open(config.base_dir.join("metadata"))
            .await
            .context("opening backup registry")?,
    );
    let storage = create_storage_backend(config.storage.clone())
        .await
        .context("constructing cloud storage backend")?
        .map(Arc::from);

    let primary_db = Arc::new(FileDatabaseSource::new(PathBuf::from("data/primary")));
    let license_db = Arc::new(FileDatabaseSource::new(PathBuf::from("data/license-authority")));

    let engine = BackupEngine::new(config, registry, storage, primary_db, license_db);

    let (run_type, trigger) = if args.user.is_some() {
        (args.run_type.into(), BackupTrigger::Manual)
    } else {
        (args.run_type.into(), BackupTrigger::Scheduled)
    };

    let spinner = create_spinner(&format!("Running {run_type:?} backup..."));
    let run = engine.run(run_type, trigger, args.user).await?;
    spinner.finish_and_clear();

    match run.status {
        keystone_backup::registry::RunStatus::Completed => {
            success(&format!("backup {} completed", run.backup_id));
            print_info(&format!("components: {}", run.components.len()));
            print_info(&format!("total size: {} bytes", run.total_size));
            if let Some(path) = &run.final_path {
                print_info(&format!("artifact: {}", path.display()));
            }
            Ok(())
        }
        keystone_backup::registry::RunStatus::Failed => {
            print_error(&format!("backup {} failed", run.backup_id));
            std::process::exit(1);
        }
        keystone_backup::registry::RunStatus::InProgress => {
            bail!("backup {} did not reach a terminal status", run.backup_id)
        }
    }
}

async fn execute_verify(args: VerifyArgs) -> Result<()> {
    let config = BackupConfig::from_env().context("loading backup configuration")?;
    let registry = BackupRegistry::open(config.base_dir.join("metadata"))
        .await
        .context("opening backup registry")?;
    let storage = create_storage_backend(config.storage.clone())
        .await
        .context("constructing cloud storage backend")?
        .map(Arc::from);

    let run = registry
        .get(&args.backup_id)
        .await
        .with_context(|| format!("backup {} not found in registry", args.backup_id))?;

    let spinner = create_spinner("Running verification pipeline...");
    let report = keystone_backup::verification::verify_backup(
        &run,
        storage.as_ref(),
        args.restoration,
        Some(&config.encryption_key),
    )
    .await?;
    spinner.finish_and_clear();

    registry
        .update(&args.backup_id, |r| {
            r.mark_as_verified(
                report.verdict,
                report
                    .phases
                    .iter()
                    .flat_map(|p| p.tests.iter())
                    .filter(|t| t.status == keystone_backup::verification::TestStatus::Failed)
                    .filter_map(|t| t.detail.clone())
                    .collect(),
            )
        })
        .await?;

    print_info(&format!("overall score: {:.0}/100", report.overall_score));
    print_info(&format!("verdict: {:?}", report.verdict));
    for phase in &report.phases {
        print_info(&format!("  {} — {:?} ({:.0}/100)", phase.name, phase.status, phase.score));
    }
    for rec in &report.recommendations {
        warning(rec);
    }

    match report.verdict {
        keystone_backup::registry::Verdict::Excellent
        | keystone_backup::registry::Verdict::Good
        | keystone_backup::registry::Verdict::Warning => {
            success("verification complete");
            Ok(())
        }
        keystone_backup::registry::Verdict::Failed | keystone_backup::registry::Verdict::Error => {
            print_error("verification did not pass");
            std::process::exit(1);
        }
    }
}

async fn execute_restore(args: RestoreArgs) -> Result<()> {
    if !args.force {
        use dialoguer::Confirm;
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Restore backup '{}'? This replaces the current primary and license-authority databases.",
                args.backup_id
            ))
            .default(false)
            .interact()?;
        if !confirm {
            print_info("restore cancelled");
            return Ok(());
        }
    }

    let config = BackupConfig::from_env().context("loading backup configuration")?;
    let registry = Arc::new(
        BackupRegistry::open(config.base_dir.join("metadata"))
            .await
            .context("opening backup registry")?,
    );
    let storage = create_storage_backend(config.storage.clone())
        .await
        .context("constructing cloud storage backend")?
        .map(Arc::from);

    let primary_db = FileDatabaseSource::new(PathBuf::from("data/primary"));
    let license_db = FileDatabaseSource::new(PathBuf::from("data/license-authority"));

    let recovery = RecoveryEngine::new(config, registry, storage);
    let spinner = create_spinner("Restoring from backup...");
    recovery
        .restore_from_backup(&args.backup_id, &primary_db, &license_db)
        .await?;
    spinner.finish_and_clear();

    success(&format!("restored from backup {}", args.backup_id));
    Ok(())
}

async fn execute_list(args: ListArgs) -> Result<()> {
    let config = BackupConfig::from_env().context("loading backup configuration")?;
    let registry = BackupRegistry::open(config.base_dir.join("metadata"))
        .await
        .context("opening backup registry")?;

    let runs = registry.recent(args.limit).await;
    if runs.is_empty() {
        print_info("no backup runs recorded yet");
        return Ok(());
    }

    let rows: Vec<RunRow> = runs
        .into_iter()
        .map(|r| RunRow {
            backup_id: r.backup_id,
            run_type: format!("{:?}", r.run_type).to_lowercase(),
            status: format!("{:?}", r.status).to_lowercase(),
            started_at: r.started_at.to_rfc3339(),
            total_size: r.total_size.to_string(),
            cloud_uploaded: r.cloud.uploaded.to_string(),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("\n{table}");
    success(&format!("showing {} run(s)", rows.len()));
    Ok(())
}

async fn execute_retain() -> Result<()> {
    let config = BackupConfig::from_env().context("loading backup configuration")?;
    let registry = BackupRegistry::open(config.base_dir.join("metadata"))
        .await
        .context("opening backup registry")?;
    let storage = create_storage_backend(config.storage.clone())
        .await
        .context("constructing cloud storage backend")?
        .map(Arc::from);

    let spinner = create_spinner("Applying retention policy...");
    let report = keystone_backup::retention::apply_retention(&registry, storage.as_ref()).await?;
    spinner.finish_and_clear();

    success(&format!(
        "retention applied: {} deleted, {} already gone, {} error(s)",
        report.deleted.len(),
        report.already_gone.len(),
        report.errors.len()
    ));
    for err in &report.errors {
        warning(err);
    }
    Ok(())
}
