//! backupd
//!
//! Runs the backup/restore service, or a single backup or restore job from the
//! command line.

// backupd/src/main.rs
use anyhow::{Context, Result};
use backupd::audit::{Audit, AuditCompletionHook};
use backupd::backup::BackupPipeline;
use backupd::config::{AppConfig, StorageConfig};
use backupd::credentials::{CredentialCipher, DecryptingDatabaseStore};
use backupd::jobs::WorkerPool;
use backupd::models::{BackupStatus, ClientMeta, RestoreStatus};
use backupd::restore::RestorePipeline;
use backupd::scheduler::CronScheduler;
use backupd::storage::{LocalStorage, S3Storage, StorageGateway};
use backupd::store::{DatabaseStore, PgStore};
use backupd::sweeper;
use backupd::tools::CliTools;
use chrono::Utc;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ Error: {:?}", e);
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

struct Services {
    store: Arc<PgStore>,
    databases: Arc<dyn DatabaseStore>,
    storage: Arc<dyn StorageGateway>,
    pool: Arc<WorkerPool>,
    backups: BackupPipeline,
    restores: RestorePipeline,
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();

    // Expects config.json in the working directory unless BACKUPD_CONFIG points elsewhere.
    let config_path = env::var("BACKUPD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    let services = build_services(&config).await?;

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve(&config, services).await,
        Some("backup") => {
            let database_id = id_arg(&args, 1, "database_id")?;
            let user_id = id_arg(&args, 2, "user_id")?;
            run_single_backup(&services, database_id, user_id).await
        }
        Some("restore") => {
            let backup_id = id_arg(&args, 1, "backup_id")?;
            let database_id = id_arg(&args, 2, "database_id")?;
            let user_id = id_arg(&args, 3, "user_id")?;
            run_single_restore(&services, backup_id, database_id, user_id).await
        }
        Some(other) => {
            eprintln!("❌ Unknown command '{}'. Use 'serve', 'backup <database_id> <user_id>' or 'restore <backup_id> <database_id> <user_id>'.", other);
            anyhow::bail!("Invalid command");
        }
    }
}

fn id_arg(args: &[String], index: usize, name: &str) -> Result<i64> {
    args.get(index)
        .with_context(|| format!("Missing argument <{}>", name))?
        .parse()
        .with_context(|| format!("<{}> must be an integer", name))
}

async fn build_services(config: &AppConfig) -> Result<Services> {
    let store = Arc::new(
        PgStore::connect(&config.metadata_database_url, config.max_db_connections)
            .await
            .context("Failed to connect to the metadata database")?,
    );
    store.migrate().await.context("Failed to run database migrations")?;

    let storage: Arc<dyn StorageGateway> = match &config.storage {
        StorageConfig::S3(spaces) => Arc::new(S3Storage::new(spaces).await),
        StorageConfig::Local(dir) => {
            info!("Storing archives under {}", dir.display());
            Arc::new(LocalStorage::new(dir.clone()))
        }
    };

    let pool = Arc::new(WorkerPool::new(config.worker_count, config.queue_capacity));
    pool.start();
    info!(
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        "Worker pool started"
    );

    let databases: Arc<dyn DatabaseStore> = match &config.credentials_key {
        Some(key) => Arc::new(DecryptingDatabaseStore::new(
            store.clone(),
            CredentialCipher::new(key),
        )),
        None => {
            warn!("No credentials_key configured; connection passwords are read as stored");
            store.clone()
        }
    };

    let tools = Arc::new(CliTools::new(config.tool_timeout));
    let audit = Audit::new(store.clone());

    let mut backups = BackupPipeline::new(
        databases.clone(),
        store.clone(),
        storage.clone(),
        tools.clone(),
        pool.clone(),
        config.work_dir.clone(),
    )
    .with_audit(audit.clone());
    let mut restores = RestorePipeline::new(
        databases.clone(),
        store.clone(),
        store.clone(),
        storage.clone(),
        tools,
        pool.clone(),
    )
    .with_audit(audit.clone());
    if config.audit_completion {
        let hook = Arc::new(AuditCompletionHook::new(audit));
        backups = backups.with_completion_hook(hook.clone());
        restores = restores.with_completion_hook(hook);
    }

    Ok(Services {
        store,
        databases,
        storage,
        pool,
        backups,
        restores,
    })
}

async fn serve(config: &AppConfig, services: Services) -> Result<()> {
    info!("🚀 Starting backupd");
    sweeper::sweep_sessions_once(services.store.as_ref(), Utc::now())
        .await
        .context("Initial session sweep failed")?;

    let scheduler = Arc::new(CronScheduler::new(
        services.store.clone(),
        services.databases.clone(),
        services.backups.clone(),
        services.pool.clone(),
        Audit::new(services.store.clone()),
    ));
    scheduler
        .load_active()
        .await
        .context("Failed to load active schedules")?;
    scheduler.start();

    sweeper::spawn_session_sweeper(services.store.clone(), config.session_sweep_interval);
    sweeper::spawn_backup_sweeper(
        services.store.clone(),
        services.storage.clone(),
        services.pool.clone(),
        config.backup_sweep_interval,
        config.backup_retention,
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    Ok(())
}

async fn run_single_backup(services: &Services, database_id: i64, user_id: i64) -> Result<()> {
    let client = ClientMeta::new("127.0.0.1", "backupd-cli");
    let backup = services
        .backups
        .create_backup(database_id, user_id, client)
        .await
        .context("Backup could not be started")?;
    println!("🚀 Backup {} ({}) started", backup.id, backup.filename);

    loop {
        let current = services.backups.get_backup(backup.id, user_id).await?;
        match current.status {
            BackupStatus::Pending => tokio::time::sleep(POLL_INTERVAL).await,
            BackupStatus::Completed => {
                println!(
                    "✅ Backup completed: {} ({} bytes)",
                    current.storage_path,
                    current.size.unwrap_or_default()
                );
                return Ok(());
            }
            BackupStatus::Failed => anyhow::bail!(
                "Backup failed: {}",
                current.error_message.unwrap_or_default()
            ),
        }
    }
}

async fn run_single_restore(
    services: &Services,
    backup_id: i64,
    database_id: i64,
    user_id: i64,
) -> Result<()> {
    let client = ClientMeta::new("127.0.0.1", "backupd-cli");
    let restore = services
        .restores
        .create_restore(backup_id, database_id, user_id, client)
        .await
        .context("Restore could not be started")?;
    println!("🔄 Restore {} started", restore.id);

    loop {
        let current = services.restores.get_restore(restore.id, user_id).await?;
        match current.status {
            RestoreStatus::Pending | RestoreStatus::Running => {
                tokio::time::sleep(POLL_INTERVAL).await
            }
            RestoreStatus::Success => {
                println!("✅ Restore completed.");
                return Ok(());
            }
            RestoreStatus::Failed => anyhow::bail!("Restore {} failed, see the logs", restore.id),
        }
    }
}
