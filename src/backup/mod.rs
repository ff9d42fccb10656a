//! Backup pipeline: dump, compress, upload, record.
//!
//! `create_backup` validates and persists a `pending` record synchronously, then
//! hands the long-running work to the worker pool. The job always leaves the
//! record `completed` or `failed`.

pub mod archive;
pub mod db_dump;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{Audit, AuditEntry, CompletionHook, NoopCompletionHook};
use crate::errors::{AppError, Result};
use crate::jobs::{panic_message, WorkerPool};
use crate::models::{Backup, BackupStatus, ClientMeta, DatabaseConnection, Engine, NewBackup};
use crate::storage::{remote_key, StorageGateway};
use crate::store::{BackupStore, DatabaseStore};
use crate::utils::ensure_owner;
use db_dump::DumpExecutor;

/// Failure of one pipeline step, stored verbatim as the backup's error message.
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
struct StepError {
    step: &'static str,
    source: AppError,
}

fn at(step: &'static str) -> impl FnOnce(AppError) -> StepError {
    move |source| StepError { step, source }
}

/// `{name}_{engine}_{YYYYmmdd_HHMMSS}_{token}.zip`, with the name reduced to
/// characters that are safe in a storage key. `token` keeps keys of backups
/// started in the same second apart.
pub fn backup_filename(
    database_name: &str,
    engine: Engine,
    timestamp: DateTime<Utc>,
    token: &str,
) -> String {
    let name: String = database_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let name = if name.is_empty() { "database".to_string() } else { name };
    format!(
        "{}_{}_{}_{}.zip",
        name,
        engine.as_str(),
        timestamp.format("%Y%m%d_%H%M%S"),
        token
    )
}

#[derive(Clone)]
pub struct BackupPipeline {
    databases: Arc<dyn DatabaseStore>,
    backups: Arc<dyn BackupStore>,
    storage: Arc<dyn StorageGateway>,
    dumper: Arc<dyn DumpExecutor>,
    pool: Arc<WorkerPool>,
    audit: Audit,
    completion: Arc<dyn CompletionHook>,
    work_dir: PathBuf,
}

impl BackupPipeline {
    pub fn new(
        databases: Arc<dyn DatabaseStore>,
        backups: Arc<dyn BackupStore>,
        storage: Arc<dyn StorageGateway>,
        dumper: Arc<dyn DumpExecutor>,
        pool: Arc<WorkerPool>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        BackupPipeline {
            databases,
            backups,
            storage,
            dumper,
            pool,
            audit: Audit::disabled(),
            completion: Arc::new(NoopCompletionHook),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_completion_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.completion = hook;
        self
    }

    async fn owned_database(&self, database_id: i64, user_id: i64) -> Result<DatabaseConnection> {
        let database = self
            .databases
            .get_database(database_id)
            .await?
            .ok_or_else(|| AppError::not_found("database", database_id))?;
        ensure_owner("database", database_id, database.user_id, user_id)?;
        Ok(database)
    }

    /// Persists a `pending` backup of `database_id` and queues the dump job.
    ///
    /// Unknown databases, foreign owners and unsupported engines are rejected
    /// before anything is written.
    pub async fn create_backup(
        &self,
        database_id: i64,
        user_id: i64,
        client: ClientMeta,
    ) -> Result<Backup> {
        let database = self.owned_database(database_id, user_id).await?;
        let engine = database.engine()?;

        let token = Uuid::new_v4().simple().to_string();
        let filename = backup_filename(&database.name, engine, Utc::now(), &token);
        let backup = self
            .backups
            .insert_backup(NewBackup {
                user_id,
                database_id,
                storage_path: remote_key(user_id, engine, &filename),
                filename,
            })
            .await?;
        info!(
            backup_id = backup.id,
            database_id,
            engine = %engine,
            "Backup {} queued",
            backup.filename
        );

        self.audit
            .record(
                AuditEntry::new(
                    user_id,
                    "create",
                    "backup",
                    backup.id,
                    &format!("Backup started for database {}", database.name),
                    &client,
                )
                .with_metadata(json!({
                    "backup_id": backup.id,
                    "database_id": database_id,
                    "filename": backup.filename,
                    "engine": engine.as_str(),
                })),
            )
            .await;

        let pipeline = self.clone();
        let job_backup = backup.clone();
        self.pool
            .submit(async move { pipeline.run(job_backup, database, engine).await })
            .await;

        Ok(backup)
    }

    async fn run(&self, backup: Backup, database: DatabaseConnection, engine: Engine) {
        let outcome = AssertUnwindSafe(self.execute(&backup, &database, engine))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(StepError {
                    step: "backup job",
                    source: AppError::Panicked(panic_message(payload.as_ref())),
                })
            });

        let marked = match outcome {
            Ok(size) => {
                info!(backup_id = backup.id, size, "✓ Backup {} completed", backup.filename);
                self.backups.mark_backup_completed(backup.id, size).await
            }
            Err(e) => {
                error!(backup_id = backup.id, "Backup {} failed: {}", backup.filename, e);
                self.backups.mark_backup_failed(backup.id, &e.to_string()).await
            }
        };
        match marked {
            Ok(true) => {}
            Ok(false) => warn!(backup_id = backup.id, "Backup was no longer pending"),
            Err(e) => error!(backup_id = backup.id, "Failed to persist backup status: {}", e),
        }

        match self.backups.get_backup(backup.id).await {
            Ok(Some(finished)) => self.completion.backup_finished(&finished).await,
            Ok(None) => {}
            Err(e) => warn!(backup_id = backup.id, "Failed to reload backup: {}", e),
        }
    }

    /// Dump, compress and upload; returns the archive size in bytes.
    async fn execute(
        &self,
        backup: &Backup,
        database: &DatabaseConnection,
        engine: Engine,
    ) -> std::result::Result<i64, StepError> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| at("prepare work dir")(e.into()))?;
        let scratch = tempfile::Builder::new()
            .prefix("backup-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| at("prepare work dir")(e.into()))?;

        let stem = backup.filename.trim_end_matches(".zip");
        let dump_path = scratch.path().join(format!("{}.sql", stem));
        let archive_path = scratch.path().join(&backup.filename);

        self.dumper
            .dump(database, engine, &dump_path)
            .await
            .map_err(at("dump"))?;

        let compressed = compress(dump_path.clone(), archive_path.clone()).await;
        if let Err(e) = tokio::fs::remove_file(&dump_path).await {
            warn!(backup_id = backup.id, "Failed to remove dump {}: {}", dump_path.display(), e);
        }
        compressed.map_err(at("compression"))?;

        let size = tokio::fs::metadata(&archive_path)
            .await
            .map_err(|e| at("archive stat")(e.into()))?
            .len();
        let bytes = tokio::fs::read(&archive_path)
            .await
            .map_err(|e| at("archive read")(e.into()))?;
        self.storage
            .upload(bytes, &backup.storage_path)
            .await
            .map_err(at("upload"))?;

        Ok(size as i64)
    }

    pub async fn get_backup(&self, id: i64, user_id: i64) -> Result<Backup> {
        let backup = self
            .backups
            .get_backup(id)
            .await?
            .ok_or_else(|| AppError::not_found("backup", id))?;
        ensure_owner("backup", id, backup.user_id, user_id)?;
        Ok(backup)
    }

    pub async fn list_backups(&self, user_id: i64) -> Result<Vec<Backup>> {
        self.backups.list_backups_by_user(user_id).await
    }

    pub async fn list_backups_for_database(
        &self,
        database_id: i64,
        user_id: i64,
    ) -> Result<Vec<Backup>> {
        self.owned_database(database_id, user_id).await?;
        self.backups.list_backups_by_database(database_id).await
    }

    /// Removes the stored archive, then the record.
    pub async fn delete_backup(&self, id: i64, user_id: i64, client: ClientMeta) -> Result<()> {
        let backup = self.get_backup(id, user_id).await?;
        self.storage.delete(&backup.storage_path).await?;
        if !self.backups.delete_backup(id).await? {
            return Err(AppError::not_found("backup", id));
        }
        info!(backup_id = id, "Backup {} deleted", backup.filename);

        self.audit
            .record(
                AuditEntry::new(
                    user_id,
                    "delete",
                    "backup",
                    id,
                    &format!("Backup {} deleted", backup.filename),
                    &client,
                )
                .with_metadata(json!({
                    "backup_id": id,
                    "database_id": backup.database_id,
                    "filename": backup.filename,
                })),
            )
            .await;
        Ok(())
    }

    /// Archive bytes of a completed backup.
    pub async fn download_backup(
        &self,
        id: i64,
        user_id: i64,
        client: ClientMeta,
    ) -> Result<Vec<u8>> {
        let backup = self.get_backup(id, user_id).await?;
        if backup.status != BackupStatus::Completed {
            return Err(AppError::BackupNotReady(id));
        }
        let bytes = self.storage.download(&backup.storage_path).await?;

        self.audit
            .record(
                AuditEntry::new(
                    user_id,
                    "download",
                    "backup",
                    id,
                    &format!("Backup {} downloaded", backup.filename),
                    &client,
                )
                .with_metadata(json!({
                    "backup_id": id,
                    "size": bytes.len(),
                })),
            )
            .await;
        Ok(bytes)
    }
}

async fn compress(dump_path: PathBuf, archive_path: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || archive::create_zip_archive(&dump_path, &archive_path))
        .await
        .map_err(|e| AppError::Panicked(format!("compression task: {}", e)))?
}
