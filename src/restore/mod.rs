//! Restore pipeline: download a completed backup and replay it into a database.

pub mod db_restore;

use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::{Audit, AuditEntry, CompletionHook, NoopCompletionHook};
use crate::backup::archive::extract_sql_entry;
use crate::errors::{AppError, Result};
use crate::jobs::{panic_message, WorkerPool};
use crate::models::{
    Backup, BackupStatus, ClientMeta, DatabaseConnection, Engine, NewRestore, Restore,
    RestoreStatus,
};
use crate::storage::StorageGateway;
use crate::store::{BackupStore, DatabaseStore, RestoreStore};
use crate::utils::ensure_owner;
use db_restore::RestoreExecutor;

#[derive(Clone)]
pub struct RestorePipeline {
    databases: Arc<dyn DatabaseStore>,
    backups: Arc<dyn BackupStore>,
    restores: Arc<dyn RestoreStore>,
    storage: Arc<dyn StorageGateway>,
    executor: Arc<dyn RestoreExecutor>,
    pool: Arc<WorkerPool>,
    audit: Audit,
    completion: Arc<dyn CompletionHook>,
}

impl RestorePipeline {
    pub fn new(
        databases: Arc<dyn DatabaseStore>,
        backups: Arc<dyn BackupStore>,
        restores: Arc<dyn RestoreStore>,
        storage: Arc<dyn StorageGateway>,
        executor: Arc<dyn RestoreExecutor>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        RestorePipeline {
            databases,
            backups,
            restores,
            storage,
            executor,
            pool,
            audit: Audit::disabled(),
            completion: Arc::new(NoopCompletionHook),
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

    async fn owned_backup(&self, backup_id: i64, user_id: i64) -> Result<Backup> {
        let backup = self
            .backups
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| AppError::not_found("backup", backup_id))?;
        ensure_owner("backup", backup_id, backup.user_id, user_id)?;
        Ok(backup)
    }

    /// Queues a restore of `backup_id` into `database_id`.
    ///
    /// Only `completed` backups can be restored; anything else is rejected with
    /// `BackupNotReady` and no restore record is created.
    pub async fn create_restore(
        &self,
        backup_id: i64,
        database_id: i64,
        user_id: i64,
        client: ClientMeta,
    ) -> Result<Restore> {
        let backup = self.owned_backup(backup_id, user_id).await?;
        let database = self
            .databases
            .get_database(database_id)
            .await?
            .ok_or_else(|| AppError::not_found("database", database_id))?;
        ensure_owner("database", database_id, database.user_id, user_id)?;
        if backup.status != BackupStatus::Completed {
            return Err(AppError::BackupNotReady(backup_id));
        }
        let engine = database.engine()?;

        let restore = self
            .restores
            .insert_restore(NewRestore {
                user_id,
                backup_id,
                database_id,
            })
            .await?;
        info!(
            restore_id = restore.id,
            backup_id,
            database_id,
            "Restore of {} into {} queued",
            backup.filename,
            database.db_name
        );

        self.audit
            .record(
                AuditEntry::new(
                    user_id,
                    "create",
                    "restore",
                    restore.id,
                    &format!("Restore of backup {} into database {}", backup.filename, database.name),
                    &client,
                )
                .with_metadata(json!({
                    "restore_id": restore.id,
                    "backup_id": backup_id,
                    "database_id": database_id,
                })),
            )
            .await;

        let pipeline = self.clone();
        let restore_id = restore.id;
        self.pool
            .submit(async move { pipeline.run(restore_id, backup, database, engine).await })
            .await;

        Ok(restore)
    }

    async fn run(&self, restore_id: i64, backup: Backup, database: DatabaseConnection, engine: Engine) {
        match self.restores.advance_restore(restore_id, RestoreStatus::Running).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(restore_id, "Restore is no longer pending, skipping");
                return;
            }
            Err(e) => {
                // Success requires `running`, so never apply without it.
                error!(restore_id, "Failed to mark restore running: {}", e);
                if let Err(e) = self.restores.advance_restore(restore_id, RestoreStatus::Failed).await {
                    error!(restore_id, "Failed to persist restore status: {}", e);
                }
                self.notify_finished(restore_id).await;
                return;
            }
        }

        let outcome = AssertUnwindSafe(self.execute(&backup, &database, engine))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(AppError::Panicked(panic_message(payload.as_ref()))));

        let next = match outcome {
            Ok(()) => {
                info!(restore_id, "✓ Restore of {} succeeded", backup.filename);
                RestoreStatus::Success
            }
            Err(e) => {
                error!(restore_id, "Restore of {} failed: {}", backup.filename, e);
                RestoreStatus::Failed
            }
        };
        match self.restores.advance_restore(restore_id, next).await {
            Ok(true) => {}
            Ok(false) => warn!(restore_id, "Restore could not move to {}", next.as_str()),
            Err(e) => error!(restore_id, "Failed to persist restore status: {}", e),
        }
        self.notify_finished(restore_id).await;
    }

    async fn notify_finished(&self, restore_id: i64) {
        match self.restores.get_restore(restore_id).await {
            Ok(Some(finished)) => self.completion.restore_finished(&finished).await,
            Ok(None) => {}
            Err(e) => warn!(restore_id, "Failed to reload restore: {}", e),
        }
    }

    async fn execute(
        &self,
        backup: &Backup,
        database: &DatabaseConnection,
        engine: Engine,
    ) -> Result<()> {
        let archive = self.storage.download(&backup.storage_path).await?;
        let sql = tokio::task::spawn_blocking(move || extract_sql_entry(&archive))
            .await
            .map_err(|e| AppError::Panicked(format!("extraction task: {}", e)))??;
        self.executor.restore(database, engine, sql).await
    }

    pub async fn get_restore(&self, id: i64, user_id: i64) -> Result<Restore> {
        let restore = self
            .restores
            .get_restore(id)
            .await?
            .ok_or_else(|| AppError::not_found("restore", id))?;
        ensure_owner("restore", id, restore.user_id, user_id)?;
        Ok(restore)
    }

    pub async fn list_restores(&self, user_id: i64) -> Result<Vec<Restore>> {
        self.restores.list_restores_by_user(user_id).await
    }

    pub async fn list_restores_for_backup(
        &self,
        backup_id: i64,
        user_id: i64,
    ) -> Result<Vec<Restore>> {
        self.owned_backup(backup_id, user_id).await?;
        self.restores.list_restores_by_backup(backup_id).await
    }
}
