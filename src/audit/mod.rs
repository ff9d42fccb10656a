//! Action log collaborator and the completion hook.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::errors::Result;
use crate::models::{Backup, BackupStatus, ClientMeta, Restore, RestoreStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub user_id: i64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: i64,
    pub description: String,
    pub metadata: Value,
    pub ip_address: String,
    pub user_agent: String,
}

impl AuditEntry {
    pub fn new(
        user_id: i64,
        action: &str,
        resource_type: &str,
        resource_id: i64,
        description: &str,
        client: &ClientMeta,
    ) -> Self {
        AuditEntry {
            user_id,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            description: description.to_string(),
            metadata: Value::Null,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Fire-and-forget front for an optional [`AuditSink`]. A failing sink is
/// logged and never fails the operation that produced the entry.
#[derive(Clone, Default)]
pub struct Audit {
    sink: Option<Arc<dyn AuditSink>>,
}

impl Audit {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Audit { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Audit { sink: None }
    }

    pub async fn record(&self, entry: AuditEntry) {
        let Some(sink) = &self.sink else {
            return;
        };
        let (action, resource_type, resource_id) =
            (entry.action.clone(), entry.resource_type.clone(), entry.resource_id);
        if let Err(e) = sink.record(entry).await {
            warn!(
                action = %action,
                resource_type = %resource_type,
                resource_id,
                "Failed to record audit entry: {}",
                e
            );
        }
    }
}

/// Called once a backup or restore reaches a terminal state.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn backup_finished(&self, _backup: &Backup) {}

    async fn restore_finished(&self, _restore: &Restore) {}
}

/// Default hook: completion is only logged.
pub struct NoopCompletionHook;

impl CompletionHook for NoopCompletionHook {}

/// Completion hook writing a `completed`/`failed` audit entry per job.
pub struct AuditCompletionHook {
    audit: Audit,
}

impl AuditCompletionHook {
    pub fn new(audit: Audit) -> Self {
        AuditCompletionHook { audit }
    }
}

#[async_trait]
impl CompletionHook for AuditCompletionHook {
    async fn backup_finished(&self, backup: &Backup) {
        let (action, description) = match backup.status {
            BackupStatus::Completed => ("completed", "Backup completed"),
            _ => ("failed", "Backup failed"),
        };
        let entry = AuditEntry::new(
            backup.user_id,
            action,
            "backup",
            backup.id,
            description,
            &ClientMeta::default(),
        )
        .with_metadata(json!({
            "backup_id": backup.id,
            "database_id": backup.database_id,
            "status": backup.status.as_str(),
            "size": backup.size,
            "error_msg": backup.error_message,
        }));
        self.audit.record(entry).await;
    }

    async fn restore_finished(&self, restore: &Restore) {
        let (action, description) = match restore.status {
            RestoreStatus::Success => ("completed", "Restore completed"),
            _ => ("failed", "Restore failed"),
        };
        let entry = AuditEntry::new(
            restore.user_id,
            action,
            "restore",
            restore.id,
            description,
            &ClientMeta::default(),
        )
        .with_metadata(json!({
            "restore_id": restore.id,
            "backup_id": restore.backup_id,
            "database_id": restore.database_id,
            "status": restore.status.as_str(),
        }));
        self.audit.record(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::store::MemoryStore;
    use chrono::Utc;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _entry: AuditEntry) -> Result<()> {
            Err(AppError::Storage("audit table unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn failing_sink_is_swallowed() {
        let audit = Audit::new(Arc::new(BrokenSink));
        audit
            .record(AuditEntry::new(1, "create", "schedule", 1, "x", &ClientMeta::default()))
            .await;
    }

    #[tokio::test]
    async fn completion_hook_records_terminal_state() {
        let store = Arc::new(MemoryStore::new());
        let hook = AuditCompletionHook::new(Audit::new(store.clone()));
        let now = Utc::now();
        let backup = Backup {
            id: 4,
            user_id: 9,
            database_id: 2,
            filename: "app_postgresql_20250101_000000.zip".to_string(),
            storage_path: "9/postgresql/app_postgresql_20250101_000000.zip".to_string(),
            size: None,
            status: BackupStatus::Failed,
            error_message: Some("dump failed".to_string()),
            created_at: now,
            updated_at: now,
        };

        hook.backup_finished(&backup).await;

        let entries = store.audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "failed");
        assert_eq!(entries[0].resource_type, "backup");
        assert_eq!(entries[0].metadata["error_msg"], "dump failed");
    }
}
