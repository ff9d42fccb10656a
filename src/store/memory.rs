use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{BackupStore, DatabaseStore, RestoreStore, ScheduleStore, SessionStore};
use crate::audit::{AuditEntry, AuditSink};
use crate::errors::{AppError, Result};
use crate::models::{
    Backup, BackupStatus, DatabaseConnection, NewBackup, NewRestore, NewSchedule, Restore,
    RestoreStatus, Schedule,
};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    databases: BTreeMap<i64, DatabaseConnection>,
    schedules: BTreeMap<i64, Schedule>,
    backups: BTreeMap<i64, Backup>,
    restores: BTreeMap<i64, Restore>,
    sessions: BTreeMap<i64, DateTime<Utc>>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store implementing every store trait and the audit sink.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_database(&self, database: DatabaseConnection) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(database.id);
        state.databases.insert(database.id, database);
    }

    pub fn add_session(&self, expires_at: DateTime<Utc>) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.sessions.insert(id, expires_at);
        id
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Overwrites a backup's creation time, for retention tests.
    pub fn set_backup_created_at(&self, id: i64, created_at: DateTime<Utc>) {
        if let Some(backup) = self.lock().backups.get_mut(&id) {
            backup.created_at = created_at;
        }
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }

    pub fn schedule_count(&self) -> usize {
        self.lock().schedules.len()
    }

    pub fn restore_count(&self) -> usize {
        self.lock().restores.len()
    }
}

#[async_trait]
impl DatabaseStore for MemoryStore {
    async fn get_database(&self, id: i64) -> Result<Option<DatabaseConnection>> {
        Ok(self.lock().databases.get(&id).cloned())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let mut state = self.lock();
        let now = Utc::now();
        let schedule = Schedule {
            id: state.next_id(),
            user_id: new.user_id,
            database_id: new.database_id,
            name: new.name,
            cron_expression: new.cron_expression,
            active: new.active,
            created_at: now,
            updated_at: now,
        };
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        Ok(self.lock().schedules.get(&id).cloned())
    }

    async fn list_schedules_by_user(&self, user_id: i64) -> Result<Vec<Schedule>> {
        Ok(self
            .lock()
            .schedules
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.lock().schedules.values().filter(|s| s.active).cloned().collect())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let mut state = self.lock();
        let stored = state
            .schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| AppError::not_found("schedule", schedule.id))?;
        stored.name = schedule.name.clone();
        stored.cron_expression = schedule.cron_expression.clone();
        stored.active = schedule.active;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_schedule(&self, id: i64) -> Result<bool> {
        Ok(self.lock().schedules.remove(&id).is_some())
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn insert_backup(&self, new: NewBackup) -> Result<Backup> {
        let mut state = self.lock();
        let now = Utc::now();
        let backup = Backup {
            id: state.next_id(),
            user_id: new.user_id,
            database_id: new.database_id,
            filename: new.filename,
            storage_path: new.storage_path,
            size: None,
            status: BackupStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.backups.insert(backup.id, backup.clone());
        Ok(backup)
    }

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        Ok(self.lock().backups.get(&id).cloned())
    }

    async fn list_backups_by_user(&self, user_id: i64) -> Result<Vec<Backup>> {
        Ok(self
            .lock()
            .backups
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_backups_by_database(&self, database_id: i64) -> Result<Vec<Backup>> {
        Ok(self
            .lock()
            .backups
            .values()
            .filter(|b| b.database_id == database_id)
            .cloned()
            .collect())
    }

    async fn mark_backup_completed(&self, id: i64, size: i64) -> Result<bool> {
        let mut state = self.lock();
        match state.backups.get_mut(&id) {
            Some(b) if b.status == BackupStatus::Pending => {
                b.status = BackupStatus::Completed;
                b.size = Some(size);
                b.error_message = None;
                b.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_backup_failed(&self, id: i64, error_message: &str) -> Result<bool> {
        let mut state = self.lock();
        match state.backups.get_mut(&id) {
            Some(b) if b.status == BackupStatus::Pending => {
                b.status = BackupStatus::Failed;
                b.error_message = Some(error_message.to_string());
                b.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_completed_backups_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Backup>> {
        Ok(self
            .lock()
            .backups
            .values()
            .filter(|b| b.status == BackupStatus::Completed && b.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_backup(&self, id: i64) -> Result<bool> {
        Ok(self.lock().backups.remove(&id).is_some())
    }
}

#[async_trait]
impl RestoreStore for MemoryStore {
    async fn insert_restore(&self, new: NewRestore) -> Result<Restore> {
        let mut state = self.lock();
        let now = Utc::now();
        let restore = Restore {
            id: state.next_id(),
            user_id: new.user_id,
            backup_id: new.backup_id,
            database_id: new.database_id,
            status: RestoreStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        state.restores.insert(restore.id, restore.clone());
        Ok(restore)
    }

    async fn get_restore(&self, id: i64) -> Result<Option<Restore>> {
        Ok(self.lock().restores.get(&id).cloned())
    }

    async fn list_restores_by_user(&self, user_id: i64) -> Result<Vec<Restore>> {
        Ok(self
            .lock()
            .restores
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_restores_by_backup(&self, backup_id: i64) -> Result<Vec<Restore>> {
        Ok(self
            .lock()
            .restores
            .values()
            .filter(|r| r.backup_id == backup_id)
            .cloned()
            .collect())
    }

    async fn advance_restore(&self, id: i64, next: RestoreStatus) -> Result<bool> {
        let mut state = self.lock();
        match state.restores.get_mut(&id) {
            Some(r) if r.status.can_advance_to(next) => {
                r.status = next;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.sessions.len();
        state.sessions.retain(|_, expires_at| *expires_at > now);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.lock().audit.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backup_status_never_moves_backwards() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let backup = store
            .insert_backup(NewBackup {
                user_id: 1,
                database_id: 2,
                filename: "f.zip".to_string(),
                storage_path: "1/mysql/f.zip".to_string(),
            })
            .await?;

        assert!(store.mark_backup_completed(backup.id, 512).await?);
        assert!(!store.mark_backup_failed(backup.id, "late failure").await?);
        assert!(!store.mark_backup_completed(backup.id, 1).await?);

        let stored = store.get_backup(backup.id).await?.unwrap();
        assert_eq!(stored.status, BackupStatus::Completed);
        assert_eq!(stored.size, Some(512));
        assert_eq!(stored.error_message, None);
        Ok(())
    }

    #[tokio::test]
    async fn restore_advances_only_along_the_state_machine() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let restore = store
            .insert_restore(NewRestore { user_id: 1, backup_id: 2, database_id: 3 })
            .await?;

        assert!(!store.advance_restore(restore.id, RestoreStatus::Success).await?);
        assert!(store.advance_restore(restore.id, RestoreStatus::Running).await?);
        assert!(store.advance_restore(restore.id, RestoreStatus::Success).await?);
        assert!(!store.advance_restore(restore.id, RestoreStatus::Failed).await?);
        assert!(!store.advance_restore(restore.id, RestoreStatus::Running).await?);

        let stored = store.get_restore(restore.id).await?.unwrap();
        assert_eq!(stored.status, RestoreStatus::Success);
        Ok(())
    }

    #[tokio::test]
    async fn expired_sessions_are_removed() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.add_session(now - chrono::Duration::hours(2));
        store.add_session(now - chrono::Duration::minutes(1));
        store.add_session(now + chrono::Duration::hours(1));

        assert_eq!(store.delete_expired_sessions(now).await?, 2);
        assert_eq!(store.session_count(), 1);
        assert_eq!(store.delete_expired_sessions(now).await?, 0);
        Ok(())
    }
}
