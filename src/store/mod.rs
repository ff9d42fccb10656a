//! Persistence seams used by the core. Every mutation is a single-row update;
//! status changes are conditional on the current status so a record never
//! moves backwards.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{
    Backup, DatabaseConnection, NewBackup, NewRestore, NewSchedule, Restore, RestoreStatus,
    Schedule,
};

#[async_trait]
pub trait DatabaseStore: Send + Sync {
    async fn get_database(&self, id: i64) -> Result<Option<DatabaseConnection>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule>;
    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>>;
    async fn list_schedules_by_user(&self, user_id: i64) -> Result<Vec<Schedule>>;
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>>;
    /// Persists name, cron expression and active flag of `schedule`.
    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule>;
    /// Returns false when no live row matched.
    async fn delete_schedule(&self, id: i64) -> Result<bool>;
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn insert_backup(&self, new: NewBackup) -> Result<Backup>;
    async fn get_backup(&self, id: i64) -> Result<Option<Backup>>;
    async fn list_backups_by_user(&self, user_id: i64) -> Result<Vec<Backup>>;
    async fn list_backups_by_database(&self, database_id: i64) -> Result<Vec<Backup>>;
    /// `pending -> completed`, recording the archive size. False if the backup
    /// was not pending.
    async fn mark_backup_completed(&self, id: i64, size: i64) -> Result<bool>;
    /// `pending -> failed`. False if the backup was not pending.
    async fn mark_backup_failed(&self, id: i64, error_message: &str) -> Result<bool>;
    async fn list_completed_backups_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Backup>>;
    async fn delete_backup(&self, id: i64) -> Result<bool>;
}

#[async_trait]
pub trait RestoreStore: Send + Sync {
    async fn insert_restore(&self, new: NewRestore) -> Result<Restore>;
    async fn get_restore(&self, id: i64) -> Result<Option<Restore>>;
    async fn list_restores_by_user(&self, user_id: i64) -> Result<Vec<Restore>>;
    async fn list_restores_by_backup(&self, backup_id: i64) -> Result<Vec<Restore>>;
    /// Moves the restore to `next` only from one of `next.predecessors()`.
    async fn advance_restore(&self, id: i64, next: RestoreStatus) -> Result<bool>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Hard-deletes every session that expired before `now`.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}
