use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use super::{BackupStore, DatabaseStore, RestoreStore, ScheduleStore, SessionStore};
use crate::audit::{AuditEntry, AuditSink};
use crate::errors::{AppError, Result};
use crate::models::{
    Backup, DatabaseConnection, NewBackup, NewRestore, NewSchedule, Restore, RestoreStatus,
    Schedule,
};

const SCHEDULE_COLUMNS: &str =
    "id, user_id, database_id, name, cron_expression, active, created_at, updated_at";
const BACKUP_COLUMNS: &str =
    "id, user_id, database_id, filename, filepath, size, status, error_msg, created_at, updated_at";
const RESTORE_COLUMNS: &str =
    "id, user_id, backup_id, database_id, status, created_at, updated_at";

/// Postgres-backed store for the service's own records.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(PgStore { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("✓ Database migrations completed");
        Ok(())
    }
}

fn database_from_row(row: &PgRow) -> Result<DatabaseConnection> {
    let port: i32 = row.try_get("port")?;
    let id: i64 = row.try_get("id")?;
    Ok(DatabaseConnection {
        id,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        engine: row.try_get("type")?,
        host: row.try_get("host")?,
        port: u16::try_from(port)
            .map_err(|_| AppError::Config(format!("database {} has invalid port {}", id, port)))?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        db_name: row.try_get("db_name")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule> {
    Ok(Schedule {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        database_id: row.try_get("database_id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn backup_from_row(row: &PgRow) -> Result<Backup> {
    let status: String = row.try_get("status")?;
    Ok(Backup {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        database_id: row.try_get("database_id")?,
        filename: row.try_get("filename")?,
        storage_path: row.try_get("filepath")?,
        size: row.try_get("size")?,
        status: status.parse()?,
        error_message: row.try_get("error_msg")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn restore_from_row(row: &PgRow) -> Result<Restore> {
    let status: String = row.try_get("status")?;
    Ok(Restore {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        backup_id: row.try_get("backup_id")?,
        database_id: row.try_get("database_id")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(rows: &[PgRow], map: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl DatabaseStore for PgStore {
    async fn get_database(&self, id: i64) -> Result<Option<DatabaseConnection>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, type, host, port, username, password, db_name
             FROM databases WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(database_from_row).transpose()
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let row = sqlx::query(&format!(
            "INSERT INTO schedules (user_id, database_id, name, cron_expression, active)
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            SCHEDULE_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.database_id)
        .bind(&new.name)
        .bind(&new.cron_expression)
        .bind(new.active)
        .fetch_one(&self.pool)
        .await?;
        schedule_from_row(&row)
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM schedules WHERE id = $1 AND deleted_at IS NULL",
            SCHEDULE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules_by_user(&self, user_id: i64) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedules WHERE user_id = $1 AND deleted_at IS NULL ORDER BY id",
            SCHEDULE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, schedule_from_row)
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedules WHERE active = TRUE AND deleted_at IS NULL ORDER BY id",
            SCHEDULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, schedule_from_row)
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let row = sqlx::query(&format!(
            "UPDATE schedules SET name = $2, cron_expression = $3, active = $4, updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL RETURNING {}",
            SCHEDULE_COLUMNS
        ))
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(schedule.active)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => schedule_from_row(&row),
            None => Err(AppError::not_found("schedule", schedule.id)),
        }
    }

    async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl BackupStore for PgStore {
    async fn insert_backup(&self, new: NewBackup) -> Result<Backup> {
        let row = sqlx::query(&format!(
            "INSERT INTO backups (user_id, database_id, filename, filepath, status)
             VALUES ($1, $2, $3, $4, 'pending') RETURNING {}",
            BACKUP_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.database_id)
        .bind(&new.filename)
        .bind(&new.storage_path)
        .fetch_one(&self.pool)
        .await?;
        backup_from_row(&row)
    }

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM backups WHERE id = $1 AND deleted_at IS NULL",
            BACKUP_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn list_backups_by_user(&self, user_id: i64) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backups WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC",
            BACKUP_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, backup_from_row)
    }

    async fn list_backups_by_database(&self, database_id: i64) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backups WHERE database_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC",
            BACKUP_COLUMNS
        ))
        .bind(database_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, backup_from_row)
    }

    async fn mark_backup_completed(&self, id: i64, size: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backups SET status = 'completed', size = $2, error_msg = NULL, updated_at = now()
             WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_backup_failed(&self, id: i64, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backups SET status = 'failed', error_msg = $2, updated_at = now()
             WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_completed_backups_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backups
             WHERE status = 'completed' AND created_at < $1 AND deleted_at IS NULL
             ORDER BY created_at",
            BACKUP_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, backup_from_row)
    }

    async fn delete_backup(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE backups SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RestoreStore for PgStore {
    async fn insert_restore(&self, new: NewRestore) -> Result<Restore> {
        let row = sqlx::query(&format!(
            "INSERT INTO restores (user_id, backup_id, database_id, status)
             VALUES ($1, $2, $3, 'pending') RETURNING {}",
            RESTORE_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.backup_id)
        .bind(new.database_id)
        .fetch_one(&self.pool)
        .await?;
        restore_from_row(&row)
    }

    async fn get_restore(&self, id: i64) -> Result<Option<Restore>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM restores WHERE id = $1 AND deleted_at IS NULL",
            RESTORE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(restore_from_row).transpose()
    }

    async fn list_restores_by_user(&self, user_id: i64) -> Result<Vec<Restore>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM restores WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC",
            RESTORE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, restore_from_row)
    }

    async fn list_restores_by_backup(&self, backup_id: i64) -> Result<Vec<Restore>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM restores WHERE backup_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC",
            RESTORE_COLUMNS
        ))
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, restore_from_row)
    }

    async fn advance_restore(&self, id: i64, next: RestoreStatus) -> Result<bool> {
        let allowed: Vec<String> = next
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let result = sqlx::query(
            "UPDATE restores SET status = $2, updated_at = now()
             WHERE id = $1 AND status = ANY($3) AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(next.as_str())
        .bind(allowed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO action_histories
             (user_id, action, resource_type, resource_id, description, metadata, ip_address, user_agent)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.user_id)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
