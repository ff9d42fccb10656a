//! Periodic cleanup of expired sessions and old backup artifacts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::jobs::WorkerPool;
use crate::storage::StorageGateway;
use crate::store::{BackupStore, SessionStore};

pub async fn sweep_sessions_once(sessions: &dyn SessionStore, now: DateTime<Utc>) -> Result<u64> {
    let removed = sessions.delete_expired_sessions(now).await?;
    if removed > 0 {
        info!("Removed {} expired sessions", removed);
    }
    Ok(removed)
}

/// Sweeps sessions immediately, then once per `period`.
pub fn spawn_session_sweeper(sessions: Arc<dyn SessionStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_sessions_once(sessions.as_ref(), Utc::now()).await {
                error!("Session sweep failed: {}", e);
            }
        }
    })
}

/// Outcome of one backup retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub artifacts_deleted: usize,
    pub records_deleted: usize,
}

/// Deletes artifact and record of every completed backup created before
/// `now - retention`. The two deletions are attempted independently.
pub async fn sweep_expired_backups_once(
    backups: &dyn BackupStore,
    storage: &dyn StorageGateway,
    now: DateTime<Utc>,
    retention: ChronoDuration,
) -> Result<SweepReport> {
    let cutoff = now - retention;
    let expired = backups.list_completed_backups_before(cutoff).await?;
    let mut report = SweepReport {
        examined: expired.len(),
        ..Default::default()
    };

    for backup in expired {
        match storage.delete(&backup.storage_path).await {
            Ok(()) => report.artifacts_deleted += 1,
            Err(e) => warn!(backup_id = backup.id, "Failed to delete expired artifact: {}", e),
        }
        match backups.delete_backup(backup.id).await {
            Ok(true) => report.records_deleted += 1,
            Ok(false) => {}
            Err(e) => warn!(backup_id = backup.id, "Failed to delete expired backup record: {}", e),
        }
    }

    if report.examined > 0 {
        info!(
            "Retention sweep: {} expired backups, {} artifacts and {} records removed",
            report.examined, report.artifacts_deleted, report.records_deleted
        );
    }
    Ok(report)
}

/// Runs the retention sweep on the worker pool once per `period`.
pub fn spawn_backup_sweeper(
    backups: Arc<dyn BackupStore>,
    storage: Arc<dyn StorageGateway>,
    pool: Arc<WorkerPool>,
    period: Duration,
    retention: ChronoDuration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; retention runs start one period in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (backups, storage) = (Arc::clone(&backups), Arc::clone(&storage));
            pool.submit(async move {
                if let Err(e) =
                    sweep_expired_backups_once(backups.as_ref(), storage.as_ref(), Utc::now(), retention)
                        .await
                {
                    error!("Backup retention sweep failed: {}", e);
                }
            })
            .await;
        }
    })
}
