//! Recurring backups driven by persisted schedules.
//!
//! A single clock task sleeps until the earliest trigger is due, then hands
//! each fire to the worker pool. The trigger map lives behind one lock shared
//! by the clock and every mutation; mutations are additionally serialized so
//! persisting a schedule and (de)registering its trigger happen as one step.

pub mod cron_expr;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{Audit, AuditEntry};
use crate::backup::BackupPipeline;
use crate::errors::{AppError, Result};
use crate::jobs::WorkerPool;
use crate::models::{ClientMeta, NewSchedule, Schedule};
use crate::store::{DatabaseStore, ScheduleStore};
use crate::utils::ensure_owner;
use cron_expr::CronSchedule;

// Upper bound on a clock sleep when no trigger is registered.
const IDLE_TICK: Duration = Duration::from_secs(60);

struct Trigger {
    cron: CronSchedule,
    next: Option<DateTime<Utc>>,
    database_id: i64,
    user_id: i64,
}

/// One due trigger, taken off the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    pub schedule_id: i64,
    pub database_id: i64,
    pub user_id: i64,
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub active: Option<bool>,
}

pub struct CronScheduler {
    schedules: Arc<dyn ScheduleStore>,
    databases: Arc<dyn DatabaseStore>,
    backups: BackupPipeline,
    pool: Arc<WorkerPool>,
    audit: Audit,
    triggers: Mutex<HashMap<i64, Trigger>>,
    mutations: tokio::sync::Mutex<()>,
    wake: Notify,
    started: AtomicBool,
}

impl CronScheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        databases: Arc<dyn DatabaseStore>,
        backups: BackupPipeline,
        pool: Arc<WorkerPool>,
        audit: Audit,
    ) -> Self {
        CronScheduler {
            schedules,
            databases,
            backups,
            pool,
            audit,
            triggers: Mutex::new(HashMap::new()),
            mutations: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            started: AtomicBool::new(false),
        }
    }

    fn triggers(&self) -> MutexGuard<'_, HashMap<i64, Trigger>> {
        self.triggers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the clock task. Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let scheduler = Arc::clone(self);
        Some(tokio::spawn(async move { scheduler.clock_loop().await }))
    }

    async fn clock_loop(&self) {
        info!("Scheduler clock started");
        loop {
            let earliest = self.triggers().values().filter_map(|t| t.next).min();
            let wait = match earliest {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(IDLE_TICK),
                None => IDLE_TICK,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => continue,
            }

            let fires = self.take_due(Utc::now());
            if !fires.is_empty() {
                self.dispatch(fires).await;
            }
        }
    }

    /// Removes due fires from the trigger map and advances each trigger to its
    /// next run after `now`. Missed runs collapse into a single fire.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Fire> {
        let mut triggers = self.triggers();
        let mut fires = Vec::new();
        for (schedule_id, trigger) in triggers.iter_mut() {
            if trigger.next.is_some_and(|at| at <= now) {
                fires.push(Fire {
                    schedule_id: *schedule_id,
                    database_id: trigger.database_id,
                    user_id: trigger.user_id,
                });
                trigger.next = trigger.cron.next_after(&now);
            }
        }
        fires
    }

    /// Submits one backup job per fire. Failures are logged per fire.
    pub async fn dispatch(&self, fires: Vec<Fire>) {
        for fire in fires {
            debug!(schedule_id = fire.schedule_id, "Schedule fired");
            let backups = self.backups.clone();
            self.pool
                .submit(async move {
                    match backups
                        .create_backup(fire.database_id, fire.user_id, ClientMeta::scheduled())
                        .await
                    {
                        Ok(backup) => info!(
                            schedule_id = fire.schedule_id,
                            backup_id = backup.id,
                            "Scheduled backup created for database {}",
                            fire.database_id
                        ),
                        Err(e) => error!(
                            schedule_id = fire.schedule_id,
                            "Scheduled backup for database {} failed: {}",
                            fire.database_id,
                            e
                        ),
                    }
                })
                .await;
        }
    }

    fn register(&self, schedule: &Schedule, cron: CronSchedule) {
        let next = cron.next_after(&Utc::now());
        self.triggers().insert(
            schedule.id,
            Trigger {
                cron,
                next,
                database_id: schedule.database_id,
                user_id: schedule.user_id,
            },
        );
        self.wake.notify_one();
        debug!(schedule_id = schedule.id, next = ?next, "Trigger registered");
    }

    fn deregister(&self, schedule_id: i64) -> bool {
        let removed = self.triggers().remove(&schedule_id).is_some();
        if removed {
            self.wake.notify_one();
            debug!(schedule_id, "Trigger removed");
        }
        removed
    }

    pub fn is_registered(&self, schedule_id: i64) -> bool {
        self.triggers().contains_key(&schedule_id)
    }

    pub fn next_fire(&self, schedule_id: i64) -> Option<DateTime<Utc>> {
        self.triggers().get(&schedule_id).and_then(|t| t.next)
    }

    /// Registers a trigger for every active schedule. A record that cannot be
    /// registered is logged and skipped. Returns the number registered.
    pub async fn load_active(&self) -> Result<usize> {
        let _guard = self.mutations.lock().await;
        let active = self.schedules.list_active_schedules().await?;
        let total = active.len();
        let mut loaded = 0;
        for schedule in active {
            match cron_expr::parse(&schedule.cron_expression) {
                Ok(cron) => {
                    self.register(&schedule, cron);
                    loaded += 1;
                }
                Err(e) => warn!(schedule_id = schedule.id, "Skipping schedule: {}", e),
            }
        }
        info!("Loaded {}/{} active schedules", loaded, total);
        Ok(loaded)
    }

    pub async fn create(
        &self,
        database_id: i64,
        user_id: i64,
        cron_expression: &str,
        client: ClientMeta,
    ) -> Result<Schedule> {
        let cron = cron_expr::parse(cron_expression)?;
        let database = self
            .databases
            .get_database(database_id)
            .await?
            .ok_or_else(|| AppError::not_found("database", database_id))?;
        ensure_owner("database", database_id, database.user_id, user_id)?;

        let _guard = self.mutations.lock().await;
        let schedule = self
            .schedules
            .insert_schedule(NewSchedule {
                user_id,
                database_id,
                name: None,
                cron_expression: cron_expression.trim().to_string(),
                active: true,
            })
            .await?;
        self.register(&schedule, cron);
        info!(
            schedule_id = schedule.id,
            database_id,
            "Schedule '{}' created",
            schedule.cron_expression
        );

        self.audit
            .record(
                AuditEntry::new(
                    user_id,
                    "create",
                    "schedule",
                    schedule.id,
                    &format!("Schedule created for database {}", database.name),
                    &client,
                )
                .with_metadata(schedule_metadata(&schedule)),
            )
            .await;
        Ok(schedule)
    }

    pub async fn update(
        &self,
        id: i64,
        user_id: i64,
        changes: ScheduleUpdate,
        client: ClientMeta,
    ) -> Result<Schedule> {
        let new_cron = changes
            .cron_expression
            .as_deref()
            .map(|expr| cron_expr::parse(expr).map(|cron| (expr.trim().to_string(), cron)))
            .transpose()?;

        let _guard = self.mutations.lock().await;
        let mut schedule = self.get(id, user_id).await?;
        let was_active = schedule.active;
        if let Some(name) = changes.name {
            schedule.name = Some(name);
        }
        let cron_changed = match &new_cron {
            Some((expr, _)) => {
                let changed = *expr != schedule.cron_expression;
                schedule.cron_expression = expr.clone();
                changed
            }
            None => false,
        };
        if let Some(active) = changes.active {
            schedule.active = active;
        }

        let schedule = self.schedules.update_schedule(&schedule).await?;

        match (was_active, schedule.active) {
            (_, false) => {
                self.deregister(id);
            }
            (false, true) => self.register_from_record(&schedule, new_cron.map(|(_, c)| c)),
            (true, true) if cron_changed || !self.is_registered(id) => {
                self.deregister(id);
                self.register_from_record(&schedule, new_cron.map(|(_, c)| c));
            }
            (true, true) => {}
        }
        info!(
            schedule_id = id,
            active = schedule.active,
            "Schedule '{}' updated",
            schedule.cron_expression
        );

        self.audit
            .record(
                AuditEntry::new(user_id, "update", "schedule", id, "Schedule updated", &client)
                    .with_metadata(schedule_metadata(&schedule)),
            )
            .await;
        Ok(schedule)
    }

    fn register_from_record(&self, schedule: &Schedule, parsed: Option<CronSchedule>) {
        let cron = match parsed {
            Some(cron) => cron,
            None => match cron_expr::parse(&schedule.cron_expression) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(schedule_id = schedule.id, "Not registering schedule: {}", e);
                    return;
                }
            },
        };
        self.register(schedule, cron);
    }

    pub async fn delete(&self, id: i64, user_id: i64, client: ClientMeta) -> Result<()> {
        let _guard = self.mutations.lock().await;
        let schedule = self.get(id, user_id).await?;
        self.deregister(id);
        if !self.schedules.delete_schedule(id).await? {
            return Err(AppError::not_found("schedule", id));
        }
        info!(schedule_id = id, "Schedule deleted");

        self.audit
            .record(
                AuditEntry::new(user_id, "delete", "schedule", id, "Schedule deleted", &client)
                    .with_metadata(schedule_metadata(&schedule)),
            )
            .await;
        Ok(())
    }

    pub async fn get(&self, id: i64, user_id: i64) -> Result<Schedule> {
        let schedule = self
            .schedules
            .get_schedule(id)
            .await?
            .ok_or_else(|| AppError::not_found("schedule", id))?;
        ensure_owner("schedule", id, schedule.user_id, user_id)?;
        Ok(schedule)
    }

    pub async fn list(&self, user_id: i64) -> Result<Vec<Schedule>> {
        self.schedules.list_schedules_by_user(user_id).await
    }
}

fn schedule_metadata(schedule: &Schedule) -> serde_json::Value {
    json!({
        "schedule_id": schedule.id,
        "database_id": schedule.database_id,
        "cron_expression": schedule.cron_expression,
        "active": schedule.active,
    })
}
