//! Backup and restore job orchestration for MySQL and PostgreSQL databases.
//!
//! Schedules, backups and restores are persisted through the [`store`] traits;
//! the long-running work runs on the bounded [`jobs::WorkerPool`].

pub mod audit;
pub mod backup;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod restore;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod tools;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
