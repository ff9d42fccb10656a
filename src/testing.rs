// Fixtures shared by the pipeline, scheduler and sweeper tests.
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backup::db_dump::DumpExecutor;
use crate::backup::BackupPipeline;
use crate::errors::{AppError, Result};
use crate::jobs::WorkerPool;
use crate::models::{Backup, DatabaseConnection, Engine, Restore};
use crate::restore::db_restore::RestoreExecutor;
use crate::storage::{LocalStorage, StorageGateway};
use crate::store::{BackupStore, MemoryStore, RestoreStore};

pub const DUMP_SQL: &str = "CREATE TABLE orders (id int primary key);\nINSERT INTO orders VALUES (1);\n";

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

/// Stands in for mysqldump/pg_dump/mysql/psql.
pub struct FakeTools {
    behaviour: Behaviour,
    restored: Mutex<Vec<Vec<u8>>>,
}

impl FakeTools {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(FakeTools {
            behaviour,
            restored: Mutex::new(Vec::new()),
        })
    }

    pub fn restored(&self) -> Vec<Vec<u8>> {
        self.restored.lock().unwrap().clone()
    }

    fn outcome(&self, tool: &str) -> Result<()> {
        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(AppError::ExternalTool {
                tool: tool.to_string(),
                status: "exit status: 2".to_string(),
                stderr: "connection refused".to_string(),
            }),
            Behaviour::Panic => panic!("{} crashed", tool),
        }
    }
}

#[async_trait]
impl DumpExecutor for FakeTools {
    async fn dump(&self, _conn: &DatabaseConnection, _engine: Engine, output_file: &Path) -> Result<()> {
        self.outcome("pg_dump")?;
        tokio::fs::write(output_file, DUMP_SQL).await?;
        Ok(())
    }
}

#[async_trait]
impl RestoreExecutor for FakeTools {
    async fn restore(&self, _conn: &DatabaseConnection, _engine: Engine, sql: Vec<u8>) -> Result<()> {
        self.outcome("psql")?;
        self.restored.lock().unwrap().push(sql);
        Ok(())
    }
}

/// Storage whose every operation fails.
pub struct UnreachableStorage;

#[async_trait]
impl StorageGateway for UnreachableStorage {
    async fn upload(&self, _bytes: Vec<u8>, _key: &str) -> Result<()> {
        Err(AppError::Storage("unreachable".to_string()))
    }
    async fn download(&self, _key: &str) -> Result<Vec<u8>> {
        Err(AppError::Storage("unreachable".to_string()))
    }
    async fn delete(&self, _key: &str) -> Result<()> {
        Err(AppError::Storage("unreachable".to_string()))
    }
    async fn exists(&self, _key: &str) -> Result<bool> {
        Err(AppError::Storage("unreachable".to_string()))
    }
}

pub fn database(id: i64, user_id: i64, engine: &str) -> DatabaseConnection {
    DatabaseConnection {
        id,
        user_id,
        name: "shop".to_string(),
        engine: engine.to_string(),
        host: "127.0.0.1".to_string(),
        port: 5432,
        username: "shop".to_string(),
        password: "secret".to_string(),
        db_name: "shop".to_string(),
    }
}

/// Memory store seeded with database 1 (user 10, postgresql) and database 2
/// (user 20, mysql), plus a started pool and a backup pipeline over a temp dir.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub pool: Arc<WorkerPool>,
    pub tools: Arc<FakeTools>,
    pub backups: BackupPipeline,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(behaviour: Behaviour) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.add_database(database(1, 10, "postgresql"));
        store.add_database(database(2, 20, "mysql"));
        let pool = Arc::new(WorkerPool::new(2, 8));
        pool.start();
        let tools = FakeTools::new(behaviour);
        let backups = BackupPipeline::new(
            store.clone(),
            store.clone(),
            Arc::new(LocalStorage::new(dir.path().join("storage"))),
            tools.clone(),
            pool.clone(),
            dir.path().join("work"),
        );
        Harness {
            store,
            pool,
            tools,
            backups,
            dir,
        }
    }
}

pub async fn wait_for_backup(store: &MemoryStore, id: i64) -> Backup {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(backup) = store.get_backup(id).await.unwrap() {
                if backup.status.is_terminal() {
                    return backup;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backup did not reach a terminal state")
}

pub async fn wait_for_restore(store: &MemoryStore, id: i64) -> Restore {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(restore) = store.get_restore(id).await.unwrap() {
                if restore.status.is_terminal() {
                    return restore;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("restore did not reach a terminal state")
}
