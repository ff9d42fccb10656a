use async_trait::async_trait;
use tracing::info;

use crate::errors::Result;
use crate::models::{DatabaseConnection, Engine};
use crate::tools::{strategy_for, CliTools};

/// Applies a SQL script to a target database.
#[async_trait]
pub trait RestoreExecutor: Send + Sync {
    async fn restore(
        &self,
        connection: &DatabaseConnection,
        engine: Engine,
        sql: Vec<u8>,
    ) -> Result<()>;
}

#[async_trait]
impl RestoreExecutor for CliTools {
    async fn restore(
        &self,
        connection: &DatabaseConnection,
        engine: Engine,
        sql: Vec<u8>,
    ) -> Result<()> {
        info!(
            database_id = connection.id,
            engine = %engine,
            "Restoring {} bytes of SQL into {}",
            sql.len(),
            connection.db_name
        );
        let invocation = strategy_for(engine).restore(connection);
        self.run(invocation, Some(sql)).await?;
        info!("✓ Restore into {} finished", connection.db_name);
        Ok(())
    }
}
