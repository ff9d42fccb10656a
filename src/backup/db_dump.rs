use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use crate::errors::Result;
use crate::models::{DatabaseConnection, Engine};
use crate::tools::{strategy_for, CliTools};

/// Produces a plain SQL dump of one database.
#[async_trait]
pub trait DumpExecutor: Send + Sync {
    async fn dump(
        &self,
        connection: &DatabaseConnection,
        engine: Engine,
        output_file: &Path,
    ) -> Result<()>;
}

#[async_trait]
impl DumpExecutor for CliTools {
    async fn dump(
        &self,
        connection: &DatabaseConnection,
        engine: Engine,
        output_file: &Path,
    ) -> Result<()> {
        info!(
            database_id = connection.id,
            engine = %engine,
            "Dumping {} to {}",
            connection.db_name,
            output_file.display()
        );
        let invocation = strategy_for(engine).dump(connection, output_file);
        self.run(invocation, None).await?;
        info!("✓ Dump of {} finished", connection.db_name);
        Ok(())
    }
}
