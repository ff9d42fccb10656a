use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidScheduleExpr { expr: String, reason: String },

    #[error("Unsupported database engine: {0}")]
    UnsupportedEngine(String),

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: i64 },

    #[error("Access to {resource} {id} is not allowed")]
    Forbidden { resource: &'static str, id: i64 },

    #[error("Backup {0} is not completed and cannot be restored")]
    BackupNotReady(i64),

    #[error("{tool} failed with status {status}: {stderr}")]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} did not finish within {secs} seconds")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Stored credentials are unusable: {0}")]
    Credentials(String),

    #[error("Archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl AppError {
    pub fn not_found(resource: &'static str, id: i64) -> Self {
        AppError::NotFound { resource, id }
    }

    pub fn forbidden(resource: &'static str, id: i64) -> Self {
        AppError::Forbidden { resource, id }
    }

    /// Malformed input rejected before anything is persisted or queued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::InvalidScheduleExpr { .. } | AppError::UnsupportedEngine(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
