// backupd/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_WORK_DIR: &str = "./databasebackup";
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_SESSION_SWEEP_SECS: u64 = 3600;
const DEFAULT_BACKUP_SWEEP_SECS: u64 = 86400;
const DEFAULT_RETENTION_DAYS: i64 = 365;
const DEFAULT_MAX_DB_CONNECTIONS: u32 = 10;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonStorageConfig {
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub metadata_database_url: Option<String>,
    pub max_db_connections: Option<u32>,
    pub work_dir: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub session_sweep_interval_secs: Option<u64>,
    pub backup_sweep_interval_secs: Option<u64>,
    pub backup_retention_days: Option<i64>,
    pub audit_completion: Option<bool>,
    pub credentials_key: Option<String>,
    pub storage: Option<JsonStorageConfig>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub log_level: Option<String>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local(PathBuf),
    S3(SpacesConfig),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub metadata_database_url: String,
    pub max_db_connections: u32,
    pub work_dir: PathBuf,
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// `None` when external tools may run without a deadline.
    pub tool_timeout: Option<Duration>,
    pub session_sweep_interval: Duration,
    pub backup_sweep_interval: Duration,
    pub backup_retention: chrono::Duration,
    pub audit_completion: bool,
    /// Master key for stored connection passwords; `None` reads them as plain text.
    pub credentials_key: Option<String>,
    pub storage: StorageConfig,
    pub log_level: String,
    /// Problems that did not stop loading. Logged once tracing is up.
    pub warnings: Vec<String>,
}

impl AppConfig {
    /// Reads `config_path`; `DATABASE_URL` in the environment overrides
    /// `metadata_database_url`.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, std::env::var("DATABASE_URL").ok())
    }

    pub fn from_raw(raw: RawJsonConfig, database_url_override: Option<String>) -> Result<Self> {
        let metadata_database_url = database_url_override
            .filter(|s| !s.trim().is_empty())
            .or(raw.metadata_database_url.clone())
            .context("metadata_database_url must be set in config.json or DATABASE_URL")?;
        let parsed = Url::parse(&metadata_database_url)
            .context("metadata_database_url is not a valid URL")?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            anyhow::bail!(
                "metadata_database_url must be a postgres:// URL, got scheme '{}'",
                parsed.scheme()
            );
        }

        let work_dir = raw
            .work_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
        if work_dir.to_string_lossy().is_empty() {
            anyhow::bail!("work_dir cannot be empty in config.json.");
        }

        let worker_count = positive("worker_count", raw.worker_count, DEFAULT_WORKER_COUNT)?;
        let queue_capacity = positive("queue_capacity", raw.queue_capacity, DEFAULT_QUEUE_CAPACITY)?;
        let session_sweep_secs = positive(
            "session_sweep_interval_secs",
            raw.session_sweep_interval_secs,
            DEFAULT_SESSION_SWEEP_SECS,
        )?;
        let backup_sweep_secs = positive(
            "backup_sweep_interval_secs",
            raw.backup_sweep_interval_secs,
            DEFAULT_BACKUP_SWEEP_SECS,
        )?;
        let retention_days = raw.backup_retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        if retention_days <= 0 {
            anyhow::bail!("backup_retention_days must be positive, got {}", retention_days);
        }

        let tool_timeout = match raw.tool_timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let mut warnings = Vec::new();
        let spaces = raw
            .s3_storage
            .as_ref()
            .and_then(|s3_raw| spaces_config_from_raw(s3_raw, &mut warnings));
        let storage = match spaces {
            Some(spaces) => {
                if raw.storage.as_ref().is_some_and(|s| s.local_dir.is_some()) {
                    warnings.push(
                        "Both s3_storage and storage.local_dir are configured; using S3.".to_string(),
                    );
                }
                StorageConfig::S3(spaces)
            }
            None => StorageConfig::Local(
                raw.storage
                    .as_ref()
                    .and_then(|s| s.local_dir.clone())
                    .unwrap_or_else(|| work_dir.join("storage")),
            ),
        };

        Ok(AppConfig {
            metadata_database_url,
            max_db_connections: positive(
                "max_db_connections",
                raw.max_db_connections,
                DEFAULT_MAX_DB_CONNECTIONS,
            )?,
            work_dir,
            worker_count,
            queue_capacity,
            tool_timeout,
            session_sweep_interval: Duration::from_secs(session_sweep_secs),
            backup_sweep_interval: Duration::from_secs(backup_sweep_secs),
            backup_retention: chrono::Duration::days(retention_days),
            audit_completion: raw.audit_completion.unwrap_or(false),
            credentials_key: raw.credentials_key.clone().filter(|k| !k.is_empty()),
            storage,
            log_level: raw.log_level.clone().unwrap_or_else(|| "info".to_string()),
            warnings,
        })
    }
}

fn positive<T>(key: &str, value: Option<T>, default: T) -> Result<T>
where
    T: PartialEq + Default,
{
    let value = value.unwrap_or(default);
    if value == T::default() {
        anyhow::bail!("{} must be greater than zero in config.json.", key);
    }
    Ok(value)
}

/// Returns a complete S3 configuration, or `None` (with a warning when some
/// but not all required fields were given).
fn spaces_config_from_raw(
    s3_raw: &JsonS3StorageConfig,
    warnings: &mut Vec<String>,
) -> Option<SpacesConfig> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()), // Ensure not empty
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(SpacesConfig {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
        })
    } else {
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn if some S3 fields were provided but were incomplete/empty
            warnings.push("S3 configuration is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty. Falling back to local storage.".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(
            raw(json!({ "metadata_database_url": "postgres://backup@localhost/backupd" })),
            None,
        )?;

        assert_eq!(config.work_dir, PathBuf::from("./databasebackup"));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.tool_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.session_sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.backup_sweep_interval, Duration::from_secs(86400));
        assert_eq!(config.backup_retention, chrono::Duration::days(365));
        assert!(!config.audit_completion);
        assert_eq!(config.credentials_key, None);
        assert_eq!(config.log_level, "info");
        assert!(config.warnings.is_empty());
        match config.storage {
            StorageConfig::Local(dir) => assert_eq!(dir, PathBuf::from("./databasebackup/storage")),
            other => panic!("expected local storage, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_database_url_override_wins() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(
            raw(json!({ "metadata_database_url": "postgres://file/db" })),
            Some("postgresql://env/db".to_string()),
        )?;
        assert_eq!(config.metadata_database_url, "postgresql://env/db");

        let config = AppConfig::from_raw(RawJsonConfig::default(), Some("postgres://env/db".to_string()))?;
        assert_eq!(config.metadata_database_url, "postgres://env/db");
        Ok(())
    }

    #[test]
    fn test_missing_or_foreign_database_url_is_rejected() {
        assert!(AppConfig::from_raw(RawJsonConfig::default(), None).is_err());
        assert!(AppConfig::from_raw(
            raw(json!({ "metadata_database_url": "mysql://root@localhost/app" })),
            None
        )
        .is_err());
    }

    #[test]
    fn test_complete_s3_block_selects_s3_storage() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(
            raw(json!({
                "metadata_database_url": "postgres://localhost/backupd",
                "s3_storage": {
                    "bucket_name": "backups",
                    "region": "fra1",
                    "access_key_id": "key",
                    "secret_access_key": "secret",
                    "endpoint_url": "https://fra1.digitaloceanspaces.com",
                    "folder_prefix": ""
                }
            })),
            None,
        )?;
        match config.storage {
            StorageConfig::S3(spaces) => {
                assert_eq!(spaces.bucket_name, "backups");
                assert_eq!(spaces.folder_prefix, None);
            }
            other => panic!("expected S3 storage, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_s3_and_local_dir_together_warn() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(
            raw(json!({
                "metadata_database_url": "postgres://localhost/backupd",
                "credentials_key": "master",
                "storage": { "local_dir": "/var/lib/backupd" },
                "s3_storage": {
                    "bucket_name": "backups",
                    "region": "fra1",
                    "access_key_id": "key",
                    "secret_access_key": "secret",
                    "endpoint_url": "https://fra1.digitaloceanspaces.com"
                }
            })),
            None,
        )?;
        assert!(matches!(config.storage, StorageConfig::S3(_)));
        assert_eq!(config.credentials_key.as_deref(), Some("master"));
        assert_eq!(config.warnings, vec!["Both s3_storage and storage.local_dir are configured; using S3.".to_string()]);
        Ok(())
    }

    #[test]
    fn test_incomplete_s3_block_falls_back_to_local_dir() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(
            raw(json!({
                "metadata_database_url": "postgres://localhost/backupd",
                "storage": { "local_dir": "/var/lib/backupd" },
                "s3_storage": { "bucket_name": "backups", "region": "" }
            })),
            None,
        )?;
        assert!(matches!(config.storage, StorageConfig::Local(ref dir) if dir == Path::new("/var/lib/backupd")));
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains("Falling back to local storage"));
        Ok(())
    }

    #[test]
    fn test_zero_timeout_disables_deadline_but_zero_workers_fails() {
        let config = AppConfig::from_raw(
            raw(json!({ "metadata_database_url": "postgres://h/d", "tool_timeout_secs": 0 })),
            None,
        )
        .unwrap();
        assert_eq!(config.tool_timeout, None);

        for key in ["worker_count", "queue_capacity", "session_sweep_interval_secs", "backup_retention_days"] {
            let mut value = json!({ "metadata_database_url": "postgres://h/d" });
            value[key] = json!(0);
            assert!(AppConfig::from_raw(raw(value), None).is_err(), "{key} = 0 accepted");
        }
    }

    #[test]
    fn test_load_from_json_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "metadata_database_url": "postgres://localhost/backupd", "worker_count": 2, "audit_completion": true }"#,
        )?;

        let config = AppConfig::load_from_json(&path)?;
        assert_eq!(config.worker_count, 2);
        assert!(config.audit_completion);

        std::fs::write(&path, "{ not json")?;
        assert!(AppConfig::load_from_json(&path).is_err());
        Ok(())
    }
}
