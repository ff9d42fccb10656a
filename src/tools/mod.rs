//! Command-line client tools behind the dump and restore executors.
//!
//! Each [`Engine`] maps to one [`EngineStrategy`] that knows the tool names
//! and argument shape for that engine. Passwords are handed over through the
//! environment, never on the command line.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::{AppError, Result};
use crate::models::{DatabaseConnection, Engine};
use crate::utils::find_executable;

/// One external tool call, before the executable is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: &'static str,
    pub args: Vec<OsString>,
    pub env: Vec<(&'static str, String)>,
}

pub trait EngineStrategy: Send + Sync {
    /// Writes a plain SQL dump of the connection's database to `output_file`.
    fn dump(&self, connection: &DatabaseConnection, output_file: &Path) -> ToolInvocation;

    /// Applies SQL read from standard input to the connection's database.
    fn restore(&self, connection: &DatabaseConnection) -> ToolInvocation;
}

pub struct MySqlStrategy;

impl EngineStrategy for MySqlStrategy {
    fn dump(&self, connection: &DatabaseConnection, output_file: &Path) -> ToolInvocation {
        let mut result_file = OsString::from("--result-file=");
        result_file.push(output_file.as_os_str());
        ToolInvocation {
            program: "mysqldump",
            args: vec![
                "-u".into(),
                connection.username.clone().into(),
                "-h".into(),
                connection.host.clone().into(),
                "-P".into(),
                connection.port.to_string().into(),
                "--single-transaction".into(),
                "--routines".into(),
                "--triggers".into(),
                result_file,
                connection.db_name.clone().into(),
            ],
            env: vec![("MYSQL_PWD", connection.password.clone())],
        }
    }

    fn restore(&self, connection: &DatabaseConnection) -> ToolInvocation {
        ToolInvocation {
            program: "mysql",
            args: vec![
                "-u".into(),
                connection.username.clone().into(),
                "-h".into(),
                connection.host.clone().into(),
                "-P".into(),
                connection.port.to_string().into(),
                connection.db_name.clone().into(),
            ],
            env: vec![("MYSQL_PWD", connection.password.clone())],
        }
    }
}

pub struct PostgresStrategy;

impl EngineStrategy for PostgresStrategy {
    fn dump(&self, connection: &DatabaseConnection, output_file: &Path) -> ToolInvocation {
        ToolInvocation {
            program: "pg_dump",
            args: vec![
                "-h".into(),
                connection.host.clone().into(),
                "-p".into(),
                connection.port.to_string().into(),
                "-U".into(),
                connection.username.clone().into(),
                "-d".into(),
                connection.db_name.clone().into(),
                "--no-password".into(),
                "--clean".into(),
                "--if-exists".into(),
                "--no-acl".into(),
                "--no-owner".into(),
                "-f".into(),
                output_file.as_os_str().to_owned(),
            ],
            env: vec![("PGPASSWORD", connection.password.clone())],
        }
    }

    fn restore(&self, connection: &DatabaseConnection) -> ToolInvocation {
        ToolInvocation {
            program: "psql",
            args: vec![
                "-X".into(), // Do not read psqlrc
                "-q".into(),
                "-v".into(),
                "ON_ERROR_STOP=1".into(),
                "-h".into(),
                connection.host.clone().into(),
                "-p".into(),
                connection.port.to_string().into(),
                "-U".into(),
                connection.username.clone().into(),
                "-d".into(),
                connection.db_name.clone().into(),
            ],
            env: vec![("PGPASSWORD", connection.password.clone())],
        }
    }
}

pub fn strategy_for(engine: Engine) -> &'static dyn EngineStrategy {
    match engine {
        Engine::MySql => &MySqlStrategy,
        Engine::PostgreSql => &PostgresStrategy,
    }
}

/// Runs dump/restore client tools found in PATH, with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CliTools {
    timeout: Option<Duration>,
}

impl CliTools {
    pub fn new(timeout: Option<Duration>) -> Self {
        CliTools { timeout }
    }

    pub async fn run(&self, invocation: ToolInvocation, stdin: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let executable = find_executable(invocation.program)?;
        debug!(tool = invocation.program, "Using {}", executable.display());
        run_command(
            invocation.program,
            Command::new(executable)
                .args(&invocation.args)
                .envs(invocation.env.iter().map(|(k, v)| (*k, v.as_str()))),
            stdin,
            self.timeout,
        )
        .await
    }
}

/// Spawns `command`, feeds `stdin` to it, and returns its stdout.
///
/// A non-zero exit becomes `ExternalTool` carrying stderr; exceeding `timeout`
/// kills the child and returns `ToolTimeout`.
pub async fn run_command(
    tool: &str,
    command: &mut Command,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let launch_error = |e: std::io::Error| AppError::ExternalTool {
        tool: tool.to_string(),
        status: "launch failed".to_string(),
        stderr: e.to_string(),
    };

    let mut child = command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(launch_error)?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let tool_name = tool.to_string();
        tokio::spawn(async move {
            // The tool may exit before reading everything; its exit status tells the story.
            if let Err(e) = pipe.write_all(&input).await {
                warn!(tool = %tool_name, "Failed to write to standard input: {}", e);
            }
        });
    }

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| AppError::ToolTimeout {
                tool: tool.to_string(),
                secs: limit.as_secs(),
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(launch_error)?;

    if !output.status.success() {
        return Err(AppError::ExternalTool {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn connection(engine: Engine) -> DatabaseConnection {
        DatabaseConnection {
            id: 1,
            user_id: 1,
            name: "app".to_string(),
            engine: engine.as_str().to_string(),
            host: "db.internal".to_string(),
            port: engine.default_port(),
            username: "backup".to_string(),
            password: "hunter2".to_string(),
            db_name: "app".to_string(),
        }
    }

    fn args_contain_password(invocation: &ToolInvocation) -> bool {
        invocation
            .args
            .iter()
            .any(|a| a.to_string_lossy().contains("hunter2"))
    }

    #[test]
    fn postgres_dump_writes_plain_sql_to_the_output_file() {
        let out = PathBuf::from("/work/app.sql");
        let inv = strategy_for(Engine::PostgreSql).dump(&connection(Engine::PostgreSql), &out);
        assert_eq!(inv.program, "pg_dump");
        assert!(inv.args.windows(2).any(|w| w[0] == "-f" && w[1] == "/work/app.sql"));
        assert!(inv.args.iter().any(|a| a == "--if-exists"));
        assert_eq!(inv.env, vec![("PGPASSWORD", "hunter2".to_string())]);
        assert!(!args_contain_password(&inv));
    }

    #[test]
    fn mysql_dump_uses_result_file_and_env_password() {
        let out = PathBuf::from("/work/shop.sql");
        let inv = strategy_for(Engine::MySql).dump(&connection(Engine::MySql), &out);
        assert_eq!(inv.program, "mysqldump");
        assert!(inv.args.iter().any(|a| a == "--result-file=/work/shop.sql"));
        assert_eq!(inv.args.last().map(|a| a.as_os_str()), Some(std::ffi::OsStr::new("app")));
        assert_eq!(inv.env, vec![("MYSQL_PWD", "hunter2".to_string())]);
        assert!(!args_contain_password(&inv));
    }

    #[test]
    fn restore_tools_match_the_engine() {
        assert_eq!(strategy_for(Engine::MySql).restore(&connection(Engine::MySql)).program, "mysql");
        let psql = strategy_for(Engine::PostgreSql).restore(&connection(Engine::PostgreSql));
        assert_eq!(psql.program, "psql");
        assert!(psql.args.iter().any(|a| a == "ON_ERROR_STOP=1"));
        assert!(!args_contain_password(&psql));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_command_feeds_stdin_and_returns_stdout() -> anyhow::Result<()> {
        let out = run_command(
            "cat",
            &mut Command::new("cat"),
            Some(b"SELECT 1;".to_vec()),
            Some(Duration::from_secs(5)),
        )
        .await?;
        assert_eq!(out, b"SELECT 1;");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = run_command(
            "sh",
            Command::new("sh").args(["-c", "echo 'relation does not exist' >&2; exit 3"]),
            None,
            None,
        )
        .await
        .unwrap_err();
        match err {
            AppError::ExternalTool { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "relation does not exist");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_tool_is_killed_at_the_deadline() {
        let err = run_command(
            "sleep",
            Command::new("sleep").arg("30"),
            None,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ToolTimeout { ref tool, .. } if tool == "sleep"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let err = run_command(
            "nope",
            &mut Command::new("/nonexistent/bin/dump-tool"),
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ExternalTool { ref status, .. } if status == "launch failed"));
    }
}
