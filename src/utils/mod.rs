use std::path::PathBuf;
use which::which;

use crate::errors::{AppError, Result};

/// Ownership predicate applied by every scheduler and pipeline entry point.
pub fn is_owner(resource_owner_id: i64, requester_id: i64) -> bool {
    resource_owner_id == requester_id
}

pub fn ensure_owner(
    resource: &'static str,
    resource_id: i64,
    resource_owner_id: i64,
    requester_id: i64,
) -> Result<()> {
    if is_owner(resource_owner_id, requester_id) {
        Ok(())
    } else {
        Err(AppError::forbidden(resource, resource_id))
    }
}

/// Finds a client tool executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| AppError::ExternalTool {
        tool: name.to_string(),
        status: "not found".to_string(),
        stderr: format!(
            "{} executable not found in PATH ({}). Please ensure the database client tools are installed and in your PATH.",
            name, e
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_owner_rejects_other_users() {
        assert!(ensure_owner("backup", 3, 10, 10).is_ok());
        let err = ensure_owner("backup", 3, 10, 11).unwrap_err();
        assert!(matches!(err, AppError::Forbidden { resource: "backup", id: 3 }));
    }

    #[test]
    fn missing_executable_is_an_external_tool_error() {
        let err = find_executable("definitely-not-a-real-dump-tool").unwrap_err();
        assert!(matches!(err, AppError::ExternalTool { ref tool, .. } if tool == "definitely-not-a-real-dump-tool"));
    }
}
