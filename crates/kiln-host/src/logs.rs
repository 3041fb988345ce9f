//! Log egress: reclaiming per-execution log files.
//!
//! Workers for egress-enabled entries run with stdout/stderr redirected
//! to `<log_dir>/<execution_token>.log`. After a response (or a worker
//! loss) the dispatcher reads the file and unlinks it in the same step,
//! so a crashed host never leaks an unbounded log directory.

use std::path::{Path, PathBuf};

use kiln_core::ExecutionToken;

/// Path of the log file for one worker's execution token.
#[must_use]
pub fn log_file_path(log_dir: &Path, token: &ExecutionToken) -> PathBuf {
    log_dir.join(format!("{token}.log"))
}

/// Reads and removes the log file for `token`.
///
/// Returns `None` when no file exists, which the dispatcher maps to an
/// empty log blob (the worker wrote nothing before finishing).
pub async fn read_and_reclaim(log_dir: &Path, token: &ExecutionToken) -> Option<String> {
    let path = log_file_path(log_dir, token);
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read log file");
            return None;
        }
    };
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to reclaim log file");
    }
    Some(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let token = ExecutionToken::generate();
        let path = log_file_path(dir.path(), &token);
        tokio::fs::write(&path, "A").await.unwrap();

        assert_eq!(
            read_and_reclaim(dir.path(), &token).await,
            Some("A".to_owned())
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let token = ExecutionToken::generate();
        assert_eq!(read_and_reclaim(dir.path(), &token).await, None);
    }
}
