//! Host bridge (C1): serialises shell commands onto a bounded pool of named
//! FIFOs shared with the host. A watcher process on the host side reads each
//! FIFO, runs the command, and writes three result files back into the same
//! directory: `<id>_stdout`, `<id>_stderr`, `<id>_ret`.

use crate::error::{ControllerError, ControllerResult};
use parking_lot::Mutex;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_STEP: Duration = Duration::from_millis(500);

/// Result of one host-bridge call: exit code (`-1` on transient failure)
/// and the selected body (stdout on success, stderr otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub body: String,
}

impl ExecResult {
    pub fn transient_failure() -> Self {
        Self { exit_code: -1, body: String::new() }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

fn pipe_name_pattern() -> &'static Regex {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^host-pipe-xbatctld-\d+$").expect("valid regex"))
}

fn stale_result_pattern() -> &'static Regex {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}_(stdout|stderr|ret)$",
        )
        .expect("valid regex")
    })
}

/// Bounded pool of FIFO handles, guarded by a counting semaphore plus a
/// thread-safe free-list, mirroring the pipe pool in the original system
/// (a bounded semaphore + a lock-guarded stack of file descriptors).
pub struct PipePool {
    directory: PathBuf,
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<PathBuf>>>,
    poll_retries: u32,
}

impl PipePool {
    /// Discovers FIFOs under `directory` matching
    /// `^host-pipe-xbatctld-\d+$`, sweeps stale result files, and returns a
    /// pool sized to the number discovered.
    pub fn discover(directory: impl Into<PathBuf>, poll_retries: u32) -> ControllerResult<Self> {
        let directory = directory.into();
        let mut pipes = Vec::new();
        if directory.is_dir() {
            for entry in std::fs::read_dir(&directory)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if pipe_name_pattern().is_match(&name) {
                    pipes.push(entry.path());
                }
            }
        }
        pipes.sort();
        let pool_size = pipes.len().max(1);

        let pool = Self {
            directory: directory.clone(),
            semaphore: Arc::new(Semaphore::new(pool_size)),
            free: Arc::new(Mutex::new(pipes)),
            poll_retries,
        };
        pool.clear_run_files()?;
        Ok(pool)
    }

    /// Sweeps stale `<uuid>_{stdout,stderr,ret}` files left behind by a
    /// prior controller instance.
    pub fn clear_run_files(&self) -> ControllerResult<()> {
        if !self.directory.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if stale_result_pattern().is_match(&name) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Executes `cmdline` on the host and returns the result. Bounded by
    /// `acquire_timeout`; a timed-out acquisition returns a transient
    /// failure rather than blocking forever, and never leaks a pipe slot.
    #[tracing::instrument(skip(self, cmdline), fields(correlation_id = tracing::field::Empty))]
    pub async fn execute(&self, cmdline: &str, acquire_timeout: Duration) -> ExecResult {
        let permit = match tokio::time::timeout(acquire_timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return ExecResult::transient_failure(),
        };

        let pipe = {
            let mut free = self.free.lock();
            free.pop()
        };
        let Some(pipe) = pipe else {
            drop(permit);
            return ExecResult::transient_failure();
        };

        let id = Uuid::new_v4();
        tracing::Span::current().record("correlation_id", tracing::field::display(id));
        let directory = self.directory.clone();
        let cmdline = cmdline.to_string();
        let poll_retries = self.poll_retries;
        let pipe_for_task = pipe.clone();

        let result = tokio::task::spawn_blocking(move || {
            run_on_pipe(&directory, &pipe_for_task, id, &cmdline, poll_retries)
        })
        .await
        .unwrap_or_else(|_| ExecResult::transient_failure());

        {
            let mut free = self.free.lock();
            free.push(pipe);
        }
        drop(permit);
        result
    }
}

fn run_on_pipe(
    directory: &Path,
    pipe: &Path,
    id: Uuid,
    cmdline: &str,
    poll_retries: u32,
) -> ExecResult {
    use std::fs::OpenOptions;
    use std::io::Write;

    let stdout_path = directory.join(format!("{id}_stdout"));
    let stderr_path = directory.join(format!("{id}_stderr"));
    let ret_path = directory.join(format!("{id}_ret"));

    let write_result = OpenOptions::new()
        .write(true)
        .open(pipe)
        .and_then(|mut f| writeln!(f, "{id};{cmdline}"));

    let result = if write_result.is_err() {
        ExecResult::transient_failure()
    } else {
        poll_for_result(&stdout_path, &stderr_path, &ret_path, poll_retries)
    };

    let _ = std::fs::remove_file(&stdout_path);
    let _ = std::fs::remove_file(&stderr_path);
    let _ = std::fs::remove_file(&ret_path);

    result
}

fn poll_for_result(
    stdout_path: &Path,
    stderr_path: &Path,
    ret_path: &Path,
    retries: u32,
) -> ExecResult {
    std::thread::sleep(POLL_INITIAL);
    for _ in 0..retries {
        if let Ok(contents) = std::fs::read_to_string(ret_path) {
            let exit_code: i32 = contents.trim().parse().unwrap_or(-1);
            let body_path = if exit_code == 0 { stdout_path } else { stderr_path };
            let body = std::fs::read_to_string(body_path).unwrap_or_default();
            return ExecResult { exit_code, body };
        }
        std::thread::sleep(POLL_STEP);
    }
    ExecResult::transient_failure()
}

impl From<&ExecResult> for ControllerResult<()> {
    fn from(result: &ExecResult) -> Self {
        if result.is_success() {
            Ok(())
        } else {
            Err(ControllerError::HostBridge(result.body.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_pattern_matches_expected_names() {
        assert!(pipe_name_pattern().is_match("host-pipe-xbatctld-0"));
        assert!(pipe_name_pattern().is_match("host-pipe-xbatctld-12"));
        assert!(!pipe_name_pattern().is_match("host-pipe-other-0"));
    }

    #[test]
    fn stale_pattern_matches_uuid_result_files() {
        let name = format!("{}_stdout", Uuid::new_v4());
        assert!(stale_result_pattern().is_match(&name));
        assert!(!stale_result_pattern().is_match("not-a-uuid_stdout"));
    }

    #[tokio::test]
    async fn discover_with_no_pipes_still_builds_pool_of_size_one() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PipePool::discover(dir.path(), 1).unwrap();
        let result = pool.execute("true", Duration::from_millis(50)).await;
        // No real pipe backs this call in the test environment, so the
        // exchange times out and must fail transiently rather than hang.
        assert_eq!(result.exit_code, -1);
    }
}
