//! Blocking helper execution with a deadline.
//!
//! stdout and stderr are redirected into files inside the call scope rather
//! than pipes, so a chatty helper can never block on a full pipe while we
//! wait for it to exit.

use crate::manifest::HelperCommand;
use crate::scratch::CallScope;
use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_STDOUT_BYTES: u64 = 1024 * 1024;
const STDERR_EXCERPT_BYTES: u64 = 2048;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start helper {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("helper {program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("helper {program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("helper output exceeds {} bytes", MAX_STDOUT_BYTES)]
    OutputTooLarge,
    #[error("unusable helper output: {0}")]
    Output(String),
    #[error("input rejected: {0}")]
    Input(String),
    #[error("scratch I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Kills and reaps the child if it is still running when dropped.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Run `command` with `extra_args` appended, inside `scope`, and return its stdout.
///
/// Fails on spawn error, on timeout (the child is killed), on non-zero or
/// signal exit, and on oversized output.
pub fn run_helper<S: AsRef<OsStr>>(
    command: &HelperCommand,
    extra_args: &[S],
    scope: &CallScope,
    timeout: Duration,
) -> Result<Vec<u8>, BridgeError> {
    let (stdout_path, stdout_file) = scope.create("stdout")?;
    let (stderr_path, stderr_file) = scope.create("stderr")?;

    let child = Command::new(&command.program)
        .args(&command.args)
        .args(extra_args)
        .current_dir(scope.path())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .map_err(|source| BridgeError::Spawn {
            program: command.program.clone(),
            source,
        })?;
    let mut guard = ChildGuard {
        child,
        reaped: false,
    };

    let started = Instant::now();
    let status = loop {
        if let Some(status) = guard.child.try_wait()? {
            guard.reaped = true;
            break status;
        }
        if started.elapsed() >= timeout {
            return Err(BridgeError::TimedOut {
                program: command.program.clone(),
                timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    tracing::debug!(
        program = %command.program,
        ?status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "helper exited"
    );

    if !status.success() {
        return Err(BridgeError::Exit {
            program: command.program.clone(),
            status,
            stderr: read_excerpt(&stderr_path),
        });
    }

    let file = std::fs::File::open(&stdout_path)?;
    let mut stdout = Vec::new();
    file.take(MAX_STDOUT_BYTES + 1).read_to_end(&mut stdout)?;
    if stdout.len() as u64 > MAX_STDOUT_BYTES {
        return Err(BridgeError::OutputTooLarge);
    }
    Ok(stdout)
}

fn read_excerpt(path: &std::path::Path) -> String {
    let mut buf = Vec::new();
    if let Ok(file) = std::fs::File::open(path) {
        let _ = file.take(STDERR_EXCERPT_BYTES).read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::scratch::ScratchRoot;
    use std::path::Path;
    use tempfile::TempDir;

    /// A helper that runs `body` under `sh`. The script is passed as an
    /// argument instead of being executed directly, which avoids ETXTBSY
    /// races with other tests forking while the file is open for writing.
    pub(crate) fn sh_helper(dir: &Path, name: &str, body: &str) -> HelperCommand {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        HelperCommand {
            program: "sh".into(),
            args: vec![path.display().to_string()],
        }
    }

    fn setup() -> (TempDir, ScratchRoot) {
        let tmp = TempDir::new().unwrap();
        let root = ScratchRoot::new(tmp.path().join("scratch")).unwrap();
        (tmp, root)
    }

    #[test]
    fn test_captures_stdout_and_args() {
        let (tmp, root) = setup();
        let cmd = sh_helper(tmp.path(), "echo.sh", r#"printf '%s|%s' "$1" "$2""#);
        let scope = root.scope("t").unwrap();
        let out = run_helper(&cmd, &["a", "b"], &scope, Duration::from_secs(5)).unwrap();
        assert_eq!(out, b"a|b");
    }

    #[test]
    fn test_nonzero_exit_carries_stderr() {
        let (tmp, root) = setup();
        let cmd = sh_helper(tmp.path(), "fail.sh", "echo 'no face' >&2; exit 1");
        let scope = root.scope("t").unwrap();
        match run_helper::<&str>(&cmd, &[], &scope, Duration::from_secs(5)) {
            Err(BridgeError::Exit { stderr, status, .. }) => {
                assert_eq!(stderr, "no face");
                assert_eq!(status.code(), Some(1));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        let (tmp, root) = setup();
        let cmd = sh_helper(tmp.path(), "slow.sh", "exec sleep 10");
        let scope = root.scope("t").unwrap();
        let started = Instant::now();
        let err = run_helper::<&str>(&cmd, &[], &scope, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, BridgeError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program() {
        let (_tmp, root) = setup();
        let cmd = HelperCommand {
            program: "/nonexistent/recall-helper".into(),
            args: vec![],
        };
        let scope = root.scope("t").unwrap();
        let err = run_helper::<&str>(&cmd, &[], &scope, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }
}
