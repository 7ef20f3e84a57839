//! Local process runner
//!
//! Wraps one OS subprocess. Output is exposed as two independent line
//! streams that are read while the process runs, which is what makes
//! `tail -f` style commands usable at all.

use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::codec::FramedRead;

use ops_protocol::LineCodec;

/// Lazy, single-pass stream of output lines
pub type LineStream<R> = FramedRead<R, LineCodec>;

/// The process could not be started
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Executable does not exist or is not on `PATH`
    #[error("Executable not found: {program}")]
    NotFound { program: String },

    /// Any other launch failure (permissions, resource limits)
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// The process ended abnormally
#[derive(Debug, Error)]
pub enum ExitError {
    /// Terminated without an exit code (signal)
    #[error("{program} terminated abnormally ({status})")]
    Abnormal { program: String, status: ExitStatus },

    /// Waiting on the process failed
    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExitError {
    /// Exit status to report to the remote side, shell style
    pub fn exit_code(&self) -> u32 {
        match self {
            ExitError::Abnormal { status, .. } => signal_of(status)
                .map(|signal| 128 + signal as u32)
                .unwrap_or(1),
            ExitError::Wait { .. } => 1,
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Builder for a process invocation
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessRunner {
    /// Run `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append arguments
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Spawn the process with piped stdout/stderr
    pub fn start(self) -> Result<RunningProcess, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A dropped session must never leak its process
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SpawnError::NotFound {
                    program: self.program.clone(),
                }
            } else {
                SpawnError::Launch {
                    program: self.program.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id();
        tracing::debug!("Spawned {} {:?} (pid {:?})", self.program, self.args, pid);

        let stdout = child
            .stdout
            .take()
            .map(|out| FramedRead::new(out, LineCodec::new()));
        let stderr = child
            .stderr
            .take()
            .map(|err| FramedRead::new(err, LineCodec::new()));

        Ok(RunningProcess {
            program: self.program,
            pid,
            child,
            stdout,
            stderr,
            exit: None,
            kill_sent: false,
        })
    }
}

/// A spawned process
pub struct RunningProcess {
    program: String,
    pid: Option<u32>,
    child: Child,
    stdout: Option<LineStream<ChildStdout>>,
    stderr: Option<LineStream<ChildStderr>>,
    /// Exit status once reaped
    exit: Option<ExitStatus>,
    kill_sent: bool,
}

impl RunningProcess {
    /// Program name
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the stdout line stream (once)
    pub fn take_stdout(&mut self) -> Option<LineStream<ChildStdout>> {
        self.stdout.take()
    }

    /// Take the stderr line stream (once)
    pub fn take_stderr(&mut self) -> Option<LineStream<ChildStderr>> {
        self.stderr.take()
    }

    /// Request termination. No-op after exit or a previous kill.
    pub fn kill(&mut self) {
        if self.exit.is_some() || self.kill_sent {
            return;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("try_wait on {} failed: {}", self.program, e),
        }

        match self.child.start_kill() {
            Ok(()) => {
                self.kill_sent = true;
                tracing::debug!("Sent kill to {} (pid {:?})", self.program, self.pid);
            }
            Err(e) => {
                tracing::debug!("Kill of {} was a no-op: {}", self.program, e);
            }
        }
    }

    /// Wait for the process to exit
    ///
    /// A non-zero exit code is a normal exit; only termination without
    /// an exit code is an `ExitError`.
    pub async fn wait(&mut self) -> Result<ExitStatus, ExitError> {
        let status = match self.exit {
            Some(status) => status,
            None => {
                let status = self.child.wait().await.map_err(|source| ExitError::Wait {
                    program: self.program.clone(),
                    source,
                })?;
                self.exit = Some(status);
                status
            }
        };

        if status.code().is_some() {
            Ok(status)
        } else {
            Err(ExitError::Abnormal {
                program: self.program.clone(),
                status,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str) -> ProcessRunner {
        ProcessRunner::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_streams_lines_in_order() {
        let mut process = sh("printf 'L1\\nL2\\nL3\\n'; printf 'E1\\n' >&2")
            .start()
            .unwrap();

        let stdout: Vec<String> = process
            .take_stdout()
            .unwrap()
            .map(|line| line.unwrap())
            .collect()
            .await;
        let stderr: Vec<String> = process
            .take_stderr()
            .unwrap()
            .map(|line| line.unwrap())
            .collect()
            .await;

        assert_eq!(stdout, vec!["L1", "L2", "L3"]);
        assert_eq!(stderr, vec!["E1"]);
        assert!(process.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_partial_last_line_is_yielded() {
        let mut process = sh("printf 'done\\nno newline'").start().unwrap();

        let stdout: Vec<String> = process
            .take_stdout()
            .unwrap()
            .map(|line| line.unwrap())
            .collect()
            .await;

        assert_eq!(stdout, vec!["done", "no newline"]);
    }

    #[tokio::test]
    async fn test_lines_arrive_before_exit() {
        let mut process = sh("echo first; sleep 30").start().unwrap();
        let mut stdout = process.take_stdout().unwrap();

        let first = timeout(Duration::from_secs(5), stdout.next())
            .await
            .expect("line should stream while the process runs")
            .unwrap()
            .unwrap();
        assert_eq!(first, "first");

        process.kill();
        assert!(process.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let result = ProcessRunner::new("/nonexistent/ops-agent-test-binary").start();
        assert!(matches!(result, Err(SpawnError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let mut process = sh("exit 3").start().unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_kill_terminates_running_process() {
        let mut process = ProcessRunner::new("sleep").args(["30"]).start().unwrap();
        assert!(process.pid().is_some());

        process.kill();
        let result = timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("killed process should be reaped promptly");

        let err = result.unwrap_err();
        assert_eq!(err.exit_code(), 128 + 9);
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let mut process = sh("true").start().unwrap();
        assert!(process.wait().await.unwrap().success());

        // Neither call may error or hang
        process.kill();
        process.kill();
        let status = timeout(Duration::from_secs(1), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let mut process = sh("echo $TERM").env("TERM", "xterm-256color").start().unwrap();
        let line = process.take_stdout().unwrap().next().await.unwrap().unwrap();
        assert_eq!(line, "xterm-256color");
    }
}
