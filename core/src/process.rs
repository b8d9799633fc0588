//! # Process Capabilities
//!
//! Two seams to the outside world:
//!
//! - [`ProcessRunner`] runs a program to completion (`init`,
//!   `unsafe-reset-all`, `version`, node CLI queries and transactions).
//! - [`ProcessSupervisor`] answers whether the node is up, under which PID,
//!   and for how long.
//!
//! [`SystemRunner`] and [`PidFileSupervisor`] are the production
//! implementations. Tests substitute their own runners.

use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus, Signal, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HomeLayout;
use crate::error::{Error, ErrorCode, Result};
use crate::fsutil::{create_dir_all_mode, remove_file_if_exists, write_atomic};

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `program` to completion, discarding its output.
    async fn run(&self, program: &str, args: &[String]) -> Result<()>;

    /// Runs `program` to completion and returns its stdout.
    async fn output(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs real subprocesses with an optional wall-clock limit.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    async fn exec(&self, program: &str, args: &[String], capture: bool) -> Result<std::process::Output> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(if capture { Stdio::piped() } else { Stdio::null() })
            .stderr(if capture { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        debug!(program, ?args, "running subprocess");

        let child = cmd.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| Error::process(format!("{program} timed out after {limit:?}")))?,
            None => child.await,
        }
        .map_err(|e| Error::wrap(ErrorCode::ProcessError, format!("failed to start {program}"), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(Error::process(if detail.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                format!("{program} exited with {}: {detail}", output.status)
            }));
        }
        Ok(output)
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        self.exec(program, args, false).await.map(|_| ())
    }

    async fn output(&self, program: &str, args: &[String]) -> Result<String> {
        let output = self.exec(program, args, true).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub trait ProcessSupervisor: Send + Sync {
    fn is_running(&self) -> bool;
    fn pid(&self) -> Option<u32>;
    fn uptime(&self) -> Option<Duration>;
}

/// Tracks the node through `<home>/node.pid`. Starts it detached with output
/// appended to `<home>/logs/node.log`.
pub struct PidFileSupervisor {
    layout: HomeLayout,
    binary: String,
    args: Vec<String>,
    system: Mutex<System>,
}

impl std::fmt::Debug for PidFileSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFileSupervisor")
            .field("home", &self.layout.root())
            .field("binary", &self.binary)
            .field("args", &self.args)
            .finish()
    }
}

impl PidFileSupervisor {
    /// Supervises `<binary> start --home <home>`.
    pub fn new(home: &Path, binary: &str) -> Self {
        let args = vec![
            "start".to_string(),
            "--home".to_string(),
            home.display().to_string(),
        ];
        Self {
            layout: HomeLayout::new(home),
            binary: binary.to_string(),
            args,
            system: Mutex::new(System::new()),
        }
    }

    /// Replaces the arguments passed to the node binary on start.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn recorded_pid(&self) -> Option<u32> {
        fs::read_to_string(self.layout.pid_file())
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Runs `f` against the live process, refreshing it first. Zombies count
    /// as gone.
    fn with_process<T>(&self, pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return None;
        }
        let process = system.process(pid)?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }
        Some(f(process))
    }

    /// Starts the node unless it is already running. Returns its PID.
    pub fn start(&self) -> Result<u32> {
        if let Some(pid) = self.pid() {
            return Err(Error::precondition(format!("node is already running (pid {pid})")));
        }
        create_dir_all_mode(&self.layout.logs_dir(), 0o755)
            .map_err(|e| Error::io("create logs directory", e))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.node_log())
            .map_err(|e| Error::io(format!("open {}", self.layout.node_log().display()), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| Error::io("duplicate node log handle", e))?;

        let child = std::process::Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|e| Error::wrap(ErrorCode::ProcessError, format!("failed to start {}", self.binary), e))?;
        let pid = child.id();

        write_atomic(&self.layout.pid_file(), pid.to_string().as_bytes(), 0o644)
            .map_err(|e| Error::io("write pid file", e))?;
        info!(pid, binary = %self.binary, "node started");
        Ok(pid)
    }

    /// Sends SIGTERM, then SIGKILL once `grace` has passed. Returns false if
    /// the node was not running.
    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        let Some(pid) = self.pid() else {
            let _ = remove_file_if_exists(&self.layout.pid_file());
            return Ok(false);
        };
        let sent = self
            .with_process(pid, |p| p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()))
            .unwrap_or(false);
        if !sent {
            warn!(pid, "could not signal node");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.with_process(pid, |_| ()).is_some() {
            if tokio::time::Instant::now() >= deadline {
                warn!(pid, "node ignored SIGTERM, killing");
                self.with_process(pid, |p| p.kill());
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        remove_file_if_exists(&self.layout.pid_file()).map_err(|e| Error::io("remove pid file", e))?;
        info!(pid, "node stopped");
        Ok(true)
    }

    pub async fn restart(&self, grace: Duration) -> Result<u32> {
        self.stop(grace).await?;
        self.start()
    }
}

impl ProcessSupervisor for PidFileSupervisor {
    fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    fn pid(&self) -> Option<u32> {
        let pid = self.recorded_pid()?;
        self.with_process(pid, |_| pid)
    }

    fn uptime(&self) -> Option<Duration> {
        let pid = self.recorded_pid()?;
        self.with_process(pid, |p| Duration::from_secs(p.run_time()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runner_maps_failures_to_process_error() {
        let runner = SystemRunner::new();
        runner.run("true", &[]).await.unwrap();

        let err = runner.run("false", &[]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProcessError);

        let err = runner.run("/nonexistent/valkitd", &[]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProcessError);
    }

    #[tokio::test]
    async fn runner_captures_stdout() {
        let out = SystemRunner::new()
            .output("echo", &["v1.2.3".to_string()])
            .await
            .unwrap();
        assert_eq!(out.trim(), "v1.2.3");
    }

    #[tokio::test]
    async fn runner_timeout_is_process_error() {
        let err = SystemRunner::with_timeout(Duration::from_millis(50))
            .run("sleep", &["5".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProcessError);
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn supervisor_start_stop_cycle() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = PidFileSupervisor::new(home.path(), "sleep").with_args(vec!["30".into()]);
        assert!(!supervisor.is_running());

        let pid = supervisor.start().unwrap();
        assert_eq!(supervisor.pid(), Some(pid));
        assert!(supervisor.uptime().is_some());
        assert!(supervisor.start().is_err(), "double start must fail");

        assert!(supervisor.stop(Duration::from_secs(5)).await.unwrap());
        assert!(!supervisor.is_running());
        assert!(!HomeLayout::new(home.path()).pid_file().exists());
        assert!(!supervisor.stop(Duration::from_secs(1)).await.unwrap());
    }

    #[test]
    fn stale_pid_file_is_not_running() {
        let home = tempfile::tempdir().unwrap();
        let layout = HomeLayout::new(home.path());
        fs::write(layout.pid_file(), "4194304").unwrap();
        let supervisor = PidFileSupervisor::new(home.path(), "valkitd");
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.uptime(), None);
    }
}
