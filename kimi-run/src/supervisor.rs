//! Detached worker spawning for background dispatches.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, Stdio};
use tracing::info;

use kimi_common::RunId;

pub const ATTACH_FLAG: &str = "--attach-run";

/// How to re-enter this binary as the worker for an admitted run.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub program: PathBuf,
    pub config: Option<PathBuf>,
    pub debug: bool,
}

impl WorkerInvocation {
    pub fn current(config: Option<PathBuf>, debug: bool) -> Result<Self> {
        let program = std::env::current_exe().context("failed to locate own executable")?;
        Ok(Self {
            program,
            config,
            debug,
        })
    }

    /// The worker reads the task itself from the run's metadata, so only the
    /// run id and the settings that locate the state directory are passed.
    pub fn args(&self, run_id: &RunId) -> Vec<OsString> {
        let mut args = vec![OsString::from(ATTACH_FLAG), OsString::from(run_id.as_str())];
        if let Some(config) = &self.config {
            args.push(OsString::from("--config"));
            args.push(config.clone().into_os_string());
        }
        if self.debug {
            args.push(OsString::from("--debug"));
        }
        args
    }

    /// Start the worker in its own session with stdin closed and both output
    /// streams appended to `log_path`. Returns the worker pid.
    pub fn spawn_detached(&self, run_id: &RunId, state_dir: &Path, log_path: &Path) -> Result<u32> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("failed to clone {}", log_path.display()))?;

        let mut command = StdCommand::new(&self.program);
        command
            .args(self.args(run_id))
            .env("KIMI_HOOKS_DIR", state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            use std::io;
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.program.display()))?;
        let pid = child.id();
        info!(run_id = %run_id, pid, log = %log_path.display(), "Detached worker started");
        Ok(pid)
    }
}
