//! Admission, mode selection and exit-code mapping for one invocation.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kimi_common::{FsRecordStore, RecordStore, RunId};

use crate::config::HooksConfig;
use crate::dedup_lock::DedupLock;
use crate::error::{DispatchError, EXIT_INVALID_INVOCATION, EXIT_SUCCESS};
use crate::engine::resolve_engine;
use crate::lifecycle::{Completion, TaskLifecycle, TaskSpec};
use crate::notify::NotificationFanout;
use crate::supervisor::WorkerInvocation;

/// Longest engine timeout accepted on the command line (30 days).
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

pub enum DispatchMode {
    Foreground,
    /// Hand the admitted run to a detached copy of this binary.
    Background(WorkerInvocation),
}

pub struct Dispatcher {
    config: HooksConfig,
    lifecycle: TaskLifecycle,
    lock: DedupLock,
}

impl Dispatcher {
    pub fn new(config: HooksConfig, lifecycle: TaskLifecycle) -> Self {
        let lock = DedupLock::new(&config.state_dir, config.dedup_window);
        Self {
            config,
            lifecycle,
            lock,
        }
    }

    /// Production wiring: filesystem store, configured engine and channels.
    pub fn from_config(config: HooksConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(FsRecordStore::new(&config.state_dir));
        let engine = resolve_engine(&config.engine)?;
        let fanout = Arc::new(NotificationFanout::from_config(store.clone(), &config)?);
        let lifecycle = TaskLifecycle::new(store, engine, fanout, config.state_dir.clone())
            .with_echo(config.engine.echo_output);
        Ok(Self::new(config, lifecycle))
    }

    pub fn config(&self) -> &HooksConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &TaskLifecycle {
        &self.lifecycle
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(self.lifecycle.store())
    }

    /// Run a new task. Returns the process exit code on any admitted path.
    pub async fn dispatch(
        &self,
        spec: TaskSpec,
        mode: DispatchMode,
        cancel: CancellationToken,
    ) -> Result<i32, DispatchError> {
        validate(&spec)?;

        if !self.lock.admit()? {
            warn!(
                window_ms = self.config.dedup_window.as_millis() as u64,
                "Duplicate trigger rejected"
            );
            return Err(DispatchError::Duplicate {
                window_ms: self.config.dedup_window.as_millis() as u64,
            });
        }
        let release = self.lock.release_on_drop();

        let run_id = self.lifecycle.fresh_run_id();
        let meta = self.lifecycle.prepare(&spec, run_id)?;

        match mode {
            DispatchMode::Foreground => {
                let report = self.lifecycle.run(&meta, cancel).await?;
                release.release();
                Ok(report.process_exit_code())
            }
            DispatchMode::Background(worker) => {
                let layout = self.lifecycle.layout(&meta.run_id);
                match worker.spawn_detached(&meta.run_id, &self.config.state_dir, &layout.dispatch_log()) {
                    Ok(pid) => {
                        info!(run_id = %meta.run_id, pid, "Task handed to detached worker");
                        release.disarm();
                        Ok(EXIT_SUCCESS)
                    }
                    Err(err) => {
                        let message = format!("failed to detach worker: {err:#}");
                        error!(run_id = %meta.run_id, "{}", message);
                        let completion = Completion {
                            exit_code: EXIT_INVALID_INVOCATION,
                            captured: message,
                        };
                        self.lifecycle.finalize(&meta, completion).await?;
                        release.release();
                        Ok(EXIT_INVALID_INVOCATION)
                    }
                }
            }
        }
    }

    /// Entry point of a detached worker: the dispatcher already admitted the
    /// run and handed over the lock.
    pub async fn resume(&self, run_id: &RunId, cancel: CancellationToken) -> Result<i32, DispatchError> {
        let release = self.lock.release_on_drop();
        let meta = self
            .lifecycle
            .attach(run_id)
            .map_err(|err| DispatchError::invalid(format!("{err:#}")))?;

        info!(run_id = %run_id, "Detached worker resumed run");
        let report = self.lifecycle.run(&meta, cancel).await?;
        release.release();
        Ok(report.process_exit_code())
    }
}

fn validate(spec: &TaskSpec) -> Result<(), DispatchError> {
    if spec.prompt.trim().is_empty() {
        return Err(DispatchError::invalid("a non-empty prompt is required"));
    }
    if spec.task_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(DispatchError::invalid("task name must not be empty"));
    }
    if spec.timeout_secs == 0 {
        return Err(DispatchError::invalid("timeout must be at least one second"));
    }
    if spec.timeout_secs > MAX_TIMEOUT_SECS {
        return Err(DispatchError::invalid(format!(
            "timeout must not exceed {} seconds",
            MAX_TIMEOUT_SECS
        )));
    }
    Ok(())
}
