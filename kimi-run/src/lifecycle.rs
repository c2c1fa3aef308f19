//! One admitted run, from metadata creation to guaranteed finalization.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kimi_common::fs::ensure_private_dir;
use kimi_common::{now_utc, RecordStore, RecordStoreExt, RunId, TaskMetadata, TaskResult, TaskStatus};

use crate::capture::{resolve_output, OutputSink, OutputSources};
use crate::engine::{EngineRequest, ExecutionEngine};
use crate::error::{EXIT_ENGINE_UNAVAILABLE, EXIT_INTERRUPTED};
use crate::layout::{RunLayout, LATEST_KEY};
use crate::notify::{fallback, CompletionNotice, FanoutReport, NotificationFanout};
use crate::signals::InterruptMarker;

/// A validated dispatch request.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub prompt: String,
    /// Generated from the run id when absent.
    pub task_name: Option<String>,
    pub telegram_group: Option<String>,
    pub workdir: PathBuf,
    pub timeout_secs: u64,
    pub allowed_tools: Vec<String>,
    pub background: bool,
}

/// How the engine phase ended, before classification.
#[derive(Debug, Clone)]
pub struct Completion {
    pub exit_code: i32,
    pub captured: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: TaskStatus,
    pub exit_code: i32,
    pub fanout: FanoutReport,
}

impl RunReport {
    /// Exit status for the dispatcher process.
    pub fn process_exit_code(&self) -> i32 {
        match self.status {
            TaskStatus::Interrupted if self.exit_code == 0 => EXIT_INTERRUPTED,
            _ => self.exit_code,
        }
    }
}

pub struct TaskLifecycle {
    store: Arc<dyn RecordStore>,
    engine: Arc<dyn ExecutionEngine>,
    fanout: Arc<NotificationFanout>,
    state_dir: PathBuf,
    echo_output: bool,
}

impl TaskLifecycle {
    pub fn new(
        store: Arc<dyn RecordStore>,
        engine: Arc<dyn ExecutionEngine>,
        fanout: Arc<NotificationFanout>,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            engine,
            fanout,
            state_dir,
            echo_output: false,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn layout(&self, run_id: &RunId) -> RunLayout {
        RunLayout::new(&self.state_dir, run_id)
    }

    /// A time-ordered run id whose directory does not exist yet.
    pub fn fresh_run_id(&self) -> RunId {
        let base = RunId::generate();
        if !self.layout(&base).run_dir().exists() {
            return base;
        }
        (1u32..)
            .filter_map(|n| RunId::parse(&format!("{}-{}", base, n)))
            .find(|candidate| !self.layout(candidate).run_dir().exists())
            .unwrap_or(base)
    }

    /// Create the run directory, persist `running` metadata and arm the
    /// pending-wake record.
    pub fn prepare(&self, spec: &TaskSpec, run_id: RunId) -> Result<TaskMetadata> {
        let layout = self.layout(&run_id);
        ensure_private_dir(&layout.run_dir())?;

        let task_name = spec
            .task_name
            .clone()
            .unwrap_or_else(|| format!("kimi-task-{}", run_id));
        let meta = TaskMetadata {
            session_id: run_id.session_id(),
            run_id,
            timestamp: now_utc(),
            task_name,
            telegram_group: spec.telegram_group.clone(),
            cwd: spec.workdir.clone(),
            prompt: spec.prompt.clone(),
            timeout: spec.timeout_secs,
            allowed_tools: spec.allowed_tools.clone(),
            pid: std::process::id(),
            background: spec.background,
            status: TaskStatus::Running,
            exit_code: None,
            completed_at: None,
        };
        self.store
            .write_json(&layout.meta_key(), &meta)
            .context("failed to write task metadata")?;
        fallback::record_dispatch_start(self.store.as_ref(), &meta, &layout.result_file())?;

        info!(
            run_id = %meta.run_id,
            task = %meta.task_name,
            workdir = %meta.cwd.display(),
            background = meta.background,
            "Run prepared"
        );
        Ok(meta)
    }

    /// Load an admitted run for a detached worker. The run must still be
    /// `running`. The recorded pid becomes the worker's own.
    pub fn attach(&self, run_id: &RunId) -> Result<TaskMetadata> {
        let layout = self.layout(run_id);
        let key = layout.meta_key();
        let meta: TaskMetadata = self
            .store
            .read_json(&key)?
            .ok_or_else(|| anyhow!("no metadata for run {}", run_id))?;
        if meta.status.is_terminal() {
            bail!("run {} already finished with status {}", run_id, meta.status);
        }
        let worker_pid = std::process::id();
        self.store
            .update_json(&key, |stored: &mut TaskMetadata| stored.pid = worker_pid)
            .context("failed to record worker pid")
    }

    /// Execute the engine and finalize. Finalization runs whatever happened
    /// during execution; only a failed fallback write surfaces as an error.
    pub async fn run(&self, meta: &TaskMetadata, cancel: CancellationToken) -> Result<RunReport> {
        let layout = self.layout(&meta.run_id);
        let marker = InterruptMarker::new(self.store.clone(), layout.interrupt_key());
        let watcher = marker.watch(cancel.clone());

        let completion = self.execute(meta, &layout, cancel.clone()).await;

        if cancel.is_cancelled() {
            marker.mark();
        }
        watcher.abort();

        self.finalize(meta, completion).await
    }

    async fn execute(
        &self,
        meta: &TaskMetadata,
        layout: &RunLayout,
        cancel: CancellationToken,
    ) -> Completion {
        let mut sink = OutputSink::create(&layout.output_log(), self.echo_output).await;

        if let Err(err) = fs::create_dir_all(&meta.cwd) {
            let message = format!("failed to create workdir {}: {}", meta.cwd.display(), err);
            error!(run_id = %meta.run_id, "{}", message);
            sink.write_line(&message).await;
            return Completion {
                exit_code: 1,
                captured: sink.finish().await,
            };
        }

        let request = EngineRequest {
            run_id: meta.run_id.to_string(),
            task_name: meta.task_name.clone(),
            prompt: meta.prompt.clone(),
            workdir: meta.cwd.clone(),
            timeout: Duration::from_secs(meta.timeout),
            allowed_tools: meta.allowed_tools.clone(),
        };

        let exit_code = match self.engine.run(&request, &mut sink, cancel).await {
            Ok(outcome) => outcome.exit_code,
            Err(err) => {
                let message = format!("engine '{}' failed to start: {err:#}", self.engine.name());
                error!(run_id = %meta.run_id, "{}", message);
                sink.write_line(&message).await;
                EXIT_ENGINE_UNAVAILABLE
            }
        };
        Completion {
            exit_code,
            captured: sink.finish().await,
        }
    }

    /// Classify, record the terminal state, publish results and notify.
    pub async fn finalize(&self, meta: &TaskMetadata, completion: Completion) -> Result<RunReport> {
        let layout = self.layout(&meta.run_id);
        let interrupted = self.store.exists(&layout.interrupt_key());
        let status = TaskStatus::classify(completion.exit_code, interrupted);
        let completed_at = now_utc();

        let mut terminal = meta.clone();
        let updated = self.store.update_json(&layout.meta_key(), |stored: &mut TaskMetadata| {
            if !stored.complete(status, completion.exit_code, completed_at) {
                warn!(run_id = %stored.run_id, status = %stored.status, "Metadata already terminal");
            }
        });
        match updated {
            Ok(stored) => terminal = stored,
            Err(err) => {
                error!(run_id = %meta.run_id, error = %format!("{err:#}"), "Failed to record terminal status");
                terminal.complete(status, completion.exit_code, completed_at);
            }
        }

        // The stored terminal state wins when another writer got there first.
        let status = terminal.status;
        let exit_code = terminal.exit_code.unwrap_or(completion.exit_code);
        let completed_at = terminal.completed_at.unwrap_or(completed_at);

        let output = resolve_output(
            &completion.captured,
            &OutputSources::new(layout.output_log(), &meta.task_name, meta.cwd.clone()),
        );
        let result = TaskResult::from_metadata(&terminal, output.clone(), exit_code);
        for key in [layout.result_key(), LATEST_KEY.to_string()] {
            if let Err(err) = self.store.write_json(&key, &result) {
                error!(run_id = %meta.run_id, key = %key, error = %format!("{err:#}"), "Failed to write result");
            }
        }

        info!(
            run_id = %meta.run_id,
            status = %status,
            exit_code,
            "Run finished"
        );

        let notice = CompletionNotice {
            run_id: meta.run_id.clone(),
            session_id: meta.session_id.clone(),
            task_name: meta.task_name.clone(),
            status,
            exit_code: Some(exit_code),
            timestamp: completed_at,
            workdir: meta.cwd.clone(),
            telegram_group: meta.telegram_group.clone(),
            output,
            result_file: result_file_for(&layout, self.store.as_ref()),
        };
        let fanout = self.fanout.notify(&notice).await?;

        Ok(RunReport {
            run_id: meta.run_id.clone(),
            status,
            exit_code,
            fanout,
        })
    }
}

fn result_file_for(layout: &RunLayout, store: &dyn RecordStore) -> PathBuf {
    store
        .locate(&layout.result_key())
        .unwrap_or_else(|| layout.result_file())
}

/// Parse `--allowed-tools a,b,c`.
pub fn parse_allowed_tools(raw: Option<&str>) -> Vec<String> {
    raw.map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|tool| !tool.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Resolve the working directory against the invocation's cwd.
pub fn absolute_workdir(workdir: &Path) -> Result<PathBuf> {
    if workdir.is_absolute() {
        return Ok(workdir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(workdir))
}
