//! The external AI engine: a `kimi` subprocess, or a built-in mock when the
//! binary is absent.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::OutputSink;
use crate::config::{EngineConfig, DEFAULT_ENGINE_BINARY};
use crate::error::{EXIT_INTERRUPTED, EXIT_TIMEOUT};

const READ_CHUNK: usize = 8 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const MOCK_DELAY: Duration = Duration::from_millis(300);

/// What the engine is asked to do.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub run_id: String,
    pub task_name: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl EngineOutcome {
    fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            timed_out: false,
            cancelled: false,
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Run to completion, streaming output into `sink`. Returns an error only
    /// when the engine could not be started at all.
    async fn run(
        &self,
        request: &EngineRequest,
        sink: &mut OutputSink,
        cancel: CancellationToken,
    ) -> Result<EngineOutcome>;
}

/// Pick the engine named by the configuration.
pub fn resolve_engine(config: &EngineConfig) -> Result<Arc<dyn ExecutionEngine>> {
    let requested = config.binary.as_deref().unwrap_or(DEFAULT_ENGINE_BINARY);
    match locate_binary(requested) {
        Some(binary) => {
            debug!(binary = %binary.display(), "Using engine binary");
            let engine = CommandEngine::new(binary, config.kill_grace);
            Ok(Arc::new(if config.mock_when_missing {
                engine.with_spawn_fallback(MockEngine::default())
            } else {
                engine
            }))
        }
        None if config.mock_when_missing => {
            warn!(binary = requested, "Engine binary not found; using mock engine");
            Ok(Arc::new(MockEngine::default()))
        }
        None => bail!("engine binary '{}' not found", requested),
    }
}

fn locate_binary(requested: &str) -> Option<PathBuf> {
    let path = Path::new(requested);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    which::which(requested).ok()
}

/// Runs `<binary> --print -p <prompt> -w <workdir> [--allowed-tools a,b]`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    binary: PathBuf,
    kill_grace: Duration,
    /// Takes over when the binary exists but cannot be started.
    spawn_fallback: Option<MockEngine>,
}

impl CommandEngine {
    pub fn new(binary: PathBuf, kill_grace: Duration) -> Self {
        Self {
            binary,
            kill_grace,
            spawn_fallback: None,
        }
    }

    pub fn with_spawn_fallback(mut self, mock: MockEngine) -> Self {
        self.spawn_fallback = Some(mock);
        self
    }

    pub fn build_args(request: &EngineRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "-p".to_string(),
            request.prompt.clone(),
            "-w".to_string(),
            request.workdir.to_string_lossy().into_owned(),
        ];
        if !request.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        args
    }

    fn command(&self, request: &EngineRequest) -> TokioCommand {
        let mut command = TokioCommand::new(&self.binary);
        command
            .args(Self::build_args(request))
            .current_dir(&request.workdir)
            .env("KIMI_TASK_RUN_ID", &request.run_id)
            .env("KIMI_TASK_NAME", &request.task_name)
            .env("KIMI_TASK_WORKDIR", &request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// SIGTERM to the engine's process group, SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
                let group = Pid::from_raw(raw);
                if let Err(err) = killpg(group, Signal::SIGTERM) {
                    debug!(pid = raw, error = %err, "SIGTERM to engine group failed");
                }
                if time::timeout(self.kill_grace, child.wait()).await.is_ok() {
                    return;
                }
                warn!(pid = raw, "Engine ignored SIGTERM; sending SIGKILL");
                let _ = killpg(group, Signal::SIGKILL);
            }
        }
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "Engine already gone");
        }
    }
}

#[async_trait]
impl ExecutionEngine for CommandEngine {
    fn name(&self) -> &str {
        "kimi-cli"
    }

    async fn run(
        &self,
        request: &EngineRequest,
        sink: &mut OutputSink,
        cancel: CancellationToken,
    ) -> Result<EngineOutcome> {
        info!(
            run_id = %request.run_id,
            binary = %self.binary.display(),
            workdir = %request.workdir.display(),
            timeout_secs = request.timeout.as_secs(),
            "Invoking engine subprocess"
        );

        let mut child = match self.command(request).spawn() {
            Ok(child) => child,
            Err(err) => match &self.spawn_fallback {
                Some(mock) => {
                    warn!(
                        binary = %self.binary.display(),
                        error = %err,
                        "Engine failed to start; using mock engine"
                    );
                    return mock.run(request, sink, cancel).await;
                }
                None => {
                    return Err(err).with_context(|| {
                        format!("failed to start engine {}", self.binary.display())
                    })
                }
            },
        };

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = time::sleep(request.timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut cancelled = false;

        let status: ExitStatus = loop {
            tokio::select! {
                Some(chunk) = rx.recv() => sink.write(&chunk).await,
                status = child.wait() => break status.context("failed to wait for engine")?,
                _ = &mut deadline, if !timed_out && !cancelled => {
                    warn!(run_id = %request.run_id, timeout_secs = request.timeout.as_secs(), "Engine timed out");
                    timed_out = true;
                    self.terminate(&mut child).await;
                }
                _ = cancel.cancelled(), if !timed_out && !cancelled => {
                    info!(run_id = %request.run_id, "Cancellation requested; stopping engine");
                    cancelled = true;
                    self.terminate(&mut child).await;
                }
            }
        };

        let drained = time::timeout(DRAIN_TIMEOUT, async {
            while let Some(chunk) = rx.recv().await {
                sink.write(&chunk).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(run_id = %request.run_id, "Engine output still open after exit; abandoning drain");
        }

        let exit_code = if cancelled {
            EXIT_INTERRUPTED
        } else if timed_out {
            EXIT_TIMEOUT
        } else {
            exit_code_of(status)
        };
        if timed_out {
            sink.write_line(&format!(
                "[kimi-run] engine timed out after {}s",
                request.timeout.as_secs()
            ))
            .await;
        }

        debug!(run_id = %request.run_id, exit_code, "Engine exited");
        Ok(EngineOutcome {
            exit_code,
            timed_out,
            cancelled,
        })
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "Engine pipe read failed");
                break;
            }
        }
    }
}

/// Exit code, or 128 + signal number for signal deaths on unix.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Deterministic stand-in used when no engine binary is installed.
#[derive(Debug, Clone)]
pub struct MockEngine {
    delay: Duration,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self { delay: MOCK_DELAY }
    }
}

impl MockEngine {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn response_for(prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        let body = if lower.contains("hello") || lower.contains("world") {
            "fn main() {\n    println!(\"Hello, world!\");\n}".to_string()
        } else if lower.contains("analy") || lower.contains("review") {
            "Analysis complete: no issues found in the inspected files.".to_string()
        } else {
            format!("Task received and processed: {}", prompt.trim())
        };
        format!("[mock engine] kimi binary not installed\n{}\n", body)
    }
}

#[async_trait]
impl ExecutionEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(
        &self,
        request: &EngineRequest,
        sink: &mut OutputSink,
        cancel: CancellationToken,
    ) -> Result<EngineOutcome> {
        info!(run_id = %request.run_id, "Running mock engine");
        tokio::select! {
            _ = time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                sink.write_line("[mock engine] cancelled").await;
                return Ok(EngineOutcome {
                    exit_code: EXIT_INTERRUPTED,
                    timed_out: false,
                    cancelled: true,
                });
            }
        }
        sink.write(Self::response_for(&request.prompt).as_bytes())
            .await;
        Ok(EngineOutcome::exited(0))
    }
}
