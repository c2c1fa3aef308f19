//! kimi-run
//!
//! Dispatches a prompt to the kimi engine at most once per trigger window,
//! records the run under the state directory and announces completion.

use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use kimi_common::{FsRecordStore, RunId};
use kimi_run::config::HooksConfig;
use kimi_run::dispatcher::{DispatchMode, Dispatcher};
use kimi_run::error::{exit_status_byte, DispatchError, EXIT_INVALID_INVOCATION, EXIT_SUCCESS};
use kimi_run::lifecycle::{absolute_workdir, parse_allowed_tools, TaskSpec};
use kimi_run::signals::spawn_signal_handlers;
use kimi_run::status;
use kimi_run::supervisor::WorkerInvocation;

const DEFAULT_TIMEOUT_SECS: u64 = 3600;

#[derive(Parser, Debug)]
#[command(name = "kimi-run", version)]
#[command(about = "Run a kimi task once per trigger and notify on completion")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    task: TaskArgs,

    /// Configuration file (default: $KIMI_HOOKS_CONFIG or <state dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Args, Debug)]
struct TaskArgs {
    /// Prompt handed to the engine
    #[arg(short = 'p', long)]
    prompt: Option<String>,

    /// Task name used in results and notifications
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Telegram destination, `<chat_id>` or `<chat_id>:<thread_id>`
    #[arg(short = 'g', long = "telegram-group", allow_hyphen_values = true)]
    telegram_group: Option<String>,

    /// Working directory for the engine
    #[arg(short = 'w', long, default_value = ".")]
    workdir: PathBuf,

    /// Engine timeout in seconds
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Comma-separated tools the engine may use
    #[arg(long = "allowed-tools")]
    allowed_tools: Option<String>,

    /// Detach and return immediately
    #[arg(short = 'b', long)]
    background: bool,

    /// Resume an admitted run as its detached worker
    #[arg(long = "attach-run", hide = true, conflicts_with_all = ["prompt", "background"])]
    attach_run: Option<String>,
}

impl TaskArgs {
    fn into_spec(self) -> Result<TaskSpec, DispatchError> {
        let prompt = self
            .prompt
            .ok_or_else(|| DispatchError::invalid("--prompt is required"))?;
        let workdir = absolute_workdir(&self.workdir)?;
        Ok(TaskSpec {
            prompt,
            task_name: self.name,
            telegram_group: self.telegram_group.filter(|g| !g.trim().is_empty()),
            workdir,
            timeout_secs: self.timeout,
            allowed_tools: parse_allowed_tools(self.allowed_tools.as_deref()),
            background: self.background,
        })
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the latest result (or one run's metadata) and the pending-wake record
    Status {
        /// Run id to inspect instead of the latest result
        #[arg(long)]
        run: Option<String>,
    },
    /// Mark the pending-wake record as consumed
    Ack,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                EXIT_INVALID_INVOCATION
            } else {
                EXIT_SUCCESS
            };
            let _ = err.print();
            return ExitCode::from(exit_status_byte(code));
        }
    };

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            match &err {
                DispatchError::Internal(inner) => eprintln!("kimi-run: {:#}", inner),
                other => eprintln!("kimi-run: {}", other),
            }
            err.exit_code()
        }
    };
    ExitCode::from(exit_status_byte(code))
}

async fn run(cli: Cli) -> Result<i32, DispatchError> {
    let config = HooksConfig::load(cli.config.as_deref())
        .map_err(|err| DispatchError::invalid(format!("{err:#}")))?;
    debug!(state_dir = %config.state_dir.display(), "Configuration loaded");

    match cli.command {
        Some(Command::Status { run }) => show_status(&config, run.as_deref()),
        Some(Command::Ack) => acknowledge(&config),
        None => dispatch(cli.task, config, cli.debug).await,
    }
}

async fn dispatch(task: TaskArgs, config: HooksConfig, debug: bool) -> Result<i32, DispatchError> {
    let invocation = match task.attach_run.as_deref() {
        Some(raw) => Invocation::Attach(
            RunId::parse(raw)
                .ok_or_else(|| DispatchError::invalid(format!("invalid run id '{}'", raw)))?,
        ),
        None => Invocation::New(task.into_spec()?),
    };

    let worker_config = config.source.clone();
    let dispatcher = Dispatcher::from_config(config)?;
    let cancel = CancellationToken::new();
    let signals = spawn_signal_handlers(cancel.clone());

    let result = match invocation {
        Invocation::Attach(run_id) => dispatcher.resume(&run_id, cancel.clone()).await,
        Invocation::New(spec) => {
            let mode = if spec.background {
                DispatchMode::Background(WorkerInvocation::current(worker_config, debug)?)
            } else {
                DispatchMode::Foreground
            };
            dispatcher.dispatch(spec, mode, cancel.clone()).await
        }
    };

    signals.abort();
    result
}

enum Invocation {
    New(TaskSpec),
    /// Detached worker picking up an admitted run.
    Attach(RunId),
}

fn show_status(config: &HooksConfig, run: Option<&str>) -> Result<i32, DispatchError> {
    let run_id = match run {
        Some(raw) => Some(
            RunId::parse(raw)
                .ok_or_else(|| DispatchError::invalid(format!("invalid run id '{}'", raw)))?,
        ),
        None => None,
    };
    let store = FsRecordStore::new(&config.state_dir);
    let report = status::collect(&store, run_id.as_ref(), config.stale_grace)
        .map_err(|err| DispatchError::invalid(format!("{err:#}")))?;
    let rendered = serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?;
    println!("{}", rendered);
    Ok(EXIT_SUCCESS)
}

fn acknowledge(config: &HooksConfig) -> Result<i32, DispatchError> {
    let store = FsRecordStore::new(&config.state_dir);
    match status::acknowledge(&store).map_err(|err| DispatchError::invalid(format!("{err:#}")))? {
        Some(record) => {
            println!("acknowledged {} ({})", record.payload.session_id, record.payload.status);
            Ok(EXIT_SUCCESS)
        }
        None => Err(DispatchError::invalid("no pending-wake record to acknowledge")),
    }
}
