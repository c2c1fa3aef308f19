#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use kimi_common::{
    FsRecordStore, PendingWakeRecord, RecordStoreExt, RunId, TaskMetadata, TaskResult, TaskStatus,
};
use kimi_run::layout::{meta_key_for, LATEST_KEY, PENDING_WAKE_KEY};

struct Harness {
    _temp: TempDir,
    state_dir: PathBuf,
    workdir: PathBuf,
    engine: PathBuf,
}

impl Harness {
    fn new(engine_script: &str) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let state_dir = temp.path().join("state");
        let workdir = temp.path().join("work");
        fs::create_dir_all(&workdir).expect("workdir");

        let engine = temp.path().join("fake-kimi");
        fs::write(&engine, format!("#!/bin/sh\n{engine_script}\n")).expect("write engine");
        fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).expect("chmod engine");

        Self {
            _temp: temp,
            state_dir,
            workdir,
            engine,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_kimi-run"));
        cmd.env("KIMI_HOOKS_DIR", &self.state_dir)
            .env("HOME", self.state_dir.parent().expect("temp root"))
            .env("KIMI_BIN", &self.engine)
            .env("KIMI_NOTIFY_RETRY_BACKOFF_MS", "10")
            .env_remove("KIMI_HOOKS_CONFIG")
            .env_remove("KIMI_GATEWAY_TOKEN")
            .env_remove("KIMI_GATEWAY_URL")
            .env_remove("KIMI_TELEGRAM_BOT_TOKEN")
            .env_remove("TELEGRAM_BOT_TOKEN")
            .env_remove("KIMI_DEDUP_WINDOW_MS")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null());
        cmd
    }

    fn task(&self, prompt: &str) -> Command {
        let mut cmd = self.command();
        cmd.arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg("cli-test")
            .arg("-w")
            .arg(&self.workdir)
            .arg("-t")
            .arg("30");
        cmd
    }

    fn store(&self) -> FsRecordStore {
        FsRecordStore::new(&self.state_dir)
    }

    fn latest(&self) -> Option<TaskResult> {
        self.store().read_json(LATEST_KEY).expect("latest.json")
    }

    fn pending(&self) -> Option<PendingWakeRecord> {
        self.store().read_json(PENDING_WAKE_KEY).expect("pending-wake.json")
    }

    fn run_ids(&self) -> Vec<RunId> {
        let Ok(entries) = fs::read_dir(self.state_dir.join("runs")) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| RunId::parse(&entry.file_name().to_string_lossy()))
            .collect()
    }

    fn metadata(&self, run_id: &RunId) -> Option<TaskMetadata> {
        self.store()
            .read_json(&meta_key_for(run_id))
            .ok()
            .flatten()
    }
}

fn run(mut cmd: Command) -> Output {
    cmd.output().expect("spawn kimi-run")
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    done()
}

fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join("dispatch.lock")
}

#[test]
fn foreground_success_records_everything() {
    let harness = Harness::new(r#"echo "engine says: $KIMI_TASK_NAME"; exit 0"#);

    let output = run(harness.task("summarise the changelog"));
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let latest = harness.latest().expect("latest result");
    assert_eq!(latest.status, TaskStatus::Done);
    assert_eq!(latest.exit_code, 0);
    assert_eq!(latest.task_name, "cli-test");
    assert!(latest.output.contains("engine says: cli-test"));

    let runs = harness.run_ids();
    assert_eq!(runs.len(), 1);
    let meta = harness.metadata(&runs[0]).expect("metadata");
    assert_eq!(meta.status, TaskStatus::Done);
    assert!(meta.completed_at.is_some());
    assert!(harness
        .state_dir
        .join("runs")
        .join(runs[0].as_str())
        .join("result.json")
        .exists());

    let pending = harness.pending().expect("pending wake");
    assert_eq!(pending.payload.status, TaskStatus::Done);
    assert!(!pending.notified);
    assert!(!lock_path(&harness.state_dir).exists());
}

#[test]
fn task_exit_code_is_propagated() {
    let harness = Harness::new("echo 'compile error' >&2; exit 3");

    let output = run(harness.task("fix the build"));
    assert_eq!(output.status.code(), Some(3));

    let latest = harness.latest().expect("latest result");
    assert_eq!(latest.status, TaskStatus::Failed);
    assert_eq!(latest.exit_code, 3);
    assert!(latest.output.contains("compile error"));
}

#[test]
fn duplicate_trigger_exits_two_without_artifacts() {
    let harness = Harness::new("exit 0");
    fs::create_dir_all(&harness.state_dir).expect("state dir");
    fs::write(lock_path(&harness.state_dir), "other dispatcher").expect("lock");

    let output = run(harness.task("triggered twice"));
    assert_eq!(output.status.code(), Some(2));
    assert!(harness.run_ids().is_empty());
    assert!(harness.pending().is_none());
    assert!(lock_path(&harness.state_dir).exists());
}

#[test]
fn missing_prompt_is_an_invalid_invocation() {
    let harness = Harness::new("exit 0");
    let mut cmd = harness.command();
    cmd.arg("-w").arg(&harness.workdir);

    let output = run(cmd);
    assert_eq!(output.status.code(), Some(1));
    assert!(harness.run_ids().is_empty());
    assert!(!lock_path(&harness.state_dir).exists());
}

#[test]
fn unreachable_channels_still_complete() {
    let harness = Harness::new("echo done; exit 0");
    let mut cmd = harness.task("notify somewhere");
    cmd.env("KIMI_GATEWAY_URL", "http://127.0.0.1:9")
        .env("KIMI_GATEWAY_TOKEN", "gw-secret")
        .env("KIMI_TELEGRAM_API_BASE", "http://127.0.0.1:9")
        .env("KIMI_TELEGRAM_BOT_TOKEN", "bot-token")
        .arg("-g")
        .arg("-100123");

    let output = run(cmd);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let pending = harness.pending().expect("pending wake");
    assert_eq!(pending.payload.status, TaskStatus::Done);
}

#[test]
fn sigint_marks_the_run_interrupted() {
    let harness = Harness::new(r#"touch "$KIMI_TASK_WORKDIR/started"; sleep 30"#);
    let mut child = harness
        .task("long running")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn kimi-run");

    let started = harness.workdir.join("started");
    assert!(
        wait_until(Duration::from_secs(10), || started.exists()),
        "engine never started"
    );
    thread::sleep(Duration::from_millis(200));

    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT).expect("send SIGINT");

    let status = child.wait().expect("wait kimi-run");
    assert_eq!(status.code(), Some(130));

    let runs = harness.run_ids();
    assert_eq!(runs.len(), 1);
    let meta = harness.metadata(&runs[0]).expect("metadata");
    assert_eq!(meta.status, TaskStatus::Interrupted);
    assert!(harness
        .state_dir
        .join("runs")
        .join(runs[0].as_str())
        .join("interrupted")
        .exists());
    assert_eq!(
        harness.pending().expect("pending wake").payload.status,
        TaskStatus::Interrupted
    );
    assert!(!lock_path(&harness.state_dir).exists());
}

#[test]
fn background_dispatch_returns_immediately_and_worker_finalizes() {
    let harness = Harness::new("sleep 1; echo 'background work finished'; exit 0");

    let started = Instant::now();
    let output = run({
        let mut cmd = harness.task("do it later");
        cmd.arg("-b");
        cmd
    });
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    let runs = harness.run_ids();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].clone();
    assert!(harness
        .metadata(&run_id)
        .map(|meta| meta.background)
        .unwrap_or(false));

    assert!(
        wait_until(Duration::from_secs(20), || harness
            .metadata(&run_id)
            .is_some_and(|meta| meta.status.is_terminal())),
        "detached worker never finalized"
    );
    let meta = harness.metadata(&run_id).expect("metadata");
    assert_eq!(meta.status, TaskStatus::Done);

    assert!(wait_until(Duration::from_secs(5), || !lock_path(&harness.state_dir).exists()));
    let latest = harness.latest().expect("latest result");
    assert!(latest.output.contains("background work finished"));
}

#[test]
fn status_and_ack_subcommands() {
    let harness = Harness::new("echo ok; exit 0");
    assert_eq!(run(harness.task("quick")).status.code(), Some(0));

    let mut status = harness.command();
    status.arg("status");
    let output = run(status);
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status json");
    assert_eq!(report["latest"]["status"], "done");
    assert_eq!(report["pending_wake_stale"], false);

    let mut ack = harness.command();
    ack.arg("ack");
    assert_eq!(run(ack).status.code(), Some(0));
    assert!(harness.pending().expect("pending wake").notified);
}
