//! JSON documents shared by the dispatcher, the detached worker and any
//! polling consumer of the state directory.

use chrono::{DateTime, Local, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const WAKE_EVENT_TYPE: &str = "kimi-task-complete";

/// Current UTC time truncated to whole seconds.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Time-ordered run identifier: `YYYYMMDD-HHMMSS-<pid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self::at(Local::now(), std::process::id())
    }

    pub fn at(time: DateTime<Local>, pid: u32) -> Self {
        Self(format!("{}-{}", time.format("%Y%m%d-%H%M%S"), pid))
    }

    /// Accepts an externally supplied id (detached worker re-attach). Rejects
    /// anything that could escape the `runs/` directory.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(trimmed.to_string()))
    }

    pub fn session_id(&self) -> String {
        format!("kimi-{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Done,
    Failed,
    Interrupted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    /// Terminal classification of a finished run. An interrupt marker wins over
    /// whatever exit code the engine reported.
    pub fn classify(exit_code: i32, interrupted: bool) -> Self {
        if interrupted {
            TaskStatus::Interrupted
        } else if exit_code != 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Done
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `runs/<run-id>/task-meta.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    pub run_id: RunId,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub task_name: String,
    #[serde(default)]
    pub telegram_group: Option<String>,
    pub cwd: PathBuf,
    pub prompt: String,
    pub timeout: u64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub pid: u32,
    pub background: bool,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskMetadata {
    /// Move a running task to its terminal status. Returns false (and leaves
    /// the record untouched) if the task already left `running`.
    pub fn complete(&mut self, status: TaskStatus, exit_code: i32, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = Some(exit_code);
        self.completed_at = Some(at);
        true
    }
}

/// `runs/<run-id>/result.json` and the process-wide `latest.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub task_name: String,
    #[serde(default)]
    pub telegram_group: Option<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub output: String,
    pub status: TaskStatus,
    pub exit_code: i32,
}

impl TaskResult {
    pub fn from_metadata(meta: &TaskMetadata, output: String, exit_code: i32) -> Self {
        Self {
            session_id: meta.session_id.clone(),
            timestamp: meta.completed_at.unwrap_or_else(now_utc),
            task_name: meta.task_name.clone(),
            telegram_group: meta.telegram_group.clone(),
            cwd: meta.cwd.clone(),
            allowed_tools: meta.allowed_tools.clone(),
            output,
            status: meta.status,
            exit_code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWakePayload {
    pub session_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub workdir: PathBuf,
    pub result_file: PathBuf,
}

/// `pending-wake.json`, overwritten on every dispatch start and completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWakeRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: PendingWakePayload,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
}

impl PendingWakeRecord {
    pub fn new(payload: PendingWakePayload) -> Self {
        Self {
            kind: WAKE_EVENT_TYPE.to_string(),
            payload,
            notified: false,
            created_at: now_utc(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WakeEventPayload {
    pub session_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

/// Body of the gateway wake POST.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WakeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: WakeEventPayload,
}

impl WakeEvent {
    pub fn new(payload: WakeEventPayload) -> Self {
        Self {
            kind: WAKE_EVENT_TYPE.to_string(),
            payload,
        }
    }
}
