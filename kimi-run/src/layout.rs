//! Where everything lives inside the state directory.

use std::path::{Path, PathBuf};

use kimi_common::RunId;

pub const LOCK_FILE: &str = "dispatch.lock";
pub const LOCK_GUARD_FILE: &str = "dispatch.lock.guard";
pub const LATEST_KEY: &str = "latest.json";
pub const PENDING_WAKE_KEY: &str = "pending-wake.json";
pub const RUNS_DIR: &str = "runs";

/// Paths and record keys of a single run.
#[derive(Debug, Clone)]
pub struct RunLayout {
    state_dir: PathBuf,
    run_id: RunId,
}

impl RunLayout {
    pub fn new(state_dir: &Path, run_id: &RunId) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            run_id: run_id.clone(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join(RUNS_DIR).join(self.run_id.as_str())
    }

    pub fn meta_key(&self) -> String {
        meta_key_for(&self.run_id)
    }

    pub fn result_key(&self) -> String {
        self.key("result.json")
    }

    pub fn interrupt_key(&self) -> String {
        self.key("interrupted")
    }

    pub fn result_file(&self) -> PathBuf {
        self.run_dir().join("result.json")
    }

    pub fn output_log(&self) -> PathBuf {
        self.run_dir().join("output.log")
    }

    /// stdout/stderr of a detached worker.
    pub fn dispatch_log(&self) -> PathBuf {
        self.run_dir().join("dispatch.log")
    }

    fn key(&self, name: &str) -> String {
        run_key(&self.run_id, name)
    }
}

fn run_key(run_id: &RunId, name: &str) -> String {
    format!("{}/{}/{}", RUNS_DIR, run_id, name)
}

/// Metadata key of a run, without needing the state directory.
pub fn meta_key_for(run_id: &RunId) -> String {
    run_key(run_id, "task-meta.json")
}

/// Run id encoded in a `kimi-<run-id>` session id.
pub fn run_id_from_session(session_id: &str) -> Option<RunId> {
    session_id.strip_prefix("kimi-").and_then(RunId::parse)
}
