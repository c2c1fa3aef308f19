//! Durable key/value slots backing every JSON artifact in the state directory.
//!
//! Keys are relative, `/`-separated paths (`latest.json`,
//! `runs/<run-id>/task-meta.json`). Writes replace the whole slot atomically.

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use crate::fs::atomic_write;

pub trait RecordStore: Send + Sync {
    /// Raw slot content, `None` if the slot does not exist.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn write_atomic(&self, key: &str, content: &[u8]) -> Result<()>;

    fn exists(&self, key: &str) -> bool;

    /// Delete the slot. Missing slots are not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Filesystem location of a slot, for stores that have one.
    fn locate(&self, key: &str) -> Option<PathBuf>;
}

/// JSON helpers over any [`RecordStore`].
pub trait RecordStoreExt: RecordStore {
    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse record '{}'", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to serialize record '{}'", key))?;
        bytes.push(b'\n');
        self.write_atomic(key, &bytes)
    }

    /// Read-modify-write of an existing JSON slot.
    fn update_json<T, F>(&self, key: &str, mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let mut value: T = self
            .read_json(key)?
            .ok_or_else(|| anyhow!("record '{}' does not exist", key))?;
        mutate(&mut value);
        self.write_json(key, &value)?;
        Ok(value)
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

/// Slots stored as files below a root directory.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl RecordStore for FsRecordStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read record '{}'", path.display()))
            }
        }
    }

    fn write_atomic(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        atomic_write(&path, content)
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove record '{}'", path.display()))
            }
        }
    }

    fn locate(&self, key: &str) -> Option<PathBuf> {
        self.path_for(key).ok()
    }
}

/// In-memory slots for tests.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    slots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = slots.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl RecordStore for MemoryRecordStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots.get(key).cloned())
    }

    fn write_atomic(&self, key: &str, content: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(key);
        Ok(())
    }

    fn locate(&self, _key: &str) -> Option<PathBuf> {
        None
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("record key must not be empty");
    }
    let path = Path::new(key);
    if path.is_absolute() {
        bail!("record key '{}' must be relative", key);
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            bail!("record key '{}' contains a non-normal component", key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
        count: u32,
    }

    fn exercise(store: &dyn RecordStore) {
        assert!(!store.exists("runs/a/doc.json"));
        assert!(store.read("runs/a/doc.json").unwrap().is_none());

        store
            .write_json(
                "runs/a/doc.json",
                &Doc {
                    name: "one".into(),
                    count: 1,
                },
            )
            .unwrap();
        assert!(store.exists("runs/a/doc.json"));

        let updated: Doc = store
            .update_json("runs/a/doc.json", |doc: &mut Doc| doc.count += 1)
            .unwrap();
        assert_eq!(updated.count, 2);

        let read: Doc = store.read_json("runs/a/doc.json").unwrap().unwrap();
        assert_eq!(read, updated);

        store.remove("runs/a/doc.json").unwrap();
        store.remove("runs/a/doc.json").unwrap();
        assert!(!store.exists("runs/a/doc.json"));
    }

    #[test]
    fn fs_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsRecordStore::new(temp_dir.path());
        exercise(&store);
        assert_eq!(
            store.locate("latest.json").unwrap(),
            temp_dir.path().join("latest.json")
        );
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryRecordStore::new();
        exercise(&store);
        assert!(store.locate("latest.json").is_none());
    }

    #[test]
    fn keys_cannot_escape_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsRecordStore::new(temp_dir.path());
        assert!(store.write_atomic("../escape.json", b"{}").is_err());
        assert!(store.write_atomic("/etc/passwd", b"{}").is_err());
        assert!(store.write_atomic("./x", b"{}").is_err());
    }

    #[test]
    fn update_missing_record_fails() {
        let store = MemoryRecordStore::new();
        let err = store
            .update_json("missing.json", |_doc: &mut Doc| {})
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn corrupt_record_reports_key() {
        let store = MemoryRecordStore::new();
        store.write_atomic("latest.json", b"{not json").unwrap();
        let err = store.read_json::<Doc>("latest.json").unwrap_err();
        assert!(err.to_string().contains("latest.json"));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn concurrent_reader_never_sees_partial_metadata() {
        use crate::{now_utc, RunId, TaskMetadata, TaskStatus};
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;

        const KEY: &str = "runs/x/task-meta.json";

        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FsRecordStore::new(temp_dir.path()));
        let run_id = RunId::parse("x").unwrap();
        let meta = TaskMetadata {
            session_id: run_id.session_id(),
            run_id,
            timestamp: now_utc(),
            task_name: "x".into(),
            telegram_group: None,
            cwd: temp_dir.path().to_path_buf(),
            // Large enough that a torn write would show up as a parse error.
            prompt: "p".repeat(64 * 1024),
            timeout: 60,
            allowed_tools: Vec::new(),
            pid: 1,
            background: false,
            status: TaskStatus::Running,
            exit_code: None,
            completed_at: None,
        };
        store.write_json(KEY, &meta).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut reads = 0u32;
                loop {
                    let seen: TaskMetadata = store.read_json(KEY).unwrap().unwrap();
                    match seen.status {
                        TaskStatus::Running => {
                            assert_eq!(seen.exit_code, None);
                            assert_eq!(seen.completed_at, None);
                        }
                        _ => {
                            assert_eq!(seen.status, TaskStatus::Failed);
                            assert_eq!(seen.exit_code, Some(2));
                            assert!(seen.completed_at.is_some());
                        }
                    }
                    reads += 1;
                    if stop.load(Ordering::SeqCst) {
                        return reads;
                    }
                }
            })
        };

        for round in 0..200 {
            store
                .update_json(KEY, |m: &mut TaskMetadata| {
                    if round % 2 == 0 {
                        m.status = TaskStatus::Failed;
                        m.exit_code = Some(2);
                        m.completed_at = Some(now_utc());
                    } else {
                        m.status = TaskStatus::Running;
                        m.exit_code = None;
                        m.completed_at = None;
                    }
                })
                .unwrap();
        }
        stop.store(true, Ordering::SeqCst);

        assert!(reader.join().unwrap() > 0);
    }
}
