use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create `dir` (and parents) if missing. On unix the leaf is created 0700.
#[cfg(target_family = "unix")]
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .mode(0o700)
        .recursive(true)
        .create(dir)
        .with_context(|| format!("failed to create directory '{}'", dir.display()))
}

#[cfg(not(target_family = "unix"))]
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory '{}'", dir.display()))
}

/// Replace `path` with `content` so that readers only ever see the old or the
/// new document:
/// - write to a sibling temp file (0600 on unix)
/// - fsync file
/// - rename over the target
/// - fsync directory
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_private_dir(&parent)?;

    let temp_path = temp_sibling(path);
    let result = write_and_rename(&temp_path, path, content);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;

    #[cfg(target_family = "unix")]
    {
        // Directory fsync makes the rename itself durable.
        if let Ok(dir) = File::open(&parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

fn write_and_rename(temp_path: &Path, final_path: &Path, content: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);

    let mut file = options
        .open(temp_path)
        .with_context(|| format!("failed to create temp file '{}'", temp_path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write temp file '{}'", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to fsync '{}'", temp_path.display()))?;
    drop(file);

    fs::rename(temp_path, final_path).with_context(|| {
        format!(
            "failed to rename '{}' over '{}'",
            temp_path.display(),
            final_path.display()
        )
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "record".to_string());
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("doc.json");

        atomic_write(&path, b"{\"v\":1}").unwrap();
        atomic_write(&path, b"{\"v\":2}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");

        for i in 0..5 {
            atomic_write(&path, format!("{i}").as_bytes()).unwrap();
        }

        let entries: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["doc.json".to_string()]);
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn atomic_write_uses_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secret.json");
        atomic_write(&path, b"{}").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
