//! Engine output capture and the output fallback chain.

use anyhow::{Context, Result};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use strip_ansi_escapes::strip;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use kimi_common::limits::{tail, CAPTURE_TAIL_BUDGET, RESULT_OUTPUT_BUDGET};

pub const NO_OUTPUT_SENTINEL: &str = "(no output available)";
const LISTING_LIMIT: usize = 50;

/// Streams engine output into `output.log` while keeping a bounded tail in
/// memory for the result documents.
pub struct OutputSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    tail: Vec<u8>,
    total_bytes: u64,
    echo: bool,
}

impl OutputSink {
    /// Opens (truncating) the log file. A log that cannot be created degrades
    /// to memory-only capture.
    pub async fn create(path: &Path, echo: bool) -> Self {
        let file = match tokio::fs::File::create(path).await {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Output log unavailable; capturing in memory only");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
            tail: Vec::new(),
            total_bytes: 0,
            echo,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len() as u64;
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.write_all(chunk).await {
                warn!(path = %self.path.display(), error = %err, "Output log write failed; continuing in memory");
                self.file = None;
            }
        }
        if self.echo {
            let mut stderr = tokio::io::stderr();
            let _ = stderr.write_all(chunk).await;
        }

        self.tail.extend_from_slice(chunk);
        if self.tail.len() > CAPTURE_TAIL_BUDGET {
            let excess = self.tail.len() - CAPTURE_TAIL_BUDGET;
            self.tail.drain(..excess);
        }
    }

    pub async fn write_line(&mut self, line: &str) {
        let mut owned = line.to_string();
        if !owned.ends_with('\n') {
            owned.push('\n');
        }
        self.write(owned.as_bytes()).await;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Flush the log and hand back the captured tail as text.
    pub async fn finish(mut self) -> String {
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.flush().await {
                warn!(path = %self.path.display(), error = %err, "Failed to flush output log");
            }
            let _ = file.sync_all().await;
        }
        debug!(path = %self.path.display(), bytes = self.total_bytes, "Output capture finished");
        decode_and_strip(&self.tail)
    }
}

/// Lossy UTF-8 decoding with ANSI escape sequences removed.
pub fn decode_and_strip(bytes: &[u8]) -> String {
    if !bytes.contains(&b'\x1b') {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    match strip(bytes) {
        Ok(clean) => String::from_utf8_lossy(&clean).into_owned(),
        Err(err) => {
            warn!(?err, "Failed to strip ANSI escapes from engine output");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Where to look for output when the captured stream is empty.
#[derive(Debug, Clone)]
pub struct OutputSources {
    pub output_log: PathBuf,
    /// Scratch file a wrapper script may have redirected output into.
    pub scratch_file: PathBuf,
    pub workdir: PathBuf,
}

impl OutputSources {
    pub fn new(output_log: PathBuf, task_name: &str, workdir: PathBuf) -> Self {
        Self {
            output_log,
            scratch_file: scratch_file_for(task_name),
            workdir,
        }
    }
}

/// `$TMPDIR/kimi-<task-name>.out`
pub fn scratch_file_for(task_name: &str) -> PathBuf {
    let safe: String = task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    std::env::temp_dir().join(format!("kimi-{}.out", safe))
}

/// Resolve the output embedded in results: the captured stream, else the
/// output log on disk, else the scratch file, else a listing of the working
/// directory, else a fixed sentinel. The result never exceeds the result
/// budget.
pub fn resolve_output(captured: &str, sources: &OutputSources) -> String {
    let candidates = [
        Some(captured.to_string()),
        read_tail(&sources.output_log).ok(),
        read_tail(&sources.scratch_file).ok(),
        list_workdir(&sources.workdir).ok(),
    ];

    for (stage, candidate) in candidates.into_iter().enumerate() {
        if let Some(text) = candidate {
            if !text.trim().is_empty() {
                if stage > 0 {
                    debug!(stage, "Using fallback output source");
                }
                return tail(&text, RESULT_OUTPUT_BUDGET).to_string();
            }
        }
    }
    NO_OUTPUT_SENTINEL.to_string()
}

/// Last part of a file, decoded and stripped. Reads a window larger than the
/// budget so stripped escape sequences do not starve the tail.
fn read_tail(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata()?.len();
    let window = (RESULT_OUTPUT_BUDGET * 4) as u64;
    if len > window {
        file.seek(SeekFrom::Start(len - window))?;
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(decode_and_strip(&bytes))
}

fn list_workdir(dir: &Path) -> Result<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => format!("{}/", name),
                _ => name,
            }
        })
        .collect();
    if names.is_empty() {
        return Ok(String::new());
    }
    names.sort();
    let total = names.len();
    names.truncate(LISTING_LIMIT);

    let mut text = format!("Working directory {}:\n", dir.display());
    for name in &names {
        text.push_str("  ");
        text.push_str(name);
        text.push('\n');
    }
    if total > LISTING_LIMIT {
        text.push_str(&format!("  ... {} more\n", total - LISTING_LIMIT));
    }
    Ok(text)
}
