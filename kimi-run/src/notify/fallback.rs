//! The pending-wake record: the durable, always-attempted notification that a
//! polling consumer picks up when no network channel got through.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use kimi_common::{PendingWakePayload, PendingWakeRecord, RecordStore, RecordStoreExt, TaskMetadata};

use super::CompletionNotice;
use crate::layout::PENDING_WAKE_KEY;

/// Written when a dispatch starts, so a crash before completion still leaves
/// a record pointing at the run.
pub fn record_dispatch_start(
    store: &dyn RecordStore,
    meta: &TaskMetadata,
    result_file: &Path,
) -> Result<()> {
    let record = PendingWakeRecord::new(PendingWakePayload {
        session_id: meta.session_id.clone(),
        task_name: meta.task_name.clone(),
        status: meta.status,
        timestamp: meta.timestamp,
        workdir: meta.cwd.clone(),
        result_file: result_file.to_path_buf(),
    });
    store
        .write_json(PENDING_WAKE_KEY, &record)
        .context("failed to write pending-wake record")?;
    debug!(session_id = %meta.session_id, "Pending-wake record armed");
    Ok(())
}

pub fn record_completion(store: &dyn RecordStore, notice: &CompletionNotice) -> Result<()> {
    let record = PendingWakeRecord::new(PendingWakePayload {
        session_id: notice.session_id.clone(),
        task_name: notice.task_name.clone(),
        status: notice.status,
        timestamp: notice.timestamp,
        workdir: notice.workdir.clone(),
        result_file: notice.result_file.clone(),
    });
    store
        .write_json(PENDING_WAKE_KEY, &record)
        .context("failed to write pending-wake record")
}

pub fn load_pending(store: &dyn RecordStore) -> Result<Option<PendingWakeRecord>> {
    store.read_json(PENDING_WAKE_KEY)
}

/// Consumer acknowledgement: flip `notified` on the current record.
pub fn acknowledge(store: &dyn RecordStore) -> Result<Option<PendingWakeRecord>> {
    if !store.exists(PENDING_WAKE_KEY) {
        return Ok(None);
    }
    let record = store.update_json(PENDING_WAKE_KEY, |record: &mut PendingWakeRecord| {
        record.notified = true;
    })?;
    Ok(Some(record))
}
