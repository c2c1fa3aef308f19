//! Read-only inspection of the state directory, plus the consumer
//! acknowledgement of the pending-wake record.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

use kimi_common::process_utils::process_exists;
use kimi_common::{
    now_utc, PendingWakeRecord, RecordStore, RecordStoreExt, RunId, TaskMetadata, TaskResult,
    TaskStatus,
};

use crate::layout::{meta_key_for, run_id_from_session, LATEST_KEY};
use crate::notify::fallback;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<TaskMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_wake: Option<PendingWakeRecord>,
    /// The pending-wake record claims `running` but its run is gone.
    pub pending_wake_stale: bool,
}

/// Gather `latest.json` (or a specific run's metadata) and the pending-wake
/// record. Unparseable documents are errors.
pub fn collect(
    store: &dyn RecordStore,
    run: Option<&RunId>,
    stale_grace: Duration,
) -> Result<StatusReport> {
    let (latest, run_meta) = match run {
        Some(run_id) => {
            let meta: Option<TaskMetadata> = store.read_json(&meta_key_for(run_id))?;
            (None, Some(meta.ok_or_else(|| anyhow::anyhow!("no metadata for run {}", run_id))?))
        }
        None => (store.read_json::<TaskResult>(LATEST_KEY)?, None),
    };

    let pending = fallback::load_pending(store)?;
    let pending_wake_stale = match &pending {
        Some(record) => {
            let owner = run_id_from_session(&record.payload.session_id)
                .map(|id| meta_key_for(&id))
                .and_then(|key| store.read_json::<TaskMetadata>(&key).ok().flatten());
            is_stale(record, owner.as_ref(), now_utc(), stale_grace)
        }
        None => false,
    };

    Ok(StatusReport {
        latest,
        run: run_meta,
        pending_wake: pending,
        pending_wake_stale,
    })
}

/// A `running` record is stale once its owner is known dead, or once the run
/// has outlived its timeout plus `grace`. A deadline that overflows the
/// calendar is treated as not yet reached.
pub fn is_stale(
    record: &PendingWakeRecord,
    owner: Option<&TaskMetadata>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    if record.notified || record.payload.status != TaskStatus::Running {
        return false;
    }
    let grace = ChronoDuration::from_std(grace).ok();
    match owner {
        Some(meta) if meta.status.is_terminal() => true,
        Some(meta) => {
            if !meta.background && !process_exists(meta.pid) {
                return true;
            }
            // A deadline past chrono's range never arrives.
            i64::try_from(meta.timeout)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .and_then(|budget| meta.timestamp.checked_add_signed(budget))
                .and_then(|deadline| deadline.checked_add_signed(grace?))
                .is_some_and(|deadline| now > deadline)
        }
        None => grace
            .and_then(|grace| record.created_at.checked_add_signed(grace))
            .is_some_and(|deadline| now > deadline),
    }
}

pub fn acknowledge(store: &dyn RecordStore) -> Result<Option<PendingWakeRecord>> {
    fallback::acknowledge(store)
}
