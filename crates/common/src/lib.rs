// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod limits;
pub mod process_utils;
pub mod records;
pub mod store;

pub use records::{
    now_utc, PendingWakePayload, PendingWakeRecord, RunId, TaskMetadata, TaskResult, TaskStatus,
    WakeEvent, WakeEventPayload, WAKE_EVENT_TYPE,
};
pub use store::{FsRecordStore, MemoryRecordStore, RecordStore, RecordStoreExt};
