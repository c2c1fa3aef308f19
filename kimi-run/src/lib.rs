//! kimi-run: exactly-once dispatch of `kimi` engine tasks with durable
//! results and fault-tolerant completion notifications.

pub mod capture;
pub mod config;
pub mod dedup_lock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod notify;
pub mod signals;
pub mod status;
pub mod supervisor;

pub use config::HooksConfig;
pub use dispatcher::{DispatchMode, Dispatcher};
pub use error::DispatchError;
pub use lifecycle::{TaskLifecycle, TaskSpec};
