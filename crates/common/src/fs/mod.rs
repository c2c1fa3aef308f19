mod atomic_write;

pub use atomic_write::{atomic_write, ensure_private_dir};
