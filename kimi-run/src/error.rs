use thiserror::Error;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_INVALID_INVOCATION: i32 = 1;
pub const EXIT_DUPLICATE: i32 = 2;
/// Engine killed after exceeding its wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Engine binary could not be started.
pub const EXIT_ENGINE_UNAVAILABLE: i32 = 127;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Failures that end a dispatcher invocation before (or instead of) a task
/// exit code.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("duplicate trigger rejected: last dispatch was less than {window_ms}ms ago")]
    Duplicate { window_ms: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DispatchError::InvalidInvocation(message.into())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchError::InvalidInvocation(_) => EXIT_INVALID_INVOCATION,
            DispatchError::Duplicate { .. } => EXIT_DUPLICATE,
            DispatchError::Internal(_) => EXIT_INVALID_INVOCATION,
        }
    }
}

/// Map an arbitrary task exit code onto a process exit status byte.
pub fn exit_status_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_INVALID_INVOCATION as u8)
}
