use std::fmt::Display;

/// Failure reported by the platform media-session service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("media session registry is unavailable: {0}")]
    Unavailable(String),

    #[error("{call} failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("media session has been closed")]
    SessionClosed,
}

impl PlatformError {
    pub fn call(call: &'static str, err: impl Display) -> Self {
        PlatformError::Call {
            call,
            message: err.to_string(),
        }
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Startup failures of the session tracker. Everything after startup is
/// logged and swallowed instead.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to acquire the media session registry: {0}")]
    Acquire(#[source] PlatformError),

    #[error("failed to start the session tracker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("session tracker stopped before it finished initializing")]
    InitAborted,
}
