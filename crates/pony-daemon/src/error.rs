//! Error types for the ponycloud daemons.

use pony_rpc::RouterError;

/// Exit code for configuration problems.
pub const EXIT_CONFIG: u8 = 2;

/// Exit code for every other startup or runtime failure.
pub const EXIT_FAILURE: u8 = 1;

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Neither `-c` nor a default config location is available
    #[error("Cannot determine config directory; pass --config")]
    NoConfigDir,

    /// Runtime error
    #[error("{0}")]
    Core(#[from] pony_core::Error),

    /// State model misuse
    #[error(transparent)]
    Model(#[from] pony_core::ModelError),

    /// Routing or delivery failure
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    /// Agent does not implement the requested action
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Invalid action parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

impl DaemonError {
    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::NoConfigDir
            | DaemonError::Core(
                pony_core::Error::Config(_)
                | pony_core::Error::ConfigNotFound(_)
                | pony_core::Error::Json(_),
            ) => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
