use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::State;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Router error: {0}")]
    Router(#[from] pony_rpc::RouterError),

    #[error("Manager error: {0}")]
    Manager(#[source] anyhow::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl Error {
    /// True for failures that should end the process before it serves.
    #[must_use]
    pub fn is_startup_failure(&self) -> bool {
        match self {
            Error::Config(_) | Error::ConfigNotFound(_) | Error::Json(_) => true,
            Error::Router(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// An inbound payload that does not match the event type registered for its
/// kind.
#[derive(Error, Debug)]
#[error("Malformed {kind} payload from {sender}: {source}")]
pub struct DecodeError {
    pub kind: String,
    pub sender: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Duplicate table: {0}")]
    DuplicateTable(String),

    #[error("Table {table} is indexed through unknown join table {join_table}")]
    UnknownJoinTable { table: String, join_table: String },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid lifecycle transition: {from} -> {to}")]
pub struct LifecycleError {
    pub from: State,
    pub to: State,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use pony_rpc::{RouterError, TransportError};

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing messaging.address".to_string());
        assert_eq!(err.to_string(), "Config error: missing messaging.address");
    }

    #[test]
    fn test_error_display_config_not_found() {
        let err = Error::ConfigNotFound(PathBuf::from("/etc/ponycloud/sparkle.json"));
        assert_eq!(
            err.to_string(),
            "Config file not found: /etc/ponycloud/sparkle.json"
        );
    }

    #[test]
    fn test_lifecycle_error_is_transparent() {
        let err: Error = LifecycleError {
            from: State::Stopped,
            to: State::Running,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid lifecycle transition: stopped -> running"
        );
    }

    #[test]
    fn test_decode_error_display() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = DecodeError {
            kind: "status".to_string(),
            sender: "luna".to_string(),
            source,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Malformed status payload from luna"));
    }

    #[test]
    fn test_model_error_is_transparent() {
        let err: Error = ModelError::UnknownTable("volume".to_string()).into();
        assert_eq!(err.to_string(), "Unknown table: volume");
        assert!(!err.is_startup_failure());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_startup_failure_classification() {
        assert!(Error::Config("x".to_string()).is_startup_failure());
        assert!(Error::Router(RouterError::Bind(TransportError::Closed)).is_startup_failure());
        assert!(!Error::Router(RouterError::NoRecipient).is_startup_failure());
        assert!(!Error::Manager(anyhow::anyhow!("boom")).is_startup_failure());
    }
}
