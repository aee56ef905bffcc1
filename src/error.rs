//! Error types shared by every storecast component.
//!
//! The variants follow the failure taxonomy of the broadcast core: most
//! failures degrade to "retry next tick" or "skip this one item", and none of
//! them is meant to terminate the host process.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The scheduling repository could not be reached or returned garbage.
    /// Retried on the next cycle; no schedule data is lost.
    #[error("Repository error: {0}")]
    TransientRepository(String),

    /// A playback device command failed. Aborts the current cycle.
    #[error("Device error: {0}")]
    DeviceProtocol(String),

    /// One slot or file is unusable (unknown category prefix, missing file).
    /// Only that item is skipped.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// The device reported a state the playback protocol declares impossible.
    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task '{task}' has a non-positive interval ({interval}s)")]
    InvalidInterval { task: String, interval: i64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the same operation may succeed on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientRepository(_) | Error::DeviceProtocol(_) | Error::Io(_)
        )
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Error::TransientRepository(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Error::DeviceProtocol(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }
}
