//! Error types shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for device operations.
///
/// `Config` and `Resolution` are fatal to the command that hit them.
/// `Environment` failures carry a remediation hint where one exists.
/// `Transient` failures are recovered locally (retry, escalation, reconnect)
/// and only surface when recovery is exhausted.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Resolution(String),

    #[error("{0}")]
    Environment(String),

    #[error("{0}")]
    Transient(String),

    #[error("'{name}' is locked by {owner} (purpose: {purpose})")]
    LockConflict {
        name: String,
        owner: String,
        purpose: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),
}
