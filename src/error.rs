//! Error types for the enrichment pipeline
//!
//! Only coordinator misuse and subscription failures reach callers as hard
//! errors. Everything else is absorbed by the component that hit it and
//! degrades the affected record field.

use crate::models::Pid;

/// Errors produced by procinfo operations
#[derive(Debug, thiserror::Error)]
pub enum ProcInfoError {
    /// Raw event code with no lifecycle mapping
    #[error("Malformed event: unrecognized event code {code}")]
    MalformedEvent { code: u16 },

    /// File vanished or was unreadable while hashing or signing
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Signature verification backend failed or timed out
    #[error("Trust evaluation failed: {0}")]
    TrustService(String),

    #[error("Process monitoring is already active")]
    AlreadyMonitoring,

    #[error("Process monitoring is not active")]
    NotMonitoring,

    /// Pid no longer present in the process table
    #[error("Process {0} is no longer resolvable")]
    ProcessVanished(Pid),

    /// Event source could not be opened or read
    #[error("Event source error: {0}")]
    Source(String),
}

impl ProcInfoError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcInfoError>;
