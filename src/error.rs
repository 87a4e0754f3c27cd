use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ScanId, ScanStatus};

/// Errors reported synchronously to the caller of `Executor::start`.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("scan {0} not found")]
    NotFound(ScanId),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: ScanStatus, to: ScanStatus },
}

/// Raised while turning a scan into a `ToolSpec`; no process is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("{0} is required")]
    MissingParameter(&'static str),
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("process i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("exited with status {code}")]
    Exit { code: i32 },
}

impl RunError {
    /// True when the process was stopped on purpose rather than failing.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, RunError::Cancelled | RunError::TimedOut(_))
    }
}

/// Errors from in-process probes.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("TLS connection failed: {0}")]
    Tls(String),

    #[error("certificate parse failed: {0}")]
    Certificate(String),

    #[error("fetch URL: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,
}
