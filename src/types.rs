use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type ScanId = i64;

/// Lifecycle of a scan. Only ever moves forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// `pending -> running -> {completed, failed}`, plus `pending -> failed`
    /// for scans that never get a process (rejected arguments, cancelled while queued).
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scan request as accepted from the request layer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct NewScan {
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub scan_type: String,
    pub tool: String,
    pub target: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// A persisted scan record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub id: ScanId,
    pub project_id: Option<i64>,
    pub scan_type: String,
    pub tool: String,
    pub target: String,
    pub parameters: BTreeMap<String, String>,
    pub status: ScanStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_output: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// One structured fact extracted from tool output or produced by a probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub result_type: String,
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Finding {
    pub fn new(result_type: &str, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            result_type: result_type.to_string(),
            key: key.into(),
            value: value.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details.to_string());
        self
    }
}

/// A persisted finding row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    pub id: i64,
    pub scan_id: ScanId,
    #[serde(flatten)]
    pub finding: Finding,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of live tool output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub stream: Stream,
    pub line: String,
}

impl OutputLine {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self::now(Stream::Stdout, line)
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self::now(Stream::Stderr, line)
    }

    pub fn now(stream: Stream, line: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            stream,
            line: line.into(),
        }
    }
}

/// Terminal marker for a scan topic. Nothing follows it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DoneMarker {
    pub done: bool,
    pub status: ScanStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Event pushed to live observers of a scan.
///
/// Serialized untagged: progress is `{timestamp, stream, line}` and the
/// terminal event is `{done: true, status, timestamp}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum LiveEvent {
    Done(DoneMarker),
    Line(OutputLine),
}

impl LiveEvent {
    pub fn done(status: ScanStatus) -> Self {
        LiveEvent::Done(DoneMarker {
            done: true,
            status,
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, LiveEvent::Done(_))
    }
}

impl From<OutputLine> for LiveEvent {
    fn from(line: OutputLine) -> Self {
        LiveEvent::Line(line)
    }
}
