//! Crash-safe audit log of capture and upload activity.
//!
//! Every operation runs inside its own exclusive SQLite transaction on a
//! fresh connection with a rollback journal, so after a crash the store
//! reflects exactly the last committed operation.

mod store;
#[cfg(test)]
mod tests;

pub use store::{DurableLogStore, LogTransaction};

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Datestamp layout; lexical order equals chronological order
pub const DATESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTable {
    Capture,
    Upload,
}

impl LogTable {
    pub const ALL: [LogTable; 2] = [LogTable::Capture, LogTable::Upload];

    pub fn table_name(&self) -> &'static str {
        match self {
            LogTable::Capture => "capture_logs",
            LogTable::Upload => "upload_logs",
        }
    }
}

impl FromStr for LogTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capture" | "capture_logs" => Ok(LogTable::Capture),
            "upload" | "upload_logs" => Ok(LogTable::Upload),
            other => Err(format!("unknown log table: {other}")),
        }
    }
}

impl fmt::Display for LogTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogCategory {
    EventCaptured,
    EventRejected,
    CheckedMotion,
    CameraError,
    StorageError,
    FrameUpload,
    UploadBackoff,
    RadioPower,
    FrameQuarantined,
    Other(String),
}

impl LogCategory {
    pub fn as_str(&self) -> &str {
        match self {
            LogCategory::EventCaptured => "EVENT_CAPTURED",
            LogCategory::EventRejected => "EVENT_REJECTED",
            LogCategory::CheckedMotion => "CHECKED_MOTION",
            LogCategory::CameraError => "CAMERA_ERROR",
            LogCategory::StorageError => "STORAGE_ERROR",
            LogCategory::FrameUpload => "FRAME_UPLOAD",
            LogCategory::UploadBackoff => "UPLOAD_BACKOFF",
            LogCategory::RadioPower => "RADIO_POWER",
            LogCategory::FrameQuarantined => "FRAME_QUARANTINED",
            LogCategory::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "EVENT_CAPTURED" => LogCategory::EventCaptured,
            "EVENT_REJECTED" => LogCategory::EventRejected,
            "CHECKED_MOTION" => LogCategory::CheckedMotion,
            "CAMERA_ERROR" => LogCategory::CameraError,
            "STORAGE_ERROR" => LogCategory::StorageError,
            "FRAME_UPLOAD" => LogCategory::FrameUpload,
            "UPLOAD_BACKOFF" => LogCategory::UploadBackoff,
            "RADIO_POWER" => LogCategory::RadioPower,
            "FRAME_QUARANTINED" => LogCategory::FrameQuarantined,
            other => LogCategory::Other(other.to_string()),
        }
    }

    /// Table an entry of this category is written to
    pub fn table(&self) -> LogTable {
        match self {
            LogCategory::FrameUpload
            | LogCategory::UploadBackoff
            | LogCategory::RadioPower
            | LogCategory::FrameQuarantined => LogTable::Upload,
            _ => LogTable::Capture,
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Unique per table; assigned at append time
    pub datestamp: String,
    pub category: LogCategory,
    /// True until delivery of the described work is confirmed
    pub pending: bool,
    pub message: String,
    pub table: LogTable,
}

impl LogEntry {
    /// New pending entry stamped with the current UTC time
    pub fn new(category: LogCategory, message: impl Into<String>) -> Self {
        let table = category.table();
        Self {
            datestamp: format_datestamp(Utc::now().naive_utc()),
            category,
            pending: true,
            message: message.into(),
            table,
        }
    }

    /// Entry recording something that needs no delivery confirmation
    pub fn settled(category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            pending: false,
            ..Self::new(category, message)
        }
    }

}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<14} {} {}",
            self.datestamp,
            self.category,
            if self.pending { "pending" } else { "done   " },
            self.message
        )
    }
}

pub fn format_datestamp(at: NaiveDateTime) -> String {
    at.format(DATESTAMP_FORMAT).to_string()
}

pub fn parse_datestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATESTAMP_FORMAT).ok()
}

/// Pending entries of both tables, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingEntries {
    pub capture: Vec<LogEntry>,
    pub upload: Vec<LogEntry>,
}

impl PendingEntries {
    pub fn is_empty(&self) -> bool {
        self.capture.is_empty() && self.upload.is_empty()
    }

    pub fn len(&self) -> usize {
        self.capture.len() + self.upload.len()
    }
}
