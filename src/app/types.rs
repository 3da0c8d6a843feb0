use serde::{Deserialize, Serialize};
use std::fmt;

/// Component lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    UserRequest,
}

/// Which loops this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Capture and uplink in one process
    All,
    /// Event lifecycle only
    Capture,
    /// Uplink manager only
    Uplink,
}

impl RunMode {
    pub fn runs_capture(self) -> bool {
        matches!(self, RunMode::All | RunMode::Capture)
    }

    pub fn runs_uplink(self) -> bool {
        matches!(self, RunMode::All | RunMode::Uplink)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::All => f.write_str("all"),
            RunMode::Capture => f.write_str("capture"),
            RunMode::Uplink => f.write_str("uplink"),
        }
    }
}
