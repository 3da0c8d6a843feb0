use crate::recorder::EventId;
use std::fmt;
use std::time::Duration;

/// Capture cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Polling,
    Confirmed,
    Recording,
    Classifying,
    StagedForUpload,
    Rejected,
    Discarded,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            // every state may fall back to Idle on failure
            (_, Idle) => true,
            (Idle, Polling) => true,
            (Polling, Confirmed | Rejected | Discarded) => true,
            (Confirmed, Recording) => true,
            (Recording, Classifying) => true,
            (Classifying, StagedForUpload) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::StagedForUpload | LifecycleState::Rejected | LifecycleState::Discarded
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What one pass through the state machine produced
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Capture disabled; sleep before the next cycle
    Paused { sleep: Duration },
    /// Confirmed event moved into the upload queue
    Captured {
        id: EventId,
        magnitude: f64,
        frames: usize,
    },
    /// Triggered but unconfirmed probe kept as a false-positive sample
    Rejected { id: EventId, magnitudes: Vec<f64> },
    /// Nothing written
    Discarded { magnitudes: Vec<f64> },
    /// Camera unusable this cycle
    CameraFailed { retry_in: Duration },
    /// Writing the event failed; nothing left in staging
    StorageFailed,
}

impl CycleOutcome {
    /// Pause the loop takes before starting the next cycle
    pub fn pause(&self) -> Duration {
        match self {
            CycleOutcome::Paused { sleep } => *sleep,
            CycleOutcome::CameraFailed { retry_in } => *retry_in,
            _ => Duration::ZERO,
        }
    }
}
