//! Capture cycle state machine.
//!
//! ```text
//! Idle -> Polling -> Confirmed -> Recording -> Classifying -> StagedForUpload
//!            |
//!            +-> Rejected | Discarded
//! ```
//!
//! Every failure returns the machine to `Idle`; nothing escalates past a cycle.

mod cycle;
mod state;
#[cfg(test)]
mod tests;

pub use cycle::{EventLifecycle, LifecycleDeps};
pub use state::{CycleOutcome, LifecycleState};
