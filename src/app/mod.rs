mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use orchestrator::{Collaborators, FieldcamOrchestrator};
pub use types::{ComponentState, RunMode, ShutdownReason};
