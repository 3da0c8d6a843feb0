pub mod actuators;
pub mod analyzer;
pub mod app;
pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod logstore;
pub mod params;
pub mod recorder;
pub mod recovery;
pub mod uplink;

pub use app::{Collaborators, ComponentState, FieldcamOrchestrator, RunMode, ShutdownReason};
pub use config::FieldcamConfig;
pub use error::{FieldcamError, Result};
pub use frame::Frame;
pub use lifecycle::{CycleOutcome, EventLifecycle, LifecycleState};
pub use logstore::{DurableLogStore, LogCategory, LogEntry, LogTable};
pub use recorder::{Classification, EventRecorder, EventLocation};
pub use uplink::{TickOutcome, UplinkManager};
