//! Queue drain, retry/backoff, radio power policy and log shipping.

mod manager;
mod queue;
pub mod radio;
mod sink;
mod state;

pub use manager::{TickOutcome, UplinkDeps, UplinkManager};
pub use queue::{PendingFrame, UploadQueue};
pub use radio::{MockRadio, Radio, SysfsRadio};
pub use sink::{HttpRemoteSink, MockRemoteSink, RecordedUpload, RemoteSink};
pub use state::{UplinkPolicy, UplinkState};
