use super::{ComponentState, FieldcamOrchestrator};
use crate::error::Result;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Longest a loop may take to notice cancellation; a capture cycle in
/// flight finishes first
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

impl FieldcamOrchestrator {
    /// Cancel the loops, wait for them and leave the hardware safe.
    /// The radio keeps its state for the next start.
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        self.cancellation_token.cancel();

        let mut exit_code = 0;
        // uplink first, so a capture in flight can still be staged
        let mut tasks = std::mem::take(&mut self.tasks);
        tasks.reverse();

        for (component, handle) in tasks {
            info!("Stopping {} component", component);
            self.set_component_state(component, ComponentState::Stopping)
                .await;

            match timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    self.set_component_state(component, ComponentState::Stopped)
                        .await;
                    info!("{} component stopped", component);
                }
                Ok(Err(e)) => {
                    self.set_component_state(component, ComponentState::Failed)
                        .await;
                    error!("{} component task failed: {}", component, e);
                    exit_code = 1;
                }
                Err(_) => {
                    self.set_component_state(component, ComponentState::Failed)
                        .await;
                    error!("{} component stop timeout", component);
                    exit_code = 1;
                }
            }
        }

        if self.mode.runs_capture() {
            if let Err(e) = self.collaborators.actuators.set_illumination(false) {
                warn!("Failed to switch illumination off: {}", e);
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }
}
