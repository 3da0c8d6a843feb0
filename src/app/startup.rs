use super::{ComponentState, FieldcamOrchestrator};
use crate::camera::FrameSource;
use crate::error::{FieldcamError, Result};
use crate::lifecycle::{EventLifecycle, LifecycleDeps};
use crate::logstore::DurableLogStore;
use crate::params::{ParameterRefresher, ParameterStore};
use crate::uplink::{UplinkDeps, UplinkManager, UploadQueue};
use crate::recorder::EventLocation;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

impl FieldcamOrchestrator {
    /// Prepare storage, open the log store and load the parameter snapshot
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing fieldcam components");

        let discarded = self.recorder.prepare().await?;
        if discarded > 0 {
            info!("Recovered from interrupted capture ({} staged events removed)", discarded);
        }

        let store = DurableLogStore::open(
            &self.config.storage.database_path(),
            self.config.storage.lock_timeout(),
        )
        .await?;
        self.store = Some(Arc::new(store));

        let params = ParameterStore::load(
            &self.config.storage.params_cache_path(),
            self.config.node.defaults.clone(),
        )
        .await;
        self.params = Some(Arc::new(params));

        let queue = UploadQueue::new(
            self.recorder
                .location_dir(EventLocation::PendingUpload)
                .to_path_buf(),
        );
        let pending = queue.pending_frames().await?;
        info!(
            "{} event(s) with {} frame(s) awaiting upload",
            pending.len(),
            pending.iter().map(|(_, frames)| frames.len()).sum::<usize>()
        );

        let mut states = self.component_states.lock().await;
        if self.mode.runs_capture() {
            states.insert("params".to_string(), ComponentState::Stopped);
            states.insert("lifecycle".to_string(), ComponentState::Stopped);
        }
        if self.mode.runs_uplink() {
            states.insert("uplink".to_string(), ComponentState::Stopped);
        }
        drop(states);

        info!("All components initialized successfully");
        Ok(())
    }

    /// Spawn the loops this process runs
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting fieldcam ({} mode)", self.mode);

        let store = self
            .store
            .clone()
            .ok_or_else(|| FieldcamError::system("start() called before initialize()"))?;
        let params = self
            .params
            .clone()
            .ok_or_else(|| FieldcamError::system("start() called before initialize()"))?;

        if self.mode.runs_capture() {
            self.set_component_state("params", ComponentState::Starting)
                .await;
            let refresher = ParameterRefresher::new(
                Arc::clone(&self.collaborators.provider),
                Arc::clone(&params),
            );
            let cancel = self.cancellation_token.child_token();
            self.tasks
                .push(("params", tokio::spawn(refresher.run(cancel))));
            self.set_component_state("params", ComponentState::Running)
                .await;

            self.set_component_state("lifecycle", ComponentState::Starting)
                .await;
            let tz = self.config.node.tz()?;
            let deps = LifecycleDeps {
                source: FrameSource::new(
                    Arc::clone(&self.collaborators.camera),
                    Arc::clone(&self.collaborators.actuators),
                    self.config.camera.warm_up_frames,
                ),
                recorder: self.recorder.clone(),
                store: Arc::clone(&store),
                params: Arc::clone(&params),
                provider: Arc::clone(&self.collaborators.provider),
                actuators: Arc::clone(&self.collaborators.actuators),
            };
            let lifecycle = EventLifecycle::new(deps, self.config.lifecycle.clone(), tz);
            let cancel = self.cancellation_token.child_token();
            self.tasks
                .push(("lifecycle", tokio::spawn(lifecycle.run(cancel))));
            self.set_component_state("lifecycle", ComponentState::Running)
                .await;
            info!("Event lifecycle started");
        }

        if self.mode.runs_uplink() {
            self.set_component_state("uplink", ComponentState::Starting)
                .await;
            let deps = UplinkDeps {
                recorder: self.recorder.clone(),
                store: Arc::clone(&store),
                sink: Arc::clone(&self.collaborators.sink),
                radio: Arc::clone(&self.collaborators.radio),
                params: Arc::clone(&params),
            };
            let manager = match UplinkManager::start(
                deps,
                self.config.uplink.clone(),
                self.config.storage.uplink_state_path(),
                Utc::now(),
            )
            .await
            {
                Ok(manager) => manager,
                Err(e) => {
                    self.set_component_state("uplink", ComponentState::Failed)
                        .await;
                    error!("Failed to start uplink manager: {}", e);
                    return Err(e.into());
                }
            };
            let cancel = self.cancellation_token.child_token();
            self.tasks
                .push(("uplink", tokio::spawn(manager.run(cancel))));
            self.set_component_state("uplink", ComponentState::Running)
                .await;
            info!("Uplink manager started");
        }

        info!("Fieldcam started successfully");
        Ok(())
    }
}
