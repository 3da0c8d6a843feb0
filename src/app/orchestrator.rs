use super::types::{ComponentState, RunMode, ShutdownReason};
use crate::actuators::{self, Actuators, MockActuators};
use crate::camera::{self, CameraOpener, SyntheticOpener};
use crate::config::FieldcamConfig;
use crate::error::Result;
use crate::logstore::DurableLogStore;
use crate::params::{ConfigProvider, HttpConfigProvider, ParameterStore, StaticConfigProvider};
use crate::recorder::EventRecorder;
use crate::uplink::{radio, HttpRemoteSink, MockRemoteSink, MockRadio, Radio, RemoteSink};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External collaborators injected into the loops
pub struct Collaborators {
    pub camera: Arc<dyn CameraOpener>,
    pub actuators: Arc<dyn Actuators>,
    pub provider: Arc<dyn ConfigProvider>,
    pub sink: Arc<dyn RemoteSink>,
    pub radio: Arc<dyn Radio>,
}

impl Collaborators {
    /// Hardware and network backends selected by the configuration
    pub fn from_config(config: &FieldcamConfig) -> Result<Self> {
        let tz = config.node.tz()?;
        let timeout = Duration::from_secs(config.remote.request_timeout_seconds);

        Ok(Self {
            camera: camera::opener_from_config(&config.camera)?,
            actuators: actuators::from_config(&config.actuators),
            provider: Arc::new(HttpConfigProvider::new(
                &config.remote.site_url,
                &config.remote.token,
                timeout,
                config.storage.params_cache_path(),
                config.storage.base(),
            )),
            sink: Arc::new(HttpRemoteSink::new(
                &config.remote.site_url,
                &config.remote.token,
                timeout,
                tz,
            )),
            radio: radio::from_config(&config.actuators),
        })
    }

    /// Synthetic camera and in-memory collaborators; nothing leaves the node
    pub fn offline(config: &FieldcamConfig) -> Self {
        let (width, height) = config.camera.resolution;
        Self {
            camera: Arc::new(SyntheticOpener::still(width, height)),
            actuators: Arc::new(MockActuators::new()),
            provider: Arc::new(StaticConfigProvider::new(config.node.defaults.clone())),
            sink: Arc::new(MockRemoteSink::new()),
            radio: Arc::new(MockRadio::new()),
        }
    }
}

/// Main application coordinator: wires the components and owns the loop tasks
pub struct FieldcamOrchestrator {
    pub(super) config: FieldcamConfig,
    pub(super) mode: RunMode,
    pub(super) collaborators: Collaborators,
    pub(super) recorder: EventRecorder,

    // Set by initialize()
    pub(super) store: Option<Arc<DurableLogStore>>,
    pub(super) params: Option<Arc<ParameterStore>>,

    // Lifecycle management
    pub(super) tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl FieldcamOrchestrator {
    /// Orchestrator over the configured hardware and network backends
    pub fn new(config: FieldcamConfig, mode: RunMode) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::with_collaborators(config, mode, collaborators))
    }

    pub fn with_collaborators(
        config: FieldcamConfig,
        mode: RunMode,
        collaborators: Collaborators,
    ) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let recorder = EventRecorder::new(&config.storage);

        info!(
            "Fieldcam orchestrator created (mode {}, camera {})",
            mode,
            collaborators.camera.describe()
        );

        Self {
            config,
            mode,
            collaborators,
            recorder,
            store: None,
            params: None,
            tasks: Vec::new(),
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn config(&self) -> &FieldcamConfig {
        &self.config
    }

    /// Ask a running orchestrator to shut down
    pub async fn request_shutdown(&self) {
        if let Some(sender) = self.shutdown_sender.lock().await.take() {
            let _ = sender.send(ShutdownReason::UserRequest);
        }
    }
}
