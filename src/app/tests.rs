use super::*;
use crate::actuators::MockActuators;
use crate::camera::{square_frame, SyntheticOpener};
use crate::config::FieldcamConfig;
use crate::params::StaticConfigProvider;
use crate::uplink::{MockRadio, MockRemoteSink};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    config: FieldcamConfig,
    actuators: Arc<MockActuators>,
    sink: Arc<MockRemoteSink>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = FieldcamConfig::default();
    config.storage.base_path = dir.path().to_string_lossy().to_string();
    config.camera.warm_up_frames = 0;
    config.lifecycle.trigger_wait_seconds = 0;
    config.lifecycle.trigger_poll_ms = 1;
    config.uplink.poll_interval_ms = 10;
    config.uplink.upload_resolution = (16, 12);
    config.node.defaults.motion_interval = 2;
    config.node.defaults.video_interval = 2;
    config.node.defaults.frames_per_sec = 1;
    config.node.defaults.day_threshold = 50.0;
    config.node.defaults.night_threshold = 50.0;

    Fixture {
        _dir: dir,
        config,
        actuators: Arc::new(MockActuators::new()),
        sink: Arc::new(MockRemoteSink::new()),
    }
}

impl Fixture {
    fn orchestrator(&self, mode: RunMode, camera: SyntheticOpener) -> FieldcamOrchestrator {
        let collaborators = Collaborators {
            camera: Arc::new(camera),
            actuators: self.actuators.clone(),
            provider: Arc::new(StaticConfigProvider::new(self.config.node.defaults.clone())),
            sink: self.sink.clone(),
            radio: Arc::new(MockRadio::new()),
        };
        FieldcamOrchestrator::with_collaborators(self.config.clone(), mode, collaborators)
    }
}

fn moving_scene() -> SyntheticOpener {
    SyntheticOpener::new(vec![
        square_frame(64, 48, None),
        square_frame(64, 48, Some((20, 10, 16))),
    ])
}

fn has_frames(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|events| {
            events
                .filter_map(|e| e.ok())
                .any(|e| std::fs::read_dir(e.path()).map(|mut f| f.next().is_some()).unwrap_or(false))
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn test_initialize_registers_components_for_mode() {
    let f = fixture();

    let mut all = f.orchestrator(RunMode::All, SyntheticOpener::still(64, 48));
    all.initialize().await.unwrap();
    let states = all.get_all_component_states().await;
    assert_eq!(states.len(), 3);
    assert!(states.values().all(|s| *s == ComponentState::Stopped));
    assert!(f.config.storage.database_path().exists());
    assert!(f.config.storage.events_dir().is_dir());
    assert!(f.config.storage.staging_dir().is_dir());

    let mut uplink = f.orchestrator(RunMode::Uplink, SyntheticOpener::still(64, 48));
    uplink.initialize().await.unwrap();
    let states = uplink.get_all_component_states().await;
    assert_eq!(states.len(), 1);
    assert_eq!(
        uplink.get_component_state("uplink").await,
        Some(ComponentState::Stopped)
    );
    assert_eq!(uplink.get_component_state("lifecycle").await, None);
}

#[tokio::test]
async fn test_start_requires_initialize() {
    let f = fixture();
    let mut orchestrator = f.orchestrator(RunMode::All, SyntheticOpener::still(64, 48));
    assert!(orchestrator.start().await.is_err());
}

#[tokio::test]
async fn test_capture_mode_spawns_only_capture_loops() {
    let f = fixture();
    let mut orchestrator = f.orchestrator(RunMode::Capture, SyntheticOpener::still(64, 48));
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await.unwrap();

    assert_eq!(
        orchestrator.get_component_state("lifecycle").await,
        Some(ComponentState::Running)
    );
    assert_eq!(orchestrator.get_component_state("uplink").await, None);

    let exit_code = orchestrator.shutdown().await.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(
        orchestrator.get_component_state("lifecycle").await,
        Some(ComponentState::Stopped)
    );
    assert!(!f.actuators.illumination_on());
    assert_eq!(f.sink.attempts(), 0);
}

#[tokio::test]
async fn test_captured_frames_reach_done() {
    let f = fixture();
    let mut orchestrator = f.orchestrator(RunMode::All, moving_scene());
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await.unwrap();

    let done = f.config.storage.done_dir();
    let delivered = tokio::time::timeout(Duration::from_secs(10), async {
        while f.sink.uploads().is_empty() || !has_frames(&done) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "no frame was delivered");

    assert_eq!(orchestrator.shutdown().await.unwrap(), 0);
    let upload = &f.sink.uploads()[0];
    assert_eq!(upload.event_id.len(), 32);
    assert!(upload.bytes > 0);
}

#[tokio::test]
async fn test_run_returns_after_shutdown_request() {
    let f = fixture();
    let mut orchestrator = f.orchestrator(RunMode::Uplink, SyntheticOpener::still(64, 48));
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await.unwrap();

    orchestrator.request_shutdown().await;
    let exit_code = tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
        .await
        .expect("run did not return")
        .unwrap();
    assert_eq!(exit_code, 0);
    assert!(f.config.storage.uplink_state_path().exists());
}
