use super::*;
use crate::actuators::{ActuatorCall, MockActuators};
use crate::camera::{square_frame, CameraOpener, FrameSource, SyntheticOpener};
use crate::config::FieldcamConfig;
use crate::logstore::{DurableLogStore, LogCategory, LogTable};
use crate::params::{NodeParameters, ParameterStore, StaticConfigProvider};
use crate::recorder::EventRecorder;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: TempDir,
    base: std::path::PathBuf,
    store: Arc<DurableLogStore>,
    params: Arc<ParameterStore>,
    actuators: Arc<MockActuators>,
    lifecycle: EventLifecycle,
}

fn test_params() -> NodeParameters {
    let mut params = FieldcamConfig::default().node.defaults;
    params.motion_interval = 2;
    params.video_interval = 3;
    params.frames_per_sec = 1;
    params.day_threshold = 50.0;
    params.night_threshold = 50.0;
    params
}

async fn harness(opener: SyntheticOpener, retain_false_positives: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = FieldcamConfig::default();
    config.storage.base_path = dir.path().to_string_lossy().to_string();
    config.camera.warm_up_frames = 0;
    config.lifecycle.trigger_wait_seconds = 0;
    config.lifecycle.trigger_poll_ms = 1;
    config.lifecycle.retain_false_positives = retain_false_positives;
    config.lifecycle.camera_retry_base_ms = 100;

    let recorder = EventRecorder::new(&config.storage);
    recorder.prepare().await.unwrap();
    let store = Arc::new(
        DurableLogStore::open(&config.storage.database_path(), Duration::from_secs(5))
            .await
            .unwrap(),
    );
    let params = Arc::new(ParameterStore::new(test_params()));
    let actuators = Arc::new(MockActuators::new());
    let opener: Arc<dyn CameraOpener> = Arc::new(opener);

    let deps = LifecycleDeps {
        source: FrameSource::new(opener, actuators.clone(), config.camera.warm_up_frames),
        recorder,
        store: Arc::clone(&store),
        params: Arc::clone(&params),
        provider: Arc::new(StaticConfigProvider::new(test_params())),
        actuators: actuators.clone(),
    };

    Harness {
        base: dir.path().to_path_buf(),
        _dir: dir,
        store,
        params,
        actuators,
        lifecycle: EventLifecycle::new(deps, config.lifecycle.clone(), chrono_tz::UTC),
    }
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap()
}

fn moving_scene() -> SyntheticOpener {
    SyntheticOpener::new(vec![
        square_frame(64, 48, None),
        square_frame(64, 48, Some((20, 10, 16))),
    ])
}

fn still_scene() -> SyntheticOpener {
    SyntheticOpener::new(vec![square_frame(64, 48, None)])
}

fn dir_entries(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn test_state_transitions() {
    use LifecycleState::*;
    assert!(Idle.can_transition_to(Polling));
    assert!(Polling.can_transition_to(Discarded));
    assert!(Classifying.can_transition_to(StagedForUpload));
    assert!(Recording.can_transition_to(Idle));
    assert!(!Idle.can_transition_to(Recording));
    assert!(!Polling.can_transition_to(StagedForUpload));
    assert!(StagedForUpload.is_terminal());
    assert!(!Recording.is_terminal());
}

#[tokio::test]
async fn test_paused_node_never_opens_camera() {
    let opener = still_scene();
    let stats = opener.stats();
    let mut h = harness(opener, true).await;
    let mut params = test_params();
    params.live = false;
    params.video_interval = 7;
    h.params.replace(params);

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    assert_eq!(
        outcome,
        CycleOutcome::Paused {
            sleep: Duration::from_secs(7)
        }
    );
    assert_eq!(stats.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_confirmed_motion_is_staged_for_upload() {
    let mut h = harness(moving_scene(), true).await;

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    let CycleOutcome::Captured { id, magnitude, frames } = outcome else {
        panic!("expected capture, got {:?}", outcome);
    };
    assert!(magnitude > 50.0);
    // probe frames plus the recording
    assert_eq!(frames, 5);
    assert_eq!(h.lifecycle.state(), LifecycleState::StagedForUpload);

    let event_dir = h.base.join("events").join(&id);
    assert_eq!(dir_entries(&event_dir).len(), 5);
    assert!(dir_entries(&h.base.join("staging")).is_empty());
    assert!(dir_entries(&h.base.join("false")).is_empty());

    let pending = h.store.pending().await.unwrap();
    assert_eq!(pending.capture.len(), 1);
    assert_eq!(pending.capture[0].category, LogCategory::EventCaptured);
    assert!(pending.capture[0].message.contains(&id));

    // day capture never touches the illuminator
    assert!(!h
        .actuators
        .calls()
        .contains(&ActuatorCall::Illumination(true)));
}

#[tokio::test]
async fn test_still_scene_without_trigger_writes_nothing() {
    let mut h = harness(still_scene(), true).await;

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    assert_eq!(
        outcome,
        CycleOutcome::Discarded {
            magnitudes: vec![0.0]
        }
    );
    assert!(dir_entries(&h.base.join("events")).is_empty());
    assert!(dir_entries(&h.base.join("false")).is_empty());

    let entries = h.store.entries(LogTable::Capture).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].category, LogCategory::CheckedMotion);
}

#[tokio::test]
async fn test_triggered_still_scene_is_kept_as_false_positive() {
    let mut h = harness(still_scene(), true).await;
    h.actuators.set_trigger(true);

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    let CycleOutcome::Rejected { id, magnitudes } = outcome else {
        panic!("expected rejection, got {:?}", outcome);
    };
    assert_eq!(magnitudes, vec![0.0]);
    assert_eq!(dir_entries(&h.base.join("false").join(&id)).len(), 2);
    assert!(dir_entries(&h.base.join("events")).is_empty());

    let pending = h.store.pending().await.unwrap();
    assert_eq!(pending.capture[0].category, LogCategory::EventRejected);
}

#[tokio::test]
async fn test_triggered_still_scene_discarded_when_not_retained() {
    let mut h = harness(still_scene(), false).await;
    h.actuators.set_trigger(true);

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    assert!(matches!(outcome, CycleOutcome::Discarded { .. }));
    assert!(dir_entries(&h.base.join("false")).is_empty());
}

#[tokio::test]
async fn test_night_capture_lights_only_while_open() {
    let mut h = harness(moving_scene(), true).await;

    let outcome = h.lifecycle.run_cycle_at(midnight()).await;
    assert!(matches!(outcome, CycleOutcome::Captured { .. }));

    let calls = h.actuators.calls();
    assert_eq!(calls.first(), Some(&ActuatorCall::OpticalFilter(true)));
    assert!(calls.contains(&ActuatorCall::Illumination(true)));
    assert_eq!(calls.last(), Some(&ActuatorCall::Illumination(false)));
    assert!(!h.actuators.illumination_on());
}

#[tokio::test]
async fn test_camera_failure_backs_off_and_leaves_no_trace_on_disk() {
    let opener = still_scene().fail_next_opens(2);
    let mut h = harness(opener, true).await;

    let first = h.lifecycle.run_cycle_at(midnight()).await;
    let second = h.lifecycle.run_cycle_at(midnight()).await;

    assert_eq!(
        first,
        CycleOutcome::CameraFailed {
            retry_in: Duration::from_millis(100)
        }
    );
    assert_eq!(
        second,
        CycleOutcome::CameraFailed {
            retry_in: Duration::from_millis(200)
        }
    );
    assert_eq!(h.lifecycle.state(), LifecycleState::Idle);
    assert!(!h.actuators.illumination_on());
    assert!(dir_entries(&h.base.join("events")).is_empty());
    assert!(dir_entries(&h.base.join("staging")).is_empty());

    let entries = h.store.entries(LogTable::Capture).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|e| e.category == LogCategory::CameraError));

    // the camera comes back
    let third = h.lifecycle.run_cycle_at(midnight()).await;
    assert!(matches!(third, CycleOutcome::Discarded { .. }));
}

#[tokio::test]
async fn test_camera_failure_while_recording_discards_event() {
    // the probe succeeds, the recording fails on its second read
    let opener = moving_scene().fail_after_reads(3);
    let mut h = harness(opener, true).await;

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    assert!(matches!(outcome, CycleOutcome::CameraFailed { .. }));
    assert!(dir_entries(&h.base.join("events")).is_empty());
    assert!(dir_entries(&h.base.join("staging")).is_empty());
}

#[tokio::test]
async fn test_storage_failure_cleans_staging() {
    let mut h = harness(moving_scene(), true).await;
    let events = h.base.join("events");
    std::fs::remove_dir_all(&events).unwrap();
    std::fs::write(&events, b"not a directory").unwrap();

    let outcome = h.lifecycle.run_cycle_at(noon()).await;

    assert_eq!(outcome, CycleOutcome::StorageFailed);
    assert_eq!(h.lifecycle.state(), LifecycleState::Idle);
    assert!(dir_entries(&h.base.join("staging")).is_empty());

    let entries = h.store.entries(LogTable::Capture).await.unwrap();
    assert_eq!(entries[0].category, LogCategory::StorageError);
}

#[tokio::test]
async fn test_run_stops_when_cancelled() {
    let h = harness(still_scene(), true).await;
    let mut params = test_params();
    params.live = false;
    params.video_interval = 3600;
    h.params.replace(params);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.lifecycle.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("lifecycle did not stop")
        .unwrap();
}
