use super::state::{CycleOutcome, LifecycleState};
use crate::actuators::Actuators;
use crate::analyzer::{MotionDecision, MotionDetector};
use crate::camera::{CameraSession, FrameSource};
use crate::config::LifecycleConfig;
use crate::error::{FieldcamError, StorageError};
use crate::frame::Frame;
use crate::logstore::{DurableLogStore, LogCategory, LogEntry};
use crate::params::{ConfigProvider, NodeParameters, ParameterStore, RoiMaskCache};
use crate::recorder::{new_event_id, Classification, Event, EventRecorder, StoredEvent};
use crate::recovery::{RetryBackoff, RetryConfig};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a capture cycle reads from; shared with the orchestrator
pub struct LifecycleDeps {
    pub source: FrameSource,
    pub recorder: EventRecorder,
    pub store: Arc<DurableLogStore>,
    pub params: Arc<ParameterStore>,
    pub provider: Arc<dyn ConfigProvider>,
    pub actuators: Arc<dyn Actuators>,
}

/// Probe result handed back from the blocking pool
struct Probe {
    session: CameraSession,
    frames: Vec<Frame>,
    decision: MotionDecision,
}

/// Detect, confirm, record and classify, one cycle at a time
pub struct EventLifecycle {
    deps: LifecycleDeps,
    config: LifecycleConfig,
    tz: Tz,
    masks: RoiMaskCache,
    camera_backoff: RetryBackoff,
    state: LifecycleState,
}

impl EventLifecycle {
    pub fn new(deps: LifecycleDeps, config: LifecycleConfig, tz: Tz) -> Self {
        let camera_backoff = RetryBackoff::new(
            "camera",
            RetryConfig {
                base_delay: Duration::from_millis(config.camera_retry_base_ms),
                max_delay: Duration::from_secs(config.camera_retry_max_seconds),
            },
        );

        Self {
            deps,
            config,
            tz,
            masks: RoiMaskCache::new(),
            camera_backoff,
            state: LifecycleState::Idle,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Run cycles until cancelled. Cancellation is observed between cycles
    /// and during pauses.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Event lifecycle started ({})", self.deps.source.describe());

        while !cancel.is_cancelled() {
            let outcome = self.run_cycle().await;
            let pause = outcome.pause();
            if pause.is_zero() {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Event lifecycle stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.run_cycle_at(Utc::now()).await
    }

    /// One full cycle; `now` selects day or night behaviour
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        self.transition(LifecycleState::Idle);
        let params = self.deps.params.snapshot();

        if !params.live {
            debug!("Capture paused for {}s", params.video_interval);
            return CycleOutcome::Paused {
                sleep: Duration::from_secs(u64::from(params.video_interval.max(1))),
            };
        }

        let triggered = self.wait_for_trigger().await;
        self.transition(LifecycleState::Polling);

        let id = new_event_id();
        let night = !params.is_sunlight(now, self.tz);
        let threshold = params.threshold_at(now, self.tz);
        let mask = self
            .masks
            .resolve(&params, self.deps.provider.as_ref())
            .await;
        let detector = MotionDetector::new().with_roi_mask(mask);

        let probe = match self.probe(&params, night, threshold, detector).await {
            Ok(probe) => probe,
            Err(e) => return self.camera_failed(e).await,
        };
        self.camera_backoff.reset();

        let Probe {
            session,
            frames,
            decision,
        } = probe;

        match decision {
            MotionDecision::Motion {
                frame_index,
                magnitude,
            } => {
                info!(
                    "Motion confirmed at frame {} (magnitude {:.1}, threshold {:.1})",
                    frame_index, magnitude, threshold
                );
                self.transition(LifecycleState::Confirmed);
                self.record_confirmed(&params, id, session, frames, magnitude, triggered)
                    .await
            }
            MotionDecision::Still { magnitudes } => {
                session.close();
                let triggered = triggered || self.read_trigger();
                self.unconfirmed(id, frames, magnitudes, triggered).await
            }
        }
    }

    /// Poll the hardware trigger until it fires or the idle wait elapses
    async fn wait_for_trigger(&self) -> bool {
        let wait = Duration::from_secs(self.config.trigger_wait_seconds);
        let poll = Duration::from_millis(self.config.trigger_poll_ms);
        let started = Instant::now();

        loop {
            if self.read_trigger() {
                debug!("Trigger fired after {:?}", started.elapsed());
                return true;
            }
            if started.elapsed() >= wait {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn read_trigger(&self) -> bool {
        match self.deps.actuators.read_trigger() {
            Ok(level) => level,
            Err(e) => {
                warn!("Failed to read trigger: {}", e);
                false
            }
        }
    }

    /// Open the camera, capture the probe and run detection on the blocking pool
    async fn probe(
        &self,
        params: &NodeParameters,
        night: bool,
        threshold: f64,
        detector: MotionDetector,
    ) -> Result<Probe, FieldcamError> {
        let source = self.deps.source.clone();
        let count = params.motion_interval;
        let fps = params.frames_per_sec;

        tokio::task::spawn_blocking(move || {
            let mut session = source.open(night)?;
            let frames = session.capture_n(count, fps)?;
            let decision = detector.detect(&frames, threshold)?;
            Ok::<_, FieldcamError>(Probe {
                session,
                frames,
                decision,
            })
        })
        .await
        .map_err(|e| FieldcamError::system(format!("probe task failed: {}", e)))?
    }

    async fn record_confirmed(
        &mut self,
        params: &NodeParameters,
        id: String,
        mut session: CameraSession,
        mut frames: Vec<Frame>,
        magnitude: f64,
        triggered: bool,
    ) -> CycleOutcome {
        self.transition(LifecycleState::Recording);
        let count = params.video_interval;
        let fps = params.frames_per_sec;

        let recorded = tokio::task::spawn_blocking(move || {
            let result = session.capture_n(count, fps);
            session.close();
            result
        })
        .await;

        match recorded {
            Ok(Ok(more)) => frames.extend(more),
            Ok(Err(e)) => return self.camera_failed(e.into()).await,
            Err(e) => {
                return self
                    .camera_failed(FieldcamError::system(format!("recording task failed: {}", e)))
                    .await
            }
        }

        self.transition(LifecycleState::Classifying);
        let event = Event {
            id,
            frames,
            classification: Classification::Confirmed,
        };
        let stored = match self.deps.recorder.record(event).await {
            Ok(stored) => stored,
            Err(e) => return self.storage_failed(e).await,
        };

        self.transition(LifecycleState::StagedForUpload);
        let message = json!({
            "event": stored.id,
            "magnitude": magnitude,
            "trigger": triggered,
            "frames": stored.frame_count,
        });
        self.log(LogEntry::new(LogCategory::EventCaptured, message.to_string()))
            .await;

        CycleOutcome::Captured {
            id: stored.id,
            magnitude,
            frames: stored.frame_count,
        }
    }

    async fn unconfirmed(
        &mut self,
        id: String,
        frames: Vec<Frame>,
        magnitudes: Vec<f64>,
        triggered: bool,
    ) -> CycleOutcome {
        if triggered && self.config.retain_false_positives {
            self.transition(LifecycleState::Rejected);
            let event = Event {
                id,
                frames,
                classification: Classification::Rejected,
            };
            let stored: StoredEvent = match self.deps.recorder.record(event).await {
                Ok(stored) => stored,
                Err(e) => return self.storage_failed(e).await,
            };

            info!("Trigger fired without confirmed motion, kept {}", stored.id);
            let message = json!({ "event": stored.id, "magnitudes": magnitudes });
            self.log(LogEntry::new(LogCategory::EventRejected, message.to_string()))
                .await;
            return CycleOutcome::Rejected {
                id: stored.id,
                magnitudes,
            };
        }

        self.transition(LifecycleState::Discarded);
        debug!("No motion, magnitudes {:?}", magnitudes);
        let message = json!({ "magnitudes": magnitudes, "trigger": triggered });
        self.log(LogEntry::new(LogCategory::CheckedMotion, message.to_string()))
            .await;
        CycleOutcome::Discarded { magnitudes }
    }

    async fn camera_failed(&mut self, error: FieldcamError) -> CycleOutcome {
        self.transition(LifecycleState::Idle);
        let retry_in = self.camera_backoff.on_failure(&error);
        self.log(LogEntry::new(LogCategory::CameraError, error.to_string()))
            .await;
        CycleOutcome::CameraFailed { retry_in }
    }

    async fn storage_failed(&mut self, error: StorageError) -> CycleOutcome {
        self.transition(LifecycleState::Idle);
        error!("Failed to store event: {}", error);
        self.log(LogEntry::new(LogCategory::StorageError, error.to_string()))
            .await;
        CycleOutcome::StorageFailed
    }

    /// Audit entries are best effort; a store failure never ends the cycle
    async fn log(&self, entry: LogEntry) {
        let category = entry.category.clone();
        if let Err(e) = self.deps.store.append(entry).await {
            error!("Failed to append {} log entry: {}", category, e);
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Unexpected lifecycle transition {} -> {}", self.state, next);
        }
        debug!("Lifecycle {} -> {}", self.state, next);
        self.state = next;
    }
}
