use super::queue::{PendingFrame, UploadQueue};
use super::radio::Radio;
use super::sink::RemoteSink;
use super::state::{UplinkPolicy, UplinkState};
use crate::config::UplinkConfig;
use crate::error::StorageError;
use crate::frame::prepare_for_upload;
use crate::logstore::{DurableLogStore, LogCategory, LogEntry};
use crate::params::ParameterStore;
use crate::recorder::{EventLocation, EventRecorder};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive read failures before a queued frame is set aside
const MAX_READ_FAILURES: u32 = 3;

/// Collaborators of the uplink loop
pub struct UplinkDeps {
    pub recorder: EventRecorder,
    pub store: Arc<DurableLogStore>,
    pub sink: Arc<dyn RemoteSink>,
    pub radio: Arc<dyn Radio>,
    pub params: Arc<ParameterStore>,
}

/// Body of a `FRAME_UPLOAD` entry; enough to rebuild the retry index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct FrameRef {
    event: String,
    frame: String,
}

/// What a single manager step did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing to send
    Idle,
    Uploaded { event_id: String, file_name: String },
    /// Delivery failed; will retry next tick
    DeliveryFailed,
    BackoffStarted { until: DateTime<Utc> },
    InBackoff { until: DateTime<Utc> },
    /// Frames are queued but the radio could not be powered
    RadioOff,
    /// Unreadable frame moved out of the queue
    Quarantined { event_id: String, file_name: String },
    /// Internal fault, logged at error level
    Fault,
}

pub struct UplinkManager {
    deps: UplinkDeps,
    config: UplinkConfig,
    policy: UplinkPolicy,
    queue: UploadQueue,
    state: UplinkState,
    state_path: PathBuf,
    index: HashMap<FrameRef, LogEntry>,
    read_failures: HashMap<FrameRef, u32>,
    last_log_shipment: Option<DateTime<Utc>>,
}

impl UplinkManager {
    /// Restore persisted radio state, power the radio accordingly and rebuild
    /// the pending upload index
    pub async fn start(
        deps: UplinkDeps,
        config: UplinkConfig,
        state_path: PathBuf,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let state = UplinkState::load(&state_path, config.radio_on_at_boot, now).await;
        if let Err(e) = deps.radio.set_power(state.radio_on) {
            error!("Failed to restore radio power {}: {}", state.radio_on, e);
        }

        let policy = UplinkPolicy {
            failure_window: seconds(config.failure_window_seconds),
            retry_cooldown: seconds(config.retry_cooldown_seconds),
            radio_idle_timeout: seconds(config.radio_idle_timeout_seconds),
            keep_radio_on: config.keep_radio_on,
        };
        let queue = UploadQueue::new(
            deps.recorder
                .location_dir(EventLocation::PendingUpload)
                .to_path_buf(),
        );

        let mut manager = Self {
            deps,
            config,
            policy,
            queue,
            state,
            state_path,
            index: HashMap::new(),
            read_failures: HashMap::new(),
            last_log_shipment: None,
        };
        manager.rebuild_index().await?;

        info!(
            "Uplink manager ready (radio {}, {} pending upload entries)",
            if manager.state.radio_on { "on" } else { "off" },
            manager.index.len()
        );
        Ok(manager)
    }

    pub fn state(&self) -> &UplinkState {
        &self.state
    }

    /// Pending `FRAME_UPLOAD` entries become the retry index. Entries whose
    /// frame already reached `done/` were delivered before a crash and are
    /// settled here.
    async fn rebuild_index(&mut self) -> Result<(), StorageError> {
        let pending = self.deps.store.pending().await?;
        let mut delivered = Vec::new();

        for entry in pending.upload {
            if entry.category != LogCategory::FrameUpload {
                continue;
            }
            let frame: FrameRef = match serde_json::from_str(&entry.message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Unreadable upload entry {}: {}", entry.datestamp, e);
                    continue;
                }
            };

            if self
                .deps
                .recorder
                .is_frame_done(&frame.event, &frame.frame)
                .await
            {
                delivered.push(entry);
            } else {
                self.index.insert(frame, entry);
            }
        }

        if !delivered.is_empty() {
            let settled = self.deps.store.mark_done(&delivered).await?;
            info!("Settled {} upload entries delivered before restart", settled);
        }
        Ok(())
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Uplink manager started");
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let outcome = self.tick(Utc::now()).await;
            debug!("Uplink tick: {:?}", outcome);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        // radio is left as is so the next start resumes from the same state
        if let Err(e) = self.state.persist(&self.state_path, Utc::now()).await {
            warn!("Failed to persist uplink state: {}", e);
        }
        info!("Uplink manager stopped");
    }

    /// One step: expire backoff, apply radio policy, ship logs, send one frame.
    /// A due log backlog counts as occupancy, so it powers the radio like a
    /// queued frame does.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if self.state.expire_backoff(now) {
            info!("Upload backoff expired, resuming");
        }

        let next = match self.queue.next_frame().await {
            Ok(next) => next,
            Err(e) => {
                error!("Cannot read upload queue: {}", e);
                return TickOutcome::Fault;
            }
        };
        let backlog = if self.state.in_backoff(now) {
            None
        } else {
            self.log_backlog_due(now).await
        };

        let occupied = next.is_some() || backlog.is_some();
        if occupied {
            self.state.last_activity = now;
        }

        self.apply_radio_policy(now, !occupied).await;

        if let Some(until) = self.state.backoff_until.filter(|_| self.state.in_backoff(now)) {
            return TickOutcome::InBackoff { until };
        }

        if let Some(entries) = backlog.filter(|_| self.state.radio_on) {
            self.ship_logs(now, entries).await;
        }

        match next {
            None => TickOutcome::Idle,
            Some(_) if !self.state.radio_on => TickOutcome::RadioOff,
            Some(frame) => self.upload(now, frame).await,
        }
    }

    async fn upload(&mut self, now: DateTime<Utc>, frame: PendingFrame) -> TickOutcome {
        let key = FrameRef {
            event: frame.event_id.clone(),
            frame: frame.file_name.clone(),
        };

        let entry = match self.index.get(&key) {
            Some(entry) => entry.clone(),
            None => {
                let message = match serde_json::to_string(&key) {
                    Ok(message) => message,
                    Err(e) => {
                        error!("Cannot encode upload entry: {}", e);
                        return TickOutcome::Fault;
                    }
                };
                match self
                    .deps
                    .store
                    .append(LogEntry::new(LogCategory::FrameUpload, message))
                    .await
                {
                    Ok(entry) => {
                        self.index.insert(key.clone(), entry.clone());
                        entry
                    }
                    Err(e) => {
                        error!("Cannot record upload of {}: {}", frame.path.display(), e);
                        return TickOutcome::Fault;
                    }
                }
            }
        };

        let image = match self.prepare(&frame).await {
            Some(image) => {
                self.read_failures.remove(&key);
                image
            }
            None => return self.frame_unreadable(key, entry, frame).await,
        };
        let captured_at = Utc
            .timestamp_millis_opt(frame.timestamp_ms)
            .single()
            .unwrap_or(now);

        if let Err(e) = self
            .deps
            .sink
            .upload(&frame.event_id, captured_at, image)
            .await
        {
            warn!(
                "Upload of {}/{} failed: {}",
                frame.event_id, frame.file_name, e
            );
            return match self.state.record_failure(now, &self.policy) {
                Some(until) => {
                    self.start_backoff(now, until).await;
                    TickOutcome::BackoffStarted { until }
                }
                None => TickOutcome::DeliveryFailed,
            };
        }

        self.state.record_success();

        if let Err(e) = self
            .deps
            .recorder
            .complete_frame(&frame.event_id, &frame.file_name)
            .await
        {
            error!("Uploaded frame could not be moved to done: {}", e);
            return TickOutcome::Fault;
        }

        match self.deps.store.mark_done(&[entry]).await {
            Ok(_) => {
                self.index.remove(&key);
            }
            Err(e) => error!("Cannot settle upload entry for {}: {}", frame.file_name, e),
        }

        info!("Uploaded {}/{}", frame.event_id, frame.file_name);
        let audit = json!({
            "message": format!("uploaded frame {} of event {}", frame.file_name, frame.event_id),
        });
        if let Err(e) = self.deps.sink.log(&audit).await {
            debug!("Upload audit message not delivered: {}", e);
        }

        TickOutcome::Uploaded {
            event_id: frame.event_id,
            file_name: frame.file_name,
        }
    }

    /// Count a read failure; after `MAX_READ_FAILURES` the frame leaves the
    /// queue for `quarantine/` and its upload entry is settled
    async fn frame_unreadable(
        &mut self,
        key: FrameRef,
        entry: LogEntry,
        frame: PendingFrame,
    ) -> TickOutcome {
        let failures = self.read_failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        if *failures < MAX_READ_FAILURES {
            return TickOutcome::Fault;
        }
        self.read_failures.remove(&key);

        let path = match self
            .deps
            .recorder
            .quarantine_frame(&frame.event_id, &frame.file_name)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                error!("Cannot quarantine {}: {}", frame.path.display(), e);
                return TickOutcome::Fault;
            }
        };
        error!(
            "Frame {} unreadable {} times, moved to {}",
            frame.path.display(),
            MAX_READ_FAILURES,
            path.display()
        );

        match self.deps.store.mark_done(&[entry]).await {
            Ok(_) => {
                self.index.remove(&key);
            }
            Err(e) => error!("Cannot settle upload entry for {}: {}", frame.file_name, e),
        }
        let message = json!({ "event": key.event, "frame": key.frame });
        self.audit(LogEntry::settled(LogCategory::FrameQuarantined, message.to_string()))
            .await;

        TickOutcome::Quarantined {
            event_id: frame.event_id,
            file_name: frame.file_name,
        }
    }

    /// Read and scale a queued frame. Frames that cannot be decoded are sent
    /// as stored.
    async fn prepare(&self, frame: &PendingFrame) -> Option<Vec<u8>> {
        let raw = match tokio::fs::read(&frame.path).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Cannot read queued frame {}: {}", frame.path.display(), e);
                return None;
            }
        };

        let resolution = self.config.upload_resolution;
        let quality = self.config.upload_quality;
        let path = frame.path.clone();
        let result = tokio::task::spawn_blocking(move || {
            match prepare_for_upload(&raw, resolution, quality) {
                Ok(scaled) => scaled,
                Err(e) => {
                    error!("Cannot rescale {}: {}; sending as stored", path.display(), e);
                    raw
                }
            }
        })
        .await;

        match result {
            Ok(image) => Some(image),
            Err(e) => {
                error!("Frame preparation task failed: {}", e);
                None
            }
        }
    }

    async fn start_backoff(&mut self, now: DateTime<Utc>, until: DateTime<Utc>) {
        warn!(
            "Uploads failing for {}s, backing off until {}",
            self.config.failure_window_seconds, until
        );
        let message = json!({
            "since": self.state.consecutive_failure_since,
            "until": until,
        });
        self.audit(LogEntry::settled(LogCategory::UploadBackoff, message.to_string()))
            .await;
        self.apply_radio_policy(now, false).await;
    }

    async fn apply_radio_policy(&mut self, now: DateTime<Utc>, queue_empty: bool) {
        let desired = self.state.desired_radio(now, queue_empty, &self.policy);
        if desired == self.state.radio_on {
            return;
        }

        if let Err(e) = self.deps.radio.set_power(desired) {
            error!("Failed to switch radio {}: {}", on_off(desired), e);
            return;
        }
        self.state.radio_on = desired;
        if desired {
            // idle timer starts when the radio comes up
            self.state.last_activity = now;
        }
        info!("Radio switched {}", on_off(desired));

        if let Err(e) = self.state.persist(&self.state_path, now).await {
            warn!("Failed to persist uplink state: {}", e);
        }
        let message = json!({ "radio_on": desired });
        self.audit(LogEntry::settled(LogCategory::RadioPower, message.to_string()))
            .await;
    }

    /// Pending capture entries, once `update_after` seconds have passed since
    /// the last shipment. An empty or unreadable backlog restarts the interval.
    async fn log_backlog_due(&mut self, now: DateTime<Utc>) -> Option<Vec<LogEntry>> {
        let interval = seconds(self.deps.params.snapshot().update_after);
        if let Some(last) = self.last_log_shipment {
            if now - last < interval {
                return None;
            }
        }

        match self.deps.store.pending().await {
            Ok(pending) if !pending.capture.is_empty() => Some(pending.capture),
            Ok(_) => {
                self.last_log_shipment = Some(now);
                None
            }
            Err(e) => {
                error!("Cannot read pending log entries: {}", e);
                self.last_log_shipment = Some(now);
                None
            }
        }
    }

    /// Send the backlog as one JSON array; success settles it
    async fn ship_logs(&mut self, now: DateTime<Utc>, pending: Vec<LogEntry>) {
        self.last_log_shipment = Some(now);

        let batch: Vec<_> = pending
            .iter()
            .map(|entry| {
                json!({
                    "datestamp": entry.datestamp,
                    "log_type": entry.category.as_str(),
                    "message": entry.message,
                })
            })
            .collect();
        let body = serde_json::Value::Array(batch);

        match self.deps.sink.log(&body).await {
            Ok(()) => match self.deps.store.mark_done(&pending).await {
                Ok(count) => debug!("Shipped {} capture log entries", count),
                Err(e) => error!("Cannot settle shipped log entries: {}", e),
            },
            Err(e) => warn!("Log shipment failed: {}", e),
        }
    }

    async fn audit(&self, entry: LogEntry) {
        let category = entry.category.clone();
        if let Err(e) = self.deps.store.append(entry).await {
            error!("Failed to append {} log entry: {}", category, e);
        }
    }
}

/// Configured durations are clamped to ten years
fn seconds(secs: u64) -> ChronoDuration {
    const MAX_SECONDS: u64 = 10 * 365 * 24 * 3600;
    ChronoDuration::seconds(secs.min(MAX_SECONDS) as i64)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
