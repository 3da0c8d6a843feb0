//! On-disk event layout and atomic relocation.
//!
//! ```text
//! <base>/staging/<id>/   frames being written
//! <base>/events/<id>/    pending upload
//! <base>/false/<id>/     retained false positives
//! <base>/done/<id>/      uploaded frames
//! ```
//!
//! Frames are written once, into staging, and every later move is a single
//! `rename` of a directory or file.

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::frame::Frame;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// JPEG quality for frames written to disk
pub const STORED_JPEG_QUALITY: u8 = 95;

pub type EventId = String;

/// Mint a fresh event id (32 hex chars)
pub fn new_event_id() -> EventId {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLocation {
    Staged,
    PendingUpload,
    FalsePositive,
    Done,
    /// Frames set aside after repeated read failures
    Quarantined,
}

impl EventLocation {
    pub fn for_classification(classification: Classification) -> Self {
        match classification {
            Classification::Confirmed => EventLocation::PendingUpload,
            Classification::Rejected => EventLocation::FalsePositive,
        }
    }
}

/// An event ready to be written
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub frames: Vec<Frame>,
    pub classification: Classification,
}

/// Result of a successful recording
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: EventId,
    pub location: EventLocation,
    pub path: PathBuf,
    pub frame_count: usize,
}

#[derive(Debug, Clone)]
pub struct EventRecorder {
    staging: PathBuf,
    events: PathBuf,
    false_positives: PathBuf,
    done: PathBuf,
    quarantine: PathBuf,
}

impl EventRecorder {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            staging: storage.staging_dir(),
            events: storage.events_dir(),
            false_positives: storage.false_dir(),
            done: storage.done_dir(),
            quarantine: storage.quarantine_dir(),
        }
    }

    pub fn location_dir(&self, location: EventLocation) -> &Path {
        match location {
            EventLocation::Staged => &self.staging,
            EventLocation::PendingUpload => &self.events,
            EventLocation::FalsePositive => &self.false_positives,
            EventLocation::Done => &self.done,
            EventLocation::Quarantined => &self.quarantine,
        }
    }

    pub fn event_dir(&self, location: EventLocation, id: &str) -> PathBuf {
        self.location_dir(location).join(id)
    }

    /// Create the layout and discard staging leftovers from an interrupted write.
    /// Returns the number of discarded staging directories.
    pub async fn prepare(&self) -> Result<usize, StorageError> {
        for dir in [
            &self.staging,
            &self.events,
            &self.false_positives,
            &self.done,
            &self.quarantine,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::DirectoryCreation {
                    path: dir.display().to_string(),
                    source: e,
                })?;
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            warn!("Removing incomplete staged event {}", path.display());
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            removed += 1;
        }

        if removed > 0 {
            info!("Discarded {} incomplete staged event(s)", removed);
        }
        Ok(removed)
    }

    /// Write the event into staging, then atomically move it to the location
    /// its classification selects. On failure nothing is left in staging.
    pub async fn record(&self, event: Event) -> Result<StoredEvent, StorageError> {
        let destination = EventLocation::for_classification(event.classification);
        let id = event.id.clone();
        let frame_count = event.frames.len();

        if let Err(e) = self.write_staged(&id, event.frames).await {
            self.discard_staged(&id).await;
            return Err(e);
        }

        match self.relocate(&id, EventLocation::Staged, destination).await {
            Ok(path) => {
                info!(
                    "Recorded event {} ({} frames) to {}",
                    id,
                    frame_count,
                    path.display()
                );
                Ok(StoredEvent {
                    id,
                    location: destination,
                    path,
                    frame_count,
                })
            }
            Err(e) => {
                self.discard_staged(&id).await;
                Err(e)
            }
        }
    }

    async fn write_staged(&self, id: &str, frames: Vec<Frame>) -> Result<(), StorageError> {
        let dir = self.event_dir(EventLocation::Staged, id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreation {
                path: dir.display().to_string(),
                source: e,
            })?;

        let encoded = tokio::task::spawn_blocking(move || {
            frames
                .iter()
                .map(|frame| {
                    frame
                        .encode_jpeg(STORED_JPEG_QUALITY)
                        .map(|bytes| (frame.file_name(), bytes))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| StorageError::Write {
            path: dir.display().to_string(),
            details: format!("encoder task failed: {}", e),
        })?
        .map_err(|e| StorageError::Write {
            path: dir.display().to_string(),
            details: format!("JPEG encoding failed: {}", e),
        })?;

        for (name, bytes) in encoded {
            let path = dir.join(&name);
            write_durable(&path, &bytes).await?;
        }

        debug!("Staged event {} in {}", id, dir.display());
        Ok(())
    }

    async fn discard_staged(&self, id: &str) {
        let dir = self.event_dir(EventLocation::Staged, id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staged event {}: {}", dir.display(), e);
            }
        }
    }

    /// Move a whole event directory with a single rename
    pub async fn relocate(
        &self,
        id: &str,
        from: EventLocation,
        to: EventLocation,
    ) -> Result<PathBuf, StorageError> {
        let source = self.event_dir(from, id);
        let target = self.event_dir(to, id);
        rename_exclusive(&source, &target).await?;
        Ok(target)
    }

    /// Move one uploaded frame from the pending queue to `done/<id>/`
    pub async fn complete_frame(&self, id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        self.move_frame(id, file_name, EventLocation::Done).await
    }

    /// Move an unreadable queued frame to `quarantine/<id>/`
    pub async fn quarantine_frame(&self, id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        self.move_frame(id, file_name, EventLocation::Quarantined).await
    }

    async fn move_frame(
        &self,
        id: &str,
        file_name: &str,
        to: EventLocation,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.event_dir(to, id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreation {
                path: dir.display().to_string(),
                source: e,
            })?;

        let source = self.event_dir(EventLocation::PendingUpload, id).join(file_name);
        let target = dir.join(file_name);
        rename_exclusive(&source, &target).await?;
        Ok(target)
    }

    /// Whether a frame has already reached `done/`
    pub async fn is_frame_done(&self, id: &str, file_name: &str) -> bool {
        tokio::fs::try_exists(self.event_dir(EventLocation::Done, id).join(file_name))
            .await
            .unwrap_or(false)
    }
}

async fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let write = async {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    };
    write.await.map_err(|e| StorageError::Write {
        path: path.display().to_string(),
        details: e.to_string(),
    })
}

/// `rename` that refuses to replace an existing target
async fn rename_exclusive(source: &Path, target: &Path) -> Result<(), StorageError> {
    if tokio::fs::try_exists(target).await.unwrap_or(false) {
        return Err(StorageError::DestinationExists {
            path: target.display().to_string(),
        });
    }
    tokio::fs::rename(source, target)
        .await
        .map_err(|e| StorageError::Relocation {
            from: source.display().to_string(),
            to: target.display().to_string(),
            details: e.to_string(),
        })
}
