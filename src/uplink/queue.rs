use crate::frame::timestamp_from_file_name;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Next frame to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFrame {
    pub event_id: String,
    pub file_name: String,
    pub timestamp_ms: i64,
    pub path: PathBuf,
}

/// Oldest-first view over `events/`
#[derive(Debug, Clone)]
pub struct UploadQueue {
    events_dir: PathBuf,
}

impl UploadQueue {
    pub fn new(events_dir: PathBuf) -> Self {
        Self { events_dir }
    }

    /// Oldest frame of the oldest event. Empty event directories found on
    /// the way are removed.
    pub async fn next_frame(&self) -> io::Result<Option<PendingFrame>> {
        for (event_id, dir) in self.events_oldest_first().await? {
            match oldest_frame(&dir).await? {
                Some((file_name, timestamp_ms)) => {
                    return Ok(Some(PendingFrame {
                        path: dir.join(&file_name),
                        event_id,
                        file_name,
                        timestamp_ms,
                    }));
                }
                None => match tokio::fs::remove_dir(&dir).await {
                    Ok(()) => debug!("Removed drained event {}", event_id),
                    Err(e) => warn!("Cannot remove drained event {}: {}", dir.display(), e),
                },
            }
        }
        Ok(None)
    }

    /// Pending event ids with their frame file names
    pub async fn pending_frames(&self) -> io::Result<Vec<(String, Vec<String>)>> {
        let mut result = Vec::new();
        for (event_id, dir) in self.events_oldest_first().await? {
            let frames = frames_in(&dir)
                .await?
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            result.push((event_id, frames));
        }
        Ok(result)
    }

    /// Event directories ordered by creation time, then modification time,
    /// then name
    async fn events_oldest_first(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.events_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let name = entry.file_name().to_string_lossy().to_string();
            events.push((age, name, entry.path()));
        }

        events.sort();
        Ok(events
            .into_iter()
            .map(|(_, name, path)| (name, path))
            .collect())
    }
}

async fn oldest_frame(dir: &Path) -> io::Result<Option<(String, i64)>> {
    Ok(frames_in(dir).await?.into_iter().next())
}

/// Frame files in capture order
async fn frames_in(dir: &Path) -> io::Result<Vec<(String, i64)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(ts) = timestamp_from_file_name(&name) {
            frames.push((name, ts));
        }
    }
    frames.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(frames)
}
