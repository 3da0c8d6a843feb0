//! Remotely supplied node parameters.
//!
//! The capture loop only ever reads an immutable [`NodeParameters`] snapshot.
//! A refresh builds a complete new snapshot and swaps the `Arc` under a
//! short write lock, so readers see either the old or the new document.

use crate::error::ParamsError;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, Utc};
use chrono_tz::Tz;
use image::GrayImage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeParameters {
    /// Capture is paused while false
    pub live: bool,
    /// Frames recorded after a confirmation; also the idle sleep in seconds when not live
    pub video_interval: u32,
    /// Frames in a motion probe
    pub motion_interval: u32,
    /// Sensor frames per retained frame
    pub frames_per_sec: u32,
    pub day_threshold: f64,
    pub night_threshold: f64,
    /// Seconds between parameter refreshes and log shipments
    pub update_after: u64,
    #[serde(with = "time_of_day")]
    pub sunrise: NaiveTime,
    #[serde(with = "time_of_day")]
    pub sunset: NaiveTime,
    #[serde(default)]
    pub roi_mask_url: Option<String>,
}

impl NodeParameters {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.frames_per_sec == 0 {
            return Err(ParamsError::Invalid {
                details: "frames_per_sec must be greater than 0".to_string(),
            });
        }
        if self.update_after == 0 {
            return Err(ParamsError::Invalid {
                details: "update_after must be greater than 0".to_string(),
            });
        }
        if self.day_threshold < 0.0 || self.night_threshold < 0.0 {
            return Err(ParamsError::Invalid {
                details: "movement thresholds must not be negative".to_string(),
            });
        }
        Ok(())
    }

    /// Strict time-of-day comparison in the node timezone; the date is ignored
    pub fn is_sunlight(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        let local = now.with_timezone(&tz).time();
        self.sunrise < local && local < self.sunset
    }

    pub fn threshold_at(&self, now: DateTime<Utc>, tz: Tz) -> f64 {
        if self.is_sunlight(now, tz) {
            self.day_threshold
        } else {
            self.night_threshold
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_after)
    }
}

/// Sunrise and sunset arrive either as `HH:MM:SS` or as a full ISO datetime;
/// only the first 19 characters of the latter are significant.
mod time_of_day {
    use chrono::{NaiveDateTime, NaiveTime};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const TIME_FORMAT: &str = "%H:%M:%S";
    const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid time of day: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<NaiveTime> {
        let raw = raw.trim();
        if let Ok(t) = NaiveTime::parse_from_str(raw, TIME_FORMAT) {
            return Some(t);
        }
        if let Ok(t) = NaiveTime::parse_from_str(raw, "%H:%M") {
            return Some(t);
        }
        let head = raw.get(..19)?;
        NaiveDateTime::parse_from_str(head, DATETIME_FORMAT)
            .ok()
            .map(|dt| dt.time())
    }
}

/// Holder of the current parameter snapshot
pub struct ParameterStore {
    current: RwLock<Arc<NodeParameters>>,
}

impl ParameterStore {
    pub fn new(initial: NodeParameters) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Seed from the cached remote document when one exists
    pub async fn load(cache_path: &Path, defaults: NodeParameters) -> Self {
        match read_cache(cache_path).await {
            Some(cached) => {
                info!("Using cached node parameters from {}", cache_path.display());
                Self::new(cached)
            }
            None => {
                debug!("No usable parameter cache, using configured defaults");
                Self::new(defaults)
            }
        }
    }

    pub fn snapshot(&self) -> Arc<NodeParameters> {
        Arc::clone(&*self.current.read())
    }

    pub fn replace(&self, params: NodeParameters) {
        *self.current.write() = Arc::new(params);
    }
}

async fn read_cache(path: &Path) -> Option<NodeParameters> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice::<NodeParameters>(&raw) {
        Ok(params) if params.validate().is_ok() => Some(params),
        Ok(_) => {
            warn!("Ignoring invalid parameter cache {}", path.display());
            None
        }
        Err(e) => {
            warn!("Ignoring unreadable parameter cache {}: {}", path.display(), e);
            None
        }
    }
}

/// Source of remote node parameters
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch(&self) -> Result<NodeParameters, ParamsError>;

    /// Download the region-of-interest mask referenced by the parameters
    async fn fetch_roi_mask(&self, url: &str) -> Result<GrayImage, ParamsError> {
        Err(ParamsError::ConfigUnavailable {
            details: format!("provider cannot fetch ROI mask {url}"),
        })
    }
}

/// Fixed parameters, for offline operation and tests
pub struct StaticConfigProvider {
    params: NodeParameters,
    mask: Option<GrayImage>,
}

impl StaticConfigProvider {
    pub fn new(params: NodeParameters) -> Self {
        Self { params, mask: None }
    }

    pub fn with_mask(mut self, mask: GrayImage) -> Self {
        self.mask = Some(mask);
        self
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn fetch(&self) -> Result<NodeParameters, ParamsError> {
        Ok(self.params.clone())
    }

    async fn fetch_roi_mask(&self, url: &str) -> Result<GrayImage, ParamsError> {
        self.mask
            .clone()
            .ok_or_else(|| ParamsError::ConfigUnavailable {
                details: format!("no mask configured for {url}"),
            })
    }
}

/// Reports node health to the dashboard and receives the parameter document
/// in the response.
pub struct HttpConfigProvider {
    client: reqwest::Client,
    me_url: String,
    token: String,
    cache_path: PathBuf,
    storage_path: PathBuf,
}

#[derive(Serialize)]
struct StatusReport {
    remaining_storage: f64,
    last_reported_at: String,
}

impl HttpConfigProvider {
    pub fn new(
        site_url: &str,
        token: &str,
        timeout: Duration,
        cache_path: PathBuf,
        storage_path: PathBuf,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            me_url: format!("{}/core/api/camera/me/", site_url.trim_end_matches('/')),
            token: token.to_string(),
            cache_path,
            storage_path,
        }
    }

    async fn write_cache(&self, body: &[u8]) {
        let tmp = self.cache_path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, body).await?;
            tokio::fs::rename(&tmp, &self.cache_path).await
        }
        .await;
        if let Err(e) = result {
            warn!(
                "Failed to cache node parameters to {}: {}",
                self.cache_path.display(),
                e
            );
        }
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn fetch(&self) -> Result<NodeParameters, ParamsError> {
        let report = StatusReport {
            remaining_storage: free_space_gib(&self.storage_path).unwrap_or(0.0),
            last_reported_at: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };

        let unavailable = |details: String| ParamsError::ConfigUnavailable { details };

        let response = self
            .client
            .patch(&self.me_url)
            .header("Authorization", format!("Token {}", self.token))
            .json(&report)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("{} returned {}", self.me_url, status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let params: NodeParameters =
            serde_json::from_slice(&body).map_err(|e| ParamsError::Invalid {
                details: e.to_string(),
            })?;
        params.validate()?;

        // Cache the normalised document so restarts do not depend on the network
        if let Ok(normalised) = serde_json::to_vec_pretty(&params) {
            self.write_cache(&normalised).await;
        }

        Ok(params)
    }

    async fn fetch_roi_mask(&self, url: &str) -> Result<GrayImage, ParamsError> {
        let unavailable = |details: String| ParamsError::ConfigUnavailable { details };

        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        image::load_from_memory(&bytes)
            .map(|img| img.to_luma8())
            .map_err(|e| ParamsError::Invalid {
                details: format!("ROI mask is not an image: {e}"),
            })
    }
}

/// Free space on the filesystem holding `path`, in GiB rounded to 3 places
#[cfg(unix)]
pub fn free_space_gib(path: &Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    let gib = bytes as f64 / 1024_f64.powi(3);
    Some((gib * 1000.0).round() / 1000.0)
}

#[cfg(not(unix))]
pub fn free_space_gib(_path: &Path) -> Option<f64> {
    None
}

/// Periodically pulls fresh parameters; failures keep the stale snapshot
pub struct ParameterRefresher {
    provider: Arc<dyn ConfigProvider>,
    store: Arc<ParameterStore>,
}

impl ParameterRefresher {
    pub fn new(provider: Arc<dyn ConfigProvider>, store: Arc<ParameterStore>) -> Self {
        Self { provider, store }
    }

    /// One refresh attempt; returns whether the snapshot was replaced
    pub async fn refresh_once(&self) -> bool {
        match self.provider.fetch().await {
            Ok(params) => {
                if *self.store.snapshot() != params {
                    info!("Node parameters updated");
                    debug!("New parameters: {:?}", params);
                }
                self.store.replace(params);
                true
            }
            Err(e) => {
                warn!("Parameter refresh failed, keeping previous snapshot: {}", e);
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Parameter refresher started");
        loop {
            self.refresh_once().await;

            let wait = self.store.snapshot().update_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Parameter refresher stopped");
    }
}

/// Region-of-interest mask, downloaded once per distinct URL
#[derive(Default)]
pub struct RoiMaskCache {
    url: Option<String>,
    mask: Option<Arc<GrayImage>>,
}

impl RoiMaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask for the current parameters; `None` means detect unmasked
    pub async fn resolve(
        &mut self,
        params: &NodeParameters,
        provider: &dyn ConfigProvider,
    ) -> Option<Arc<GrayImage>> {
        let Some(url) = params.roi_mask_url.as_deref() else {
            self.url = None;
            self.mask = None;
            return None;
        };

        if self.url.as_deref() != Some(url) {
            self.url = Some(url.to_string());
            self.mask = match provider.fetch_roi_mask(url).await {
                Ok(mask) => {
                    info!(
                        "Loaded ROI mask {}x{} from {}",
                        mask.width(),
                        mask.height(),
                        url
                    );
                    Some(Arc::new(mask))
                }
                Err(e) => {
                    warn!("ROI mask unavailable, detecting unmasked: {}", e);
                    None
                }
            };
        }

        self.mask.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_node_parameters;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_sunlight_is_strict_time_of_day() {
        let params = default_node_parameters();
        let utc: Tz = "UTC".parse().unwrap();

        assert!(params.is_sunlight(at(12, 0), utc));
        assert!(!params.is_sunlight(at(6, 0), utc));
        assert!(!params.is_sunlight(at(18, 0), utc));
        assert!(!params.is_sunlight(at(23, 30), utc));

        assert_eq!(params.threshold_at(at(12, 0), utc), params.day_threshold);
        assert_eq!(params.threshold_at(at(2, 0), utc), params.night_threshold);
    }

    #[test]
    fn test_sunlight_uses_node_timezone() {
        let params = default_node_parameters();
        let karachi: Tz = "Asia/Karachi".parse().unwrap();
        // 03:00 UTC is 08:00 in Karachi
        assert!(params.is_sunlight(at(3, 0), karachi));
        // 14:00 UTC is 19:00 in Karachi
        assert!(!params.is_sunlight(at(14, 0), karachi));
    }

    #[test]
    fn test_parse_remote_document() {
        let doc = r#"{
            "id": 7,
            "live": true,
            "video_interval": 12,
            "motion_interval": 3,
            "frames_per_sec": 15,
            "day_threshold": 900,
            "night_threshold": 2500,
            "update_after": 600,
            "sunrise": "2024-03-10T05:47:00+05:00",
            "sunset": "2024-03-10T18:21:13+05:00",
            "last_reported_at": "2024-03-10T10:00:00"
        }"#;
        let params: NodeParameters = serde_json::from_str(doc).unwrap();
        assert_eq!(params.video_interval, 12);
        assert_eq!(params.day_threshold, 900.0);
        assert_eq!(params.sunrise, NaiveTime::from_hms_opt(5, 47, 0).unwrap());
        assert_eq!(params.sunset, NaiveTime::from_hms_opt(18, 21, 13).unwrap());
        assert_eq!(params.roi_mask_url, None);
    }

    #[test]
    fn test_snapshot_swap() {
        let store = ParameterStore::new(default_node_parameters());
        let before = store.snapshot();

        let mut next = default_node_parameters();
        next.live = false;
        store.replace(next);

        // Old snapshot is untouched, new readers see the replacement
        assert!(before.live);
        assert!(!store.snapshot().live);
    }

    #[tokio::test]
    async fn test_load_prefers_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = dir.path().join("ME.json");

        let store = ParameterStore::load(&cache, default_node_parameters()).await;
        assert_eq!(store.snapshot().video_interval, 10);

        let mut cached = default_node_parameters();
        cached.video_interval = 42;
        tokio::fs::write(&cache, serde_json::to_vec(&cached).unwrap())
            .await
            .unwrap();

        let store = ParameterStore::load(&cache, default_node_parameters()).await;
        assert_eq!(store.snapshot().video_interval, 42);
    }

    struct FailingProvider;

    #[async_trait]
    impl ConfigProvider for FailingProvider {
        async fn fetch(&self) -> Result<NodeParameters, ParamsError> {
            Err(ParamsError::ConfigUnavailable {
                details: "offline".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_stale_snapshot() {
        let store = Arc::new(ParameterStore::new(default_node_parameters()));
        let refresher = ParameterRefresher::new(Arc::new(FailingProvider), Arc::clone(&store));

        assert!(!refresher.refresh_once().await);
        assert_eq!(*store.snapshot(), default_node_parameters());
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let mut fresh = default_node_parameters();
        fresh.day_threshold = 1234.0;
        let store = Arc::new(ParameterStore::new(default_node_parameters()));
        let refresher = ParameterRefresher::new(
            Arc::new(StaticConfigProvider::new(fresh)),
            Arc::clone(&store),
        );

        assert!(refresher.refresh_once().await);
        assert_eq!(store.snapshot().day_threshold, 1234.0);
    }

    struct CountingMaskProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConfigProvider for CountingMaskProvider {
        async fn fetch(&self) -> Result<NodeParameters, ParamsError> {
            Ok(default_node_parameters())
        }

        async fn fetch_roi_mask(&self, _url: &str) -> Result<GrayImage, ParamsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GrayImage::new(4, 4))
        }
    }

    #[tokio::test]
    async fn test_roi_mask_downloaded_once() {
        let provider = CountingMaskProvider {
            calls: AtomicUsize::new(0),
        };
        let mut cache = RoiMaskCache::new();
        let mut params = default_node_parameters();

        assert!(cache.resolve(&params, &provider).await.is_none());

        params.roi_mask_url = Some("http://site/mask.png".to_string());
        assert!(cache.resolve(&params, &provider).await.is_some());
        assert!(cache.resolve(&params, &provider).await.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_roi_mask_failure_falls_back_to_unmasked() {
        let provider = StaticConfigProvider::new(default_node_parameters());
        let mut cache = RoiMaskCache::new();
        let mut params = default_node_parameters();
        params.roi_mask_url = Some("http://site/mask.png".to_string());

        assert!(cache.resolve(&params, &provider).await.is_none());
    }

    #[test]
    fn test_free_space_reports_something_for_tmp() {
        let dir = tempfile::TempDir::new().unwrap();
        if cfg!(unix) {
            assert!(free_space_gib(dir.path()).is_some());
        }
    }
}
