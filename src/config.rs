use crate::params::NodeParameters;
use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FieldcamConfig {
    pub camera: CameraConfig,
    pub storage: StorageConfig,
    pub lifecycle: LifecycleConfig,
    pub uplink: UplinkConfig,
    pub remote: RemoteConfig,
    pub node: NodeConfig,
    pub actuators: ActuatorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// GStreamer appsink pipeline (Linux, `camera` feature)
    Gstreamer,
    /// Static synthetic frames, for bench testing without a sensor
    Synthetic,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_camera_backend")]
    pub backend: CameraBackend,

    /// GStreamer source element (e.g. "nvarguscamerasrc" or "v4l2src device=/dev/video0")
    #[serde(default = "default_camera_source")]
    pub source: String,

    /// Full pipeline override; must end in an appsink named "sink" producing RGBA
    #[serde(default)]
    pub pipeline: Option<String>,

    /// Capture resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Sensor frame rate
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Frames discarded after open while auto-exposure settles
    #[serde(default = "default_warm_up_frames")]
    pub warm_up_frames: u32,

    /// Maximum wait for a single frame
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Root of the on-disk queue and state files
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// SQLite log store file name, relative to base_path
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Maximum wait for the log store's exclusive lock
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LifecycleConfig {
    /// Hardware trigger polling period while idle
    #[serde(default = "default_trigger_poll_ms")]
    pub trigger_poll_ms: u64,

    /// Maximum idle wait for a trigger before polling anyway
    #[serde(default = "default_trigger_wait_seconds")]
    pub trigger_wait_seconds: u64,

    /// Keep unconfirmed but triggered probes under false/
    #[serde(default = "default_retain_false_positives")]
    pub retain_false_positives: bool,

    /// First delay after a camera open failure
    #[serde(default = "default_camera_retry_base_ms")]
    pub camera_retry_base_ms: u64,

    /// Upper bound for the camera retry delay
    #[serde(default = "default_camera_retry_max_seconds")]
    pub camera_retry_max_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UplinkConfig {
    /// Queue polling period
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sustained failure duration before requests stop
    #[serde(default = "default_failure_window_seconds")]
    pub failure_window_seconds: u64,

    /// Pause, measured from the first failure, before requests resume
    #[serde(default = "default_retry_cooldown_seconds")]
    pub retry_cooldown_seconds: u64,

    /// Empty-queue duration before the radio is powered down
    #[serde(default = "default_radio_idle_timeout_seconds")]
    pub radio_idle_timeout_seconds: u64,

    /// Keep the radio powered regardless of queue state
    #[serde(default = "default_keep_radio_on")]
    pub keep_radio_on: bool,

    /// Radio state assumed when no persisted state exists
    #[serde(default = "default_radio_on_at_boot")]
    pub radio_on_at_boot: bool,

    /// Resolution images are scaled to before upload
    #[serde(default = "default_upload_resolution")]
    pub upload_resolution: (u32, u32),

    /// JPEG quality for uploaded images
    #[serde(default = "default_upload_quality")]
    pub upload_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteConfig {
    /// Base URL of the dashboard site
    #[serde(default = "default_site_url")]
    pub site_url: String,

    /// API token sent as `Authorization: Token <token>`
    #[serde(default)]
    pub token: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    /// IANA timezone the sunrise/sunset times are expressed in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Parameters used until the remote provider answers
    pub defaults: NodeParameters,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorBackend {
    /// GPIO value files under /sys/class/gpio
    Sysfs,
    /// No hardware; trigger never fires
    None,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ActuatorConfig {
    #[serde(default = "default_actuator_backend")]
    pub backend: ActuatorBackend,

    /// Infrared illuminator value file
    #[serde(default = "default_illumination_path")]
    pub illumination_path: String,

    /// Day/night optical filter value file
    #[serde(default = "default_filter_path")]
    pub filter_path: String,

    /// PIR trigger value file
    #[serde(default = "default_trigger_path")]
    pub trigger_path: String,

    /// Radio modem power value file
    #[serde(default = "default_radio_path")]
    pub radio_path: String,
}

impl StorageConfig {
    pub fn base(&self) -> PathBuf {
        PathBuf::from(&self.base_path)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base().join("staging")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.base().join("events")
    }

    pub fn false_dir(&self) -> PathBuf {
        self.base().join("false")
    }

    pub fn done_dir(&self) -> PathBuf {
        self.base().join("done")
    }

    /// Queued frames that repeatedly could not be read
    pub fn quarantine_dir(&self) -> PathBuf {
        self.base().join("quarantine")
    }

    pub fn database_path(&self) -> PathBuf {
        self.base().join(&self.database_file)
    }

    pub fn params_cache_path(&self) -> PathBuf {
        self.base().join("ME.json")
    }

    pub fn uplink_state_path(&self) -> PathBuf {
        self.base().join("uplink_state.json")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }
}

impl NodeConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Message(format!("Unknown node timezone: {}", self.timezone)))
    }
}

impl FieldcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("fieldcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let defaults = default_node_parameters();

        let settings = Config::builder()
            .set_default("camera.backend", "gstreamer")?
            .set_default("camera.source", default_camera_source())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.fps", default_camera_fps())?
            .set_default("camera.warm_up_frames", default_warm_up_frames())?
            .set_default("camera.read_timeout_ms", default_read_timeout_ms())?
            .set_default("storage.base_path", default_base_path())?
            .set_default("storage.database_file", default_database_file())?
            .set_default(
                "storage.lock_timeout_seconds",
                default_lock_timeout_seconds(),
            )?
            .set_default("lifecycle.trigger_poll_ms", default_trigger_poll_ms())?
            .set_default(
                "lifecycle.trigger_wait_seconds",
                default_trigger_wait_seconds(),
            )?
            .set_default(
                "lifecycle.retain_false_positives",
                default_retain_false_positives(),
            )?
            .set_default(
                "lifecycle.camera_retry_base_ms",
                default_camera_retry_base_ms(),
            )?
            .set_default(
                "lifecycle.camera_retry_max_seconds",
                default_camera_retry_max_seconds(),
            )?
            .set_default("uplink.poll_interval_ms", default_poll_interval_ms())?
            .set_default(
                "uplink.failure_window_seconds",
                default_failure_window_seconds(),
            )?
            .set_default(
                "uplink.retry_cooldown_seconds",
                default_retry_cooldown_seconds(),
            )?
            .set_default(
                "uplink.radio_idle_timeout_seconds",
                default_radio_idle_timeout_seconds(),
            )?
            .set_default("uplink.keep_radio_on", default_keep_radio_on())?
            .set_default("uplink.radio_on_at_boot", default_radio_on_at_boot())?
            .set_default(
                "uplink.upload_resolution",
                vec![default_upload_resolution().0, default_upload_resolution().1],
            )?
            .set_default("uplink.upload_quality", default_upload_quality() as u32)?
            .set_default("remote.site_url", default_site_url())?
            .set_default("remote.token", "")?
            .set_default(
                "remote.request_timeout_seconds",
                default_request_timeout_seconds(),
            )?
            .set_default("node.timezone", default_timezone())?
            .set_default("node.defaults.live", defaults.live)?
            .set_default("node.defaults.video_interval", defaults.video_interval)?
            .set_default("node.defaults.motion_interval", defaults.motion_interval)?
            .set_default("node.defaults.frames_per_sec", defaults.frames_per_sec)?
            .set_default("node.defaults.day_threshold", defaults.day_threshold)?
            .set_default("node.defaults.night_threshold", defaults.night_threshold)?
            .set_default("node.defaults.update_after", defaults.update_after)?
            .set_default(
                "node.defaults.sunrise",
                defaults.sunrise.format("%H:%M:%S").to_string(),
            )?
            .set_default(
                "node.defaults.sunset",
                defaults.sunset.format("%H:%M:%S").to_string(),
            )?
            .set_default("actuators.backend", "none")?
            .set_default("actuators.illumination_path", default_illumination_path())?
            .set_default("actuators.filter_path", default_filter_path())?
            .set_default("actuators.trigger_path", default_trigger_path())?
            .set_default("actuators.radio_path", default_radio_path())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Environment overrides, e.g. FIELDCAM__UPLINK__KEEP_RADIO_ON=true
            .add_source(Environment::with_prefix("FIELDCAM").separator("__"))
            .build()?;

        let config: FieldcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.fps == 0 {
            return Err(ConfigError::Message(
                "Camera fps must be greater than 0".to_string(),
            ));
        }

        if self.storage.base_path.is_empty() {
            return Err(ConfigError::Message(
                "Storage base_path must not be empty".to_string(),
            ));
        }

        if self.storage.lock_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Storage lock_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.trigger_poll_ms == 0 {
            return Err(ConfigError::Message(
                "Lifecycle trigger_poll_ms must be greater than 0".to_string(),
            ));
        }

        if self.uplink.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Uplink poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.uplink.retry_cooldown_seconds < self.uplink.failure_window_seconds {
            return Err(ConfigError::Message(
                "Uplink retry_cooldown_seconds must not be shorter than failure_window_seconds"
                    .to_string(),
            ));
        }

        if self.uplink.upload_resolution.0 == 0 || self.uplink.upload_resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Uplink upload_resolution must be greater than 0".to_string(),
            ));
        }

        if self.uplink.upload_quality == 0 || self.uplink.upload_quality > 100 {
            return Err(ConfigError::Message(
                "Uplink upload_quality must be within 1..=100".to_string(),
            ));
        }

        self.node.tz()?;

        self.node
            .defaults
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        Ok(())
    }
}

impl Default for FieldcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                backend: default_camera_backend(),
                source: default_camera_source(),
                pipeline: None,
                resolution: default_camera_resolution(),
                fps: default_camera_fps(),
                warm_up_frames: default_warm_up_frames(),
                read_timeout_ms: default_read_timeout_ms(),
            },
            storage: StorageConfig {
                base_path: default_base_path(),
                database_file: default_database_file(),
                lock_timeout_seconds: default_lock_timeout_seconds(),
            },
            lifecycle: LifecycleConfig {
                trigger_poll_ms: default_trigger_poll_ms(),
                trigger_wait_seconds: default_trigger_wait_seconds(),
                retain_false_positives: default_retain_false_positives(),
                camera_retry_base_ms: default_camera_retry_base_ms(),
                camera_retry_max_seconds: default_camera_retry_max_seconds(),
            },
            uplink: UplinkConfig {
                poll_interval_ms: default_poll_interval_ms(),
                failure_window_seconds: default_failure_window_seconds(),
                retry_cooldown_seconds: default_retry_cooldown_seconds(),
                radio_idle_timeout_seconds: default_radio_idle_timeout_seconds(),
                keep_radio_on: default_keep_radio_on(),
                radio_on_at_boot: default_radio_on_at_boot(),
                upload_resolution: default_upload_resolution(),
                upload_quality: default_upload_quality(),
            },
            remote: RemoteConfig {
                site_url: default_site_url(),
                token: String::new(),
                request_timeout_seconds: default_request_timeout_seconds(),
            },
            node: NodeConfig {
                timezone: default_timezone(),
                defaults: default_node_parameters(),
            },
            actuators: ActuatorConfig {
                backend: default_actuator_backend(),
                illumination_path: default_illumination_path(),
                filter_path: default_filter_path(),
                trigger_path: default_trigger_path(),
                radio_path: default_radio_path(),
            },
        }
    }
}

// Default value functions
fn default_camera_backend() -> CameraBackend {
    CameraBackend::Gstreamer
}
fn default_camera_source() -> String {
    "nvarguscamerasrc".to_string()
}
fn default_camera_resolution() -> (u32, u32) {
    (1280, 720)
}
fn default_camera_fps() -> u32 {
    30
}
fn default_warm_up_frames() -> u32 {
    35
} // Auto-exposure settles within roughly a second at 30fps
fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_base_path() -> String {
    "./fieldcam-data".to_string()
}
fn default_database_file() -> String {
    "local.db".to_string()
}
fn default_lock_timeout_seconds() -> u64 {
    60
}

fn default_trigger_poll_ms() -> u64 {
    500
}
fn default_trigger_wait_seconds() -> u64 {
    2
}
fn default_retain_false_positives() -> bool {
    true
}
fn default_camera_retry_base_ms() -> u64 {
    1000
}
fn default_camera_retry_max_seconds() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_failure_window_seconds() -> u64 {
    150
}
fn default_retry_cooldown_seconds() -> u64 {
    900
}
fn default_radio_idle_timeout_seconds() -> u64 {
    120
}
fn default_keep_radio_on() -> bool {
    false
}
fn default_radio_on_at_boot() -> bool {
    true
}
fn default_upload_resolution() -> (u32, u32) {
    (640, 480)
}
fn default_upload_quality() -> u8 {
    90
}

fn default_site_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub(crate) fn default_node_parameters() -> NodeParameters {
    NodeParameters {
        live: true,
        video_interval: 10,
        motion_interval: 2,
        frames_per_sec: 30,
        day_threshold: 1000.0,
        night_threshold: 3000.0,
        update_after: 300,
        sunrise: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
        sunset: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        roi_mask_url: None,
    }
}

fn default_actuator_backend() -> ActuatorBackend {
    ActuatorBackend::None
}
fn default_illumination_path() -> String {
    "/sys/class/gpio/gpio12/value".to_string()
}
fn default_filter_path() -> String {
    "/sys/class/gpio/gpio24/value".to_string()
}
fn default_trigger_path() -> String {
    "/sys/class/gpio/gpio7/value".to_string()
}
fn default_radio_path() -> String {
    "/sys/class/gpio/gpio16/value".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = FieldcamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.uplink.failure_window_seconds, 150);
        assert_eq!(config.uplink.retry_cooldown_seconds, 900);
        assert_eq!(config.camera.warm_up_frames, 35);
    }

    #[test]
    fn test_storage_layout() {
        let mut config = FieldcamConfig::default();
        config.storage.base_path = "/data/node".to_string();

        assert_eq!(
            config.storage.events_dir(),
            PathBuf::from("/data/node/events")
        );
        assert_eq!(config.storage.false_dir(), PathBuf::from("/data/node/false"));
        assert_eq!(config.storage.done_dir(), PathBuf::from("/data/node/done"));
        assert_eq!(
            config.storage.database_path(),
            PathBuf::from("/data/node/local.db")
        );
    }

    #[test]
    fn test_load_from_file_with_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fieldcam.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[camera]
backend = "synthetic"

[uplink]
keep_radio_on = true
radio_idle_timeout_seconds = 30

[node]
timezone = "Asia/Karachi"

[node.defaults]
day_threshold = 800.0
sunrise = "05:30:00"
"#
        )
        .unwrap();

        let config = FieldcamConfig::load_from_file(&path).unwrap();
        assert_eq!(config.camera.backend, CameraBackend::Synthetic);
        assert!(config.uplink.keep_radio_on);
        assert_eq!(config.uplink.radio_idle_timeout_seconds, 30);
        assert_eq!(config.node.timezone, "Asia/Karachi");
        assert_eq!(config.node.defaults.day_threshold, 800.0);
        assert_eq!(
            config.node.defaults.sunrise,
            NaiveTime::from_hms_opt(5, 30, 0).unwrap()
        );
        // Untouched keys keep their defaults
        assert_eq!(config.node.defaults.night_threshold, 3000.0);
        assert_eq!(config.uplink.failure_window_seconds, 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = FieldcamConfig::default();

        config.camera.resolution = (0, 0);
        assert!(config.validate().is_err());
        config.camera.resolution = (1280, 720);

        config.uplink.retry_cooldown_seconds = 60;
        assert!(config.validate().is_err());
        config.uplink.retry_cooldown_seconds = 900;

        config.node.timezone = "Mars/Olympus_Mons".to_string();
        assert!(config.validate().is_err());
        config.node.timezone = "UTC".to_string();

        assert!(config.validate().is_ok());
    }
}
