use crate::config::{ActuatorBackend, ActuatorConfig};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Logical on/off contract for the node's auxiliary hardware
pub trait Actuators: Send + Sync {
    /// Infrared illuminator
    fn set_illumination(&self, on: bool) -> io::Result<()>;

    /// Day/night optical filter; `night = true` removes the IR-cut filter
    fn set_optical_filter(&self, night: bool) -> io::Result<()>;

    /// Current level of the hardware (PIR) trigger
    fn read_trigger(&self) -> io::Result<bool>;
}

/// Build the configured actuator backend
pub fn from_config(config: &ActuatorConfig) -> Arc<dyn Actuators> {
    match config.backend {
        ActuatorBackend::Sysfs => {
            info!("Using sysfs GPIO actuators");
            Arc::new(SysfsActuators::new(
                &config.illumination_path,
                &config.filter_path,
                &config.trigger_path,
            ))
        }
        ActuatorBackend::None => {
            info!("No actuator hardware configured");
            Arc::new(NullActuators)
        }
    }
}

pub(crate) fn write_gpio(path: &Path, on: bool) -> io::Result<()> {
    std::fs::write(path, if on { "1" } else { "0" })
}

pub(crate) fn read_gpio(path: &Path) -> io::Result<bool> {
    let raw = std::fs::read_to_string(path)?;
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected GPIO value {:?} in {}", other, path.display()),
        )),
    }
}

/// GPIO value files exported under /sys/class/gpio
pub struct SysfsActuators {
    illumination: PathBuf,
    filter: PathBuf,
    trigger: PathBuf,
}

impl SysfsActuators {
    pub fn new(illumination: &str, filter: &str, trigger: &str) -> Self {
        Self {
            illumination: PathBuf::from(illumination),
            filter: PathBuf::from(filter),
            trigger: PathBuf::from(trigger),
        }
    }
}

impl Actuators for SysfsActuators {
    fn set_illumination(&self, on: bool) -> io::Result<()> {
        debug!("Illumination {}", if on { "on" } else { "off" });
        write_gpio(&self.illumination, on)
    }

    fn set_optical_filter(&self, night: bool) -> io::Result<()> {
        debug!("Optical filter {}", if night { "night" } else { "day" });
        write_gpio(&self.filter, night)
    }

    fn read_trigger(&self) -> io::Result<bool> {
        read_gpio(&self.trigger)
    }
}

/// No hardware attached; the trigger never fires
pub struct NullActuators;

impl Actuators for NullActuators {
    fn set_illumination(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn set_optical_filter(&self, _night: bool) -> io::Result<()> {
        Ok(())
    }

    fn read_trigger(&self) -> io::Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCall {
    Illumination(bool),
    OpticalFilter(bool),
}

/// In-memory actuators for testing and dry runs
#[derive(Default)]
pub struct MockActuators {
    calls: Mutex<Vec<ActuatorCall>>,
    illumination: AtomicBool,
    trigger: AtomicBool,
}

impl MockActuators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_trigger(&self, level: bool) {
        self.trigger.store(level, Ordering::SeqCst);
    }

    pub fn illumination_on(&self) -> bool {
        self.illumination.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.calls.lock().clone()
    }
}

impl Actuators for MockActuators {
    fn set_illumination(&self, on: bool) -> io::Result<()> {
        self.illumination.store(on, Ordering::SeqCst);
        self.calls.lock().push(ActuatorCall::Illumination(on));
        Ok(())
    }

    fn set_optical_filter(&self, night: bool) -> io::Result<()> {
        self.calls.lock().push(ActuatorCall::OpticalFilter(night));
        Ok(())
    }

    fn read_trigger(&self) -> io::Result<bool> {
        Ok(self.trigger.load(Ordering::SeqCst))
    }
}
