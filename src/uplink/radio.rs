use crate::actuators::write_gpio;
use crate::config::{ActuatorBackend, ActuatorConfig};
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Power switch of the cellular/radio modem
pub trait Radio: Send + Sync {
    fn set_power(&self, on: bool) -> io::Result<()>;
}

pub fn from_config(config: &ActuatorConfig) -> Arc<dyn Radio> {
    match config.backend {
        ActuatorBackend::Sysfs => Arc::new(SysfsRadio::new(&config.radio_path)),
        ActuatorBackend::None => {
            info!("No radio power control configured");
            Arc::new(MockRadio::new())
        }
    }
}

pub struct SysfsRadio {
    path: PathBuf,
}

impl SysfsRadio {
    pub fn new(path: &str) -> Self {
        Self {
            path: PathBuf::from(path),
        }
    }
}

impl Radio for SysfsRadio {
    fn set_power(&self, on: bool) -> io::Result<()> {
        write_gpio(&self.path, on)
    }
}

/// Records power transitions in memory
#[derive(Default)]
pub struct MockRadio {
    transitions: Mutex<Vec<bool>>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().clone()
    }

    pub fn is_on(&self) -> Option<bool> {
        self.transitions.lock().last().copied()
    }
}

impl Radio for MockRadio {
    fn set_power(&self, on: bool) -> io::Result<()> {
        self.transitions.lock().push(on);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_radio_writes_value_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("value");
        let radio = SysfsRadio::new(path.to_str().unwrap());

        radio.set_power(true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
        radio.set_power(false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }
}
