//! Scanner configuration, loaded from TOML.
//!
//! Every field has a default matching the hardware as wired, so an empty file
//! (or no file at all) is a valid configuration. Durations are written in
//! seconds and may be fractional.
//!
//! ```toml
//! emulate = false
//!
//! [timing]
//! startup = 7
//! scan_max = 10.5
//!
//! [scan]
//! dpi = 150
//! area = [0, 0, 1275, 1650]
//! ```

use crate::constants::{PID, PIN_BUTTON, PIN_MOTOR_WAKE, PIN_PAPER, PIN_POWER, VID};
use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Run against the built-in emulated scanner instead of USB and GPIO
    pub emulate: bool,
    pub usb: UsbConfig,
    pub gpio: GpioConfig,
    pub timing: Timing,
    pub scan: ScanSettings,
}

impl ScannerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ScanError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ScanError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ScanError> {
        toml::to_string_pretty(self).map_err(|e| ScanError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.timing.scan_max_long < self.timing.scan_max {
            return Err(ScanError::Config(
                "timing.scan_max_long must not be shorter than timing.scan_max".to_string(),
            ));
        }
        if self.scan.dpi == 0 {
            return Err(ScanError::Config("scan.dpi must be nonzero".to_string()));
        }
        let [left, top, right, bottom] = self.scan.area;
        if right <= left || bottom <= top {
            return Err(ScanError::Config(format!(
                "scan.area {:?} is empty",
                self.scan.area
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: VID,
            product_id: PID,
        }
    }
}

/// BCM pin numbers of the four rails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub power: u8,
    pub button: u8,
    pub paper: u8,
    pub motor_wake: u8,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            power: PIN_POWER,
            button: PIN_BUTTON,
            paper: PIN_PAPER,
            motor_wake: PIN_MOTOR_WAKE,
        }
    }
}

/// Real-world timing windows of the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Idle time in Ready before the scanner dozes off (its own 10 min default)
    #[serde(with = "secs")]
    pub powersaving_timeout: Duration,
    /// Boot time from no power
    #[serde(with = "secs")]
    pub startup: Duration,
    /// Wake-up time from power saving
    #[serde(with = "secs")]
    pub startup_resume: Duration,
    /// Pause between power-off and power-on during a reset
    #[serde(with = "secs")]
    pub restart_delay: Duration,
    /// Delay after power-on before the button is pressed
    #[serde(with = "secs")]
    pub button_delay: Duration,
    #[serde(with = "secs")]
    pub button_hold: Duration,
    /// Pause after raising the paper rail before the scan starts
    #[serde(with = "secs")]
    pub paper_settle: Duration,
    /// Paper rail stays up this long for a normal sheet
    #[serde(with = "secs")]
    pub scan_max: Duration,
    #[serde(with = "secs")]
    pub scan_max_long: Duration,
    /// Motor driver wake-up after the scan starts
    #[serde(with = "secs")]
    pub motor_wake: Duration,
    /// Motor driver goes back to sleep this long after the paper deadline
    #[serde(with = "secs")]
    pub motor_sleep_margin: Duration,
    /// How long the device may keep streaming after the paper deadline before
    /// the sheet is considered jammed
    #[serde(with = "secs")]
    pub jam_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            powersaving_timeout: Duration::from_secs(10 * 60),
            startup: Duration::from_secs(7),
            startup_resume: Duration::from_secs(4),
            restart_delay: Duration::from_secs(1),
            button_delay: Duration::from_millis(100),
            button_hold: Duration::from_millis(100),
            paper_settle: Duration::from_millis(500),
            scan_max: Duration::from_millis(10_500),
            scan_max_long: Duration::from_millis(31_500),
            motor_wake: Duration::from_millis(1_400),
            motor_sleep_margin: Duration::from_millis(200),
            jam_grace: Duration::from_secs(5),
        }
    }
}

impl Timing {
    pub fn scan_duration(&self, long: bool) -> Duration {
        if long { self.scan_max_long } else { self.scan_max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub dpi: u16,
    /// Left, top, right, bottom in dots at `dpi`
    pub area: [u32; 4],
}

impl Default for ScanSettings {
    fn default() -> Self {
        // US letter at 150 dpi
        Self {
            dpi: 150,
            area: [0, 0, 1275, 1650],
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
