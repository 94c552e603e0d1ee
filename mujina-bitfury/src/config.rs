//! Runtime configuration.
//!
//! Device selection comes from environment variables; tuning parameters can
//! be overridden from a JSON file named by `MUJINA_TUNING_FILE`.
//!
//! # Environment Variables
//!
//! - `MUJINA_BITFURY_VIRTUAL`: simulated board geometry as `<slots>x<chips>`
//!   (default `4x8`), or `off` to disable it
//! - `MUJINA_TUNING_FILE`: path to a JSON object with [`TuningConfig`] fields

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chip::{FREQUENCY_CODE_MAX, FREQUENCY_CODE_MIN};
use crate::error::{Error, Result};

/// Tuner timing and voltage parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningConfig {
    /// Short tier cadence and share window (seconds).
    pub short_interval_secs: u64,

    /// Long tier cadence and share window (seconds).
    pub long_interval_secs: u64,

    /// Very-long tier cadence (seconds). The tier has no actions yet.
    pub very_long_interval_secs: u64,

    /// Pause between pushing work and reading the latched flags (ms).
    pub settle_delay_ms: u64,

    /// Oscillator code every chip starts at.
    pub initial_frequency: u8,

    /// Voltage applied to every slot at detection.
    pub detect_voltage: f32,

    /// Voltage the long tier gives to slots running slow.
    pub raised_voltage: f32,

    /// Long tier passes allowed to touch voltage.
    pub voltage_apply_limit: u8,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            short_interval_secs: 10,
            long_interval_secs: 900,
            very_long_interval_secs: 30 * 60,
            settle_delay_ms: 5,
            initial_frequency: 55,
            detect_voltage: 0.835,
            raised_voltage: 0.91,
            voltage_apply_limit: 2,
        }
    }
}

impl TuningConfig {
    pub fn short_interval(&self) -> Duration {
        Duration::from_secs(self.short_interval_secs)
    }

    pub fn long_interval(&self) -> Duration {
        Duration::from_secs(self.long_interval_secs)
    }

    pub fn very_long_interval(&self) -> Duration {
        Duration::from_secs(self.very_long_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.short_interval_secs == 0
            || self.long_interval_secs == 0
            || self.very_long_interval_secs == 0
        {
            return Err(Error::Config("tier intervals must be non-zero".into()));
        }
        if !(FREQUENCY_CODE_MIN..=FREQUENCY_CODE_MAX).contains(&self.initial_frequency) {
            return Err(Error::Config(format!(
                "initial_frequency {} outside {}..={}",
                self.initial_frequency, FREQUENCY_CODE_MIN, FREQUENCY_CODE_MAX
            )));
        }
        for (name, volts) in [
            ("detect_voltage", self.detect_voltage),
            ("raised_voltage", self.raised_voltage),
        ] {
            if !(0.5..=1.2).contains(&volts) {
                return Err(Error::Config(format!("{name} {volts} V outside 0.5..=1.2")));
            }
        }
        Ok(())
    }

    /// Parse and validate overrides from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid tuning JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

/// Geometry of a simulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBoardConfig {
    pub slots: u8,
    pub chips_per_slot: u8,
}

impl Default for VirtualBoardConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            chips_per_slot: 8,
        }
    }
}

impl FromStr for VirtualBoardConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("expected <slots>x<chips>, got {s:?}"));
        let (slots, chips) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let slots: u8 = slots.parse().map_err(|_| invalid())?;
        let chips_per_slot: u8 = chips.parse().map_err(|_| invalid())?;
        if slots == 0 || slots > 32 || chips_per_slot == 0 {
            return Err(invalid());
        }
        Ok(Self {
            slots,
            chips_per_slot,
        })
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct MinerConfig {
    pub tuning: TuningConfig,
    pub virtual_board: Option<VirtualBoardConfig>,
}

impl MinerConfig {
    pub fn from_env() -> Result<Self> {
        let virtual_board = match std::env::var("MUJINA_BITFURY_VIRTUAL") {
            Ok(value) if value.eq_ignore_ascii_case("off") => None,
            Ok(value) => Some(value.parse()?),
            Err(_) => Some(VirtualBoardConfig::default()),
        };

        let tuning = match std::env::var("MUJINA_TUNING_FILE") {
            Ok(path) => TuningConfig::from_json_file(Path::new(&path))?,
            Err(_) => TuningConfig::default(),
        };

        Ok(Self {
            tuning,
            virtual_board,
        })
    }
}
