use std::time::Duration;

use tokio::time::Instant;

use crate::config::TuningConfig;

/// Fires once per `interval`, measured from the previous firing.
#[derive(Debug, Clone)]
pub(super) struct TierTimer {
    interval: Duration,
    last_fire: Option<Instant>,
}

impl TierTimer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fire: None,
        }
    }

    fn seed(&mut self, now: Instant) {
        self.last_fire = Some(now);
    }

    /// True (and re-armed) once strictly more than `interval` has passed.
    /// Never fires before being seeded.
    pub(super) fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.last_fire {
            Some(last) if now.saturating_duration_since(last) > self.interval => {
                self.last_fire = Some(now);
                true
            }
            _ => false,
        }
    }
}

/// Tuner state that lives as long as the device.
///
/// `initialized` only goes false to true and the voltage budget only counts
/// down; neither is ever reset.
#[derive(Debug, Clone)]
pub struct ControllerState {
    initialized: bool,
    voltage_budget: u8,
    pub(super) short: TierTimer,
    pub(super) long: TierTimer,
    pub(super) very_long: TierTimer,
}

impl ControllerState {
    pub fn new(config: &TuningConfig) -> Self {
        Self {
            initialized: false,
            voltage_budget: config.voltage_apply_limit,
            short: TierTimer::new(config.short_interval()),
            long: TierTimer::new(config.long_interval()),
            very_long: TierTimer::new(config.very_long_interval()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Long tier passes still allowed to change voltage.
    pub fn voltage_budget(&self) -> u8 {
        self.voltage_budget
    }

    /// Mark initialization done and start every tier timer at `now`.
    /// Returns false if this already happened.
    pub(super) fn initialize(&mut self, now: Instant) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        self.short.seed(now);
        self.long.seed(now);
        self.very_long.seed(now);
        true
    }

    /// Spend one voltage pass, if any are left.
    pub(super) fn take_voltage_pass(&mut self) -> bool {
        if self.voltage_budget == 0 {
            return false;
        }
        self.voltage_budget -= 1;
        true
    }
}
