//! Tiered frequency and voltage tuning.
//!
//! The tuner runs inline in the dispatch cycle. Each tier has its own
//! cadence and share window:
//!
//! | Tier      | Default | Actions                                        |
//! |-----------|---------|------------------------------------------------|
//! | short     | 10 s    | nudge stalled chips, anomaly step-down, thermal override |
//! | long      | 900 s   | frequency walk, reinit dead chips, voltage raise |
//! | very-long | 30 min  | none yet                                       |
//!
//! Every action goes straight to the transport and blocks the device thread
//! until the hardware answers.

mod long_tier;
mod short_tier;
mod state;

use serde::Serialize;
use tokio::time::Instant;

use crate::chip::ChipSlot;
use crate::config::TuningConfig;
use crate::slot::SlotSummary;
use crate::tracing::prelude::*;
use crate::transport::ChipTransport;

pub use state::ControllerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Tier {
    Short,
    Long,
    VeryLong,
}

/// Outcome of one tier pass.
#[derive(Debug, Clone, Serialize)]
pub struct TierReport {
    pub tier: Tier,
    pub slots: Vec<SlotSummary>,
    /// Anomalies counted across all chips (short tier only)
    pub anomalies: u32,
    /// Voltage passes left after this one
    pub voltage_budget: u8,
}

impl TierReport {
    pub fn total_hashrate_ghs(&self) -> f64 {
        self.slots.iter().map(|s| s.hashrate_ghs).sum()
    }
}

pub struct TuningController {
    config: TuningConfig,
    state: ControllerState,
    last_short: Option<TierReport>,
    last_long: Option<TierReport>,
}

impl TuningController {
    pub fn new(config: TuningConfig) -> Self {
        Self {
            state: ControllerState::new(&config),
            config,
            last_short: None,
            last_long: None,
        }
    }

    pub fn config(&self) -> &TuningConfig {
        &self.config
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn last_report(&self, tier: Tier) -> Option<&TierReport> {
        match tier {
            Tier::Short => self.last_short.as_ref(),
            Tier::Long => self.last_long.as_ref(),
            Tier::VeryLong => None,
        }
    }

    /// First-cycle setup: every chip to the initial code and reinitialized
    /// there, tier timers started. Does nothing on later calls.
    pub fn initialize(
        &mut self,
        chips: &mut [ChipSlot],
        transport: &mut dyn ChipTransport,
        now: Instant,
    ) -> bool {
        if self.state.is_initialized() {
            return false;
        }

        let code = self.config.initial_frequency;
        for chip in chips.iter_mut() {
            chip.frequency_code = code;
        }
        for chip in chips.iter() {
            if let Err(e) = transport.reinit(chip.address(), code) {
                warn!(chip = %chip.address(), error = %e, "Initial reinit failed");
            }
        }

        info!(chips = chips.len(), code, "Chips initialized");
        self.state.initialize(now)
    }

    /// Run every tier whose interval has elapsed, shortest first.
    pub fn run_due_tiers(
        &mut self,
        chips: &mut [ChipSlot],
        transport: &mut dyn ChipTransport,
        now: Instant,
    ) -> Vec<Tier> {
        let mut fired = Vec::new();

        if self.state.short.fire_if_due(now) {
            let report = short_tier::run(
                chips,
                transport,
                self.config.short_interval(),
                self.state.voltage_budget(),
                now,
            );
            self.last_short = Some(report);
            fired.push(Tier::Short);
        }

        if self.state.long.fire_if_due(now) {
            let report = long_tier::run(
                chips,
                transport,
                self.config.long_interval(),
                &mut self.state,
                self.config.raised_voltage,
                now,
            );
            self.last_long = Some(report);
            fired.push(Tier::Long);
        }

        if self.state.very_long.fire_if_due(now) {
            debug!(
                window_secs = self.config.very_long_interval_secs,
                "Very-long tier elapsed"
            );
            fired.push(Tier::VeryLong);
        }

        fired
    }
}
