//! The device seam the host drives, and the Bitfury board behind it.
//!
//! A device is owned by exactly one OS thread (see [`crate::device_thread`]),
//! which calls [`HardwareDevice::thread_prepare`] once, then
//! [`HardwareDevice::scan_cycle`] in a loop, then
//! [`HardwareDevice::thread_shutdown`].

use std::collections::BTreeSet;

use serde::Serialize;
use tokio::time::Instant;

use crate::chip::{ChipAddress, ChipSlot};
use crate::config::TuningConfig;
use crate::dispatch::{self, CycleOutcome};
use crate::error::{Error, Result};
use crate::slot::{SlotSummary, power_rail};
use crate::tracing::prelude::*;
use crate::transport::{ChipTransport, VoltageLevel};
use crate::tuning::{Tier, TuningController};
use crate::work::WorkHost;

/// What the host needs from a mining device.
pub trait HardwareDevice: Send {
    fn name(&self) -> &str;

    /// One-line human summary for periodic status logs.
    fn status_line(&self) -> String;

    /// Snapshot for the host side.
    fn status(&self) -> DeviceStatus;

    /// Called once on the device thread before the first cycle.
    fn thread_prepare(&mut self) -> Result<()>;

    /// One dispatch pass. [`CycleOutcome::Starved`] when the host had no
    /// work to hand out.
    fn scan_cycle(&mut self, host: &mut dyn WorkHost) -> Result<CycleOutcome>;

    /// Called once on the device thread after the last cycle.
    fn thread_shutdown(&mut self);
}

/// Point-in-time view of a device, shared with the async side.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub chips: usize,
    /// Last short-tier view of each slot
    pub slots: Vec<SlotSummary>,
    /// Last short-tier total
    pub hashrate_ghs: f64,
    pub voltage_budget: u8,
    pub hashes_total: u64,
    pub uptime_secs: u64,
    pub is_active: bool,
    /// Same text as [`HardwareDevice::status_line`]
    pub line: String,
}

/// A chain of Bitfury chips spread over power slots.
pub struct BitfuryDevice {
    name: String,
    transport: Box<dyn ChipTransport>,
    chips: Vec<ChipSlot>,
    slot_count: usize,
    controller: TuningController,
    prepared_at: Option<Instant>,
    hashes_total: u64,
    active: bool,
}

impl std::fmt::Debug for BitfuryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitfuryDevice")
            .field("name", &self.name)
            .field("chips", &self.chips.len())
            .field("slots", &self.slot_count)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl BitfuryDevice {
    /// Enumerate chips behind `transport` and bring every present slot's
    /// rail to the baseline voltage.
    ///
    /// Fails with [`Error::NoChips`] when nothing answers.
    pub fn detect(
        name: impl Into<String>,
        mut transport: Box<dyn ChipTransport>,
        config: TuningConfig,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;

        let addresses = transport.detect_chips()?;
        if addresses.is_empty() {
            info!(device = %name, "No Bitfury chips found");
            return Err(Error::NoChips);
        }

        let slots: BTreeSet<u8> = addresses.iter().map(|a| a.slot).collect();
        for &slot in &slots {
            apply_baseline_voltage(transport.as_mut(), slot, config.detect_voltage);
        }

        info!(
            device = %name,
            chips = addresses.len(),
            slots = slots.len(),
            "Bitfury chips detected"
        );

        let chips = addresses
            .into_iter()
            .map(|address| ChipSlot::new(address, config.initial_frequency))
            .collect();

        Ok(Self {
            name,
            transport,
            chips,
            slot_count: slots.len(),
            controller: TuningController::new(config),
            prepared_at: None,
            hashes_total: 0,
            active: true,
        })
    }

    pub fn chips(&self) -> &[ChipSlot] {
        &self.chips
    }

    pub fn controller(&self) -> &TuningController {
        &self.controller
    }

    fn addresses(&self) -> Vec<ChipAddress> {
        self.chips.iter().map(ChipSlot::address).collect()
    }

    fn uptime_secs(&self) -> u64 {
        self.prepared_at
            .map(|at| at.elapsed().as_secs())
            .unwrap_or_default()
    }
}

fn apply_baseline_voltage(transport: &mut dyn ChipTransport, slot: u8, volts: f32) {
    let rail = power_rail(slot);
    let applied = match transport.set_voltage(rail, VoltageLevel::Volts(volts)) {
        Ok(applied) => applied,
        Err(e) => {
            warn!(slot, rail, error = %e, "Failed to set baseline voltage");
            return;
        }
    };
    match transport.read_temperature(rail) {
        Ok(temp_c) => info!(slot, rail, volts = applied, temp_c, "Slot powered"),
        Err(e) => info!(slot, rail, volts = applied, error = %e, "Slot powered, no temperature"),
    }
}

impl HardwareDevice for BitfuryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn status_line(&self) -> String {
        let ghs = self
            .controller
            .last_report(Tier::Short)
            .map(|r| r.total_hashrate_ghs())
            .unwrap_or_default();
        format!(
            "{}: {} chips in {} slots, {:.1} GH/s, voltage budget {}, up {}s",
            self.name,
            self.chips.len(),
            self.slot_count,
            ghs,
            self.controller.state().voltage_budget(),
            self.uptime_secs(),
        )
    }

    fn status(&self) -> DeviceStatus {
        let short = self.controller.last_report(Tier::Short);
        DeviceStatus {
            name: self.name.clone(),
            chips: self.chips.len(),
            slots: short.map(|r| r.slots.clone()).unwrap_or_default(),
            hashrate_ghs: short.map(|r| r.total_hashrate_ghs()).unwrap_or_default(),
            voltage_budget: self.controller.state().voltage_budget(),
            hashes_total: self.hashes_total,
            uptime_secs: self.uptime_secs(),
            is_active: self.active,
            line: self.status_line(),
        }
    }

    fn thread_prepare(&mut self) -> Result<()> {
        self.prepared_at = Some(Instant::now());
        debug!(device = %self.name, "Device thread prepared");
        Ok(())
    }

    fn scan_cycle(&mut self, host: &mut dyn WorkHost) -> Result<CycleOutcome> {
        self.controller
            .initialize(&mut self.chips, self.transport.as_mut(), Instant::now());

        let settle = self.controller.config().settle_delay();
        let outcome = dispatch::run_cycle(&mut self.chips, self.transport.as_mut(), host, settle)?;

        let CycleOutcome::Completed { hashes, at } = outcome else {
            return Ok(outcome);
        };
        self.hashes_total = self.hashes_total.saturating_add(hashes);

        for tier in self
            .controller
            .run_due_tiers(&mut self.chips, self.transport.as_mut(), at)
        {
            trace!(device = %self.name, %tier, "Tier ran");
        }

        Ok(outcome)
    }

    fn thread_shutdown(&mut self) {
        self.active = false;
        let addresses = self.addresses();
        match self.transport.shutdown_chips(&addresses) {
            Ok(()) => info!(device = %self.name, chips = addresses.len(), "Chips shut down"),
            Err(e) => error!(device = %self.name, error = %e, "Failed to shut down chips"),
        }
    }
}
