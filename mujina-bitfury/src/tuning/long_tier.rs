//! Long tier: walk slow chips up the frequency band, reinitialize dead
//! ones, and (at most a couple of times per process) raise the voltage of
//! slots whose chips are clocking low.

use std::time::Duration;

use tokio::time::Instant;

use super::state::ControllerState;
use super::{Tier, TierReport};
use crate::chip::stats::derive_hashrate;
use crate::chip::{ChipSlot, FREQUENCY_CODE_FLOOR, FREQUENCY_CODE_MAX, FREQUENCY_CODE_WRAP};
use crate::slot::SlotGroups;
use crate::tracing::prelude::*;
use crate::transport::{ChipTransport, VoltageLevel};

/// Chips below this get one frequency step up (GH/s).
const SLOW_GHS: f64 = 2.4;

/// Chips below this are reinitialized (GH/s).
const DEAD_GHS: f64 = 1.0;

/// Slots averaging below this get the raised voltage (MHz).
const SLOW_SLOT_MHZ: f64 = 215.0;

pub(super) fn run(
    chips: &mut [ChipSlot],
    transport: &mut dyn ChipTransport,
    window: Duration,
    state: &mut ControllerState,
    raised_voltage: f32,
    now: Instant,
) -> TierReport {
    let mut groups = SlotGroups::for_chips(chips);

    for chip in chips.iter_mut() {
        let shares = chip.shares.count_within(window, now);
        let ghs = derive_hashrate(shares, window);

        let summary = groups.get_mut(chip.address().slot);
        summary.add_chip(ghs, format!("{:.1}-{:3.0}", ghs, chip.smoothed_mhz));
        if chip.frequency_code != FREQUENCY_CODE_FLOOR {
            summary.add_frequency_sample(chip.smoothed_mhz);
        }

        step_frequency(chip, ghs);

        if ghs < DEAD_GHS {
            debug!(chip = %chip.address(), ghs, code = chip.frequency_code, "Reinitializing chip");
            if let Err(e) = transport.reinit(chip.address(), chip.frequency_code) {
                warn!(chip = %chip.address(), error = %e, "Chip reinit failed");
            }
        }
    }

    info!(window_secs = window.as_secs(), "Long stat");
    for summary in groups.iter_mut() {
        info!(
            slot = summary.slot,
            average_mhz = ?summary.average_mhz.map(|mhz| mhz.round()),
            "{}",
            summary.stat_line()
        );
    }

    if state.take_voltage_pass() {
        info!(remaining = state.voltage_budget(), "Renewing slot voltage");
        for summary in groups.iter_mut() {
            match summary.average_mhz {
                Some(mhz) if mhz < SLOW_SLOT_MHZ => {
                    let rail = summary.rail();
                    match transport.set_voltage(rail, VoltageLevel::Volts(raised_voltage)) {
                        Ok(volts) => {
                            summary.applied_voltage = Some(volts);
                            info!(slot = summary.slot, average_mhz = mhz, volts, "Raised slot voltage");
                        }
                        Err(e) => {
                            warn!(slot = summary.slot, rail, error = %e, "Failed to raise slot voltage");
                        }
                    }
                }
                _ => info!(slot = summary.slot, "Slot voltage: no changes"),
            }
        }
    }

    TierReport {
        tier: Tier::Long,
        slots: groups.into_vec(),
        anomalies: 0,
        voltage_budget: state.voltage_budget(),
    }
}

/// One step up for slow chips; past the top of the band, back to the wrap
/// point instead of climbing further.
fn step_frequency(chip: &mut ChipSlot, ghs: f64) {
    if ghs < SLOW_GHS {
        chip.frequency_code = chip.frequency_code.saturating_add(1);
    }
    if chip.frequency_code > FREQUENCY_CODE_MAX {
        chip.frequency_code = FREQUENCY_CODE_WRAP;
    }
}
