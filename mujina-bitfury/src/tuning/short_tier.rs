//! Short tier: unstick stalled chips, step away from anomalous operating
//! points, and pull overheating slots down to minimum voltage.

use std::time::Duration;

use tokio::time::Instant;

use super::{Tier, TierReport};
use crate::chip::stats::derive_hashrate;
use crate::chip::{ChipSlot, FREQUENCY_CODE_FLOOR};
use crate::slot::SlotGroups;
use crate::tracing::prelude::*;
use crate::transport::{ChipTransport, VoltageLevel};

/// Below this a chip is treated as stalled and nudged (GH/s).
const STALL_GHS: f64 = 0.5;

/// Code briefly written to a stalled chip before restoring its own.
const NUDGE_CODE: u8 = 1;

const NUDGE_PAUSE: Duration = Duration::from_millis(1);

/// Operating point known to misbehave under sustained anomalies. A chip
/// here steps down once its anomalies outnumber the window's seconds.
const BAD_POINT_CODE: u8 = 54;
const BAD_POINT_STEP: u8 = 4;

/// Above the bad point, a smaller anomaly count already costs one step.
const ANOMALY_LIMIT: u32 = 3;

/// Above this a slot is forced to minimum voltage (°C).
const OVERHEAT_C: f32 = 75.0;

/// Readings at or above this are sensor garbage and ignored (°C).
const IMPLAUSIBLE_C: f32 = 170.0;

fn is_overheating(temp_c: f32) -> bool {
    temp_c > OVERHEAT_C && temp_c < IMPLAUSIBLE_C
}

pub(super) fn run(
    chips: &mut [ChipSlot],
    transport: &mut dyn ChipTransport,
    window: Duration,
    voltage_budget: u8,
    now: Instant,
) -> TierReport {
    let mut groups = SlotGroups::for_chips(chips);
    let mut anomalies: u32 = 0;
    let bad_point_limit = u32::try_from(window.as_secs()).unwrap_or(u32::MAX);

    for chip in chips.iter_mut() {
        let shares = chip.shares.count_within(window, now);
        let ghs = derive_hashrate(shares, window);

        let marker = if ghs != 0.0 { "" } else { "!" };
        let cell = format!("{}-{:3.0}{}", chip.frequency_code, chip.measured_mhz, marker);
        groups.get_mut(chip.address().slot).add_chip(ghs, cell);

        chip.smoothed_mhz = (chip.measured_mhz + chip.smoothed_mhz * 9.0) / 10.0;

        if ghs < STALL_GHS && chip.frequency_code > FREQUENCY_CODE_FLOOR {
            nudge(chip, transport);
        }

        step_down_on_anomalies(chip, bad_point_limit);
        anomalies = anomalies.saturating_add(chip.anomaly_counter);
        chip.anomaly_counter = 0;
    }

    info!(window_secs = window.as_secs(), anomalies, "Short stat");

    for summary in groups.iter_mut() {
        let rail = summary.rail();
        summary.temperature_c = match transport.read_temperature(rail) {
            Ok(temp_c) => Some(temp_c),
            Err(e) => {
                warn!(slot = summary.slot, rail, error = %e, "Temperature read failed");
                None
            }
        };

        info!(
            slot = summary.slot,
            temp_c = ?summary.temperature_c,
            "{}",
            summary.stat_line()
        );

        if summary.temperature_c.is_some_and(is_overheating) {
            match transport.set_voltage(rail, VoltageLevel::Lowest) {
                Ok(volts) => {
                    summary.applied_voltage = Some(volts);
                    warn!(
                        slot = summary.slot,
                        temp_c = ?summary.temperature_c,
                        volts,
                        "Slot overheating, forced low voltage"
                    );
                }
                Err(e) => {
                    error!(slot = summary.slot, rail, error = %e, "Failed to force low voltage");
                }
            }
        }
    }

    TierReport {
        tier: Tier::Short,
        slots: groups.into_vec(),
        anomalies,
        voltage_budget,
    }
}

/// Kick a stalled chip by bouncing its clock through a throwaway code.
fn nudge(chip: &ChipSlot, transport: &mut dyn ChipTransport) {
    let address = chip.address();
    debug!(chip = %address, code = chip.frequency_code, "Nudging stalled chip");

    if let Err(e) = transport.set_frequency(address, NUDGE_CODE) {
        warn!(chip = %address, error = %e, "Nudge failed");
        return;
    }
    std::thread::sleep(NUDGE_PAUSE);
    if let Err(e) = transport.set_frequency(address, chip.frequency_code) {
        warn!(chip = %address, error = %e, "Failed to restore frequency after nudge");
    }
}

/// Takes effect at the chip's next nudge or reinit.
fn step_down_on_anomalies(chip: &mut ChipSlot, bad_point_limit: u32) {
    let before = chip.frequency_code;

    if chip.anomaly_counter > bad_point_limit && chip.frequency_code == BAD_POINT_CODE {
        chip.frequency_code -= BAD_POINT_STEP;
    }
    if chip.anomaly_counter > ANOMALY_LIMIT && chip.frequency_code > BAD_POINT_CODE {
        chip.frequency_code -= 1;
    }

    if chip.frequency_code != before {
        info!(
            chip = %chip.address(),
            anomalies = chip.anomaly_counter,
            from = before,
            to = chip.frequency_code,
            "Stepped frequency down"
        );
    }
}
