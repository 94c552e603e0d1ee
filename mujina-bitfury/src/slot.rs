//! Slot grouping and power-rail addressing.
//!
//! Chips in one slot share a power controller. The controllers for slots
//! 8/9 and 12/13 are wired crosswise on the backplane, so voltage and
//! temperature requests for those slots go to the partner's address.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::chip::ChipSlot;

/// Power-controller address for `slot`.
pub fn power_rail(slot: u8) -> u8 {
    match slot {
        8 => 12,
        9 => 13,
        12 => 8,
        13 => 9,
        other => other,
    }
}

/// Aggregates for one slot, built fresh by every tier pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotSummary {
    pub slot: u8,
    pub chips: usize,
    /// Sum of the chips' hash rates, GH/s
    pub hashrate_ghs: f64,
    /// Mean smoothed clock of chips not parked at the floor code
    pub average_mhz: Option<f64>,
    pub temperature_c: Option<f32>,
    /// Voltage applied by this pass, if any
    pub applied_voltage: Option<f32>,
    /// Per-chip `code-mhz` cells for the log line, `!` marks a silent chip
    #[serde(skip)]
    pub(crate) cells: Vec<String>,
    #[serde(skip)]
    mhz_sum: f64,
    #[serde(skip)]
    mhz_count: usize,
}

impl SlotSummary {
    fn new(slot: u8) -> Self {
        Self {
            slot,
            ..Self::default()
        }
    }

    pub(crate) fn add_chip(&mut self, hashrate_ghs: f64, cell: String) {
        self.chips += 1;
        self.hashrate_ghs += hashrate_ghs;
        self.cells.push(cell);
    }

    pub(crate) fn add_frequency_sample(&mut self, mhz: f64) {
        self.mhz_sum += mhz;
        self.mhz_count += 1;
        self.average_mhz = Some(self.mhz_sum / self.mhz_count as f64);
    }

    pub fn rail(&self) -> u8 {
        power_rail(self.slot)
    }

    /// `"<cells> = <ghs> ..."` line for tier reports.
    pub(crate) fn stat_line(&self) -> String {
        format!("{} = {:4.1} GH/s", self.cells.join(" "), self.hashrate_ghs)
    }
}

/// Per-slot aggregates keyed by slot, holding only slots with chips.
#[derive(Debug, Default)]
pub struct SlotGroups(BTreeMap<u8, SlotSummary>);

impl SlotGroups {
    /// One empty summary per slot present in `chips`.
    pub fn for_chips(chips: &[ChipSlot]) -> Self {
        let mut groups = BTreeMap::new();
        for chip in chips {
            let slot = chip.address().slot;
            groups.entry(slot).or_insert_with(|| SlotSummary::new(slot));
        }
        Self(groups)
    }

    pub fn get_mut(&mut self, slot: u8) -> &mut SlotSummary {
        self.0.entry(slot).or_insert_with(|| SlotSummary::new(slot))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SlotSummary> {
        self.0.values_mut()
    }

    pub fn into_vec(self) -> Vec<SlotSummary> {
        self.0.into_values().collect()
    }
}
