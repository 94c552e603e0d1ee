//! Per-chip state for a Bitfury board.
//!
//! A board carries up to 32 slots, each hosting a handful of chips. Every
//! chip owns a [`ChipSlot`] for the life of the device: the work it is
//! hashing (plus the two units before it, so late nonces can still be
//! attributed), the results latched by the last transport exchange, its
//! frequency code and its share statistics.

pub mod stats;

use std::fmt;

use serde::Serialize;

use crate::tracing::prelude::*;
use crate::transport::{ChipPayload, ChipReport};
use crate::work::WorkUnit;
use stats::ShareWindow;

/// Results a chip can hold between job switches.
pub const RESULT_CAPACITY: usize = 16;

/// Lowest oscillator code the hardware accepts.
pub const FREQUENCY_CODE_MIN: u8 = 48;

/// Highest code the long tier lets a chip run at before wrapping.
pub const FREQUENCY_CODE_MAX: u8 = 57;

/// Where a chip that runs past [`FREQUENCY_CODE_MAX`] lands.
pub const FREQUENCY_CODE_WRAP: u8 = 53;

/// Deliberately throttled chips sit here and are left out of slot averages.
pub const FREQUENCY_CODE_FLOOR: u8 = 50;

/// Physical position of a chip: board slot and position within the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChipAddress {
    pub slot: u8,
    pub position: u8,
}

impl ChipAddress {
    pub fn new(slot: u8, position: u8) -> Self {
        Self { slot, position }
    }
}

impl fmt::Display for ChipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{}", self.slot, self.position)
    }
}

/// The three work units a chip may hold at once.
///
/// Rotation moves every unit one stage back and hands the oldest one out so
/// the caller can report it complete.
#[derive(Debug, Default)]
pub struct WorkRing {
    current: Option<WorkUnit>,
    previous: Option<WorkUnit>,
    two_back: Option<WorkUnit>,
}

impl WorkRing {
    pub fn current(&self) -> Option<&WorkUnit> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&WorkUnit> {
        self.previous.as_ref()
    }

    pub fn two_back(&self) -> Option<&WorkUnit> {
        self.two_back.as_ref()
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Install new current work. Returns the unit it displaced, if any.
    pub fn assign(&mut self, work: WorkUnit) -> Option<WorkUnit> {
        self.current.replace(work)
    }

    /// `two_back <- previous <- current <- empty`, returning the released
    /// `two_back` unit.
    pub fn rotate(&mut self) -> Option<WorkUnit> {
        let released = self.two_back.take();
        self.two_back = self.previous.take();
        self.previous = self.current.take();
        released
    }
}

/// Mutable record for one chip.
#[derive(Debug)]
pub struct ChipSlot {
    address: ChipAddress,

    pub(crate) work: WorkRing,

    /// Hardware form of the current work, resent every cycle.
    payload: Option<ChipPayload>,

    /// Raw nonces latched since the last job switch, in arrival order.
    results: Vec<u32>,

    /// Set by the transport when the chip moved on to the next job.
    pub(crate) job_switched: bool,

    /// Nonce reported for the job two generations back.
    pub(crate) old_nonce: Option<u32>,

    /// Nonce reported for the job just loaded.
    pub(crate) future_nonce: Option<u32>,

    /// Oscillator code the tuner wants the chip to run at.
    pub(crate) frequency_code: u8,

    /// Latest clock measured by the hardware.
    pub(crate) measured_mhz: f64,

    /// Slow moving average of `measured_mhz`, updated by the short tier.
    pub(crate) smoothed_mhz: f64,

    /// Anomalies reported since the last short tier evaluation.
    pub(crate) anomaly_counter: u32,

    pub(crate) shares: ShareWindow,
}

impl ChipSlot {
    pub fn new(address: ChipAddress, frequency_code: u8) -> Self {
        Self {
            address,
            work: WorkRing::default(),
            payload: None,
            results: Vec::with_capacity(RESULT_CAPACITY),
            job_switched: false,
            old_nonce: None,
            future_nonce: None,
            frequency_code,
            measured_mhz: 0.0,
            smoothed_mhz: 0.0,
            anomaly_counter: 0,
            shares: ShareWindow::new(),
        }
    }

    pub fn address(&self) -> ChipAddress {
        self.address
    }

    pub fn frequency_code(&self) -> u8 {
        self.frequency_code
    }

    pub fn work(&self) -> &WorkRing {
        &self.work
    }

    pub fn shares(&self) -> &ShareWindow {
        &self.shares
    }

    pub fn needs_work(&self) -> bool {
        !self.work.has_current()
    }

    pub fn pending_result_count(&self) -> usize {
        self.results.len()
    }

    pub(crate) fn payload(&self) -> Option<&ChipPayload> {
        self.payload.as_ref()
    }

    /// Load new current work and derive its payload.
    pub(crate) fn assign_work(&mut self, work: WorkUnit) {
        self.payload = Some(ChipPayload::from(&work));
        if let Some(displaced) = self.work.assign(work) {
            // Callers only assign to empty chips.
            warn!(chip = %self.address, work = displaced.id, "Displaced in-flight work");
        }
    }

    /// Fold one transport report into the chip.
    pub(crate) fn latch(&mut self, report: ChipReport) {
        self.job_switched = report.job_switched;
        self.old_nonce = report.old_nonce;
        self.future_nonce = report.future_nonce;
        self.anomaly_counter = self.anomaly_counter.saturating_add(report.anomalies);
        if let Some(mhz) = report.measured_mhz {
            self.measured_mhz = mhz;
        }

        let room = RESULT_CAPACITY - self.results.len();
        if report.results.len() > room {
            warn!(
                chip = %self.address,
                dropped = report.results.len() - room,
                "Result buffer full, dropping nonces"
            );
        }
        self.results.extend(report.results.into_iter().take(room));
    }

    /// Hand out the buffered results and clear the buffer.
    pub(crate) fn take_results(&mut self) -> Vec<u32> {
        std::mem::replace(&mut self.results, Vec::with_capacity(RESULT_CAPACITY))
    }

    /// Payload is gone once current work rotates out.
    pub(crate) fn rotate_work(&mut self) -> Option<WorkUnit> {
        self.payload = None;
        self.work.rotate()
    }
}
