//! Simulated Bitfury board.
//!
//! Stands in for the SPI chain and power controllers so the daemon can run
//! without hardware. Chips switch jobs every few pushes, find nonces at a
//! rate that follows their frequency code, and run warmer at higher slot
//! voltage. Randomness comes from a seeded `StdRng` so runs are repeatable.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ChipPayload, ChipReport, ChipTransport, Result, TransportError, VoltageLevel};
use crate::chip::ChipAddress;
use crate::config::VirtualBoardConfig;
use crate::slot::power_rail;
use crate::tracing::prelude::*;

/// Volts the simulated controller settles at for [`VoltageLevel::Lowest`].
pub const LOWEST_VOLTS: f32 = 0.6;

/// Controller refuses anything outside this range.
const VOLTS_RANGE: std::ops::RangeInclusive<f32> = 0.5..=1.2;

/// Pushes per job on a healthy chip.
const PUSHES_PER_JOB: u32 = 8;

/// Nonce probability per push at code 55. Gives roughly half a share per
/// second at the default settle delay.
const NONCE_CHANCE_AT_55: f64 = 0.003;

/// Clock per unit of frequency code, MHz.
const MHZ_PER_CODE: f64 = 4.0;

const AMBIENT_C: f32 = 35.0;
const DEGREES_PER_VOLT: f32 = 100.0;

#[derive(Debug, Default)]
struct SimChip {
    code: u8,
    pushes: u32,
    pending: Vec<u32>,
    job: Option<ChipPayload>,
}

/// A board of `slots × chips_per_slot` simulated chips.
#[derive(Debug)]
pub struct VirtualBoard {
    geometry: VirtualBoardConfig,
    chips: HashMap<ChipAddress, SimChip>,
    rails: BTreeMap<u8, f32>,
    rng: StdRng,
    powered: bool,
}

impl VirtualBoard {
    pub fn new(geometry: VirtualBoardConfig) -> Self {
        Self::with_seed(geometry, 0x5eed_b17f_u64)
    }

    pub fn with_seed(geometry: VirtualBoardConfig, seed: u64) -> Self {
        Self {
            geometry,
            chips: HashMap::new(),
            rails: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            powered: true,
        }
    }

    fn chip_mut(&mut self, chip: ChipAddress) -> Result<&mut SimChip> {
        self.chips
            .get_mut(&chip)
            .ok_or_else(|| TransportError::Timeout(format!("chip {chip}")))
    }

    fn exchange(&mut self, chip: ChipAddress, payload: ChipPayload) -> Result<ChipReport> {
        let code = self.chip_mut(chip)?.code;
        let nonce_chance = (NONCE_CHANCE_AT_55 * f64::from(code) / 55.0).min(1.0);
        let nonce_hit = self.rng.random_bool(nonce_chance);
        let anomaly = self.rng.random_bool(0.001);
        let boundary = self.rng.random_bool(0.05);
        let nonce: u32 = self.rng.random();
        let old_nonce: u32 = self.rng.random();

        let sim = self.chip_mut(chip)?;
        if sim.code == 0 {
            return Ok(ChipReport::default());
        }

        // A changed payload restarts the job
        if sim.job != Some(payload) {
            sim.job = Some(payload);
            sim.pushes = 0;
        }
        sim.pushes += 1;
        if nonce_hit {
            // Chips report nonces byte-swapped
            sim.pending.push(nonce.swap_bytes());
        }

        let mut report = ChipReport {
            measured_mhz: Some(f64::from(sim.code) * MHZ_PER_CODE),
            anomalies: u32::from(anomaly),
            ..ChipReport::default()
        };
        if sim.pushes >= PUSHES_PER_JOB {
            sim.pushes = 0;
            report.job_switched = true;
            report.results = std::mem::take(&mut sim.pending);
            if boundary {
                report.old_nonce = Some(old_nonce);
            }
        }
        Ok(report)
    }
}

impl ChipTransport for VirtualBoard {
    fn detect_chips(&mut self) -> Result<Vec<ChipAddress>> {
        let addresses: Vec<_> = (0..self.geometry.slots)
            .flat_map(|slot| {
                (0..self.geometry.chips_per_slot).map(move |p| ChipAddress::new(slot, p))
            })
            .collect();
        for &address in &addresses {
            self.chips.entry(address).or_default();
        }
        debug!(chips = addresses.len(), "Virtual board enumerated");
        Ok(addresses)
    }

    fn push_batch(
        &mut self,
        chips: &[ChipAddress],
        payloads: &[ChipPayload],
    ) -> Result<Vec<ChipReport>> {
        if !self.powered {
            return Err(TransportError::Other("board is powered down".into()));
        }
        if chips.len() != payloads.len() {
            return Err(TransportError::Other(format!(
                "{} chips but {} payloads",
                chips.len(),
                payloads.len()
            )));
        }
        chips
            .iter()
            .zip(payloads)
            .map(|(&chip, &payload)| self.exchange(chip, payload))
            .collect()
    }

    fn set_frequency(&mut self, chip: ChipAddress, code: u8) -> Result<()> {
        self.chip_mut(chip)?.code = code;
        Ok(())
    }

    fn reinit(&mut self, chip: ChipAddress, code: u8) -> Result<()> {
        let sim = self.chip_mut(chip)?;
        *sim = SimChip {
            code,
            ..SimChip::default()
        };
        Ok(())
    }

    fn set_voltage(&mut self, rail: u8, level: VoltageLevel) -> Result<f32> {
        let volts = match level {
            VoltageLevel::Lowest => LOWEST_VOLTS,
            VoltageLevel::Volts(v) if VOLTS_RANGE.contains(&v) => v,
            VoltageLevel::Volts(_) => return Err(TransportError::PowerRejected { rail }),
        };
        self.rails.insert(rail, volts);
        Ok(volts)
    }

    fn read_temperature(&mut self, rail: u8) -> Result<f32> {
        let volts = self
            .rails
            .get(&rail)
            .copied()
            .ok_or_else(|| TransportError::Timeout(format!("rail {rail} sensor")))?;
        let jitter: f32 = self.rng.random_range(-1.0..1.0);
        Ok(AMBIENT_C + (volts - LOWEST_VOLTS) * DEGREES_PER_VOLT + jitter)
    }

    fn shutdown_chips(&mut self, chips: &[ChipAddress]) -> Result<()> {
        for chip in chips {
            self.chip_mut(*chip)?.code = 0;
        }
        let slots: Vec<u8> = chips.iter().map(|c| power_rail(c.slot)).collect();
        for rail in slots {
            self.rails.insert(rail, LOWEST_VOLTS);
        }
        self.powered = false;
        Ok(())
    }
}
