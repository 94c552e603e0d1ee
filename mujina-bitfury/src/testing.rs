//! Test doubles for the transport and host seams.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chip::ChipAddress;
use crate::transport::{self, ChipPayload, ChipReport, ChipTransport, TransportError, VoltageLevel};
use crate::work::{WorkHost, WorkUnit};

/// Volts reported back for [`VoltageLevel::Lowest`].
pub const LOWEST_VOLTS: f32 = 0.6;

const DEFAULT_TEMPERATURE_C: f32 = 40.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Detect,
    Push(Vec<ChipPayload>),
    SetFrequency(ChipAddress, u8),
    Reinit(ChipAddress, u8),
    SetVoltage(u8, VoltageLevel),
    ReadTemperature(u8),
    Shutdown(usize),
}

#[derive(Default)]
struct MockState {
    chips: Vec<ChipAddress>,
    commands: Vec<Command>,
    reports: VecDeque<Vec<ChipReport>>,
    temperatures: HashMap<u8, f32>,
    fail_push: bool,
    fail_temperature: bool,
}

/// Transport that records every call and replays scripted reports.
///
/// Clones share state, so a test can keep one handle while the code under
/// test owns another.
#[derive(Clone, Default)]
pub struct RecordingTransport(Arc<Mutex<MockState>>);

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chips(chips: Vec<ChipAddress>) -> Self {
        let transport = Self::new();
        transport.0.lock().chips = chips;
        transport
    }

    /// Reports for the next push; pushes with nothing queued get default
    /// (idle) reports.
    pub fn queue_reports(&self, reports: Vec<ChipReport>) {
        self.0.lock().reports.push_back(reports);
    }

    pub fn set_temperature(&self, rail: u8, temp_c: f32) {
        self.0.lock().temperatures.insert(rail, temp_c);
    }

    pub fn fail_pushes(&self) {
        self.0.lock().fail_push = true;
    }

    pub fn fail_temperature_reads(&self) {
        self.0.lock().fail_temperature = true;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.0.lock().commands.clone()
    }

    pub fn push_count(&self) -> usize {
        self.filtered(|c| matches!(c, Command::Push(_))).len()
    }

    pub fn frequency_commands(&self) -> Vec<Command> {
        self.filtered(|c| matches!(c, Command::SetFrequency(..)))
    }

    pub fn reinit_commands(&self) -> Vec<Command> {
        self.filtered(|c| matches!(c, Command::Reinit(..)))
    }

    pub fn voltage_commands(&self) -> Vec<(u8, VoltageLevel)> {
        self.0
            .lock()
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::SetVoltage(rail, level) => Some((*rail, *level)),
                _ => None,
            })
            .collect()
    }

    fn filtered(&self, keep: impl Fn(&Command) -> bool) -> Vec<Command> {
        self.0.lock().commands.iter().filter(|c| keep(*c)).cloned().collect()
    }

    fn record(&self, command: Command) {
        self.0.lock().commands.push(command);
    }
}

impl ChipTransport for RecordingTransport {
    fn detect_chips(&mut self) -> transport::Result<Vec<ChipAddress>> {
        self.record(Command::Detect);
        Ok(self.0.lock().chips.clone())
    }

    fn push_batch(
        &mut self,
        chips: &[ChipAddress],
        payloads: &[ChipPayload],
    ) -> transport::Result<Vec<ChipReport>> {
        self.record(Command::Push(payloads.to_vec()));
        let mut state = self.0.lock();
        if state.fail_push {
            return Err(TransportError::Timeout("SPI chain".into()));
        }
        Ok(state
            .reports
            .pop_front()
            .unwrap_or_else(|| vec![ChipReport::default(); chips.len()]))
    }

    fn set_frequency(&mut self, chip: ChipAddress, code: u8) -> transport::Result<()> {
        self.record(Command::SetFrequency(chip, code));
        Ok(())
    }

    fn reinit(&mut self, chip: ChipAddress, code: u8) -> transport::Result<()> {
        self.record(Command::Reinit(chip, code));
        Ok(())
    }

    fn set_voltage(&mut self, rail: u8, level: VoltageLevel) -> transport::Result<f32> {
        self.record(Command::SetVoltage(rail, level));
        Ok(match level {
            VoltageLevel::Lowest => LOWEST_VOLTS,
            VoltageLevel::Volts(volts) => volts,
        })
    }

    fn read_temperature(&mut self, rail: u8) -> transport::Result<f32> {
        self.record(Command::ReadTemperature(rail));
        let state = self.0.lock();
        if state.fail_temperature {
            return Err(TransportError::Timeout(format!("rail {rail} sensor")));
        }
        Ok(state
            .temperatures
            .get(&rail)
            .copied()
            .unwrap_or(DEFAULT_TEMPERATURE_C))
    }

    fn shutdown_chips(&mut self, chips: &[ChipAddress]) -> transport::Result<()> {
        self.record(Command::Shutdown(chips.len()));
        Ok(())
    }
}

/// In-memory host with a fixed work queue.
#[derive(Debug, Default)]
pub struct QueueHost {
    pub queue: VecDeque<WorkUnit>,
    /// `(work id, nonce)` in submission order
    pub submitted: Vec<(u64, u32)>,
    pub completed: Vec<u64>,
}

impl QueueHost {
    pub fn with_work(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            queue: ids.into_iter().map(WorkUnit::stub).collect(),
            ..Self::default()
        }
    }
}

impl WorkHost for QueueHost {
    fn pull_next_work(&mut self) -> Option<WorkUnit> {
        self.queue.pop_front()
    }

    fn submit_found_nonce(&mut self, work: &WorkUnit, nonce: u32) {
        self.submitted.push((work.id, nonce));
    }

    fn report_work_complete(&mut self, work: WorkUnit) {
        self.completed.push(work.id);
    }
}
