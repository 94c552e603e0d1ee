//! Hardware transport seam.
//!
//! Everything that touches the board goes through [`ChipTransport`]: the
//! SPI chain carrying work and results, and the I2C power controllers that
//! set slot voltage and report slot temperature. Implementations are
//! synchronous and block the calling device thread.

pub mod virtual_board;

use crate::chip::ChipAddress;
use crate::work::WorkUnit;

pub use virtual_board::VirtualBoard;

/// Transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No response from {0}")]
    Timeout(String),

    /// The chain answered for a different number of chips than were sent.
    #[error("Expected {expected} chip reports, got {got}")]
    ReportCount { expected: usize, got: usize },

    #[error("Power controller on rail {rail} rejected the request")]
    PowerRejected { rail: u8 },

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Work in the layout the chip's job registers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipPayload {
    pub midstate: [u32; 8],
    pub m7: u32,
    pub ntime: u32,
    pub nbits: u32,
}

impl From<&WorkUnit> for ChipPayload {
    fn from(work: &WorkUnit) -> Self {
        let [m7, ntime, nbits] = work.tail;
        Self {
            midstate: work.midstate,
            m7,
            ntime,
            nbits,
        }
    }
}

/// Status latched for one chip by a [`ChipTransport::push_batch`] exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChipReport {
    /// The chip finished the previous job and loaded the one just sent.
    pub job_switched: bool,

    /// Raw nonces, in the order the chip produced them.
    pub results: Vec<u32>,

    /// Late nonce belonging to the job two generations back.
    pub old_nonce: Option<u32>,

    /// Early nonce belonging to the job just loaded.
    pub future_nonce: Option<u32>,

    /// Clock measured over the exchange, if the chip reported one.
    pub measured_mhz: Option<f64>,

    /// Suspicious results seen during the exchange.
    pub anomalies: u32,
}

/// Target for a slot voltage change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoltageLevel {
    /// Lowest VID the power controller supports.
    Lowest,

    /// Absolute output in volts.
    Volts(f32),
}

/// Board access used by the dispatch loop and the tuner.
///
/// Rails are power-controller addresses; see [`crate::slot::power_rail`]
/// for how slots map onto them.
pub trait ChipTransport: Send {
    /// Enumerate responding chips, ordered by slot then position.
    fn detect_chips(&mut self) -> Result<Vec<ChipAddress>>;

    /// Send one payload per chip, in `chips` order, and latch every chip's
    /// status in the same exchange.
    fn push_batch(
        &mut self,
        chips: &[ChipAddress],
        payloads: &[ChipPayload],
    ) -> Result<Vec<ChipReport>>;

    fn set_frequency(&mut self, chip: ChipAddress, code: u8) -> Result<()>;

    /// Full chip re-initialization at `code`.
    fn reinit(&mut self, chip: ChipAddress, code: u8) -> Result<()>;

    /// Returns the voltage the controller actually applied.
    fn set_voltage(&mut self, rail: u8, level: VoltageLevel) -> Result<f32>;

    fn read_temperature(&mut self, rail: u8) -> Result<f32>;

    /// Stop hashing and power the chips down.
    fn shutdown_chips(&mut self, chips: &[ChipAddress]) -> Result<()>;
}
