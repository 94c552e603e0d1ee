//! Crate-wide error type.

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The data path to the chips failed. Fatal for the affected device.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Enumeration found nothing to drive.
    #[error("No Bitfury chips detected")]
    NoChips,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
