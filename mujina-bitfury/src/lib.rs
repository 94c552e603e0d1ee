//! Bitfury multi-slot chip driver.
//!
//! Drives chains of Bitfury chips spread over power slots: hands them work,
//! collects their nonces and keeps them tuned. Frequency is adjusted per chip
//! and voltage per slot from observed share rates and temperatures on three
//! fixed cadences.

pub mod backplane;
pub mod chip;
pub mod config;
pub mod daemon;
pub mod device;
pub mod device_thread;
pub mod dispatch;
pub mod error;
pub mod job_source;
pub mod scheduler;
pub mod slot;
pub mod tracing;
pub mod transport;
pub mod tuning;
pub mod work;

#[cfg(test)]
mod testing;
