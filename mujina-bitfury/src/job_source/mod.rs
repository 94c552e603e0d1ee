//! Sources of work for the devices.
//!
//! A source is an async task that keeps a device's work queue topped up.
//! The bounded queue is the only flow control: a source blocks on `send`
//! until the device has pulled enough to make room.

pub mod dummy;

pub use dummy::DummySource;
