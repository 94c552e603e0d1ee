//! Dedicated OS thread per device.
//!
//! The dispatch loop blocks (settle delays, transport exchanges), so it runs
//! on a plain `std::thread` rather than inside the tokio runtime. The thread
//! owns the device outright; the async side only sees a status snapshot and
//! a shutdown flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::device::{DeviceStatus, HardwareDevice};
use crate::dispatch::CycleOutcome;
use crate::error::Result;
use crate::tracing::prelude::*;
use crate::work::WorkHost;

/// Pause after a cycle the host could not feed.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// How often the shared status snapshot is refreshed.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable read access to a device's latest status snapshot.
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<Mutex<DeviceStatus>>);

impl StatusHandle {
    pub fn get(&self) -> DeviceStatus {
        self.0.lock().clone()
    }
}

/// Handle to a running device thread.
pub struct DeviceThread {
    name: String,
    status: Arc<Mutex<DeviceStatus>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Move `device` and its `host` onto a new thread and start cycling.
    pub fn spawn(
        device: Box<dyn HardwareDevice>,
        host: Box<dyn WorkHost + Send>,
    ) -> Result<Self> {
        let name = device.name().to_string();
        let status = Arc::new(Mutex::new(device.status()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = std::thread::Builder::new()
            .name(format!("bitfury-{name}"))
            .spawn({
                let status = Arc::clone(&status);
                let shutdown = Arc::clone(&shutdown);
                move || run_device_loop(device, host, status, shutdown)
            })?;

        Ok(Self {
            name,
            status,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle(Arc::clone(&self.status))
    }

    /// True once the loop has exited, on request or after a failure.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stop the loop and wait for the shutdown hook to finish. Blocks.
    pub fn join(mut self) {
        self.request_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(device = %self.name, "Device thread panicked");
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

fn run_device_loop(
    mut device: Box<dyn HardwareDevice>,
    mut host: Box<dyn WorkHost + Send>,
    status: Arc<Mutex<DeviceStatus>>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(e) = device.thread_prepare() {
        error!(device = %device.name(), error = %e, "Device failed to start");
        device.thread_shutdown();
        *status.lock() = device.status();
        return;
    }
    info!(device = %device.name(), "Device thread started");

    let mut last_publish = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        match device.scan_cycle(host.as_mut()) {
            Ok(CycleOutcome::Starved) => std::thread::sleep(IDLE_BACKOFF),
            Ok(CycleOutcome::Completed { .. }) => {}
            Err(e) => {
                error!(device = %device.name(), error = %e, "Device failed, taking it offline");
                break;
            }
        }

        if last_publish.elapsed() >= STATUS_INTERVAL {
            *status.lock() = device.status();
            last_publish = Instant::now();
        }
    }

    device.thread_shutdown();
    *status.lock() = device.status();
    info!(device = %device.name(), "Device thread stopped");
}
