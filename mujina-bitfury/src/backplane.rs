//! Backplane for device lifecycle management.
//!
//! Devices plug into the backplane, which gives each one its own thread and
//! a host wired to the daemon's channels: work comes in on a per-device
//! queue, found nonces and finished work go out on one shared event channel.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::config::TuningConfig;
use crate::device::{BitfuryDevice, HardwareDevice};
use crate::device_thread::{DeviceThread, StatusHandle};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::ChipTransport;
use crate::work::{ChannelHost, HostEvent, WorkUnit};

/// Running devices keyed by name.
pub struct Backplane {
    devices: BTreeMap<String, DeviceThread>,
    event_tx: mpsc::Sender<HostEvent>,
}

impl Backplane {
    pub fn new(event_tx: mpsc::Sender<HostEvent>) -> Self {
        Self {
            devices: BTreeMap::new(),
            event_tx,
        }
    }

    /// Detect a Bitfury chain behind `transport` and attach it.
    ///
    /// Returns false when no chips answer; the device is not registered.
    pub fn detect_and_attach(
        &mut self,
        name: &str,
        transport: Box<dyn ChipTransport>,
        tuning: TuningConfig,
        work_rx: mpsc::Receiver<WorkUnit>,
    ) -> Result<bool> {
        match BitfuryDevice::detect(name, transport, tuning) {
            Ok(device) => {
                self.attach(Box::new(device), work_rx)?;
                Ok(true)
            }
            Err(Error::NoChips) => {
                warn!(device = name, "Nothing detected, not registering");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Start a thread for `device`, fed from `work_rx`.
    pub fn attach(
        &mut self,
        device: Box<dyn HardwareDevice>,
        work_rx: mpsc::Receiver<WorkUnit>,
    ) -> Result<()> {
        let name = device.name().to_string();
        if self.devices.contains_key(&name) {
            return Err(Error::Other(format!("device {name} already attached")));
        }

        let host = ChannelHost::new(name.clone(), work_rx, self.event_tx.clone());
        let thread = DeviceThread::spawn(device, Box::new(host))?;
        info!(device = %name, "Device attached");
        self.devices.insert(name, thread);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Status handles that stay valid after the backplane shuts down.
    pub fn status_handles(&self) -> Vec<StatusHandle> {
        self.devices.values().map(DeviceThread::status_handle).collect()
    }

    /// Names of devices whose thread has exited on its own.
    pub fn offline(&self) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.is_finished())
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Stop every device and wait for its chips to be powered down.
    pub async fn shutdown_all(&mut self) {
        let devices = std::mem::take(&mut self.devices);
        for thread in devices.values() {
            thread.request_shutdown();
        }

        for (name, thread) in devices {
            if let Err(e) = tokio::task::spawn_blocking(move || thread.join()).await {
                error!(device = %name, error = %e, "Failed to join device thread");
            }
        }
        info!("All devices shut down");
    }
}
