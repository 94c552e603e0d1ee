//! Daemon lifecycle management for mujina-bitfury.
//!
//! Wires transports, devices, job sources and the scheduler together, then
//! waits for SIGINT or SIGTERM and tears everything down in order: sources
//! and scheduler first, then the device threads, which power their chips
//! down on the way out.

use std::time::Duration;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::backplane::Backplane;
use crate::config::MinerConfig;
use crate::job_source::DummySource;
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::transport::{ChipTransport, VirtualBoard};
use crate::work::{HostEvent, WorkUnit};

/// Work units buffered per device.
const WORK_QUEUE_DEPTH: usize = 64;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// The main daemon.
pub struct Daemon {
    config: MinerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Transports to detect devices on, by device name.
    fn transports(&self) -> Vec<(String, Box<dyn ChipTransport>)> {
        let mut transports: Vec<(String, Box<dyn ChipTransport>)> = Vec::new();
        if let Some(geometry) = self.config.virtual_board {
            info!(
                slots = geometry.slots,
                chips_per_slot = geometry.chips_per_slot,
                "Virtual board enabled"
            );
            transports.push((
                format!("virtual-{}x{}", geometry.slots, geometry.chips_per_slot),
                Box::new(VirtualBoard::new(geometry)),
            ));
        } else {
            info!("Virtual board disabled (MUJINA_BITFURY_VIRTUAL=off)");
        }
        transports
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let (event_tx, event_rx) = mpsc::channel::<HostEvent>(1024);
        let mut backplane = Backplane::new(event_tx);

        for (seed, (name, transport)) in (1u64..).zip(self.transports()) {
            let (work_tx, work_rx) = mpsc::channel::<WorkUnit>(WORK_QUEUE_DEPTH);
            let tuning = self.config.tuning.clone();
            match backplane.detect_and_attach(&name, transport, tuning, work_rx) {
                Ok(true) => {
                    let source = DummySource::new(name, work_tx, self.shutdown.clone(), seed);
                    self.tracker.spawn(async move {
                        if let Err(e) = source.run().await {
                            error!("DummySource error: {}", e);
                        }
                    });
                }
                Ok(false) => {}
                Err(e) => error!(device = %name, error = %e, "Failed to start device"),
            }
        }

        if backplane.is_empty() {
            warn!("No devices running; waiting for shutdown signal");
        }

        let scheduler = Scheduler::new(backplane.status_handles());
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                let tallies = scheduler.run(shutdown, event_rx, STATUS_INTERVAL).await;
                for (device, tally) in tallies {
                    info!(%device, nonces = tally.nonces, completed = tally.completed, "Final tally");
                }
            }
        });

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=mujina_bitfury=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Initiate shutdown
        self.shutdown.cancel();
        self.tracker.wait().await;

        for device in backplane.offline() {
            warn!(%device, "Device had already gone offline");
        }
        backplane.shutdown_all().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new(MinerConfig::default())
    }
}
