//! Host side of the device threads.
//!
//! Collects the events devices send back (found nonces, finished work) and
//! logs every device's status line on a fixed cadence. Nonce validation and
//! pool submission would hang off [`Scheduler::handle_event`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::device_thread::StatusHandle;
use crate::tracing::prelude::*;
use crate::work::HostEvent;

/// Per-device event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostTally {
    pub nonces: u64,
    pub completed: u64,
}

pub struct Scheduler {
    tallies: BTreeMap<String, HostTally>,
    statuses: Vec<StatusHandle>,
}

impl Scheduler {
    pub fn new(statuses: Vec<StatusHandle>) -> Self {
        Self {
            tallies: BTreeMap::new(),
            statuses,
        }
    }

    pub fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::NonceFound {
                device,
                work_id,
                nonce,
            } => {
                trace!(%device, work_id, nonce = format_args!("{:#010x}", nonce), "Nonce");
                self.tallies.entry(device).or_default().nonces += 1;
            }
            HostEvent::WorkComplete { device, work_id } => {
                trace!(%device, work_id, "Work complete");
                self.tallies.entry(device).or_default().completed += 1;
            }
        }
    }

    pub fn tally(&self, device: &str) -> HostTally {
        self.tallies.get(device).copied().unwrap_or_default()
    }

    fn log_status(&self) {
        for handle in &self.statuses {
            let status = handle.get();
            let tally = self.tally(&status.name);
            info!(
                nonces = tally.nonces,
                completed = tally.completed,
                "{}",
                status.line
            );
            match serde_json::to_string(&status) {
                Ok(json) => debug!(device = %status.name, status = %json, "Device status"),
                Err(e) => warn!(device = %status.name, error = %e, "Failed to encode status"),
            }
        }
    }

    /// Consume events until cancelled or every device has gone away.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        mut event_rx: mpsc::Receiver<HostEvent>,
        report_interval: Duration,
    ) -> BTreeMap<String, HostTally> {
        trace!("Scheduler task started.");
        let mut report = tokio::time::interval(report_interval);
        report.tick().await;

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("All devices disconnected");
                        break;
                    }
                },
                _ = report.tick() => self.log_status(),
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutdown requested");
                    break;
                }
            }
        }

        self.log_status();
        trace!("Scheduler task stopped.");
        self.tallies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(device: &str) -> HostEvent {
        HostEvent::NonceFound {
            device: device.into(),
            work_id: 1,
            nonce: 0xdeadbeef,
        }
    }

    #[test]
    fn tallies_per_device() {
        let mut scheduler = Scheduler::new(Vec::new());
        scheduler.handle_event(nonce("a"));
        scheduler.handle_event(nonce("a"));
        scheduler.handle_event(HostEvent::WorkComplete {
            device: "b".into(),
            work_id: 3,
        });

        assert_eq!(
            scheduler.tally("a"),
            HostTally {
                nonces: 2,
                completed: 0
            }
        );
        assert_eq!(scheduler.tally("b").completed, 1);
        assert_eq!(scheduler.tally("c"), HostTally::default());
    }

    #[tokio::test]
    async fn stops_when_devices_hang_up() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(nonce("bf0")).await.unwrap();
        drop(tx);

        let tallies = Scheduler::new(Vec::new())
            .run(CancellationToken::new(), rx, Duration::from_secs(1))
            .await;

        assert_eq!(tallies["bf0"].nonces, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancel() {
        let (_tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Scheduler::new(Vec::new()).run(
            shutdown.clone(),
            rx,
            Duration::from_secs(10),
        ));

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();

        assert!(task.await.unwrap().is_empty());
    }
}
