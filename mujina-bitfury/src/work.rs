//! Work units and the host-side seam the dispatch loop talks through.
//!
//! The host owns job creation and nonce validation. A device only needs to
//! pull the next unit without blocking, hand found nonces back, and say when
//! it is finished with a unit.

use tokio::sync::mpsc;

use crate::tracing::prelude::*;

/// One unit of hashing work as handed out by the host.
///
/// The chip hashes the second SHA-256 block of an 80-byte header: the
/// midstate of the first 64 bytes plus the last three words before the
/// nonce (merkle root tail, ntime, nbits).
#[derive(Debug, PartialEq, Eq)]
pub struct WorkUnit {
    /// Host-assigned identifier
    pub id: u64,

    /// SHA-256 state after the first 64 header bytes
    pub midstate: [u32; 8],

    /// Merkle root tail, ntime, nbits
    pub tail: [u32; 3],
}

impl WorkUnit {
    pub fn new(id: u64, midstate: [u32; 8], tail: [u32; 3]) -> Self {
        Self { id, midstate, tail }
    }

    /// Work with empty header material, for tests and bring-up.
    pub fn stub(id: u64) -> Self {
        Self::new(id, [0; 8], [0; 3])
    }
}

/// What a device needs from its host.
pub trait WorkHost {
    /// Next work unit, or `None` right away if the queue is empty.
    fn pull_next_work(&mut self) -> Option<WorkUnit>;

    /// Hand a found nonce to the host for validation against `work`.
    ///
    /// Stale or invalid nonces are the host's business; the device does not
    /// look at the outcome.
    fn submit_found_nonce(&mut self, work: &WorkUnit, nonce: u32);

    /// The device will never report against `work` again.
    fn report_work_complete(&mut self, work: WorkUnit);
}

/// Events a device thread sends back to the async side of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    NonceFound {
        device: String,
        work_id: u64,
        nonce: u32,
    },
    WorkComplete {
        device: String,
        work_id: u64,
    },
}

/// [`WorkHost`] backed by tokio channels.
///
/// Lives on the device's OS thread: work is taken with `try_recv` and events
/// are sent with `blocking_send`, so it must never be used from inside the
/// async runtime.
pub struct ChannelHost {
    device: String,
    work_rx: mpsc::Receiver<WorkUnit>,
    event_tx: mpsc::Sender<HostEvent>,
}

impl ChannelHost {
    pub fn new(
        device: String,
        work_rx: mpsc::Receiver<WorkUnit>,
        event_tx: mpsc::Sender<HostEvent>,
    ) -> Self {
        Self {
            device,
            work_rx,
            event_tx,
        }
    }

    fn send(&self, event: HostEvent) {
        if self.event_tx.blocking_send(event).is_err() {
            debug!(device = %self.device, "Host event channel closed");
        }
    }
}

impl WorkHost for ChannelHost {
    fn pull_next_work(&mut self) -> Option<WorkUnit> {
        self.work_rx.try_recv().ok()
    }

    fn submit_found_nonce(&mut self, work: &WorkUnit, nonce: u32) {
        trace!(device = %self.device, work = work.id, nonce = format_args!("{:#010x}", nonce), "Nonce found");
        self.send(HostEvent::NonceFound {
            device: self.device.clone(),
            work_id: work.id,
            nonce,
        });
    }

    fn report_work_complete(&mut self, work: WorkUnit) {
        self.send(HostEvent::WorkComplete {
            device: self.device.clone(),
            work_id: work.id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_host_round_trips_work_and_events() {
        let (work_tx, work_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let mut host = ChannelHost::new("bitfury-0".into(), work_rx, event_tx);

        assert!(host.pull_next_work().is_none());

        work_tx.try_send(WorkUnit::stub(7)).unwrap();
        let work = host.pull_next_work().unwrap();
        assert_eq!(work.id, 7);

        host.submit_found_nonce(&work, 0xdeadbeef);
        host.report_work_complete(work);

        assert_eq!(
            event_rx.try_recv().unwrap(),
            HostEvent::NonceFound {
                device: "bitfury-0".into(),
                work_id: 7,
                nonce: 0xdeadbeef
            }
        );
        assert_eq!(
            event_rx.try_recv().unwrap(),
            HostEvent::WorkComplete {
                device: "bitfury-0".into(),
                work_id: 7
            }
        );
    }

    #[test]
    fn closed_event_channel_is_not_fatal() {
        let (_work_tx, work_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(1);
        drop(event_rx);
        let mut host = ChannelHost::new("bitfury-0".into(), work_rx, event_tx);

        host.report_work_complete(WorkUnit::stub(1));
    }
}
