//! One pass of the dispatch loop.
//!
//! Refill idle chips from the host, push every chip's payload in a single
//! transport exchange, let the hardware settle, then harvest the chips that
//! switched jobs: submit their nonces, rotate their work and account the
//! hashes they did.

use std::time::Duration;

use tokio::time::Instant;

use crate::chip::ChipSlot;
use crate::error::Result;
use crate::tracing::prelude::*;
use crate::transport::{ChipTransport, TransportError};
use crate::work::WorkHost;

/// Hashes credited per processed result. The chip searches a full 32-bit
/// nonce range per job and its internal hash count is not observable.
pub const HASHES_PER_RESULT: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The host ran dry while refilling; nothing was pushed.
    Starved,

    /// Work was pushed and harvested.
    Completed { hashes: u64, at: Instant },
}

impl CycleOutcome {
    pub fn hashes(&self) -> u64 {
        match self {
            CycleOutcome::Starved => 0,
            CycleOutcome::Completed { hashes, .. } => *hashes,
        }
    }
}

/// Run one dispatch pass over `chips`.
///
/// Blocks for `settle` between the push and the harvest. Only a failed push
/// is an error; everything after it is best effort.
pub fn run_cycle(
    chips: &mut [ChipSlot],
    transport: &mut dyn ChipTransport,
    host: &mut dyn WorkHost,
    settle: Duration,
) -> Result<CycleOutcome> {
    for chip in chips.iter_mut() {
        chip.job_switched = false;
    }

    if !refill(chips, host) {
        return Ok(CycleOutcome::Starved);
    }

    push_and_latch(chips, transport)?;

    std::thread::sleep(settle);
    let now = Instant::now();

    let hashes = chips
        .iter_mut()
        .filter(|chip| chip.job_switched)
        .map(|chip| harvest(chip, host, now))
        .sum();

    Ok(CycleOutcome::Completed { hashes, at: now })
}

/// Give every idle chip one unit of work. False as soon as the host has
/// nothing; chips filled before that keep their new work.
fn refill(chips: &mut [ChipSlot], host: &mut dyn WorkHost) -> bool {
    for chip in chips.iter_mut().filter(|chip| chip.needs_work()) {
        match host.pull_next_work() {
            Some(work) => chip.assign_work(work),
            None => {
                trace!(chip = %chip.address(), "No work available");
                return false;
            }
        }
    }
    true
}

fn push_and_latch(chips: &mut [ChipSlot], transport: &mut dyn ChipTransport) -> Result<()> {
    let addresses: Vec<_> = chips.iter().map(ChipSlot::address).collect();
    let payloads = chips
        .iter()
        .map(|chip| {
            chip.payload().copied().ok_or_else(|| {
                TransportError::Other(format!("chip {} has no payload", chip.address()))
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let reports = transport.push_batch(&addresses, &payloads)?;
    if reports.len() != chips.len() {
        return Err(TransportError::ReportCount {
            expected: chips.len(),
            got: reports.len(),
        }
        .into());
    }

    for (chip, report) in chips.iter_mut().zip(reports) {
        chip.latch(report);
    }
    Ok(())
}

/// Submit a switched chip's nonces and rotate its work. Returns the hashes
/// credited for it.
fn harvest(chip: &mut ChipSlot, host: &mut dyn WorkHost, now: Instant) -> u64 {
    let results = chip.take_results();
    let mut processed = results.len() as u64;

    // Newest slot first
    for &raw in results.iter().rev() {
        if let Some(previous) = chip.work.previous() {
            host.submit_found_nonce(previous, raw.swap_bytes());
            chip.shares.record(now);
        }
    }
    chip.job_switched = false;

    if let (Some(nonce), Some(two_back)) = (chip.old_nonce.take(), chip.work.two_back()) {
        host.submit_found_nonce(two_back, nonce.swap_bytes());
        processed += 1;
    }
    if let (Some(nonce), Some(current)) = (chip.future_nonce.take(), chip.work.current()) {
        host.submit_found_nonce(current, nonce.swap_bytes());
        processed += 1;
    }

    if let Some(released) = chip.rotate_work() {
        host.report_work_complete(released);
    }

    trace!(chip = %chip.address(), processed, "Job switched");
    HASHES_PER_RESULT * processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipAddress;
    use crate::error::Error;
    use crate::testing::{QueueHost, RecordingTransport};
    use crate::transport::ChipReport;
    use crate::work::WorkUnit;

    fn chips(count: u8) -> Vec<ChipSlot> {
        (0..count)
            .map(|position| ChipSlot::new(ChipAddress::new(0, position), 55))
            .collect()
    }

    fn switched(results: Vec<u32>) -> ChipReport {
        ChipReport {
            job_switched: true,
            results,
            ..ChipReport::default()
        }
    }

    fn cycle(
        chips: &mut [ChipSlot],
        transport: &RecordingTransport,
        host: &mut QueueHost,
    ) -> CycleOutcome {
        run_cycle(chips, &mut transport.clone(), host, Duration::ZERO).unwrap()
    }

    #[test]
    fn empty_queue_returns_zero_without_pushing() {
        let transport = RecordingTransport::new();
        let mut chips = chips(3);
        chips[0].assign_work(WorkUnit::stub(100));
        chips[2].assign_work(WorkUnit::stub(102));
        let mut host = QueueHost::default();

        let outcome = cycle(&mut chips, &transport, &mut host);

        assert_eq!(outcome, CycleOutcome::Starved);
        assert_eq!(outcome.hashes(), 0);
        assert_eq!(transport.push_count(), 0);
        assert_eq!(chips[0].work().current().map(|w| w.id), Some(100));
        assert!(chips[1].needs_work());
        assert_eq!(chips[2].work().current().map(|w| w.id), Some(102));
        assert!(host.submitted.is_empty() && host.completed.is_empty());
    }

    #[test]
    fn refill_stops_at_first_starved_chip() {
        let transport = RecordingTransport::new();
        let mut chips = chips(3);
        let mut host = QueueHost::with_work([1]);

        let outcome = cycle(&mut chips, &transport, &mut host);

        assert_eq!(outcome, CycleOutcome::Starved);
        assert_eq!(chips[0].work().current().map(|w| w.id), Some(1));
        assert!(chips[1].needs_work() && chips[2].needs_work());
        assert_eq!(transport.push_count(), 0);
    }

    #[test]
    fn pushes_one_payload_per_chip() {
        let transport = RecordingTransport::new();
        let mut chips = chips(4);
        let mut host = QueueHost::with_work(0..4);

        let outcome = cycle(&mut chips, &transport, &mut host);

        assert!(matches!(outcome, CycleOutcome::Completed { hashes: 0, .. }));
        assert_eq!(transport.push_count(), 1);
        assert!(chips.iter().all(|c| !c.needs_work()));
    }

    #[test]
    fn nonces_submitted_newest_first_and_byte_swapped() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work([1, 2]);

        // First switch moves work 1 to previous
        transport.queue_reports(vec![switched(vec![])]);
        cycle(&mut chips, &transport, &mut host);

        let (a, b, c) = (0x11223344, 0x55667788, 0x99aabbcc);
        transport.queue_reports(vec![switched(vec![a, b, c])]);
        let outcome = cycle(&mut chips, &transport, &mut host);

        assert_eq!(
            host.submitted,
            vec![(1, 0xccbbaa99), (1, 0x88776655), (1, 0x44332211)]
        );
        assert_eq!(outcome.hashes(), 3 * HASHES_PER_RESULT);
        assert_eq!(chips[0].shares().len(), 3);
    }

    #[test]
    fn results_without_previous_work_count_hashes_but_not_shares() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work([1]);

        transport.queue_reports(vec![switched(vec![1, 2])]);
        let outcome = cycle(&mut chips, &transport, &mut host);

        assert!(host.submitted.is_empty());
        assert!(chips[0].shares().is_empty());
        assert_eq!(outcome.hashes(), 2 * HASHES_PER_RESULT);
    }

    #[test]
    fn first_rotation_shifts_work_back() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work([7]);

        transport.queue_reports(vec![switched(vec![])]);
        cycle(&mut chips, &transport, &mut host);

        let ring = chips[0].work();
        assert!(ring.current().is_none());
        assert_eq!(ring.previous().map(|w| w.id), Some(7));
        assert!(ring.two_back().is_none());
        assert!(host.completed.is_empty());
    }

    #[test]
    fn oldest_work_reported_complete_on_third_rotation() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work(1..=4);

        for _ in 0..3 {
            transport.queue_reports(vec![switched(vec![])]);
            cycle(&mut chips, &transport, &mut host);
        }
        assert_eq!(host.completed, vec![1]);

        transport.queue_reports(vec![switched(vec![])]);
        cycle(&mut chips, &transport, &mut host);
        assert_eq!(host.completed, vec![1, 2]);
    }

    #[test]
    fn unswitched_chip_keeps_work_and_results() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work([1]);

        transport.queue_reports(vec![ChipReport {
            results: vec![5],
            ..ChipReport::default()
        }]);
        let outcome = cycle(&mut chips, &transport, &mut host);

        assert_eq!(outcome.hashes(), 0);
        assert_eq!(chips[0].work().current().map(|w| w.id), Some(1));
        assert_eq!(chips[0].pending_result_count(), 1);
    }

    #[test]
    fn boundary_nonces_go_to_their_own_jobs() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work(1..=3);

        // Fill previous (1) and two-back (none yet), then previous (2), two-back (1)
        transport.queue_reports(vec![switched(vec![])]);
        cycle(&mut chips, &transport, &mut host);
        transport.queue_reports(vec![switched(vec![])]);
        cycle(&mut chips, &transport, &mut host);

        transport.queue_reports(vec![ChipReport {
            job_switched: true,
            results: vec![0x01000000],
            old_nonce: Some(0x02000000),
            future_nonce: Some(0x03000000),
            ..ChipReport::default()
        }]);
        let outcome = cycle(&mut chips, &transport, &mut host);

        assert_eq!(host.submitted, vec![(2, 0x01), (1, 0x02), (3, 0x03)]);
        assert_eq!(outcome.hashes(), 3 * HASHES_PER_RESULT);
        // Only buffered results feed the share statistics
        assert_eq!(chips[0].shares().len(), 1);
    }

    #[test]
    fn old_nonce_dropped_without_two_back_work() {
        let transport = RecordingTransport::new();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work([1]);

        transport.queue_reports(vec![ChipReport {
            job_switched: true,
            old_nonce: Some(0xabcd),
            ..ChipReport::default()
        }]);
        let outcome = cycle(&mut chips, &transport, &mut host);

        assert!(host.submitted.is_empty());
        assert_eq!(outcome.hashes(), 0);
    }

    #[test]
    fn failed_push_is_a_transport_error() {
        let transport = RecordingTransport::new();
        transport.fail_pushes();
        let mut chips = chips(1);
        let mut host = QueueHost::with_work([1]);

        let result = run_cycle(&mut chips, &mut transport.clone(), &mut host, Duration::ZERO);

        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn short_report_is_a_transport_error() {
        let transport = RecordingTransport::new();
        transport.queue_reports(vec![ChipReport::default()]);
        let mut chips = chips(2);
        let mut host = QueueHost::with_work([1, 2]);

        let result = run_cycle(&mut chips, &mut transport.clone(), &mut host, Duration::ZERO);

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::ReportCount {
                expected: 2,
                got: 1
            }))
        ));
    }
}
