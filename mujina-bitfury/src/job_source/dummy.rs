//! Synthetic work for running without a pool.
//!
//! Header material is drawn from a seeded RNG, so nonces found against it are
//! meaningless. Useful for bring-up, burn-in and thermal testing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::work::WorkUnit;

/// Feeds one device queue with made-up work until cancelled.
pub struct DummySource {
    name: String,
    work_tx: mpsc::Sender<WorkUnit>,
    shutdown: CancellationToken,
    next_id: u64,
    rng: StdRng,
}

impl DummySource {
    pub fn new(
        name: impl Into<String>,
        work_tx: mpsc::Sender<WorkUnit>,
        shutdown: CancellationToken,
        seed: u64,
    ) -> Self {
        Self {
            name: name.into(),
            work_tx,
            shutdown,
            next_id: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next synthetic unit.
    fn generate(&mut self) -> WorkUnit {
        let id = self.next_id;
        self.next_id += 1;

        WorkUnit::new(id, self.rng.random(), self.rng.random())
    }

    /// Run until cancelled or until the device drops its queue.
    pub async fn run(mut self) -> Result<()> {
        info!(source = %self.name, "Dummy job source started");
        loop {
            let work = self.generate();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                sent = self.work_tx.send(work) => {
                    if sent.is_err() {
                        return Err(Error::Other(format!(
                            "work queue for {} closed",
                            self.name
                        )));
                    }
                }
            }
        }
        debug!(source = %self.name, generated = self.next_id, "Dummy job source stopped");
        Ok(())
    }
}
