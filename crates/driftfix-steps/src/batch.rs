//! Cursor-driven batching for steps that rewrite many rows.
//!
//! A batch is the next `batch_size` candidate rows with an id above the
//! cursor. Every row a batch handles either gets rewritten into a state the
//! candidate query no longer selects, or is passed over by the cursor, so
//! an interrupted step picks up where it stopped.
//!
//! The migration lock is refreshed after every batch, so a step may run for
//! longer than the lock's stale threshold.

use driftfix_common::Result;
use driftfix_db::SiteStore;
use tracing::info;

/// Counts for one batch, or for a whole drained step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// Highest row id seen; `None` when the batch was empty.
    pub last_id: Option<i64>,
    pub scanned: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl BatchProgress {
    fn absorb(&mut self, batch: &BatchProgress) {
        self.last_id = batch.last_id.or(self.last_id);
        self.scanned += batch.scanned;
        self.updated += batch.updated;
        self.skipped += batch.skipped;
    }
}

/// A step that works through its rows one bounded batch at a time.
pub trait BatchStep {
    fn label(&self) -> &str;

    /// Process the next batch of rows with ids strictly above `after`.
    fn process_batch(&self, store: &SiteStore, after: i64) -> Result<BatchProgress>;
}

/// Run batches until one comes back empty.
pub fn drain<B: BatchStep + ?Sized>(step: &B, store: &SiteStore) -> Result<BatchProgress> {
    let mut total = BatchProgress::default();
    let mut cursor = 0;

    loop {
        let batch = step.process_batch(store, cursor)?;
        let Some(last_id) = batch.last_id else { break };
        total.absorb(&batch);
        cursor = last_id;
        store.heartbeat()?;
    }

    info!(
        "{} in scope {}: scanned {}, updated {}, skipped {}",
        step.label(),
        store.scope().id,
        total.scanned,
        total.updated,
        total.skipped
    );
    Ok(total)
}
