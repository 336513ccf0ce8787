//! Read filtering stage: drops low quality reads that take no part in splitting or pairing.

use crate::errors::Result;
use crate::messages::Message;
use crate::node::{NodeOutput, NodeProcessor};
use crate::stats::NamedStats;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Drops low quality reads before they reach the rest of the pipeline.
///
/// Only self-contained simplex reads are candidates for filtering. Split reads and reads with
/// duplex candidates are always forwarded because the tagger waits for every one of them.
pub struct ReadFilter {
    min_qscore: f64,
    reads_filtered: AtomicU64,
}

impl ReadFilter {
    #[must_use]
    pub fn new(min_qscore: u8) -> Self {
        Self { min_qscore: f64::from(min_qscore), reads_filtered: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn reads_filtered(&self) -> u64 {
        self.reads_filtered.load(Ordering::Relaxed)
    }
}

impl NodeProcessor for ReadFilter {
    type Worker = ();

    fn name(&self) -> &str {
        "ReadFilterNode"
    }

    fn new_worker(&self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn process(&self, _worker: &mut (), message: Message, output: &NodeOutput<'_>) -> Result<()> {
        if let Message::Read(read) = &message {
            if !read.is_duplex && read.is_self_contained() && read.mean_qscore() < self.min_qscore
            {
                debug!("Filtered {} with mean qscore {:.1}", read.read_id, read.mean_qscore());
                self.reads_filtered.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        output.send(message)
    }

    fn sample_stats(&self, stats: &mut NamedStats) {
        stats.insert("reads_filtered".to_owned(), self.reads_filtered() as f64);
    }
}
