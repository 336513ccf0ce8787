//! Barcode classification stage: a stateless worker pool that labels each read with the
//! sample barcode it carries and optionally trims the barcode off.

use crate::barcode_matching::{BarcodeScorer, ScoreResult};
use crate::errors::Result;
use crate::messages::{BamRecord, Message, Read, TagValue};
use crate::node::{NodeOutput, NodeProcessor};
use crate::stats::NamedStats;
use log::debug;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Removes `range` from the bases and, where present, from the qualities.
fn trim_region(seq: &mut Vec<u8>, qual: &mut Vec<u8>, range: &Range<usize>) {
    if range.end <= seq.len() {
        seq.drain(range.clone());
    }
    if range.end <= qual.len() {
        qual.drain(range.clone());
    }
}

/// Processor for the classifier node. Workers share nothing but the scorer and counters.
pub struct BarcodeClassifier<S: BarcodeScorer> {
    scorer: S,
    no_trim: bool,
    classified: AtomicU64,
    unclassified: AtomicU64,
}

impl<S: BarcodeScorer> BarcodeClassifier<S> {
    #[must_use]
    pub fn new(scorer: S, no_trim: bool) -> Self {
        Self { scorer, no_trim, classified: AtomicU64::new(0), unclassified: AtomicU64::new(0) }
    }

    /// Scores `seq`, updates the counters and decides what to trim.
    fn score(&self, seq: &[u8]) -> (ScoreResult, Option<Range<usize>>) {
        let result = self.scorer.classify(seq);
        if result.is_classified() {
            self.classified.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unclassified.fetch_add(1, Ordering::Relaxed);
        }
        let trim = if self.no_trim { None } else { result.trim.clone() };
        (result, trim)
    }

    fn barcode_read(&self, read: &mut Read) {
        let (result, trim) = self.score(&read.seq);
        if let Some(range) = trim {
            trim_region(&mut read.seq, &mut read.qual, &range);
        }
        debug!("{} classified as {} ({:.3})", read.read_id, result.barcode, result.score);
        read.barcode = Some(result.barcode);
    }

    fn barcode_record(&self, record: &mut BamRecord) {
        let (result, trim) = self.score(&record.seq);
        if let Some(range) = trim {
            trim_region(&mut record.seq, &mut record.qual, &range);
        }
        record.tags.retain(|(tag, _)| tag != b"BC");
        record.tags.push((*b"BC", TagValue::Str(result.barcode)));
    }

    /// Total reads scored, classified or not.
    #[must_use]
    pub fn num_barcodes_demuxed(&self) -> u64 {
        self.classified.load(Ordering::Relaxed) + self.unclassified.load(Ordering::Relaxed)
    }
}

impl<S: BarcodeScorer> NodeProcessor for BarcodeClassifier<S> {
    type Worker = ();

    fn name(&self) -> &str {
        "BarcodeClassifierNode"
    }

    fn new_worker(&self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn process(&self, _worker: &mut (), message: Message, output: &NodeOutput<'_>) -> Result<()> {
        match message {
            Message::Read(mut read) => {
                self.barcode_read(&mut read);
                output.send(read)
            }
            Message::ReadPair(mut pair) => {
                self.barcode_read(&mut pair.template);
                self.barcode_read(&mut pair.complement);
                output.send(pair)
            }
            Message::BamRecord(mut record) => {
                self.barcode_record(&mut record);
                output.send(record)
            }
            Message::CandidatePairRejected(rejected) => output.send(rejected),
        }
    }

    fn sample_stats(&self, stats: &mut NamedStats) {
        stats.insert("classified".to_owned(), self.classified.load(Ordering::Relaxed) as f64);
        stats.insert("unclassified".to_owned(), self.unclassified.load(Ordering::Relaxed) as f64);
        stats.insert("num_barcodes_demuxed".to_owned(), self.num_barcodes_demuxed() as f64);
    }
}
