//! Assembly of nodes into a running pipeline.

use crate::barcode_classifier::BarcodeClassifier;
use crate::barcode_matching::MismatchBarcodeScorer;
use crate::demux::{BarcodeDemuxer, OutputWriterFactory, SamHeader};
use crate::duplex_encoder::{DuplexEncoder, StereoFeatureEncoder};
use crate::errors::{ErrorReporter, PipelineError, Result, error_channel};
use crate::messages::Message;
use crate::node::{MessageSink, PipelineNode};
use crate::read_filter::ReadFilter;
use crate::samples::SampleGroup;
use crate::stats::{NamedStats, merge_prefixed};
use crate::subread_tagger::SubreadTagger;
use crossbeam_channel::Receiver;
use log::{info, warn};
use std::sync::Arc;

/// Queue capacities, pool sizes and stage settings for [`Pipeline::standard`].
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub filter_capacity: usize,
    pub classifier_capacity: usize,
    pub encoder_capacity: usize,
    pub tagger_capacity: usize,
    pub demuxer_capacity: usize,
    pub filter_threads: usize,
    pub classifier_threads: usize,
    pub encoder_threads: usize,
    pub tagger_threads: usize,
    /// Self-contained simplex reads below this mean quality are dropped.
    pub min_qscore: u8,
    pub max_mismatches: u8,
    pub min_mismatch_delta: u8,
    /// Look for barcodes at the end of reads as well as the start.
    pub barcode_both_ends: bool,
    /// Keep barcode bases on classified reads.
    pub no_trim: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            filter_capacity: 1000,
            classifier_capacity: 1000,
            encoder_capacity: 1000,
            tagger_capacity: 1000,
            demuxer_capacity: 10000,
            filter_threads: 1,
            classifier_threads: 2,
            encoder_threads: 2,
            tagger_threads: 1,
            min_qscore: 0,
            max_mismatches: 1,
            min_mismatch_delta: 2,
            barcode_both_ends: false,
            no_trim: false,
        }
    }
}

impl PipelineOptions {
    /// Spreads `threads` over the worker-pool stages, keeping at least one thread each.
    /// The classifier and encoder share three quarters of the budget, the filter and tagger
    /// the rest.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        let (workers, light) = split_threads(threads, 0.25);
        self.filter_threads = light.div_ceil(2).max(1);
        self.tagger_threads = (light / 2).max(1);
        self.classifier_threads = workers.div_ceil(2).max(1);
        self.encoder_threads = (workers / 2).max(1);
        self
    }
}

/// Divides `available` threads into `(workers, writers)`, giving writers `writer_fraction` of
/// them rounded down. Each side always gets at least one thread and, when there are at least
/// two threads, no side takes them all.
#[must_use]
pub fn split_threads(available: usize, writer_fraction: f32) -> (usize, usize) {
    if available < 2 {
        return (1, 1);
    }
    let wanted = (writer_fraction.max(0.0) * available as f32).floor() as usize;
    let writers = wanted.clamp(1, available - 1);
    let workers = (available - writers).clamp(1, available - 1);
    (workers, writers)
}

/// A chain of sinks, head first, sharing one error channel.
pub struct Pipeline {
    nodes: Vec<Arc<dyn MessageSink>>,
    reporter: ErrorReporter,
    errors: Receiver<PipelineError>,
}

impl Pipeline {
    /// Wraps already connected `nodes`, listed upstream to downstream.
    ///
    /// # Panics
    /// - Will panic if `nodes` is empty.
    #[must_use]
    pub fn new(
        nodes: Vec<Arc<dyn MessageSink>>,
        reporter: ErrorReporter,
        errors: Receiver<PipelineError>,
    ) -> Self {
        assert!(!nodes.is_empty(), "A pipeline needs at least one node");
        Self { nodes, reporter, errors }
    }

    /// Builds filter -> classifier -> encoder -> tagger -> demuxer, writing through `factory`.
    ///
    /// # Errors
    /// - Returns an error if any node's workers cannot be spawned.
    pub fn standard<F: OutputWriterFactory>(
        samples: &SampleGroup,
        factory: F,
        header: SamHeader,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let (reporter, errors) = error_channel();
        let demuxer = BarcodeDemuxer::new(factory);
        demuxer.set_header(header);
        let demuxer: Arc<dyn MessageSink> =
            PipelineNode::spawn(demuxer, None, options.demuxer_capacity, 1, reporter.clone())?;
        Self::with_tail(samples, demuxer, options, reporter, errors)
    }

    /// Builds filter -> classifier -> encoder -> tagger, ending in `sink` instead of a demuxer.
    ///
    /// # Errors
    /// - Returns an error if any node's workers cannot be spawned.
    pub fn with_sink(
        samples: &SampleGroup,
        sink: Arc<dyn MessageSink>,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let (reporter, errors) = error_channel();
        Self::with_tail(samples, sink, options, reporter, errors)
    }

    /// Builds the stages in front of `tail`, last stage first so every node exists before
    /// anything upstream of it can push.
    fn with_tail(
        samples: &SampleGroup,
        tail: Arc<dyn MessageSink>,
        options: &PipelineOptions,
        reporter: ErrorReporter,
        errors: Receiver<PipelineError>,
    ) -> Result<Self> {
        let tagger: Arc<dyn MessageSink> = PipelineNode::spawn(
            SubreadTagger::new(),
            Some(tail.clone()),
            options.tagger_capacity,
            options.tagger_threads,
            reporter.clone(),
        )?;
        let encoder: Arc<dyn MessageSink> = PipelineNode::spawn(
            DuplexEncoder::new(StereoFeatureEncoder),
            Some(tagger.clone()),
            options.encoder_capacity,
            options.encoder_threads,
            reporter.clone(),
        )?;
        let scorer = MismatchBarcodeScorer::new(
            samples,
            options.max_mismatches,
            options.min_mismatch_delta,
            options.barcode_both_ends,
        );
        let classifier: Arc<dyn MessageSink> = PipelineNode::spawn(
            BarcodeClassifier::new(scorer, options.no_trim),
            Some(encoder.clone()),
            options.classifier_capacity,
            options.classifier_threads,
            reporter.clone(),
        )?;
        let filter: Arc<dyn MessageSink> = PipelineNode::spawn(
            ReadFilter::new(options.min_qscore),
            Some(classifier.clone()),
            options.filter_capacity,
            options.filter_threads,
            reporter.clone(),
        )?;
        Ok(Self::new(vec![filter, classifier, encoder, tagger, tail], reporter, errors))
    }

    /// Hands `message` to the head of the pipeline, blocking while it is full.
    ///
    /// # Errors
    /// - Returns [`PipelineError::QueueClosed`] once the pipeline has been terminated or a
    ///   failure has shut it down.
    pub fn push(&self, message: Message) -> Result<()> {
        self.nodes[0].push(message)
    }

    /// Terminates the head. Each node terminates its downstream once drained, so this returns
    /// only after everything pushed so far has passed through the whole pipeline.
    pub fn terminate(&self) {
        self.nodes[0].terminate();
    }

    /// Restarts every node, most downstream first, so nothing is pushed into a stopped node.
    ///
    /// # Errors
    /// - Returns the first node restart failure.
    pub fn restart(&self) -> Result<()> {
        for node in self.nodes.iter().rev() {
            node.restart()?;
        }
        Ok(())
    }

    /// Counters of every node, keyed `<node>.<counter>`.
    #[must_use]
    pub fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        for node in &self.nodes {
            merge_prefixed(&mut stats, node.name(), node.sample_stats());
        }
        stats
    }

    /// True once any node has reported a fatal error.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.reporter.has_failed()
    }

    /// Takes the first reported error, discarding any that followed from it.
    pub fn first_error(&self) -> Option<PipelineError> {
        let mut errors = self.errors.try_iter();
        let first = errors.next()?;
        let followups = errors.count();
        if followups > 0 {
            warn!("{followups} further error(s) followed: {first}");
        }
        Some(first)
    }

    /// Terminates the pipeline and returns its final counters.
    ///
    /// # Errors
    /// - Returns the first fatal error any node reported during the run.
    pub fn finish(&self) -> Result<NamedStats> {
        self.terminate();
        if let Some(err) = self.first_error() {
            return Err(err);
        }
        let stats = self.sample_stats();
        info!("Pipeline finished cleanly");
        Ok(stats)
    }
}
