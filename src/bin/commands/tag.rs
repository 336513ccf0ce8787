use crate::commands::command::Command;
use anyhow::{Result, anyhow};
use clap::Parser;
use itertools::Itertools;
use log::info;
use proglog::{CountFormatterKind, ProgLogBuilder};
use readflow_lib::demux::{FileWriterFactory, OutputFormat, SamHeader};
use readflow_lib::manifest::load_manifest;
use readflow_lib::pipeline::{Pipeline, PipelineOptions};
use readflow_lib::samples::SampleGroup;
use readflow_lib::stats::format_stats;
use std::fs;
use std::path::{Path, PathBuf};

/// Picks the delimiter of a delimited file from its extension: comma for `.csv`, tab otherwise.
fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

/// Classifies, pairs, joins and demultiplexes reads described in a manifest.
///
/// Messages are read from the manifest and pushed through a pipeline of five stages, each with
/// its own worker threads and bounded input queue:
///
/// 1. a read filter dropping unsplit, unpaired reads below `--min-qscore`
/// 2. a barcode classifier matching read ends against the sample barcodes
/// 3. a duplex encoder turning candidate pairs into duplex reads
/// 4. a subread tagger regrouping split reads with the duplex reads built from them
/// 5. a demultiplexer writing one `<sample>.sam` (or `.fastq`) per barcode into `--output`
///
/// Reads matching no barcode go to `unclassified.sam`.
///
/// The manifest is a headered TSV (or CSV, by extension) with the columns `kind`, `read_id`,
/// `parent_read_id`, `split_count`, `num_duplex_candidate_pairs`, `channel`, `bases`, `quals`
/// and `complement_read_id`. `kind` is one of:
///
/// - `simplex`: a read; split reads share a `parent_read_id` and a `split_count`
/// - `pair`: a candidate pair of two simplex reads listed above it, `read_id` being the template
/// - `rejected`: a candidate pair that was turned down
///
/// Every candidate pairing a read counts in `num_duplex_candidate_pairs` must appear as a `pair`
/// or `rejected` row with that read as template, otherwise the run fails at the end.
///
/// Sample metadata is a headered TSV or CSV with the columns `name` and `barcode`.
///
/// ## Example Command Line
///
/// ```
/// readflow tag \
///     --manifest reads.tsv \
///     --sample-metadata barcodes.tsv \
///     --output demuxed \
///     --threads 8
/// ```
#[derive(Parser, Debug)]
pub(crate) struct Tag {
    /// The manifest of messages to push through the pipeline.
    #[clap(long, short = 'i', required = true)]
    manifest: PathBuf,

    /// A file containing the names and barcodes of the samples.
    #[clap(long, short = 's', required = true)]
    sample_metadata: PathBuf,

    /// The output directory into which to write per-barcode files.
    #[clap(long, short = 'o', required = true)]
    output: PathBuf,

    /// Write FASTQ instead of SAM.
    #[clap(long, default_value = "false")]
    emit_fastq: bool,

    /// Maximum mismatches for a barcode to be considered a match.
    #[clap(long, short = 'm', default_value = "1")]
    max_mismatches: u8,

    /// Minimum difference between number of mismatches in the best and second best barcodes for a
    /// barcode to be considered a match.
    #[clap(long, short = 'd', default_value = "2")]
    min_mismatch_delta: u8,

    /// Unsplit, unpaired reads with a lower mean base quality are discarded.
    #[clap(long, short = 'q', default_value = "0")]
    min_qscore: u8,

    /// Also look for the barcode, reverse complemented, at the end of each read.
    #[clap(long, default_value = "false")]
    barcode_both_ends: bool,

    /// Keep barcode bases on classified reads.
    #[clap(long, default_value = "false")]
    no_trim: bool,

    /// The number of worker threads to spread over the pipeline stages. Cannot be less than 2.
    #[clap(long, short = 't', default_value = "4")]
    threads: usize,
}

impl Tag {
    /// Checks that the inputs exist, that the output directory can be written and that the
    /// thread count is usable, reporting every problem at once.
    fn validate_inputs(&self) -> Result<()> {
        let mut constraint_errors = vec![];

        for (label, input) in [("Manifest", &self.manifest), ("Sample metadata", &self.sample_metadata)]
        {
            if !input.exists() {
                constraint_errors.push(format!("{label} file {input:#?} doesn't exist"));
            }
        }

        if !self.output.exists() {
            info!("Output directory {:#?} didn't exist, creating it.", self.output);
            fs::create_dir_all(&self.output)?;
        }
        if self.output.metadata()?.permissions().readonly() {
            constraint_errors.push(format!("Output directory {:#?} cannot be read-only", self.output));
        }

        if self.threads < 2 {
            constraint_errors
                .push(format!("Threads provided {} was too low! Must be 2 or more.", self.threads));
        }

        if constraint_errors.is_empty() {
            Ok(())
        } else {
            let mut details = "Inputs failed validation!\n".to_owned();
            for error_reason in constraint_errors {
                details.push_str(&format!("    - {error_reason}\n"));
            }
            Err(anyhow!("The following errors with the input(s) were detected:\n{}", details))
        }
    }

    fn options(&self) -> PipelineOptions {
        PipelineOptions {
            min_qscore: self.min_qscore,
            max_mismatches: self.max_mismatches,
            min_mismatch_delta: self.min_mismatch_delta,
            barcode_both_ends: self.barcode_both_ends,
            no_trim: self.no_trim,
            ..PipelineOptions::default()
        }
        .with_threads(self.threads)
    }
}

impl Command for Tag {
    /// Executes the tag command
    fn execute(&self) -> Result<()> {
        self.validate_inputs()?;

        let samples = SampleGroup::from_file(&self.sample_metadata, delimiter_for(&self.sample_metadata))?;
        info!(
            "Loaded {} sample(s) with {}bp barcodes: {}",
            samples.samples.len(),
            samples.barcode_length(),
            samples.names().join(", ")
        );
        let messages = load_manifest(&self.manifest, delimiter_for(&self.manifest))?;
        info!("Loaded {} message(s) from {:#?}", messages.len(), self.manifest);

        let format = if self.emit_fastq { OutputFormat::Fastq } else { OutputFormat::Sam };
        let factory = FileWriterFactory::new(&self.output, format)?;
        let mut header = SamHeader::new();
        header.add_program_line(&std::env::args().collect::<Vec<_>>());
        let pipeline = Pipeline::standard(&samples, factory, header, &self.options())?;

        let logger = ProgLogBuilder::new()
            .name("readflow")
            .noun("messages")
            .verb("pushed")
            .unit(100_000)
            .count_formatter(CountFormatterKind::Comma)
            .level(log::Level::Info)
            .build();

        for message in messages {
            if pipeline.push(message).is_err() {
                // The pipeline shut itself down; the cause is reported by finish below.
                break;
            }
            logger.record();
        }

        info!("Finished pushing, waiting for the pipeline to drain.");
        let stats = pipeline.finish()?;
        info!("Pipeline stats: {}", format_stats(&stats));
        info!("Output written to {:#?}", self.output);
        Ok(())
    }
}
