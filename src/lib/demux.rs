//! Demultiplexing stage: one writer thread fanning records out to one output per barcode.

use crate::errors::{PipelineError, Result};
use crate::messages::{BamRecord, Message, UNCLASSIFIED};
use crate::node::{NodeOutput, NodeProcessor};
use crate::stats::NamedStats;
use ahash::{HashMap as AHashMap, HashMapExt};
use fgoxide::io::Io;
use itertools::Itertools;
use log::{debug, info};
use std::collections::hash_map::Entry;
use std::fmt::{self, Display};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

const BUFFER_SIZE: usize = 1024 * 1024;

/// The SAM header written at the top of every per-barcode output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamHeader {
    lines: Vec<String>,
}

impl Default for SamHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl SamHeader {
    /// A header with only the `@HD` line.
    #[must_use]
    pub fn new() -> Self {
        Self { lines: vec!["@HD\tVN:1.6\tSO:unknown".to_owned()] }
    }

    /// Records the program and command line that produced the output.
    pub fn add_program_line(&mut self, args: &[String]) {
        self.lines.push(format!(
            "@PG\tID:{name}\tPN:{name}\tVN:{}\tCL:{}",
            env!("CARGO_PKG_VERSION"),
            args.iter().join(" "),
            name = env!("CARGO_PKG_NAME"),
        ));
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Display for SamHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Opens and writes the per-key outputs of a [`BarcodeDemuxer`].
pub trait OutputWriterFactory: Send + Sync + 'static {
    type Handle: Send;

    /// Opens the output for classification key `key`.
    ///
    /// # Errors
    /// - Returns an error if the output cannot be created.
    fn open(&self, key: &str) -> io::Result<Self::Handle>;

    /// # Errors
    /// - Returns an error if the header cannot be written.
    fn write_header(&self, handle: &mut Self::Handle, header: &SamHeader) -> io::Result<()>;

    /// # Errors
    /// - Returns an error if the record cannot be written.
    fn write_record(&self, handle: &mut Self::Handle, record: &BamRecord) -> io::Result<()>;

    /// Flushes and closes an output.
    ///
    /// # Errors
    /// - Returns an error if buffered data cannot be flushed.
    fn close(&self, handle: Self::Handle) -> io::Result<()>;
}

/// The on-disk format of demultiplexed output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Sam,
    Fastq,
}

impl OutputFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Sam => "sam",
            OutputFormat::Fastq => "fastq",
        }
    }
}

/// Writes `<key>.sam` or `<key>.fastq` files into an output directory.
pub struct FileWriterFactory {
    output_dir: PathBuf,
    format: OutputFormat,
    io: Io,
}

impl FileWriterFactory {
    /// Creates the output directory if needed.
    ///
    /// # Errors
    /// - Returns an error if the directory cannot be created.
    pub fn new(output_dir: &Path, format: OutputFormat) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        Ok(Self { output_dir: output_dir.to_path_buf(), format, io: Io::new(5, BUFFER_SIZE) })
    }

    /// The path the output for `key` is written to.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.output_dir.join(format!("{key}.{}", self.format.extension()))
    }

    fn sam_line(record: &BamRecord) -> String {
        let or_star = |bytes: &[u8]| {
            if bytes.is_empty() { "*".to_owned() } else { String::from_utf8_lossy(bytes).into_owned() }
        };
        let mut line = format!(
            "{}\t4\t*\t0\t0\t*\t*\t0\t0\t{}\t{}",
            record.name,
            or_star(&record.seq),
            or_star(&record.qual)
        );
        for (tag, value) in &record.tags {
            line.push('\t');
            line.push_str(&format!("{}{}:{value}", tag[0] as char, tag[1] as char));
        }
        line
    }
}

impl OutputWriterFactory for FileWriterFactory {
    type Handle = BufWriter<Box<dyn Write + Send>>;

    fn open(&self, key: &str) -> io::Result<Self::Handle> {
        let path = self.path_for(key);
        debug!("Opening {}", path.display());
        self.io.new_writer(&path).map_err(|e| io::Error::other(e.to_string()))
    }

    fn write_header(&self, handle: &mut Self::Handle, header: &SamHeader) -> io::Result<()> {
        match self.format {
            OutputFormat::Sam => write!(handle, "{header}"),
            OutputFormat::Fastq => Ok(()),
        }
    }

    fn write_record(&self, handle: &mut Self::Handle, record: &BamRecord) -> io::Result<()> {
        match self.format {
            OutputFormat::Sam => writeln!(handle, "{}", Self::sam_line(record)),
            OutputFormat::Fastq => {
                let head = std::iter::once(record.name.clone())
                    .chain(
                        record
                            .tags
                            .iter()
                            .map(|(t, v)| format!("{}{}:{v}", t[0] as char, t[1] as char)),
                    )
                    .join("\t");
                seq_io::fastq::write_to(handle, head.as_bytes(), &record.seq, &record.qual)
            }
        }
    }

    fn close(&self, mut handle: Self::Handle) -> io::Result<()> {
        handle.flush()
    }
}

/// Processor for the demultiplexing node. Exactly one worker owns every open output, so the
/// key to output map needs no lock.
pub struct BarcodeDemuxer<F: OutputWriterFactory> {
    factory: F,
    header: OnceLock<SamHeader>,
    written: AtomicU64,
    outputs_opened: AtomicU64,
}

impl<F: OutputWriterFactory> BarcodeDemuxer<F> {
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            header: OnceLock::new(),
            written: AtomicU64::new(0),
            outputs_opened: AtomicU64::new(0),
        }
    }

    /// Attaches the header written to every output. Only the first call has an effect;
    /// returns whether this call set it.
    pub fn set_header(&self, header: SamHeader) -> bool {
        let set = self.header.set(header).is_ok();
        if !set {
            debug!("{} already has a header, ignoring", self.name());
        }
        set
    }

    fn header(&self) -> &SamHeader {
        self.header.get_or_init(SamHeader::new)
    }

    #[must_use]
    pub fn demuxed_reads_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn fail(&self, key: &str, err: &io::Error) -> PipelineError {
        PipelineError::collaborator(self.name(), key, err)
    }
}

impl<F: OutputWriterFactory> NodeProcessor for BarcodeDemuxer<F> {
    type Worker = AHashMap<String, F::Handle>;

    fn name(&self) -> &str {
        "BarcodeDemuxerNode"
    }

    fn max_workers(&self) -> Option<usize> {
        Some(1)
    }

    fn new_worker(&self, _index: usize) -> Result<Self::Worker> {
        Ok(AHashMap::new())
    }

    fn process(
        &self,
        outputs: &mut Self::Worker,
        message: Message,
        _output: &NodeOutput<'_>,
    ) -> Result<()> {
        let record = match message {
            Message::BamRecord(record) => record,
            Message::Read(read) => BamRecord::from(read),
            other => {
                return Err(PipelineError::UnexpectedMessage {
                    stage: self.name().to_owned(),
                    kind: other.kind(),
                });
            }
        };

        let key = record.barcode().unwrap_or(UNCLASSIFIED).to_owned();
        let handle = match outputs.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut handle = self.factory.open(entry.key()).map_err(|e| self.fail(entry.key(), &e))?;
                self.factory
                    .write_header(&mut handle, self.header())
                    .map_err(|e| self.fail(entry.key(), &e))?;
                self.outputs_opened.fetch_add(1, Ordering::Relaxed);
                entry.insert(handle)
            }
        };
        self.factory.write_record(handle, &record).map_err(|e| self.fail(&record.name, &e))?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish_worker(&self, outputs: Self::Worker, _output: &NodeOutput<'_>) -> Result<()> {
        let count = outputs.len();
        for (key, handle) in outputs {
            self.factory.close(handle).map_err(|e| self.fail(&key, &e))?;
        }
        info!("{} closed {} output(s), {} record(s) written", self.name(), count, self.demuxed_reads_written());
        Ok(())
    }

    fn sample_stats(&self, stats: &mut NamedStats) {
        stats.insert("demuxed_reads_written".to_owned(), self.demuxed_reads_written() as f64);
        stats.insert("outputs_opened".to_owned(), self.outputs_opened.load(Ordering::Relaxed) as f64);
    }
}
