use std::fmt::{self, Display};

/// Separator between the template and complement read ids in a duplex read id.
pub const DUPLEX_ID_SEPARATOR: char = ';';

/// Classification key given to reads that could not be assigned a barcode.
pub const UNCLASSIFIED: &str = "unclassified";

/// The opaque block of numeric features attached to a duplex read by the encoder. Stored
/// row-major as `rows` x `columns`.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureBlock {
    pub rows: usize,
    pub columns: usize,
    pub values: Vec<f32>,
}

impl FeatureBlock {
    /// Creates a block of the given shape filled with `fill`.
    #[must_use]
    pub fn filled(rows: usize, columns: usize, fill: f32) -> Self {
        Self { rows, columns, values: vec![fill; rows * columns] }
    }

    /// Mutable access to one row of the block.
    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        let start = row * self.columns;
        &mut self.values[start..start + self.columns]
    }

    /// Read access to one row of the block.
    #[must_use]
    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.columns;
        &self.values[start..start + self.columns]
    }
}

/// One unit of sequencer output flowing through the pipeline.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Read {
    /// Unique id of this read. Duplex reads carry `template;complement`.
    pub read_id: String,
    /// Id of the read this one was split from, or empty if it was not split.
    pub parent_read_id: String,
    /// Total number of sibling fragments expected for the parent.
    pub split_count: usize,
    /// Number of duplex pairings this read is expected to take part in.
    pub num_duplex_candidate_pairs: usize,
    /// True if this read was produced by pairing two simplex reads.
    pub is_duplex: bool,
    /// Position of this read within its subread group.
    pub subread_id: usize,
    /// Acquisition channel the read came from
    pub channel: u32,
    /// Called bases
    pub seq: Vec<u8>,
    /// Phred+33 base qualities
    pub qual: Vec<u8>,
    /// Barcode assigned by the classifier, if it has run.
    pub barcode: Option<String>,
    /// Encoder output, only present on duplex reads.
    pub features: Option<FeatureBlock>,
}

impl Read {
    /// Creates an unsplit, unpaired simplex read.
    #[must_use]
    pub fn simplex(read_id: &str, seq: &[u8], qual: &[u8]) -> Self {
        Self {
            read_id: read_id.to_owned(),
            split_count: 1,
            seq: seq.to_vec(),
            qual: qual.to_vec(),
            ..Self::default()
        }
    }

    /// The key subreads are grouped under: the parent id, or the read's own id if unsplit.
    #[must_use]
    pub fn group_key(&self) -> &str {
        if self.parent_read_id.is_empty() { &self.read_id } else { &self.parent_read_id }
    }

    /// The id of the template read a duplex read was built from, i.e. everything before the
    /// first separator. Simplex ids come back unchanged.
    #[must_use]
    pub fn template_read_id(&self) -> &str {
        match self.read_id.find(DUPLEX_ID_SEPARATOR) {
            Some(idx) => &self.read_id[..idx],
            None => &self.read_id,
        }
    }

    /// True if this read needs no grouping: it is whole and will never be paired.
    #[must_use]
    pub fn is_self_contained(&self) -> bool {
        self.split_count == 1 && self.num_duplex_candidate_pairs == 0
    }

    /// The classification key, `unclassified` if none was assigned.
    #[must_use]
    pub fn barcode_or_unclassified(&self) -> &str {
        self.barcode.as_deref().unwrap_or(UNCLASSIFIED)
    }

    /// Mean Phred quality of the read, zero for empty reads.
    #[must_use]
    pub fn mean_qscore(&self) -> f64 {
        if self.qual.is_empty() {
            return 0.0;
        }
        let total: u64 = self.qual.iter().map(|&q| u64::from(q.saturating_sub(33))).sum();
        total as f64 / self.qual.len() as f64
    }
}

/// A template and complement read proposed together for duplex encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadPair {
    pub template: Read,
    pub complement: Read,
}

/// Signals that a candidate pairing involving `template_read_id` was evaluated and rejected.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CandidatePairRejected {
    pub template_read_id: String,
    pub complement_read_id: String,
}

/// The value of an auxiliary tag on a [`BamRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagValue {
    Int(i64),
    Str(String),
}

impl Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Int(i) => write!(f, "i:{i}"),
            TagValue::Str(s) => write!(f, "Z:{s}"),
        }
    }
}

/// An unaligned output record ready to be written.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BamRecord {
    pub name: String,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
    pub tags: Vec<([u8; 2], TagValue)>,
}

impl BamRecord {
    /// Returns the value of the given tag, if present.
    #[must_use]
    pub fn tag(&self, tag: [u8; 2]) -> Option<&TagValue> {
        self.tags.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    /// Returns the `BC` tag value, the classification key used for demultiplexing.
    #[must_use]
    pub fn barcode(&self) -> Option<&str> {
        match self.tag(*b"BC") {
            Some(TagValue::Str(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<Read> for BamRecord {
    fn from(read: Read) -> Self {
        let mut tags = vec![
            (*b"BC", TagValue::Str(read.barcode_or_unclassified().to_owned())),
            (*b"ch", TagValue::Int(i64::from(read.channel))),
            (*b"dx", TagValue::Int(i64::from(read.is_duplex))),
        ];
        if !read.parent_read_id.is_empty() {
            tags.push((*b"pi", TagValue::Str(read.parent_read_id.clone())));
        }
        if read.split_count > 1 {
            tags.push((*b"sp", TagValue::Int(read.subread_id as i64)));
        }
        Self { name: read.read_id, seq: read.seq, qual: read.qual, tags }
    }
}

/// The messages passed between pipeline nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Read(Read),
    ReadPair(ReadPair),
    CandidatePairRejected(CandidatePairRejected),
    BamRecord(BamRecord),
}

impl Message {
    /// A short name for the variant, used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Read(_) => "Read",
            Message::ReadPair(_) => "ReadPair",
            Message::CandidatePairRejected(_) => "CandidatePairRejected",
            Message::BamRecord(_) => "BamRecord",
        }
    }
}

impl From<Read> for Message {
    fn from(read: Read) -> Self {
        Message::Read(read)
    }
}

impl From<ReadPair> for Message {
    fn from(pair: ReadPair) -> Self {
        Message::ReadPair(pair)
    }
}

impl From<CandidatePairRejected> for Message {
    fn from(rejected: CandidatePairRejected) -> Self {
        Message::CandidatePairRejected(rejected)
    }
}

impl From<BamRecord> for Message {
    fn from(record: BamRecord) -> Self {
        Message::BamRecord(record)
    }
}
