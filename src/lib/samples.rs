use crate::is_valid_base;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::Deserialize;
use std::fmt::{self, Display};
use std::path::Path;

/// One barcoded sample: the classification key reads are demultiplexed under, and the
/// barcode sequence that identifies it.
#[derive(Clone, Deserialize, Debug)]
pub struct Sample {
    /// name of the sample, also used as the output file stem
    pub name: String,
    /// barcode sequence, A, C, G, T or N (wildcard)
    pub barcode: String,
    /// position of the sample in its [`SampleGroup`]
    #[serde(skip_deserializing)]
    ordinal: usize,
}

impl Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sample({:04}) - {{ name: {}\tbarcode: {} }}", self.ordinal, self.name, self.barcode)
    }
}

impl Sample {
    /// Validates and builds a sample. Barcodes are upper-cased before validation.
    /// # Panics
    ///   - Panics if sample name is empty string.
    ///   - Panics if sample name is the reserved `unclassified` key.
    ///   - Panics if barcode is empty string.
    ///   - Panics if barcode has bases other than A, C, G, T or N.
    #[must_use]
    pub fn new(ordinal: usize, name: String, barcode: String) -> Self {
        assert!(!name.is_empty(), "Sample name cannot be empty");
        assert!(
            name != crate::messages::UNCLASSIFIED,
            "Sample name cannot be the reserved name '{}'",
            crate::messages::UNCLASSIFIED
        );
        assert!(!barcode.is_empty(), "Sample barcode cannot be empty");
        let barcode = barcode.to_ascii_uppercase();
        assert!(
            barcode.bytes().all(|b| is_valid_base(b) && b != b'.'),
            "All sample barcode bases must be one of A, C, G, T or N"
        );
        Self { name, barcode, ordinal }
    }

    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

/// The full set of samples a run is demultiplexed into.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct SampleGroup {
    /// A group of samples
    pub samples: Vec<Sample>,
}

impl Display for SampleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SampleGroup {{")?;
        for sample in &self.samples {
            writeln!(f, "    {sample}")?;
        }
        writeln!(f, "}}")
    }
}

impl SampleGroup {
    /// Validates a group of [`Sample`]s, renumbering their ordinals to match their order here.
    /// # Panics
    ///   - Will panic if no samples are provided
    ///   - Will panic if sample names or barcodes are repeated
    ///   - Will panic if barcodes differ in length
    #[must_use]
    pub fn from_samples(samples: &[Sample]) -> Self {
        assert!(!samples.is_empty(), "Must provide one or more sample");
        assert!(
            samples.iter().map(|s| &s.name).all_unique(),
            "Each sample name must be unique, duplicate identified"
        );
        assert!(
            samples.iter().map(|s| s.barcode.to_ascii_uppercase()).all_unique(),
            "Each sample barcode must be unique, duplicate identified",
        );
        assert!(
            samples.iter().map(|s| s.barcode.len()).all_equal(),
            "All barcodes must have the same length",
        );

        Self {
            samples: samples
                .iter()
                .enumerate()
                .map(|(ordinal, s)| Sample::new(ordinal, s.name.clone(), s.barcode.clone()))
                .collect(),
        }
    }

    /// Loads a sample sheet delimited by `delimiter` with a header naming `name` and `barcode`.
    /// # Errors
    ///   - Will error if the file cannot be read or a row cannot be deserialized.
    /// # Panics
    ///   - Will panic if the samples fail the checks in [`SampleGroup::from_samples`].
    pub fn from_file<P: AsRef<Path>>(path: &P, delimiter: u8) -> Result<Self, fgoxide::FgError> {
        let reader = DelimFile::default();
        Ok(Self::from_samples(&reader.read(path, delimiter, false)?))
    }

    /// The barcode length shared by all samples.
    #[must_use]
    pub fn barcode_length(&self) -> usize {
        self.samples[0].barcode.len()
    }

    /// Sample names in sheet order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.name.as_str())
    }
}
