use super::byte_is_nocall;
use crate::messages::UNCLASSIFIED;
use crate::reverse_complement;
use crate::samples::SampleGroup;
use std::ops::Range;

/// The struct that contains the info related to the best and next best sample barcode match.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarcodeMatch {
    /// Index of the best barcode match in the corresponding ``BarcodeMatcher`` struct that
    /// generated this match.
    pub best_match: usize,
    /// The number of mismatches to the best matching barcode for the read described by this match.
    pub best_mismatches: u8,
    /// The number of mismatches to the second best matching barcode for the read described by this
    /// match
    pub next_best_mismatches: u8,
}

/// The struct responsible for matching barcodes to a ``Vec`` of sample barcodes.
#[derive(Clone, Debug)]
pub struct BarcodeMatcher {
    /// Vec of the barcodes for each sample, upper-cased
    sample_barcodes: Vec<Vec<u8>>,
    /// The maxium number of Ns in any barcode in set of sample barcodes
    max_ns_in_barcodes: usize,
    /// The maximum mismatches to match a sample barcode.
    max_mismatches: u8,
    /// The minimum difference between number of mismatches in the best and second best barcodes
    /// for a barcode to be considered a match.
    min_mismatch_delta: u8,
}

impl BarcodeMatcher {
    /// Instantiates a new ``BarcodeMatcher`` struct. Checks that the sample barcodes vector is not
    /// empty and that none of the barcodes provided are the empty string.
    ///
    /// # Panics
    /// - Will panic if provided an empty vec of sample barcodes.
    /// - Will panic if any provided barcode is length zero.
    /// - Will panic if the barcodes are not all the same length.
    #[must_use]
    pub fn new(sample_barcodes: &[&str], max_mismatches: u8, min_mismatch_delta: u8) -> Self {
        assert!(!sample_barcodes.is_empty(), "Must provide at least one sample barcode");
        assert!(
            sample_barcodes.iter().all(|b| !b.is_empty()),
            "Sample barcode cannot be empty string"
        );
        assert!(
            sample_barcodes.iter().all(|b| b.len() == sample_barcodes[0].len()),
            "All sample barcodes must have the same length"
        );

        let sample_barcodes: Vec<Vec<u8>> =
            sample_barcodes.iter().map(|b| b.to_ascii_uppercase().into_bytes()).collect();
        let max_ns_in_barcodes = sample_barcodes
            .iter()
            .map(|b| b.iter().filter(|&&base| byte_is_nocall(base)).count())
            .max()
            .unwrap_or(0);

        Self { sample_barcodes, max_ns_in_barcodes, max_mismatches, min_mismatch_delta }
    }

    /// Counts the number of bases that differ between two byte arrays. No-calls in the expected
    /// barcode match anything; no-calls in the observed bases match nothing.
    fn count_mismatches(observed_bases: &[u8], expected_bases: &[u8]) -> u8 {
        assert_eq!(
            observed_bases.len(),
            expected_bases.len(),
            "observed_bases: {}, expected_bases: {}",
            observed_bases.len(),
            expected_bases.len()
        );
        let count = observed_bases
            .iter()
            .zip(expected_bases.iter())
            .filter(|&(&obs, &exp)| {
                !byte_is_nocall(exp) && (byte_is_nocall(obs) || !obs.eq_ignore_ascii_case(&exp))
            })
            .count();
        u8::try_from(count).unwrap_or(u8::MAX)
    }

    /// Returns the expected barcode length, assuming a fixed length for all samples.
    #[must_use]
    pub fn expected_barcode_length(&self) -> usize {
        self.sample_barcodes[0].len()
    }

    /// Assigns the barcode that best matches the provided ``read_bases``.
    fn assign_internal(&self, read_bases: &[u8]) -> Option<BarcodeMatch> {
        let mut best_barcode_index = self.sample_barcodes.len();
        let mut best_mismatches = 255u8;
        let mut next_best_mismatches = 255u8;
        for (index, sample_barcode) in self.sample_barcodes.iter().enumerate() {
            let mismatches = Self::count_mismatches(read_bases, sample_barcode);
            if mismatches < best_mismatches {
                next_best_mismatches = best_mismatches;
                best_mismatches = mismatches;
                best_barcode_index = index;
            } else if mismatches < next_best_mismatches {
                next_best_mismatches = mismatches;
            }
        }

        if best_mismatches > self.max_mismatches
            || next_best_mismatches.saturating_sub(best_mismatches) < self.min_mismatch_delta
        {
            None
        } else {
            Some(BarcodeMatch {
                best_match: best_barcode_index,
                best_mismatches,
                next_best_mismatches,
            })
        }
    }

    /// Assigns the barcode that best matches the provided ``read_bases``, skipping calculation
    /// for reads that cannot match any barcode (due to being too short or having too many
    /// no-called bases).
    #[must_use]
    pub fn assign(&self, read_bases: &[u8]) -> Option<BarcodeMatch> {
        if read_bases.len() != self.expected_barcode_length() {
            return None;
        }
        let num_no_calls = read_bases.iter().filter(|&&b| byte_is_nocall(b)).count();
        if num_no_calls > (self.max_mismatches as usize) + self.max_ns_in_barcodes {
            None
        } else {
            self.assign_internal(read_bases)
        }
    }
}

/// The outcome of scoring one read against the known barcodes.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreResult {
    /// Name of the barcode, or `unclassified`.
    pub barcode: String,
    /// Match quality in `[0, 1]`; 1 is a perfect match, 0 for unclassified reads.
    pub score: f32,
    /// Location of the matched barcode in the read, if one was found.
    pub trim: Option<Range<usize>>,
}

impl ScoreResult {
    #[must_use]
    pub fn unclassified() -> Self {
        Self { barcode: UNCLASSIFIED.to_owned(), score: 0.0, trim: None }
    }

    #[must_use]
    pub fn is_classified(&self) -> bool {
        self.barcode != UNCLASSIFIED
    }
}

/// Decides which barcode, if any, a sequence carries. Implementations must be safe to call
/// from many threads at once.
pub trait BarcodeScorer: Send + Sync + 'static {
    fn classify(&self, seq: &[u8]) -> ScoreResult;
}

/// Scores reads by counting mismatches between the read ends and each sample barcode.
///
/// The leading window is compared to the barcodes as given. With `both_ends` the trailing
/// window is also tried, reverse complemented, and the end with fewer mismatches wins.
pub struct MismatchBarcodeScorer {
    matcher: BarcodeMatcher,
    names: Vec<String>,
    both_ends: bool,
}

impl MismatchBarcodeScorer {
    #[must_use]
    pub fn new(samples: &SampleGroup, max_mismatches: u8, min_mismatch_delta: u8, both_ends: bool) -> Self {
        let barcodes: Vec<&str> = samples.samples.iter().map(|s| s.barcode.as_str()).collect();
        Self {
            matcher: BarcodeMatcher::new(&barcodes, max_mismatches, min_mismatch_delta),
            names: samples.samples.iter().map(|s| s.name.clone()).collect(),
            both_ends,
        }
    }

    fn to_result(&self, hit: BarcodeMatch, trim: Range<usize>) -> ScoreResult {
        let length = self.matcher.expected_barcode_length() as f32;
        ScoreResult {
            barcode: self.names[hit.best_match].clone(),
            score: 1.0 - f32::from(hit.best_mismatches) / length,
            trim: Some(trim),
        }
    }
}

impl BarcodeScorer for MismatchBarcodeScorer {
    fn classify(&self, seq: &[u8]) -> ScoreResult {
        let length = self.matcher.expected_barcode_length();
        if seq.len() < length {
            return ScoreResult::unclassified();
        }

        let front = self.matcher.assign(&seq[..length]).map(|hit| (hit, 0..length));
        let rear = if self.both_ends {
            let start = seq.len() - length;
            self.matcher
                .assign(&reverse_complement(&seq[start..]))
                .map(|hit| (hit, start..seq.len()))
        } else {
            None
        };

        let best = match (front, rear) {
            (Some(f), Some(r)) if r.0.best_mismatches < f.0.best_mismatches => Some(r),
            (Some(f), _) => Some(f),
            (None, r) => r,
        };
        best.map_or_else(ScoreResult::unclassified, |(hit, trim)| self.to_result(hit, trim))
    }
}
