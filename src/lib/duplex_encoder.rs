//! Duplex encoding stage: turns accepted candidate pairs into duplex reads carrying a block
//! of stereo features.

use crate::errors::{PipelineError, Result};
use crate::messages::{DUPLEX_ID_SEPARATOR, FeatureBlock, Message, Read, ReadPair};
use crate::node::{NodeOutput, NodeProcessor};
use crate::reverse_complement;
use crate::stats::NamedStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Checks that `read` has bases and one quality per base.
fn check_read(stage: &str, read: &Read) -> Result<()> {
    if read.seq.is_empty() {
        return Err(PipelineError::collaborator(stage, &read.read_id, "read has no bases"));
    }
    if read.seq.len() != read.qual.len() {
        return Err(PipelineError::collaborator(
            stage,
            &read.read_id,
            format!("{} bases but {} qualities", read.seq.len(), read.qual.len()),
        ));
    }
    Ok(())
}

/// Produces the feature block for a template/complement pair. Must be deterministic.
pub trait FeatureEncoder: Send + Sync + 'static {
    /// # Errors
    /// - Returns [`PipelineError::Collaborator`] if the pair cannot be encoded.
    fn encode(&self, template: &Read, complement: &Read) -> Result<FeatureBlock>;
}

/// Encodes the template against the reverse complemented complement, position by position
/// over their overlapping length.
///
/// Rows:
/// - 0..4: template base one-hot, `ACGT` order
/// - 4..8: complement base one-hot
/// - 8: 1 where the two strands agree
/// - 9, 10: template and complement qualities scaled `(q - 33) / 90`
#[derive(Copy, Clone, Debug, Default)]
pub struct StereoFeatureEncoder;

impl StereoFeatureEncoder {
    pub const NUM_FEATURES: usize = 11;
    const TEMPLATE_FIRST_NUCLEOTIDE: usize = 0;
    const COMPLEMENT_FIRST_NUCLEOTIDE: usize = 4;
    const AGREEMENT: usize = 8;
    const TEMPLATE_QSCORE: usize = 9;
    const COMPLEMENT_QSCORE: usize = 10;

    fn nucleotide_offset(base: u8) -> Option<usize> {
        match base.to_ascii_uppercase() {
            b'A' => Some(0),
            b'C' => Some(1),
            b'G' => Some(2),
            b'T' => Some(3),
            _ => None,
        }
    }

    fn scale_qscore(q: u8) -> f32 {
        f32::from(q.saturating_sub(33)) / 90.0
    }

}

impl FeatureEncoder for StereoFeatureEncoder {
    fn encode(&self, template: &Read, complement: &Read) -> Result<FeatureBlock> {
        let stage = "StereoDuplexEncoderNode";
        check_read(stage, template)?;
        check_read(stage, complement)?;
        if template.channel != complement.channel {
            return Err(PipelineError::collaborator(
                stage,
                &template.read_id,
                format!(
                    "complement {} is on channel {}, template on {}",
                    complement.read_id, complement.channel, template.channel
                ),
            ));
        }

        let complement_seq = reverse_complement(&complement.seq);
        let complement_qual: Vec<u8> = complement.qual.iter().rev().copied().collect();
        let columns = template.seq.len().min(complement_seq.len());
        let mut block = FeatureBlock::filled(Self::NUM_FEATURES, columns, 0.0);

        for i in 0..columns {
            let (t, c) = (template.seq[i], complement_seq[i]);
            if let Some(offset) = Self::nucleotide_offset(t) {
                block.row_mut(Self::TEMPLATE_FIRST_NUCLEOTIDE + offset)[i] = 1.0;
            }
            if let Some(offset) = Self::nucleotide_offset(c) {
                block.row_mut(Self::COMPLEMENT_FIRST_NUCLEOTIDE + offset)[i] = 1.0;
            }
            if t.eq_ignore_ascii_case(&c) {
                block.row_mut(Self::AGREEMENT)[i] = 1.0;
            }
            block.row_mut(Self::TEMPLATE_QSCORE)[i] = Self::scale_qscore(template.qual[i]);
            block.row_mut(Self::COMPLEMENT_QSCORE)[i] = Self::scale_qscore(complement_qual[i]);
        }
        Ok(block)
    }
}

/// Processor for the duplex encoder node.
pub struct DuplexEncoder<E: FeatureEncoder> {
    encoder: E,
    encoded_pairs: AtomicU64,
}

impl<E: FeatureEncoder> DuplexEncoder<E> {
    #[must_use]
    pub fn new(encoder: E) -> Self {
        Self { encoder, encoded_pairs: AtomicU64::new(0) }
    }

    /// Builds the duplex read for `pair`. Bases come from the template; where the strands
    /// agree the better quality is kept, elsewhere the worse. The read spans the overlap of
    /// the two strands whatever the shape of the feature block.
    fn duplex_read(&self, pair: &ReadPair) -> Result<Read> {
        let template = &pair.template;
        check_read(self.name(), template)?;
        check_read(self.name(), &pair.complement)?;
        let features = self.encoder.encode(template, &pair.complement)?;
        let complement_seq = reverse_complement(&pair.complement.seq);
        let complement_qual: Vec<u8> = pair.complement.qual.iter().rev().copied().collect();
        let length = template.seq.len().min(complement_seq.len());

        let qual = (0..length)
            .map(|i| {
                let (tq, cq) = (template.qual[i], complement_qual[i]);
                if template.seq[i].eq_ignore_ascii_case(&complement_seq[i]) {
                    tq.max(cq)
                } else {
                    tq.min(cq)
                }
            })
            .collect();

        Ok(Read {
            read_id: format!("{}{}{}", template.read_id, DUPLEX_ID_SEPARATOR, pair.complement.read_id),
            parent_read_id: template.parent_read_id.clone(),
            split_count: 1,
            is_duplex: true,
            channel: template.channel,
            seq: template.seq[..length].to_vec(),
            qual,
            barcode: template.barcode.clone(),
            features: Some(features),
            ..Read::default()
        })
    }
}

impl<E: FeatureEncoder> NodeProcessor for DuplexEncoder<E> {
    type Worker = ();

    fn name(&self) -> &str {
        "StereoDuplexEncoderNode"
    }

    fn new_worker(&self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn process(&self, _worker: &mut (), message: Message, output: &NodeOutput<'_>) -> Result<()> {
        match message {
            Message::ReadPair(pair) => {
                let duplex = self.duplex_read(&pair)?;
                self.encoded_pairs.fetch_add(1, Ordering::Relaxed);
                output.send(duplex)
            }
            other => output.send(other),
        }
    }

    fn sample_stats(&self, stats: &mut NamedStats) {
        stats.insert("encoded_pairs".to_owned(), self.encoded_pairs.load(Ordering::Relaxed) as f64);
    }
}
