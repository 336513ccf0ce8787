//! Delimited manifests describing the messages fed into a pipeline run.
//!
//! Each row is one message. `simplex` rows describe a read, `pair` rows propose the simplex
//! reads `read_id` (template) and `complement_read_id` for duplex encoding, and `rejected`
//! rows record that such a pairing was evaluated and turned down. Pair rows may only refer to
//! reads listed above them.

use crate::errors::{PipelineError, Result};
use crate::messages::{CandidatePairRejected, Message, Read, ReadPair};
use ahash::{HashMap as AHashMap, HashMapExt};
use fgoxide::io::DelimFile;
use serde::Deserialize;
use std::path::Path;

/// The kind of message a manifest row describes.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Simplex,
    Pair,
    Rejected,
}

/// One row of a manifest. Columns not used by a row's kind may be left empty.
#[derive(Clone, Debug, Deserialize)]
pub struct ManifestRow {
    pub kind: ManifestKind,
    pub read_id: String,
    #[serde(default)]
    pub parent_read_id: String,
    #[serde(default)]
    pub split_count: Option<usize>,
    #[serde(default)]
    pub num_duplex_candidate_pairs: Option<usize>,
    #[serde(default)]
    pub channel: Option<u32>,
    #[serde(default)]
    pub bases: String,
    #[serde(default)]
    pub quals: String,
    #[serde(default)]
    pub complement_read_id: String,
}

impl ManifestRow {
    fn to_read(&self, row: usize) -> Result<Read> {
        let invalid = |reason: String| PipelineError::InvalidManifest { row, reason };
        if self.read_id.is_empty() {
            return Err(invalid("read_id is empty".to_owned()));
        }
        if self.bases.len() != self.quals.len() {
            return Err(invalid(format!(
                "{} has {} bases but {} qualities",
                self.read_id,
                self.bases.len(),
                self.quals.len()
            )));
        }
        let split_count = self.split_count.unwrap_or(1);
        if split_count == 0 {
            return Err(invalid(format!("{} has a split_count of zero", self.read_id)));
        }
        Ok(Read {
            read_id: self.read_id.clone(),
            parent_read_id: self.parent_read_id.clone(),
            split_count,
            num_duplex_candidate_pairs: self.num_duplex_candidate_pairs.unwrap_or(0),
            channel: self.channel.unwrap_or(0),
            seq: self.bases.as_bytes().to_vec(),
            qual: self.quals.as_bytes().to_vec(),
            ..Read::default()
        })
    }
}

/// Turns manifest rows into messages, in row order.
///
/// # Errors
/// - Returns [`PipelineError::InvalidManifest`] for malformed rows, repeated simplex ids and
///   pairs that refer to reads not listed above them.
pub fn messages_from_rows(rows: Vec<ManifestRow>) -> Result<Vec<Message>> {
    let mut simplex: AHashMap<String, Read> = AHashMap::new();
    let mut messages = Vec::with_capacity(rows.len());

    for (idx, row) in rows.into_iter().enumerate() {
        let number = idx + 1;
        let lookup = |reads: &AHashMap<String, Read>, id: &str| {
            reads.get(id).cloned().ok_or_else(|| PipelineError::InvalidManifest {
                row: number,
                reason: format!("pair refers to unknown read '{id}'"),
            })
        };
        let message = match row.kind {
            ManifestKind::Simplex => {
                let read = row.to_read(number)?;
                if simplex.insert(read.read_id.clone(), read.clone()).is_some() {
                    return Err(PipelineError::InvalidManifest {
                        row: number,
                        reason: format!("read '{}' is listed twice", read.read_id),
                    });
                }
                Message::Read(read)
            }
            ManifestKind::Pair => Message::ReadPair(ReadPair {
                template: lookup(&simplex, &row.read_id)?,
                complement: lookup(&simplex, &row.complement_read_id)?,
            }),
            ManifestKind::Rejected => Message::CandidatePairRejected(CandidatePairRejected {
                template_read_id: row.read_id,
                complement_read_id: row.complement_read_id,
            }),
        };
        messages.push(message);
    }
    Ok(messages)
}

/// Reads a manifest delimited by `delimiter`, with a header row naming the columns.
///
/// # Errors
/// - Returns an error if the file cannot be read or any row is invalid.
pub fn load_manifest<P: AsRef<Path>>(path: &P, delimiter: u8) -> Result<Vec<Message>> {
    let rows: Vec<ManifestRow> = DelimFile::default().read(path, delimiter, false)?;
    messages_from_rows(rows)
}
