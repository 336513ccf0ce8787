//! Subread tagging stage: regroups split reads and attaches the duplex reads built from them.

use crate::errors::{PipelineError, Result};
use crate::join_table::{SubreadAdmission, SubreadJoinTable};
use crate::messages::{Message, Read};
use crate::node::{NodeOutput, NodeProcessor};
use crate::stats::NamedStats;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reassembles split reads into groups, attaches the duplex reads built from them, and
/// forwards each group downstream once it is complete.
///
/// Unsplit simplex reads that take part in no candidate pairing skip the join entirely.
pub struct SubreadTagger {
    table: SubreadJoinTable,
    reads_emitted: AtomicU64,
    groups_completed: AtomicU64,
    rejections_received: AtomicU64,
}

impl Default for SubreadTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl SubreadTagger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: SubreadJoinTable::new(),
            reads_emitted: AtomicU64::new(0),
            groups_completed: AtomicU64::new(0),
            rejections_received: AtomicU64::new(0),
        }
    }

    /// The join state, for inspection.
    #[must_use]
    pub fn table(&self) -> &SubreadJoinTable {
        &self.table
    }

    fn emit(&self, reads: Vec<Read>, output: &NodeOutput<'_>) -> Result<()> {
        self.groups_completed.fetch_add(1, Ordering::Relaxed);
        for read in reads {
            output.send(read)?;
            self.reads_emitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl NodeProcessor for SubreadTagger {
    type Worker = ();

    fn name(&self) -> &str {
        "SubreadTaggerNode"
    }

    fn new_worker(&self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn process(&self, _worker: &mut (), message: Message, output: &NodeOutput<'_>) -> Result<()> {
        let check_completions = match message {
            Message::CandidatePairRejected(rejection) => {
                self.rejections_received.fetch_add(1, Ordering::Relaxed);
                self.table.add_rejection(rejection);
                true
            }
            Message::Read(read) if read.is_duplex => {
                self.table.add_duplex(read);
                true
            }
            Message::Read(read) if read.is_self_contained() => {
                output.send(read)?;
                self.reads_emitted.fetch_add(1, Ordering::Relaxed);
                false
            }
            Message::Read(read) => match self.table.add_subread(read)? {
                SubreadAdmission::Pending => false,
                SubreadAdmission::Emit(reads) => {
                    self.emit(reads, output)?;
                    false
                }
                SubreadAdmission::Full => true,
            },
            other @ (Message::ReadPair(_) | Message::BamRecord(_)) => {
                return Err(PipelineError::UnexpectedMessage {
                    stage: self.name().to_owned(),
                    kind: other.kind(),
                });
            }
        };

        if check_completions {
            for group in self.table.sweep() {
                self.emit(group, output)?;
            }
        }
        Ok(())
    }

    fn on_drained(&self) -> Result<()> {
        if self.table.is_empty() {
            return Ok(());
        }
        Err(PipelineError::UnresolvedGroups {
            stage: self.name().to_owned(),
            pending_groups: self.table.pending_groups(),
            full_groups: self.table.full_groups(),
            duplex_reads: self.table.unmatched_duplex_reads(),
            rejections: self.table.unmatched_rejections(),
        })
    }

    fn on_restart(&self) {
        let discarded = self.table.clear();
        if discarded > 0 {
            warn!("{} discarded {} read(s) left over from the previous run", self.name(), discarded);
        }
    }

    fn sample_stats(&self, stats: &mut NamedStats) {
        stats.insert("reads_emitted".to_owned(), self.reads_emitted.load(Ordering::Relaxed) as f64);
        stats.insert(
            "groups_completed".to_owned(),
            self.groups_completed.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "rejections_received".to_owned(),
            self.rejections_received.load(Ordering::Relaxed) as f64,
        );
        stats.insert("pending_groups".to_owned(), self.table.pending_groups() as f64);
        stats.insert("full_groups".to_owned(), self.table.full_groups() as f64);
        stats.insert(
            "unmatched_duplex_reads".to_owned(),
            self.table.unmatched_duplex_reads() as f64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::error_channel;
    use crate::messages::CandidatePairRejected;
    use crate::node::{MessageSink, PipelineNode};
    use crate::sink::CollectingSink;
    use ahash::{HashMap as AHashMap, HashMapExt};
    use std::sync::Arc;
    use std::thread;

    fn subread(read_id: &str, parent: &str, split_count: usize, candidates: usize) -> Read {
        Read {
            read_id: read_id.to_owned(),
            parent_read_id: parent.to_owned(),
            split_count,
            num_duplex_candidate_pairs: candidates,
            seq: b"ACGT".to_vec(),
            qual: b"IIII".to_vec(),
            ..Read::default()
        }
    }

    fn duplex(read_id: &str) -> Read {
        Read { read_id: read_id.to_owned(), is_duplex: true, split_count: 1, ..Read::default() }
    }

    fn tagger_node(
        pool_size: usize,
    ) -> (Arc<PipelineNode<SubreadTagger>>, Arc<CollectingSink>, crossbeam_channel::Receiver<PipelineError>)
    {
        let (reporter, errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node =
            PipelineNode::spawn(SubreadTagger::new(), Some(sink.clone()), 1000, pool_size, reporter)
                .unwrap();
        (node, sink, errors)
    }

    // ############################################################################################
    // Test pass-through of self-contained reads
    // ############################################################################################
    #[test]
    fn test_self_contained_read_is_forwarded_unchanged() {
        let (node, sink, errors) = tagger_node(2);
        let read = Read::simplex("r1", b"ACGT", b"IIII");
        node.push(Message::Read(read.clone())).unwrap();
        node.terminate();
        assert_eq!(sink.take_reads(), vec![read]);
        assert!(errors.try_recv().is_err());
    }

    // ############################################################################################
    // Test the documented end-to-end scenario
    // ############################################################################################
    #[test]
    fn test_split_read_with_one_duplex() {
        let (node, sink, errors) = tagger_node(1);
        node.push(subread("subread1", "parent", 2, 1).into()).unwrap();
        node.push(subread("subread2", "parent", 2, 0).into()).unwrap();
        assert_eq!(node.processor().table().full_groups(), 1);
        node.push(duplex("subread1;subread2-complement").into()).unwrap();
        node.terminate();

        let reads = sink.take_reads();
        let ids: Vec<&str> = reads.iter().map(|r| r.read_id.as_str()).collect();
        assert_eq!(ids, vec!["subread1", "subread2", "subread1;subread2-complement"]);
        assert!(reads.iter().all(|r| r.split_count == 3));
        assert_eq!(reads[2].subread_id, 2);
        assert!(errors.try_recv().is_err());
        assert_eq!(sink.terminations(), 1);
    }

    #[test]
    fn test_rejection_completes_group() {
        let (node, sink, errors) = tagger_node(1);
        node.push(subread("s1", "p", 1, 1).into()).unwrap();
        node.push(
            CandidatePairRejected {
                template_read_id: "s1".to_owned(),
                complement_read_id: "s7".to_owned(),
            }
            .into(),
        )
        .unwrap();
        node.terminate();
        let reads = sink.take_reads();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].split_count, 1);
        assert!(errors.try_recv().is_err());
        assert_eq!(node.sample_stats()["rejections_received"], 1.0);
    }

    // ############################################################################################
    // Test failure paths
    // ############################################################################################
    #[test]
    fn test_unresolved_group_is_reported_on_drain() {
        let (node, sink, errors) = tagger_node(2);
        node.push(subread("s1", "p", 1, 1).into()).unwrap();
        node.terminate();
        assert!(sink.is_empty());
        let err = errors.try_recv().unwrap();
        assert!(matches!(err, PipelineError::UnresolvedGroups { full_groups: 1, .. }));
        assert_eq!(sink.terminations(), 1);
    }

    #[test]
    fn test_read_pair_is_unexpected() {
        let (node, _sink, errors) = tagger_node(1);
        let pair = crate::messages::ReadPair {
            template: Read::simplex("t", b"A", b"I"),
            complement: Read::simplex("c", b"A", b"I"),
        };
        node.push(pair.into()).unwrap();
        node.terminate();
        assert!(matches!(errors.try_recv().unwrap(), PipelineError::UnexpectedMessage { .. }));
    }

    #[test]
    fn test_restart_clears_leftovers() {
        let (node, sink, errors) = tagger_node(1);
        node.push(subread("s1", "p", 2, 0).into()).unwrap();
        node.terminate();
        assert!(errors.try_recv().is_ok());

        sink.restart().unwrap();
        node.restart().unwrap();
        node.push(subread("s1", "p", 2, 0).into()).unwrap();
        node.push(subread("s2", "p", 2, 0).into()).unwrap();
        node.terminate();
        assert_eq!(sink.len(), 2);
        assert!(errors.try_recv().is_err());
    }

    // ############################################################################################
    // Concurrency stress: interleaved producers over many independent groups
    // ############################################################################################
    #[test]
    fn test_many_producers_emit_every_read_exactly_once() {
        const GROUPS: usize = 200;
        const PRODUCERS: usize = 4;
        let (node, sink, errors) = tagger_node(6);

        // Group g has split_count (g % 3) + 1 subreads; the first subread is the template of
        // (g % 4) candidate pairs, of which even-numbered ones are accepted.
        let mut inputs: Vec<Message> = Vec::new();
        let mut expected_sizes: AHashMap<String, usize> = AHashMap::new();
        for g in 0..GROUPS {
            let parent = format!("parent{g}");
            let split_count = (g % 3) + 1;
            let candidates = g % 4;
            let mut accepted = 0;
            for s in 0..split_count {
                let c = if s == 0 { candidates } else { 0 };
                inputs.push(subread(&format!("{parent}-s{s}"), &parent, split_count, c).into());
            }
            for c in 0..candidates {
                if c % 2 == 0 {
                    accepted += 1;
                    inputs.push(duplex(&format!("{parent}-s0;{parent}-comp{c}")).into());
                } else {
                    inputs.push(
                        CandidatePairRejected {
                            template_read_id: format!("{parent}-s0"),
                            complement_read_id: format!("{parent}-comp{c}"),
                        }
                        .into(),
                    );
                }
            }
            expected_sizes.insert(parent, split_count + accepted);
        }
        let total_reads: usize = expected_sizes.values().sum();

        // Deal the inputs round-robin so each group's messages are spread over producers.
        let mut per_producer: Vec<Vec<Message>> = vec![Vec::new(); PRODUCERS];
        for (i, message) in inputs.into_iter().enumerate() {
            per_producer[i % PRODUCERS].push(message);
        }
        let handles = per_producer
            .into_iter()
            .rev()
            .map(|messages| {
                let node = Arc::clone(&node);
                thread::spawn(move || {
                    for message in messages {
                        node.push(message).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        node.terminate();

        assert!(errors.try_recv().is_err());
        let reads = sink.take_reads();
        assert_eq!(reads.len(), total_reads);

        let mut seen = ahash::HashSet::default();
        let mut per_parent: AHashMap<String, usize> = AHashMap::new();
        for read in &reads {
            assert!(seen.insert(read.read_id.clone()), "{} emitted twice", read.read_id);
            let parent = read.read_id.split('-').next().unwrap().to_owned();
            *per_parent.entry(parent).or_default() += 1;
        }
        for (parent, size) in &expected_sizes {
            assert_eq!(per_parent[parent], *size, "group {parent} has the wrong size");
        }
        for read in &reads {
            let parent = read.read_id.split('-').next().unwrap();
            let size = expected_sizes[parent];
            let candidates = parent.trim_start_matches("parent").parse::<usize>().unwrap() % 4;
            if candidates > 0 {
                assert_eq!(read.split_count, size);
            }
            assert!(read.split_count <= size);
        }
        assert!(node.processor().table().is_empty());
    }
}
