//! Shared state for reassembling split reads and pairing them with their duplex reads.
//!
//! Subreads of one parent read arrive out of order from many threads, as do the duplex reads
//! built from them and the rejections of candidate pairings that never became duplex reads.
//! A parent's subreads are collected in a pending group until all `split_count` of them have
//! arrived. The group is then either emitted straight away (nobody is going to pair with it)
//! or parked as a full group until every candidate pairing whose template is one of its
//! members has been resolved, by a duplex read or by a rejection.
//!
//! Two locks guard the table. The pending map has its own lock with short critical sections;
//! the duplex pool, rejection pool and full groups share a second lock because a completion
//! sweep must scan them together. When both are needed the pending lock is taken first.

use crate::errors::{PipelineError, Result};
use crate::messages::{CandidatePairRejected, Read};
use ahash::{HashMap as AHashMap, HashMapExt, HashSet as AHashSet};
use log::warn;
use parking_lot::Mutex;

/// What happened to a simplex subread added to the table.
#[derive(Debug, PartialEq)]
pub enum SubreadAdmission {
    /// The group is still missing subreads.
    Pending,
    /// The group became full and expects no duplex reads: emit these reads.
    Emit(Vec<Read>),
    /// The group became full and now waits for its candidate pairs to resolve.
    Full,
}

/// A group holding all its subreads, waiting for candidate pairings to resolve.
struct FullGroup {
    reads: Vec<Read>,
    member_ids: AHashSet<String>,
    expected_duplex: usize,
    duplex_matched: usize,
    rejections_matched: usize,
}

impl FullGroup {
    fn new(reads: Vec<Read>, expected_duplex: usize) -> Self {
        let member_ids = reads.iter().map(|r| r.read_id.clone()).collect();
        Self { reads, member_ids, expected_duplex, duplex_matched: 0, rejections_matched: 0 }
    }

    fn resolved(&self) -> usize {
        self.duplex_matched + self.rejections_matched
    }
}

#[derive(Default)]
struct DuplexState {
    pool: Vec<Read>,
    rejections: Vec<CandidatePairRejected>,
    full_groups: AHashMap<String, FullGroup>,
}

/// The concurrent join state owned by the subread tagger.
pub struct SubreadJoinTable {
    pending: Mutex<AHashMap<String, Vec<Read>>>,
    duplex: Mutex<DuplexState>,
}

impl Default for SubreadJoinTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubreadJoinTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(AHashMap::new()),
            duplex: Mutex::new(DuplexState {
                pool: Vec::new(),
                rejections: Vec::new(),
                full_groups: AHashMap::new(),
            }),
        }
    }

    /// Adds a simplex subread to the group of its parent.
    ///
    /// # Errors
    /// - [`PipelineError::DuplicateSubread`] if a read with the same id is already pending for
    ///   the parent.
    /// - [`PipelineError::LateSubread`] if the parent's group is already full.
    pub fn add_subread(&self, read: Read) -> Result<SubreadAdmission> {
        let key = read.group_key().to_owned();
        let split_count = read.split_count;

        let mut pending = self.pending.lock();
        if let Some(group) = pending.get(&key) {
            if group.iter().any(|r| r.read_id == read.read_id) {
                return Err(PipelineError::DuplicateSubread {
                    parent_read_id: key,
                    read_id: read.read_id,
                });
            }
        } else if self.duplex.lock().full_groups.contains_key(&key) {
            return Err(PipelineError::LateSubread { parent_read_id: key, read_id: read.read_id });
        }

        let group = pending.entry(key.clone()).or_default();
        group.push(read);
        if group.len() < split_count {
            return Ok(SubreadAdmission::Pending);
        }

        let reads = pending.remove(&key).unwrap_or_default();
        let expected_duplex: usize = reads.iter().map(|r| r.num_duplex_candidate_pairs).sum();
        if expected_duplex == 0 {
            return Ok(SubreadAdmission::Emit(reads));
        }

        self.duplex.lock().full_groups.insert(key, FullGroup::new(reads, expected_duplex));
        Ok(SubreadAdmission::Full)
    }

    /// Adds a duplex read to the pool of reads awaiting their group.
    pub fn add_duplex(&self, read: Read) {
        self.duplex.lock().pool.push(read);
    }

    /// Adds a rejected candidate pairing to the pool awaiting its group.
    pub fn add_rejection(&self, rejection: CandidatePairRejected) {
        self.duplex.lock().rejections.push(rejection);
    }

    /// Matches pooled duplex reads and rejections against the full groups and removes every
    /// group whose candidate pairings are all resolved.
    ///
    /// Each completed group is returned with its simplex members in arrival order followed by
    /// its duplex reads in the order they were matched. Duplex reads get their position in
    /// the group as `subread_id`, and every member's `split_count` is set to the final group
    /// size.
    pub fn sweep(&self) -> Vec<Vec<Read>> {
        let mut state = self.duplex.lock();
        let DuplexState { pool, rejections, full_groups } = &mut *state;

        let mut completed_keys = Vec::new();
        for (key, group) in full_groups.iter_mut() {
            let mut idx = 0;
            while idx < pool.len() {
                if group.member_ids.contains(pool[idx].template_read_id()) {
                    let mut duplex = pool.remove(idx);
                    duplex.subread_id = group.reads.len();
                    group.reads.push(duplex);
                    group.duplex_matched += 1;
                } else {
                    idx += 1;
                }
            }

            let before = rejections.len();
            rejections.retain(|r| !group.member_ids.contains(&r.template_read_id));
            group.rejections_matched += before - rejections.len();

            if group.resolved() >= group.expected_duplex {
                if group.resolved() > group.expected_duplex {
                    warn!(
                        "Parent read {} resolved {} candidate pair(s) but expected {}",
                        key,
                        group.resolved(),
                        group.expected_duplex
                    );
                }
                completed_keys.push(key.clone());
            }
        }

        completed_keys
            .into_iter()
            .filter_map(|key| full_groups.remove(&key))
            .map(|group| {
                let mut reads = group.reads;
                let size = reads.len();
                for read in &mut reads {
                    read.split_count = size;
                }
                reads
            })
            .collect()
    }

    /// Number of groups still waiting for subreads.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of full groups waiting for duplex reads.
    #[must_use]
    pub fn full_groups(&self) -> usize {
        self.duplex.lock().full_groups.len()
    }

    /// Number of duplex reads not yet matched to a group.
    #[must_use]
    pub fn unmatched_duplex_reads(&self) -> usize {
        self.duplex.lock().pool.len()
    }

    /// Number of rejections not yet matched to a group.
    #[must_use]
    pub fn unmatched_rejections(&self) -> usize {
        self.duplex.lock().rejections.len()
    }

    /// True if the table holds no reads or rejections at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let pending = self.pending.lock();
        let state = self.duplex.lock();
        pending.is_empty()
            && state.pool.is_empty()
            && state.rejections.is_empty()
            && state.full_groups.is_empty()
    }

    /// Drops everything held and returns the number of reads discarded.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let mut state = self.duplex.lock();
        let discarded = pending.values().map(Vec::len).sum::<usize>()
            + state.pool.len()
            + state.full_groups.values().map(|g| g.reads.len()).sum::<usize>();
        pending.clear();
        *state = DuplexState::default();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subread(read_id: &str, parent: &str, split_count: usize, candidates: usize) -> Read {
        Read {
            read_id: read_id.to_owned(),
            parent_read_id: parent.to_owned(),
            split_count,
            num_duplex_candidate_pairs: candidates,
            ..Read::default()
        }
    }

    fn duplex(read_id: &str) -> Read {
        Read { read_id: read_id.to_owned(), is_duplex: true, split_count: 1, ..Read::default() }
    }

    fn rejection(template: &str) -> CandidatePairRejected {
        CandidatePairRejected {
            template_read_id: template.to_owned(),
            complement_read_id: "other".to_owned(),
        }
    }

    fn ids(reads: &[Read]) -> Vec<&str> {
        reads.iter().map(|r| r.read_id.as_str()).collect()
    }

    // ############################################################################################
    // Test grouping without duplex reads
    // ############################################################################################
    #[test]
    fn test_group_without_candidates_is_emitted_when_full() {
        let table = SubreadJoinTable::new();
        assert_eq!(table.add_subread(subread("s2", "p", 3, 0)).unwrap(), SubreadAdmission::Pending);
        assert_eq!(table.add_subread(subread("s0", "p", 3, 0)).unwrap(), SubreadAdmission::Pending);
        assert_eq!(table.pending_groups(), 1);
        match table.add_subread(subread("s1", "p", 3, 0)).unwrap() {
            SubreadAdmission::Emit(reads) => {
                assert_eq!(ids(&reads), vec!["s2", "s0", "s1"]);
                assert!(reads.iter().all(|r| r.split_count == 3));
            }
            other => panic!("Expected the group to be emitted, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsplit_read_with_candidates_groups_under_its_own_id() {
        let table = SubreadJoinTable::new();
        let read = subread("r1", "", 1, 1);
        assert_eq!(table.add_subread(read).unwrap(), SubreadAdmission::Full);
        assert_eq!(table.full_groups(), 1);
        table.add_duplex(duplex("r1;r9"));
        let groups = table.sweep();
        assert_eq!(groups.len(), 1);
        assert_eq!(ids(&groups[0]), vec!["r1", "r1;r9"]);
    }

    // ############################################################################################
    // Test duplex matching
    // ############################################################################################
    #[test]
    fn test_group_waits_for_all_expected_duplex_reads() {
        let table = SubreadJoinTable::new();
        table.add_subread(subread("a", "p", 2, 1)).unwrap();
        assert_eq!(table.add_subread(subread("b", "p", 2, 1)).unwrap(), SubreadAdmission::Full);

        table.add_duplex(duplex("a;x"));
        assert!(table.sweep().is_empty());
        assert_eq!(table.unmatched_duplex_reads(), 0);

        table.add_duplex(duplex("b;y"));
        let groups = table.sweep();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(ids(group), vec!["a", "b", "a;x", "b;y"]);
        assert!(group.iter().all(|r| r.split_count == 4));
        assert_eq!(group[2].subread_id, 2);
        assert_eq!(group[3].subread_id, 3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplex_arriving_before_group_is_full_is_held() {
        let table = SubreadJoinTable::new();
        table.add_duplex(duplex("a;c"));
        assert!(table.sweep().is_empty());
        assert_eq!(table.unmatched_duplex_reads(), 1);
        table.add_subread(subread("a", "p", 2, 1)).unwrap();
        table.add_subread(subread("b", "p", 2, 0)).unwrap();
        let groups = table.sweep();
        assert_eq!(ids(&groups[0]), vec!["a", "b", "a;c"]);
    }

    #[test]
    fn test_duplex_only_matches_on_prefix_before_first_separator() {
        let table = SubreadJoinTable::new();
        table.add_subread(subread("a", "p1", 1, 1)).unwrap();
        table.add_subread(subread("b;c", "p2", 1, 1)).unwrap();
        table.add_subread(subread("c", "p3", 1, 1)).unwrap();

        // Only the group holding "b" could claim this one; nobody does.
        table.add_duplex(duplex("b;c;a"));
        assert!(table.sweep().is_empty());
        assert_eq!(table.unmatched_duplex_reads(), 1);

        table.add_duplex(duplex("c;b;a"));
        let groups = table.sweep();
        assert_eq!(groups.len(), 1);
        assert_eq!(ids(&groups[0]), vec!["c", "c;b;a"]);
        assert_eq!(table.full_groups(), 2);
    }

    // ############################################################################################
    // Test rejections
    // ############################################################################################
    #[test]
    fn test_rejection_resolves_a_candidate_without_adding_a_read() {
        let table = SubreadJoinTable::new();
        table.add_subread(subread("a", "p", 2, 2)).unwrap();
        table.add_subread(subread("b", "p", 2, 0)).unwrap();
        table.add_duplex(duplex("a;z"));
        assert!(table.sweep().is_empty());
        table.add_rejection(rejection("a"));
        let groups = table.sweep();
        assert_eq!(ids(&groups[0]), vec!["a", "b", "a;z"]);
        assert!(groups[0].iter().all(|r| r.split_count == 3));
        assert_eq!(table.unmatched_rejections(), 0);
    }

    #[test]
    fn test_rejection_for_unknown_template_waits() {
        let table = SubreadJoinTable::new();
        table.add_rejection(rejection("nobody"));
        assert!(table.sweep().is_empty());
        assert_eq!(table.unmatched_rejections(), 1);
        assert!(!table.is_empty());
    }

    // ############################################################################################
    // Test duplicate and late subreads
    // ############################################################################################
    #[test]
    fn test_duplicate_subread_is_rejected() {
        let table = SubreadJoinTable::new();
        table.add_subread(subread("a", "p", 3, 0)).unwrap();
        let err = table.add_subread(subread("a", "p", 3, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateSubread { .. }));
        assert_eq!(table.pending_groups(), 1);
    }

    #[test]
    fn test_late_subread_for_full_group_is_rejected() {
        let table = SubreadJoinTable::new();
        table.add_subread(subread("a", "p", 1, 1)).unwrap();
        let err = table.add_subread(subread("b", "p", 1, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::LateSubread { ref parent_read_id, .. } if parent_read_id == "p"));
        assert_eq!(table.pending_groups(), 0);
    }

    #[test]
    fn test_clear_discards_everything() {
        let table = SubreadJoinTable::new();
        table.add_subread(subread("a", "p", 2, 0)).unwrap();
        table.add_subread(subread("x", "q", 1, 1)).unwrap();
        table.add_duplex(duplex("zz;yy"));
        assert_eq!(table.clear(), 3);
        assert!(table.is_empty());
    }
}
