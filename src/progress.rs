//! The leader's view of how far each follower has replicated its log.

use super::log::LogIndex;
use super::NodeId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Not sure where the follower's log ends; one append in flight at a time, walking `next_index` back on rejection
    Probe,
    /// The follower is known to match; appends are pipelined and `next_index` advanced optimistically
    Replicate,
    /// The follower needs entries that were compacted and is being sent a snapshot at `pending`
    Snapshot { pending: LogIndex },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// index of the next log entry to send to that server
    pub next_index: LogIndex,
    /// index of highest log entry known to be replicated on server
    pub match_index: LogIndex,
    pub state: ProgressState,
    paused: bool,
    /// leader tick of the last response from this follower
    pub last_contact: u64,
    /// leader tick at which the current snapshot was sent
    snapshot_sent: u64,
}

impl Progress {
    pub fn new(next_index: LogIndex) -> Self {
        Progress {
            next_index,
            match_index: 0,
            state: ProgressState::Probe,
            paused: false,
            last_contact: 0,
            snapshot_sent: 0,
        }
    }

    /// # Panics
    /// In case the match index tries to decrease
    pub fn set_match_index(&mut self, match_index: LogIndex) {
        assert!(
            match_index >= self.match_index,
            "Match index must increase monotonically, tried to decrease from {} to {}",
            self.match_index,
            match_index
        );
        self.match_index = match_index;
    }

    /// A follower has acknowledged entries up to `n`.
    /// If successful: update nextIndex and matchIndex for follower (§5.3)
    /// Returns false for an acknowledgement that tells us nothing new.
    pub fn maybe_update(&mut self, n: LogIndex) -> bool {
        self.paused = false;
        if n <= self.match_index {
            return false;
        }
        self.set_match_index(n);
        if self.next_index <= n {
            self.next_index = n + 1;
        }
        true
    }

    /// Entries up to `last` have been sent on the assumption that they will be accepted
    pub fn optimistic_update(&mut self, last: LogIndex) {
        self.next_index = last + 1;
    }

    /// If AppendEntries fails because of log inconsistency: decrement nextIndex and retry (§5.3)
    ///
    /// `rejected` is the prevLogIndex the follower could not match; `hint` is where the leader
    /// believes the logs last agree, derived from the follower's conflict hint. Rejections for
    /// anything other than the outstanding probe are stale and ignored.
    pub fn maybe_decrement(&mut self, rejected: LogIndex, hint: LogIndex) -> bool {
        match self.state {
            ProgressState::Replicate => {
                if rejected <= self.match_index {
                    return false;
                }
                self.next_index = self.match_index + 1;
                true
            }
            ProgressState::Probe | ProgressState::Snapshot { .. } => {
                if self.next_index == 0 || self.next_index - 1 != rejected {
                    return false;
                }
                let target = core::cmp::min(rejected, hint);
                self.next_index = core::cmp::max(target, self.match_index + 1);
                self.paused = false;
                true
            }
        }
    }

    pub fn become_probe(&mut self) {
        if let ProgressState::Snapshot { pending } = self.state {
            // resume after the snapshot if it got through, otherwise after what we know matches
            self.next_index = core::cmp::max(self.match_index, pending) + 1;
        } else {
            self.next_index = self.match_index + 1;
        }
        self.state = ProgressState::Probe;
        self.paused = false;
    }

    pub fn become_replicate(&mut self) {
        self.next_index = self.match_index + 1;
        self.state = ProgressState::Replicate;
        self.paused = false;
    }

    pub fn become_snapshot(&mut self, pending: LogIndex, now: u64) {
        self.state = ProgressState::Snapshot { pending };
        self.snapshot_sent = now;
    }

    /// A snapshot that went unanswered for `timeout` ticks is assumed lost
    pub fn snapshot_timed_out(&self, now: u64, timeout: u64) -> bool {
        matches!(self.state, ProgressState::Snapshot { .. }) && now.saturating_sub(self.snapshot_sent) >= timeout
    }

    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => false,
            ProgressState::Snapshot { .. } => true,
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }
}

/// Volatile state on leaders: (Reinitialized after election)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProgressTracker {
    progress: BTreeMap<NodeId, Progress>,
}

impl ProgressTracker {
    /// for each server, nextIndex is initialized to leader last log index + 1, matchIndex to 0.
    /// The leader itself starts out matching its whole log.
    pub fn new(own_id: NodeId, ids: impl IntoIterator<Item = NodeId>, last_log_index: LogIndex) -> Self {
        let mut progress: BTreeMap<NodeId, Progress> = ids
            .into_iter()
            .map(|id| (id, Progress::new(last_log_index + 1)))
            .collect();
        let own = progress
            .entry(own_id)
            .or_insert_with(|| Progress::new(last_log_index + 1));
        own.set_match_index(last_log_index);
        own.state = ProgressState::Replicate;
        ProgressTracker { progress }
    }

    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    pub fn insert(&mut self, id: NodeId, next_index: LogIndex) {
        self.progress
            .entry(id)
            .or_insert_with(|| Progress::new(next_index));
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Progress> {
        self.progress.remove(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.progress.keys().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut Progress)> {
        self.progress.iter_mut()
    }

    /// Which index in the log is matched by a majority of the voters.
    /// Voters without progress count as having nothing.
    pub fn majority_match(&self, voters: impl IntoIterator<Item = NodeId>) -> LogIndex {
        let mut idxs: Vec<LogIndex> = voters
            .into_iter()
            .map(|id| self.progress.get(&id).map_or(0, |p| p.match_index))
            .collect();
        if idxs.is_empty() {
            return 0;
        }
        idxs.sort_unstable();
        let majority_idx = (idxs.len() + 1) / 2 - 1;
        idxs[majority_idx]
    }

    /// Nodes heard from within the last `window` ticks, plus `own_id`
    pub fn active(&self, own_id: NodeId, now: u64, window: u64) -> BTreeSet<NodeId> {
        self.progress
            .iter()
            .filter(|(id, p)| **id == own_id || now.saturating_sub(p.last_contact) <= window)
            .map(|(&id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod test_progress {
    use super::*;

    #[test]
    fn initial() {
        let tracker = ProgressTracker::new(1, vec![1, 2, 3], 4);
        assert_eq!(tracker.get(2).unwrap().next_index, 5);
        assert_eq!(tracker.get(2).unwrap().match_index, 0);
        assert_eq!(tracker.get(1).unwrap().match_index, 4);
        assert_eq!(tracker.ids().count(), 3);
    }

    #[test]
    fn match_index_increases() {
        let mut progress = Progress::new(5);
        progress.set_match_index(7);
        assert_eq!(progress.match_index, 7);
    }

    #[test]
    #[should_panic]
    fn match_index_increases_monotonically() {
        let mut progress = Progress::new(5);
        progress.set_match_index(2);
        progress.set_match_index(1);
    }

    #[test]
    fn majority_match() {
        fn mm(v: Vec<LogIndex>) -> LogIndex {
            let mut tracker = ProgressTracker::default();
            let ids: Vec<NodeId> = (1..=v.len() as NodeId).collect();
            for (&id, &m) in ids.iter().zip(v.iter()) {
                tracker.insert(id, 1);
                tracker.get_mut(id).unwrap().set_match_index(m);
            }
            tracker.majority_match(ids)
        }
        assert_eq!(mm(vec![3, 3, 3]), 3);
        assert_eq!(mm(vec![1, 2, 3]), 2);
        assert_eq!(mm(vec![3, 2, 1]), 2);
        assert_eq!(mm(vec![1, 1, 3]), 1);
        assert_eq!(mm(vec![1, 3, 3]), 3);
        assert_eq!(mm(vec![1, 2, 3, 4]), 2);
        assert_eq!(mm(vec![5]), 5);
    }

    #[test]
    fn missing_voters_count_as_nothing() {
        let tracker = ProgressTracker::new(1, vec![1], 9);
        assert_eq!(tracker.majority_match(vec![1]), 9);
        assert_eq!(tracker.majority_match(vec![1, 2, 3]), 0);
    }

    #[test]
    fn probe_waits_for_response() {
        let mut progress = Progress::new(5);
        assert!(!progress.is_paused());
        progress.pause();
        assert!(progress.is_paused());
        assert!(progress.maybe_update(5));
        assert!(!progress.is_paused());
        assert_eq!(progress.next_index, 6);
    }

    #[test]
    fn stale_acknowledgement() {
        let mut progress = Progress::new(5);
        progress.maybe_update(4);
        assert!(!progress.maybe_update(3));
        assert_eq!(progress.match_index, 4);
    }

    #[test]
    fn probe_rejection_uses_hint() {
        let mut progress = Progress::new(10);
        // rejection of prevLogIndex 9, follower hints it lacks everything past 3
        assert!(progress.maybe_decrement(9, 4));
        assert_eq!(progress.next_index, 4);
        // a late rejection of the old probe is ignored
        assert!(!progress.maybe_decrement(9, 2));
        assert_eq!(progress.next_index, 4);
    }

    #[test]
    fn rejection_never_goes_below_match() {
        let mut progress = Progress::new(10);
        progress.maybe_update(6);
        progress.next_index = 10;
        assert!(progress.maybe_decrement(9, 1));
        assert_eq!(progress.next_index, 7);
    }

    #[test]
    fn replicate_rejection_falls_back_to_match() {
        let mut progress = Progress::new(5);
        progress.maybe_update(4);
        progress.become_replicate();
        progress.optimistic_update(12);
        assert_eq!(progress.next_index, 13);
        assert!(!progress.maybe_decrement(3, 1));
        assert!(progress.maybe_decrement(8, 1));
        assert_eq!(progress.next_index, 5);
    }

    #[test]
    fn snapshot_state() {
        let mut progress = Progress::new(2);
        progress.become_snapshot(40, 7);
        assert!(progress.is_paused());
        assert!(!progress.snapshot_timed_out(10, 10));
        assert!(progress.snapshot_timed_out(17, 10));
        progress.maybe_update(40);
        progress.become_probe();
        assert_eq!(progress.next_index, 41);
        assert!(!progress.is_paused());
    }

    #[test]
    fn active_set() {
        let mut tracker = ProgressTracker::new(1, vec![1, 2, 3], 0);
        tracker.get_mut(2).unwrap().last_contact = 95;
        tracker.get_mut(3).unwrap().last_contact = 20;
        let active = tracker.active(1, 100, 10);
        assert!(active.contains(&1));
        assert!(active.contains(&2));
        assert!(!active.contains(&3));
    }
}
