use super::log::LogIndex;
use super::progress::ProgressTracker;
use super::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persistent state on all servers: (Updated on stable storage before responding to RPCs)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// latest term server has seen (initialized to 0 on first boot, increases monotonically)
    pub term: Term,
    /// candidateId that received vote in current term (or null if none)
    pub voted_for: Option<NodeId>,
    /// index of highest log entry known to be committed
    pub commit: LogIndex,
}

impl HardState {
    /// # Panics
    /// In case the term tries to decrease
    pub fn set_term(&mut self, term: Term) {
        assert!(
            term >= self.term,
            "Current term must increase monotonically, tried to decrease from {} to {}",
            self.term,
            term
        );
        if term > self.term {
            self.voted_for = None;
        }
        self.term = term;
    }

    /// # Panics
    /// In case the commit index tries to decrease
    pub fn set_commit(&mut self, commit: LogIndex) {
        assert!(
            commit >= self.commit,
            "Commit index must increase monotonically, tried to decrease from {} to {}",
            self.commit,
            commit
        );
        self.commit = commit;
    }
}

/// Votes collected by a candidate in its current term
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Candidate {
    votes: BTreeMap<NodeId, bool>,
}

impl Candidate {
    /// Record a vote, the first response from each node counts
    pub fn record(&mut self, from: NodeId, granted: bool) {
        self.votes.entry(from).or_insert(granted);
    }

    pub fn granted(&self) -> impl Iterator<Item = &NodeId> {
        self.votes.iter().filter(|(_, g)| **g).map(|(id, _)| id)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &NodeId> {
        self.votes.iter().filter(|(_, g)| !**g).map(|(id, _)| id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leader {
    pub progress: ProgressTracker,
    /// ticks since becoming leader, the clock for follower activity
    pub ticks: u64,
    /// the node leadership is being handed to, if any
    pub transferee: Option<NodeId>,
}

impl Leader {
    pub fn new(progress: ProgressTracker) -> Self {
        Leader {
            progress,
            ticks: 0,
            transferee: None,
        }
    }
}

/// Server states. Followers only respond to requests from other servers. If a follower receives no communication,
/// it becomes a candidate and initiates an election. A candidate that receives votes from a majority of the full
/// cluster becomes the new leader. Leaders typically operate until they fail.
#[derive(Debug, Clone, PartialEq)]
pub enum States {
    Follower,
    Candidate(Candidate),
    Leader(Leader),
}

impl Default for States {
    fn default() -> Self {
        Self::Follower
    }
}

impl States {
    pub fn role(&self) -> StateRole {
        match self {
            States::Follower => StateRole::Follower,
            States::Candidate(_) => StateRole::Candidate,
            States::Leader(_) => StateRole::Leader,
        }
    }
}

/// The role alone, without its volatile state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateRole {
    Follower,
    Candidate,
    Leader,
}

#[cfg(test)]
mod test_hard_state {
    use super::*;

    #[test]
    fn default() {
        let hard_state = HardState::default();
        assert_eq!(hard_state.term, 0);
        assert_eq!(hard_state.voted_for, None);
        assert_eq!(hard_state.commit, 0);
    }

    #[test]
    fn current_term_increases() {
        let mut hard_state = HardState::default();
        hard_state.set_term(2);
        assert_eq!(hard_state.term, 2);
    }

    #[test]
    #[should_panic]
    fn current_term_increases_monotonically() {
        let mut hard_state = HardState::default();
        hard_state.set_term(2);
        hard_state.set_term(1);
    }

    #[test]
    fn new_term_clears_vote() {
        let mut hard_state = HardState {
            term: 1,
            voted_for: Some(3),
            commit: 0,
        };
        hard_state.set_term(1);
        assert_eq!(hard_state.voted_for, Some(3));
        hard_state.set_term(2);
        assert_eq!(hard_state.voted_for, None);
    }

    #[test]
    #[should_panic]
    fn commit_index_increases_monotonically() {
        let mut hard_state = HardState::default();
        hard_state.set_commit(2);
        hard_state.set_commit(1);
    }
}
