//! Log compaction. Once enough entries have been applied the application state is captured,
//! together with the membership at that point, and the log prefix it covers can be discarded.

use super::log::LogIndex;
use super::membership::Membership;
use super::Term;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// the snapshot replaces all entries up through and including this index
    pub index: LogIndex,
    /// term of `index`
    pub term: Term,
    /// the membership as of `index`
    pub membership: Membership,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    /// opaque application state
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(index: LogIndex, term: Term, membership: Membership, data: Vec<u8>) -> Self {
        Snapshot {
            meta: SnapshotMeta {
                index,
                term,
                membership,
            },
            data,
        }
    }

    pub fn index(&self) -> LogIndex {
        self.meta.index
    }

    pub fn term(&self) -> Term {
        self.meta.term
    }
}

/// When to snapshot and how much log to keep behind a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// applied entries since the last snapshot before taking a new one, 0 never snapshots
    pub interval: u64,
    /// entries kept before the snapshot index so that slightly lagging followers can catch up without a snapshot
    pub keep_entries: u64,
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, applied: LogIndex, last_snapshot: LogIndex) -> bool {
        self.interval > 0 && applied.saturating_sub(last_snapshot) >= self.interval
    }

    /// The log may be compacted up to and including this index once a snapshot at `snapshot_index` is durable
    pub fn compact_to(&self, snapshot_index: LogIndex) -> LogIndex {
        snapshot_index.saturating_sub(self.keep_entries)
    }
}
