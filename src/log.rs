use super::membership::ConfigChange;
use super::Term;
use core::cmp::Ordering;
use core::ops::Index;
use serde::{Deserialize, Serialize};

pub type LogIndex = u64;

/// What an entry carries. Command payloads are opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Appended by a new leader so that entries of earlier terms commit through it
    Blank,
    Command(Vec<u8>),
    ConfigChange(ConfigChange),
}

/// Each log entry stores a state machine command along with the term number when the entry was received by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: Payload,
}

impl Entry {
    pub fn new(index: LogIndex, term: Term, payload: Payload) -> Self {
        Entry {
            index,
            term,
            payload,
        }
    }

    pub fn command(index: LogIndex, term: Term, data: impl Into<Vec<u8>>) -> Self {
        Entry::new(index, term, Payload::Command(data.into()))
    }

    pub fn is_config_change(&self) -> bool {
        matches!(self.payload, Payload::ConfigChange(_))
    }
}

/// The in-memory view of the replicated log.
///
/// Entries up to and including `snapshot_index` have been compacted into a snapshot; only
/// the term of that last compacted entry is remembered so that consistency checks against
/// it still work. Indexes are 1-based and gapless, index 0 is the empty log.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Log {
    snapshot_index: LogIndex,
    snapshot_term: Term,
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// If the entries are not contiguous from `snapshot_index + 1`
    pub fn from_parts(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<Entry>) -> Self {
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(
                entry.index,
                snapshot_index + 1 + i as LogIndex,
                "log entries must be contiguous"
            );
        }
        Log {
            snapshot_index,
            snapshot_term,
            entries,
        }
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn offset(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index() {
            None
        } else {
            Some((index - self.snapshot_index - 1) as usize)
        }
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        self.offset(index).map(|i| &self.entries[i])
    }

    /// The term of the entry at `index`, `None` if the entry is compacted or not yet present
    pub fn term(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Does the log contain an entry at `index` whose term matches `term`
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term(index) == Some(term)
    }

    /// Raft determines which of two logs is more up-to-date by comparing the index and term of the last entries in the
    /// logs. If the logs have last entries with different terms, then the log with the later term is more up-to-date.
    /// If the logs end with the same term, then whichever log is longer is more up-to-date. (§5.4.1)
    ///
    /// Returns how this log compares to another log ending at (`last_index`, `last_term`).
    pub fn compare_last(&self, last_index: LogIndex, last_term: Term) -> Ordering {
        (self.last_term(), self.last_index()).cmp(&(last_term, last_index))
    }

    /// Append a new entry in `term` at the end of the log, returning its index
    pub fn append(&mut self, term: Term, payload: Payload) -> LogIndex {
        assert!(
            term >= self.last_term(),
            "Appended term must not go backwards, tried {} after {}",
            term,
            self.last_term()
        );
        let index = self.last_index() + 1;
        self.entries.push(Entry::new(index, term, payload));
        index
    }

    /// Entries starting at `from`, at most `max` of them.
    /// `None` if some of the requested entries have been compacted away.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Option<Vec<Entry>> {
        if from <= self.snapshot_index {
            return None;
        }
        match self.offset(from) {
            Some(start) => {
                let end = core::cmp::min(self.entries.len(), start.saturating_add(max));
                Some(self.entries[start..end].to_vec())
            }
            None => Some(vec![]),
        }
    }

    /// Entries in the closed range `from..=to` that are still in the log
    pub fn slice(&self, from: LogIndex, to: LogIndex) -> &[Entry] {
        let from = core::cmp::max(from, self.first_index());
        let to = core::cmp::min(to, self.last_index());
        if from > to {
            return &[];
        }
        let start = (from - self.first_index()) as usize;
        let end = (to - self.first_index()) as usize + 1;
        &self.entries[start..end]
    }

    /// 3.  If an existing entry conflicts with a new one (same index but different terms), delete the existing entry and all that follow it (§5.3)
    /// 4.  Append any new entries not already in the log
    ///
    /// Returns the first index that was rewritten, or `None` if the log already contained every entry.
    pub fn truncate_if_different_and_append(&mut self, entries: Vec<Entry>) -> Option<LogIndex> {
        let mut changed_from = None;
        for entry in entries {
            if entry.index <= self.snapshot_index {
                // compacted entries are committed and therefore identical
                continue;
            }
            match self.term(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate(entry.index);
                }
                None => {}
            }
            assert_eq!(
                entry.index,
                self.last_index() + 1,
                "appended entries must follow the log"
            );
            changed_from.get_or_insert(entry.index);
            self.entries.push(entry);
        }
        changed_from
    }

    /// Remove the entry at `index` and all that follow it
    ///
    /// # Panics
    /// If the entry has already been compacted
    pub fn truncate(&mut self, index: LogIndex) {
        assert!(
            index > self.snapshot_index,
            "Cannot truncate compacted entry {} (snapshot at {})",
            index,
            self.snapshot_index
        );
        if let Some(offset) = self.offset(index) {
            self.entries.truncate(offset);
        }
    }

    /// The first index of the run of entries with the same term as the entry at `index`.
    /// Used by a follower to let the leader skip a whole conflicting term at once.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> LogIndex {
        let term = match self.term(index) {
            Some(term) => term,
            None => return index,
        };
        let mut first = index;
        while first > self.first_index() && self.term(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// The last index holding an entry of `term`, if any entry of that term is still in the log
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .skip_while(|e| e.term > term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Drop every entry up to and including `index`, remembering its term.
    ///
    /// # Panics
    /// If `index` is beyond the end of the log
    pub fn compact(&mut self, index: LogIndex) {
        if index <= self.snapshot_index {
            return;
        }
        let term = self
            .term(index)
            .unwrap_or_else(|| panic!("Cannot compact to {} beyond last index {}", index, self.last_index()));
        let drain = (index - self.snapshot_index) as usize;
        self.entries.drain(..drain);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Discard the whole log and restart it after a snapshot
    pub fn restore(&mut self, snapshot_index: LogIndex, snapshot_term: Term) {
        self.entries.clear();
        self.snapshot_index = snapshot_index;
        self.snapshot_term = snapshot_term;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

impl Index<LogIndex> for Log {
    type Output = Entry;

    fn index(&self, index: LogIndex) -> &Entry {
        self.get(index)
            .unwrap_or_else(|| panic!("No entry at index {}", index))
    }
}

#[cfg(test)]
pub(crate) fn log_of(terms: &[Term]) -> Log {
    let entries = terms
        .iter()
        .enumerate()
        .map(|(i, &term)| Entry::command(i as LogIndex + 1, term, vec![term as u8]))
        .collect();
    Log::from_parts(0, 0, entries)
}
