//! Durable storage for the consensus core.
//!
//! The core writes through a [`Storage`] before any message that depends on the write leaves the node,
//! so a node that restarts from storage never contradicts something it already told its peers.

use super::error::StorageError;
use super::log::{Entry, LogIndex};
use super::snapshot::Snapshot;
use super::state::HardState;
use log::warn;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a node needs to come back after a crash
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PersistedState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// retained entries, ascending and gapless; may start before the snapshot
    pub entries: Vec<Entry>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.hard_state == HardState::default() && self.snapshot.is_none() && self.entries.is_empty()
    }
}

pub trait Storage {
    fn initial_state(&self) -> Result<PersistedState, StorageError>;

    /// Replace the hard state atomically
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<(), StorageError>;

    /// Append entries, replacing any stored entries at or after the first one
    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Drop every entry at or after `from`
    fn truncate(&mut self, from: LogIndex) -> Result<(), StorageError>;

    /// Drop every entry up to and including `upto`
    fn compact(&mut self, upto: LogIndex) -> Result<(), StorageError>;

    /// Replace the stored snapshot atomically. Entries are left alone.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    fn snapshot(&self) -> Result<Option<Snapshot>, StorageError>;
}

/// Where the next appended entry must go given what is stored
fn next_index(entries: &[Entry], snapshot: Option<&Snapshot>) -> LogIndex {
    match entries.last() {
        Some(last) => last.index + 1,
        None => snapshot.map_or(1, |s| s.index() + 1),
    }
}

/// Merge `new` into `stored`, replacing any overlap
fn splice(stored: &mut Vec<Entry>, new: &[Entry], snapshot: Option<&Snapshot>) -> Result<(), StorageError> {
    let first = match new.first() {
        Some(e) => e.index,
        None => return Ok(()),
    };
    stored.retain(|e| e.index < first);
    let expected = next_index(stored, snapshot);
    if first > expected {
        return Err(StorageError::Gap {
            index: first,
            last: expected - 1,
        });
    }
    stored.extend_from_slice(new);
    Ok(())
}

#[derive(Debug, Default)]
struct MemInner {
    state: PersistedState,
    failing: bool,
}

/// In-memory storage for tests and simulations.
///
/// Clones share the same underlying state, so a node can be "restarted" from the storage
/// a previous instance wrote to.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a full or broken disk would
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    fn write<T>(&self, f: impl FnOnce(&mut PersistedState) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let mut inner = self.inner.lock();
        if inner.failing {
            return Err(StorageError::Failed("storage is failing writes".into()));
        }
        f(&mut inner.state)
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> Result<PersistedState, StorageError> {
        Ok(self.inner.lock().state.clone())
    }

    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<(), StorageError> {
        self.write(|state| {
            state.hard_state = *hard_state;
            Ok(())
        })
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        self.write(|state| splice(&mut state.entries, entries, state.snapshot.as_ref()))
    }

    fn truncate(&mut self, from: LogIndex) -> Result<(), StorageError> {
        self.write(|state| {
            state.entries.retain(|e| e.index < from);
            Ok(())
        })
    }

    fn compact(&mut self, upto: LogIndex) -> Result<(), StorageError> {
        self.write(|state| {
            state.entries.retain(|e| e.index > upto);
            Ok(())
        })
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.write(|state| {
            state.snapshot = Some(snapshot.clone());
            Ok(())
        })
    }

    fn snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.inner.lock().state.snapshot.clone())
    }
}

// -- file storage implementation --

/// File-based storage.
///
/// Stores state in a directory with:
/// - hardstate.json: term, vote and commit index
/// - snapshot.json: the latest snapshot
/// - log.jsonl: one entry per line, appended to and synced on every write
///
/// The hard state and snapshot are replaced by writing a temporary file and renaming it over the old one.
/// A torn last line in the log is treated as never written.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    /// index the next appended entry must have
    next_index: LogIndex,
}

impl FileStorage {
    /// Open (or create) storage in the given directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = FileStorage { dir, next_index: 1 };
        let (entries, torn) = storage.read_log_records()?;
        if torn {
            // drop the partial record so later appends start on a fresh line
            storage.rewrite_log(&entries)?;
        }
        let snapshot = storage.snapshot()?;
        storage.next_index = next_index(&entries, snapshot.as_ref());
        Ok(storage)
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join("hardstate.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// atomic write: write to temp file then rename
    fn replace(&self, path: PathBuf, contents: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn read_log(&self) -> Result<Vec<Entry>, StorageError> {
        Ok(self.read_log_records()?.0)
    }

    /// The stored entries, and whether the last record was torn
    fn read_log_records(&self) -> Result<(Vec<Entry>, bool), StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok((Vec::new(), false));
        }
        let reader = BufReader::new(File::open(&path)?);
        let lines = reader.lines().collect::<Result<Vec<String>, _>>()?;
        let mut entries = Vec::with_capacity(lines.len());
        let mut torn = false;
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i == last => {
                    warn!("discarding torn log record at end of {:?}: {}", path, e);
                    torn = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((entries, torn))
    }

    fn rewrite_log(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let mut contents = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut contents, entry)?;
            contents.push(b'\n');
        }
        self.replace(self.log_path(), &contents)
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<PersistedState, StorageError> {
        let path = self.hard_state_path();
        let hard_state = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            HardState::default()
        };
        Ok(PersistedState {
            hard_state,
            snapshot: self.snapshot()?,
            entries: self.read_log()?,
        })
    }

    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<(), StorageError> {
        let json = serde_json::to_vec(hard_state)?;
        self.replace(self.hard_state_path(), &json)
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        let first = match entries.first() {
            Some(e) => e.index,
            None => return Ok(()),
        };
        if first > self.next_index {
            return Err(StorageError::Gap {
                index: first,
                last: self.next_index - 1,
            });
        }
        if first < self.next_index {
            // overwriting a conflicting tail, rewrite the whole segment
            let mut stored = self.read_log()?;
            let snapshot = self.snapshot()?;
            splice(&mut stored, entries, snapshot.as_ref())?;
            self.rewrite_log(&stored)?;
        } else {
            let mut contents = Vec::new();
            for entry in entries {
                serde_json::to_writer(&mut contents, entry)?;
                contents.push(b'\n');
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path())?;
            file.write_all(&contents)?;
            file.sync_data()?;
        }
        self.next_index = entries[entries.len() - 1].index + 1;
        Ok(())
    }

    fn truncate(&mut self, from: LogIndex) -> Result<(), StorageError> {
        let mut stored = self.read_log()?;
        stored.retain(|e| e.index < from);
        self.rewrite_log(&stored)?;
        let snapshot = self.snapshot()?;
        self.next_index = next_index(&stored, snapshot.as_ref());
        Ok(())
    }

    fn compact(&mut self, upto: LogIndex) -> Result<(), StorageError> {
        let mut stored = self.read_log()?;
        stored.retain(|e| e.index > upto);
        self.rewrite_log(&stored)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let json = serde_json::to_vec(snapshot)?;
        self.replace(self.snapshot_path(), &json)?;
        let stored = self.read_log()?;
        self.next_index = next_index(&stored, Some(snapshot));
        Ok(())
    }

    fn snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(&path)?)?))
    }
}
