use super::error::StorageError;
use super::log::LogIndex;

/// The application store fed by committed entries.
///
/// `apply` is called exactly once per committed command, in increasing index order.
/// Configuration changes and blank entries are handled by the core and never reach it.
pub trait StateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]);

    /// Serialise the whole state for a snapshot
    fn snapshot(&self) -> Result<Vec<u8>, StorageError>;

    /// Replace the whole state with a snapshot previously produced by `snapshot`
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), StorageError>;
}

/// Keeps every applied command in order
impl StateMachine for Vec<Vec<u8>> {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) {
        self.push(command.to_vec());
    }

    fn snapshot(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        *self = serde_json::from_slice(snapshot)?;
        Ok(())
    }
}
