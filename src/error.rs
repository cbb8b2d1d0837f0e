use super::{NodeId, Term};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcomes a caller of the consensus core can observe.
///
/// `NotLeader`, `ProposalDropped`, `ConfigChangeInFlight` and the membership
/// validation errors mean the operation was definitely not applied.
/// `ClusterUnavailable` means the outcome is uncertain: the entry may still commit.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not the leader (leader is {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("no majority acknowledged the proposal in time")]
    ClusterUnavailable,

    #[error("proposal was dropped")]
    ProposalDropped,

    #[error("stale term {received}, current term is {current}")]
    StaleTerm { current: Term, received: Term },

    #[error("a configuration change is already in flight")]
    ConfigChangeInFlight,

    #[error("no leader is reachable")]
    QuorumLost,

    #[error("node {0} is already a member")]
    MemberExists(NodeId),

    #[error("node {0} is not a member")]
    NotMember(NodeId),

    #[error("node {0} was removed from the cluster")]
    MemberRemoved(NodeId),

    #[error("removing node {0} would leave too few reachable voters for a quorum")]
    CannotRemoveMember(NodeId),

    #[error("node {caller} may not remove node {target}")]
    Unauthorized { caller: NodeId, target: NodeId },

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("node is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Fatal errors mean local state can no longer be trusted to be durable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// True if the operation may still take effect despite the error.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, Error::ClusterUnavailable)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("log index {index} is not contiguous with last index {last}")]
    Gap { index: u64, last: u64 },

    #[error("{0}")]
    Failed(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::NotLeader { leader } => Error::NotLeader { leader: *leader },
            Error::ClusterUnavailable => Error::ClusterUnavailable,
            Error::ProposalDropped => Error::ProposalDropped,
            Error::StaleTerm { current, received } => Error::StaleTerm {
                current: *current,
                received: *received,
            },
            Error::ConfigChangeInFlight => Error::ConfigChangeInFlight,
            Error::QuorumLost => Error::QuorumLost,
            Error::MemberExists(id) => Error::MemberExists(*id),
            Error::NotMember(id) => Error::NotMember(*id),
            Error::MemberRemoved(id) => Error::MemberRemoved(*id),
            Error::CannotRemoveMember(id) => Error::CannotRemoveMember(*id),
            Error::Unauthorized { caller, target } => Error::Unauthorized {
                caller: *caller,
                target: *target,
            },
            Error::Unreachable(addr) => Error::Unreachable(addr.clone()),
            // io errors are not Clone; keep the message
            Error::Storage(e) => Error::Storage(StorageError::Failed(e.to_string())),
            Error::Shutdown => Error::Shutdown,
            Error::Config(msg) => Error::Config(msg.clone()),
        }
    }
}
