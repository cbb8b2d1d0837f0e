//! Raft servers communicate using remote procedure calls (RPCs). RequestVote RPCs are initiated by candidates
//! during elections (§5.2), and AppendEntries RPCs are initiated by leaders to replicate log entries and to provide a
//! form of heartbeat (§5.3). InstallSnapshot transfers snapshots to followers that are too far behind (§7), and
//! TimeoutNow hands leadership to a chosen follower. Delivery may drop, delay, duplicate or reorder any of them.

use super::log::{Entry, LogIndex};
use super::membership::Member;
use super::snapshot::Snapshot;
use super::{NodeId, Term};
use serde::{Deserialize, Serialize};

/// Every RPC carries the sender's term
pub trait RpcMessage {
    fn term(&self) -> Term;
}

/// Invoked by leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// leader’s term
    pub term: Term,
    /// so follower can redirect clients
    pub leader_id: NodeId,
    /// index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// term of prevLogIndex entry
    pub prev_log_term: Term,
    /// log entries to store (empty for heartbeat; may send more than one for efficiency)
    pub entries: Vec<Entry>,
    /// leader’s commitIndex
    pub leader_commit: LogIndex,
}

/// Where a rejecting follower's log stops agreeing with the leader's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    /// term of the follower's entry at prevLogIndex, none if it has no entry there
    pub term: Option<Term>,
    /// first index of `term` in the follower's log, or its last index + 1 if `term` is none
    pub index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// currentTerm, for leader to update itself
    pub term: Term,
    /// true if follower contained entry matching prevLogIndex and prevLogTerm
    pub success: bool,
    /// on success the last index known to match the leader, otherwise the prevLogIndex that was rejected
    pub match_index: LogIndex,
    pub conflict: Option<ConflictHint>,
}

/// Invoked by candidates to gather votes (§5.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// candidate’s term
    pub term: Term,
    /// candidate requesting vote
    pub candidate_id: NodeId,
    /// index of candidate’s last log entry (§5.4)
    pub last_log_index: LogIndex,
    /// term of candidate’s last log entry (§5.4)
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// currentTerm, for candidate to update itself
    pub term: Term,
    /// true means candidate received vote
    pub vote_granted: bool,
}

/// Invoked by the leader to send a snapshot to a follower whose next entries were compacted away (§7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// the last index the follower now holds, at least the snapshot index
    pub match_index: LogIndex,
}

/// Sent by a leader to a caught-up follower to make it start an election immediately
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: Term,
    pub leader_id: NodeId,
}

/// The answer to any message from a node that has been removed from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedNotice {
    pub term: Term,
}

macro_rules! rpc_term {
    ($($t:ty),*) => {
        $(impl RpcMessage for $t {
            fn term(&self) -> Term {
                self.term
            }
        })*
    };
}

rpc_term!(
    AppendEntriesRequest,
    AppendEntriesResponse,
    RequestVoteRequest,
    RequestVoteResponse,
    InstallSnapshotRequest,
    InstallSnapshotResponse,
    TimeoutNow,
    RemovedNotice
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rpc {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    TimeoutNow(TimeoutNow),
    Removed(RemovedNotice),
}

impl RpcMessage for Rpc {
    fn term(&self) -> Term {
        match self {
            Rpc::AppendEntries(m) => m.term(),
            Rpc::AppendEntriesResponse(m) => m.term(),
            Rpc::RequestVote(m) => m.term(),
            Rpc::RequestVoteResponse(m) => m.term(),
            Rpc::InstallSnapshot(m) => m.term(),
            Rpc::InstallSnapshotResponse(m) => m.term(),
            Rpc::TimeoutNow(m) => m.term(),
            Rpc::Removed(m) => m.term(),
        }
    }
}

impl Rpc {
    /// Only a leader sends these; receiving one at the current term identifies the leader
    pub fn from_leader(&self) -> bool {
        matches!(
            self,
            Rpc::AppendEntries(_) | Rpc::InstallSnapshot(_) | Rpc::TimeoutNow(_)
        )
    }
}

/// An addressed RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    pub rpc: Rpc,
}

impl Message {
    pub fn term(&self) -> Term {
        self.rpc.term()
    }
}

/// Asks the leader to add a node as a voter. Forwarded to the leader by any member that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: NodeId,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// the leader that committed the join
    pub leader: NodeId,
    pub members: Vec<Member>,
}

/// Asks the leader to remove a node. Forwarded to the leader by any member that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: NodeId,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn term_of_each_rpc() {
        let rpcs = vec![
            Rpc::RequestVote(RequestVoteRequest {
                term: 3,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            }),
            Rpc::TimeoutNow(TimeoutNow {
                term: 3,
                leader_id: 1,
            }),
            Rpc::AppendEntriesResponse(AppendEntriesResponse {
                term: 3,
                success: true,
                match_index: 1,
                conflict: None,
            }),
            Rpc::Removed(RemovedNotice { term: 3 }),
        ];
        for rpc in &rpcs {
            assert_eq!(rpc.term(), 3);
        }
        // a removal notice does not identify a leader
        assert!(!rpcs[3].from_leader());
    }

    #[test]
    fn messages_survive_the_wire() {
        let msg = Message {
            from: 1,
            to: 2,
            rpc: Rpc::AppendEntries(AppendEntriesRequest {
                term: 2,
                leader_id: 1,
                prev_log_index: 4,
                prev_log_term: 1,
                entries: vec![Entry::command(5, 2, b"x".to_vec())],
                leader_commit: 4,
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<Message>(&json).unwrap(), msg);
    }
}
