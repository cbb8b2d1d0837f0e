//! The set of nodes taking part in consensus.
//!
//! The table is only ever changed by applying a committed [`ConfigChange`]; proposing a change
//! validates it against the table but does not touch it.

use super::error::{Error, Result};
use super::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Counted for quorum and may become leader
    Voter,
    /// Receives the log but takes no part in elections or commitment
    NonVoter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    /// Where to reach the member. May change across restarts, the id does not.
    pub addr: String,
    pub role: Role,
}

impl Member {
    pub fn voter(id: NodeId, addr: impl Into<String>) -> Self {
        Member {
            id,
            addr: addr.into(),
            role: Role::Voter,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.role == Role::Voter
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddVoter { id: NodeId, addr: String },
    AddNonVoter { id: NodeId, addr: String },
    RemoveNode { id: NodeId },
}

impl ConfigChange {
    /// The node the change is about
    pub fn target(&self) -> NodeId {
        match self {
            ConfigChange::AddVoter { id, .. }
            | ConfigChange::AddNonVoter { id, .. }
            | ConfigChange::RemoveNode { id } => *id,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    members: BTreeMap<NodeId, Member>,
    /// Ids that have been removed may never come back
    removed: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: impl IntoIterator<Item = Member>, removed: impl IntoIterator<Item = NodeId>) -> Self {
        Membership {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
            removed: removed.into_iter().collect(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn get(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members.get(&id).map_or(false, Member::is_voter)
    }

    pub fn is_removed(&self, id: NodeId) -> bool {
        self.removed.contains(&id)
    }

    pub fn removed(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.removed.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .values()
            .filter(|m| m.is_voter())
            .map(|m| m.id)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// More than half of the voting members
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Do the given nodes include a majority of the voters
    pub fn is_quorum<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let count = ids.into_iter().filter(|id| self.is_voter(**id)).count();
        self.voter_count() > 0 && count >= self.quorum()
    }

    /// Check that a change makes sense against the current table
    pub fn validate(&self, change: &ConfigChange) -> Result<()> {
        let id = change.target();
        if self.is_removed(id) {
            return Err(Error::MemberRemoved(id));
        }
        match change {
            ConfigChange::AddVoter { .. } => {
                if self.is_voter(id) {
                    return Err(Error::MemberExists(id));
                }
            }
            ConfigChange::AddNonVoter { .. } => {
                if self.contains(id) {
                    return Err(Error::MemberExists(id));
                }
            }
            ConfigChange::RemoveNode { .. } => {
                if !self.contains(id) {
                    return Err(Error::NotMember(id));
                }
            }
        }
        Ok(())
    }

    /// Would the remaining voters still form a quorum among the nodes in `active` once `id` is gone
    pub fn can_remove(&self, id: NodeId, active: &BTreeSet<NodeId>) -> bool {
        if !self.is_voter(id) {
            return true;
        }
        let remaining: Vec<NodeId> = self.voters().filter(|&v| v != id).collect();
        if remaining.is_empty() {
            return false;
        }
        let reachable = remaining.iter().filter(|v| active.contains(v)).count();
        reachable >= remaining.len() / 2 + 1
    }

    /// Apply a committed change. Adding a voter that is currently a non-voter promotes it.
    pub fn apply(&mut self, change: &ConfigChange) {
        match change {
            ConfigChange::AddVoter { id, addr } => {
                self.members.insert(*id, Member::voter(*id, addr.clone()));
            }
            ConfigChange::AddNonVoter { id, addr } => {
                self.members.insert(
                    *id,
                    Member {
                        id: *id,
                        addr: addr.clone(),
                        role: Role::NonVoter,
                    },
                );
            }
            ConfigChange::RemoveNode { id } => {
                self.members.remove(id);
                self.removed.insert(*id);
            }
        }
    }
}
