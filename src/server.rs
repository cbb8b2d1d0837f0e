//! The deterministic consensus core.
//!
//! A [`Server`] never sends anything or reads a clock. Time arrives through [`Server::tick`], peers'
//! messages through [`Server::step`], and everything the server wants to say is queued until the
//! caller takes it with [`Server::take_messages`]. Before any of those calls return, every record a
//! queued message depends on has been written to the [`Storage`].

use super::config::Config;
use super::error::{Error, Result};
use super::log::{Log, LogIndex, Payload};
use super::membership::{ConfigChange, Member, Membership};
use super::progress::{ProgressState, ProgressTracker};
use super::rpc::*;
use super::snapshot::Snapshot;
use super::state::{Candidate, HardState, Leader, StateRole, States};
use super::state_machine::StateMachine;
use super::storage::{PersistedState, Storage};
use super::{NodeId, Term};
use core::cmp::Ordering;
use log::{debug, error, info, trace, warn};
use random_number::rand::rngs::StdRng;
use random_number::rand::{Rng, SeedableRng};

/// An entry that has been applied, reported so that waiting proposers can tell whether it was theirs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
}

/// A point-in-time view of a server for operational tooling
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub id: NodeId,
    pub role: StateRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit: LogIndex,
    pub applied: LogIndex,
    pub last_index: LogIndex,
    pub members: Vec<Member>,
}

pub struct Server<M, S> {
    id: NodeId,
    config: Config,
    state: States,
    hard_state: HardState,
    /// the hard state last written to storage
    persisted: HardState,
    log: Log,
    membership: Membership,
    /// index of highest log entry applied to state machine
    last_applied: LogIndex,
    leader_id: Option<NodeId>,
    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_election_timeout: u32,
    /// index of the latest configuration change a leader has appended
    pending_config_index: LogIndex,
    last_snapshot_index: LogIndex,
    storage: S,
    state_machine: M,
    rng: StdRng,
    msgs: Vec<Message>,
    applied: Vec<Applied>,
    failed: Option<Error>,
}

impl<M: StateMachine, S: Storage> Server<M, S> {
    fn new(config: Config, storage: S, state_machine: M) -> Result<Self> {
        config.validate()?;
        // spread the ids so that no seed/id pairing collapses several nodes onto one jitter sequence
        let seed = config
            .seed
            .unwrap_or_else(random_number::rand::random::<u64>)
            .wrapping_add(config.id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut server = Server {
            id: config.id,
            config,
            state: States::Follower,
            hard_state: HardState::default(),
            persisted: HardState::default(),
            log: Log::new(),
            membership: Membership::new(),
            last_applied: 0,
            leader_id: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            pending_config_index: 0,
            last_snapshot_index: 0,
            storage,
            state_machine,
            rng: StdRng::seed_from_u64(seed),
            msgs: vec![],
            applied: vec![],
            failed: None,
        };
        server.reset_election_timer();
        Ok(server)
    }

    fn new_empty(config: Config, storage: S, state_machine: M) -> Result<Self> {
        if !storage.initial_state()?.is_empty() {
            return Err(Error::Config(format!(
                "storage for node {} already holds state, restart it instead",
                config.id
            )));
        }
        Self::new(config, storage, state_machine)
    }

    /// Start a new cluster with this node as its only voter. The node elects itself on its first election timeout.
    pub fn init(config: Config, addr: impl Into<String>, storage: S, state_machine: M) -> Result<Self> {
        let mut server = Self::new_empty(config, storage, state_machine)?;
        let change = ConfigChange::AddVoter {
            id: server.id,
            addr: addr.into(),
        };
        server.hard_state.set_term(1);
        server.hard_state.voted_for = Some(server.id);
        let index = server.log.append(1, Payload::ConfigChange(change));
        server.storage.append(server.log.slice(index, index))?;
        server.hard_state.set_commit(index);
        server.apply_committed()?;
        server.persist_hard_state()?;
        info!("{}; initialised a new cluster", server.id);
        Ok(server)
    }

    /// Start a node that has no state yet and waits for a leader to replicate the cluster's log to it
    pub fn join(config: Config, storage: S, state_machine: M) -> Result<Self> {
        let server = Self::new_empty(config, storage, state_machine)?;
        info!("{}; waiting to join a cluster", server.id);
        Ok(server)
    }

    /// Come back from stored state as a follower in the stored term.
    /// `state_machine` is expected to be fresh; the snapshot and committed entries after it are applied to it again.
    pub fn restart(config: Config, storage: S, state_machine: M) -> Result<Self> {
        let PersistedState {
            hard_state,
            snapshot,
            entries,
        } = storage.initial_state()?;
        let mut server = Self::new(config, storage, state_machine)?;
        let (snapshot_index, snapshot_term) = match snapshot {
            Some(snapshot) => {
                server.state_machine.restore(&snapshot.data)?;
                server.membership = snapshot.meta.membership;
                (snapshot.meta.index, snapshot.meta.term)
            }
            None => (0, 0),
        };
        let entries = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        server.log = Log::from_parts(snapshot_index, snapshot_term, entries);
        server.last_applied = snapshot_index;
        server.last_snapshot_index = snapshot_index;
        server.hard_state = HardState {
            commit: hard_state
                .commit
                .max(snapshot_index)
                .min(server.log.last_index()),
            ..hard_state
        };
        server.persisted = hard_state;
        server.apply_committed()?;
        server.persist_hard_state()?;
        info!(
            "{}; restarted at term {} with log up to {} committed up to {}",
            server.id,
            server.hard_state.term,
            server.log.last_index(),
            server.hard_state.commit
        );
        Ok(server)
    }

    /// Recover from the loss of a quorum by making this node the only voter of the cluster, keeping its committed log.
    ///
    /// Uncommitted entries are discarded and every other member is removed through committed configuration changes,
    /// so nodes that were in the old cluster can never vote in the new one. Must only ever be invoked by an operator.
    pub fn force_new_cluster(config: Config, addr: impl Into<String>, storage: S, state_machine: M) -> Result<Self> {
        let mut server = Self::restart(config, storage, state_machine)?;
        let commit = server.hard_state.commit;
        if server.log.last_index() > commit {
            warn!(
                "{}; discarding uncommitted entries {} to {}",
                server.id,
                commit + 1,
                server.log.last_index()
            );
            server.log.truncate(commit + 1);
            server.storage.truncate(commit + 1)?;
        }
        let term = server.hard_state.term + 1;
        server.hard_state.set_term(term);
        server.hard_state.voted_for = Some(server.id);
        let first = server.log.last_index() + 1;
        let others: Vec<NodeId> = server.membership.ids().filter(|&id| id != server.id).collect();
        for id in others {
            server.log.append(term, Payload::ConfigChange(ConfigChange::RemoveNode { id }));
        }
        if !server.membership.is_voter(server.id) {
            let change = ConfigChange::AddVoter {
                id: server.id,
                addr: addr.into(),
            };
            server.log.append(term, Payload::ConfigChange(change));
        }
        let last = server.log.last_index();
        server.storage.append(server.log.slice(first, last))?;
        server.hard_state.set_commit(last);
        server.apply_committed()?;
        server.persist_hard_state()?;
        info!(
            "{}; forced a new single node cluster at term {}",
            server.id, term
        );
        Ok(server)
    }
}

impl<M: StateMachine, S: Storage> Server<M, S> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.hard_state.term
    }

    pub fn role(&self) -> StateRole {
        self.state.role()
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state
    }

    pub fn commit_index(&self) -> LogIndex {
        self.hard_state.commit
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn members(&self) -> Vec<Member> {
        self.membership.members().cloned().collect()
    }

    /// The leader of the current term, if known
    pub fn leader(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, States::Leader(_))
    }

    /// Has this node applied its own removal from the cluster
    pub fn is_removed(&self) -> bool {
        self.membership.is_removed(self.id)
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The fatal error that stopped this server, if any
    pub fn failed(&self) -> Option<&Error> {
        self.failed.as_ref()
    }

    pub fn status(&self) -> Status {
        Status {
            id: self.id,
            role: self.role(),
            term: self.hard_state.term,
            leader: self.leader_id,
            commit: self.hard_state.commit,
            applied: self.last_applied,
            last_index: self.log.last_index(),
            members: self.members(),
        }
    }

    /// Messages to deliver to peers. Everything they depend on is already durable.
    pub fn take_messages(&mut self) -> Vec<Message> {
        core::mem::take(&mut self.msgs)
    }

    /// Entries applied since the last call
    pub fn take_applied(&mut self) -> Vec<Applied> {
        core::mem::take(&mut self.applied)
    }
}

impl<M: StateMachine, S: Storage> Server<M, S> {
    /// Feed one message from a peer into the server.
    ///
    /// Returns `StaleTerm` for a message from an earlier term; it has been answered where an answer helps the
    /// sender catch up and can otherwise be ignored.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.check_failed()?;
        let result = self.step_inner(msg);
        self.finish(result)
    }

    /// Advance the logical clock by one tick
    pub fn tick(&mut self) -> Result<()> {
        self.check_failed()?;
        let result = if self.is_leader() {
            self.tick_leader()
        } else {
            self.tick_election()
        };
        self.finish(result)
    }

    /// If command received from client: append entry to local log, respond after entry applied to state machine (§5.3)
    ///
    /// Returns where the entry was placed. It is only known to be committed once it shows up in
    /// [`Server::take_applied`] with the same term.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        self.check_failed()?;
        let result = self
            .check_proposable()
            .and_then(|()| self.append_and_replicate(Payload::Command(command)));
        self.finish(result)
    }

    /// Propose a membership change. Only one may be uncommitted at a time, and the membership is only changed
    /// when the entry is applied.
    pub fn propose_config_change(&mut self, change: ConfigChange) -> Result<(LogIndex, Term)> {
        self.check_failed()?;
        let result = self.propose_config_change_inner(change);
        self.finish(result)
    }

    /// Hand leadership to `target` once it has caught up. Proposals are refused until the transfer completes or is
    /// abandoned after an election timeout.
    pub fn transfer_leadership(&mut self, target: NodeId) -> Result<()> {
        self.check_failed()?;
        let result = self.transfer_leadership_inner(target);
        self.finish(result)
    }

    fn check_failed(&self) -> Result<()> {
        match &self.failed {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn check_proposable(&self) -> Result<()> {
        match &self.state {
            States::Leader(leader) if leader.transferee.is_some() => {
                debug!(
                    "{}; dropping proposal during leadership transfer",
                    self.id
                );
                Err(Error::ProposalDropped)
            }
            States::Leader(_) => Ok(()),
            _ => Err(Error::NotLeader {
                leader: self.leader_id,
            }),
        }
    }

    /// Apply, snapshot and persist after every input, then surface the outcome.
    /// A fatal error poisons the server.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        let after = self
            .apply_committed()
            .and_then(|()| self.maybe_snapshot())
            .and_then(|()| self.persist_hard_state());
        match (result, after) {
            (_, Err(e)) => Err(self.poison(e)),
            (Err(e), Ok(())) if e.is_fatal() => Err(self.poison(e)),
            (result, Ok(())) => result,
        }
    }

    fn poison(&mut self, e: Error) -> Error {
        error!("{}; stopping after fatal error: {}", self.id, e);
        self.msgs.clear();
        self.state = States::Follower;
        self.failed = Some(e.clone());
        e
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        if self.hard_state != self.persisted {
            self.storage.save_hard_state(&self.hard_state)?;
            self.persisted = self.hard_state;
        }
        Ok(())
    }

    fn send(&mut self, to: NodeId, rpc: Rpc) {
        trace!("{}; -> {} {:?}", self.id, to, rpc);
        self.msgs.push(Message {
            from: self.id,
            to,
            rpc,
        });
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        let base = self.config.election_tick;
        self.randomized_election_timeout = self.rng.gen_range(base..2 * base);
    }

    /// Only voters that have not been removed may stand for election
    fn is_promotable(&self) -> bool {
        self.membership.is_voter(self.id) && !self.membership.is_removed(self.id)
    }

    fn leader_mut(&mut self) -> Option<&mut Leader> {
        match &mut self.state {
            States::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    fn step_inner(&mut self, msg: Message) -> Result<()> {
        let Message { from, rpc, .. } = msg;
        if self.membership.is_removed(from) {
            debug!("{}; ignoring message from removed node {}", self.id, from);
            if !matches!(rpc, Rpc::Removed(_)) {
                let term = self.hard_state.term;
                self.send(from, Rpc::Removed(RemovedNotice { term }));
            }
            return Ok(());
        }
        // a removed node may be far behind in term, or far ahead after campaigning alone
        if let Rpc::Removed(_) = rpc {
            self.handle_removed(from);
            return Ok(());
        }
        let term = rpc.term();
        match term.cmp(&self.hard_state.term) {
            // If RPC request or response contains term T > currentTerm: set currentTerm = T, convert to follower (§5.1)
            Ordering::Greater => {
                let leader = if rpc.from_leader() { Some(from) } else { None };
                info!(
                    "{}; stepping down to follower at term {} after message from {}",
                    self.id, term, from
                );
                self.become_follower(term, leader);
            }
            Ordering::Less => {
                debug!(
                    "{}; ignoring message from {} at stale term {}",
                    self.id, from, term
                );
                self.reject_stale(from, &rpc);
                return Err(Error::StaleTerm {
                    current: self.hard_state.term,
                    received: term,
                });
            }
            Ordering::Equal => {}
        }
        match rpc {
            Rpc::AppendEntries(req) => self.handle_append_entries(from, req),
            Rpc::AppendEntriesResponse(res) => self.handle_append_entries_response(from, res),
            Rpc::RequestVote(req) => {
                self.handle_request_vote(from, req);
                Ok(())
            }
            Rpc::RequestVoteResponse(res) => self.handle_vote_response(from, res),
            Rpc::InstallSnapshot(req) => self.handle_install_snapshot(from, req),
            Rpc::InstallSnapshotResponse(res) => self.handle_install_snapshot_response(from, res),
            Rpc::TimeoutNow(_) => self.handle_timeout_now(from),
            Rpc::Removed(_) => Ok(()),
        }
    }

    /// A member has told us we were removed, while the committed removal never reached us
    fn handle_removed(&mut self, from: NodeId) {
        if self.is_removed() || !self.membership.contains(from) {
            return;
        }
        info!("{}; {} reports this node was removed from the cluster", self.id, from);
        self.membership.apply(&ConfigChange::RemoveNode { id: self.id });
        self.state = States::Follower;
        self.leader_id = None;
    }

    /// Answer a request from an earlier term with our term so that the sender learns it is stale
    fn reject_stale(&mut self, from: NodeId, rpc: &Rpc) {
        let term = self.hard_state.term;
        match rpc {
            Rpc::AppendEntries(req) => self.send(
                from,
                Rpc::AppendEntriesResponse(AppendEntriesResponse {
                    term,
                    success: false,
                    match_index: req.prev_log_index,
                    conflict: None,
                }),
            ),
            Rpc::RequestVote(_) => self.send(
                from,
                Rpc::RequestVoteResponse(RequestVoteResponse {
                    term,
                    vote_granted: false,
                }),
            ),
            Rpc::InstallSnapshot(_) => self.send(
                from,
                Rpc::InstallSnapshotResponse(InstallSnapshotResponse {
                    term,
                    match_index: 0,
                }),
            ),
            _ => {}
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        self.hard_state.set_term(term);
        self.state = States::Follower;
        self.leader_id = leader;
        self.reset_election_timer();
    }

    /// A valid message from the leader of the current term
    fn follow_leader(&mut self, leader: NodeId) {
        if !matches!(self.state, States::Follower) {
            self.become_follower(self.hard_state.term, Some(leader));
        }
        self.leader_id = Some(leader);
        self.election_elapsed = 0;
    }

    /// # Followers (§5.2):
    /// -- If election timeout elapses without receiving AppendEntries RPC from current leader or granting vote to candidate: convert to candidate
    /// # Candidates (§5.2):
    /// -- If election timeout elapses: start new election
    fn tick_election(&mut self) -> Result<()> {
        self.election_elapsed += 1;
        if self.election_elapsed < self.randomized_election_timeout {
            return Ok(());
        }
        if self.is_promotable() {
            self.campaign()
        } else {
            self.election_elapsed = 0;
            Ok(())
        }
    }

    /// Upon election: send initial empty AppendEntries RPCs (heartbeat) to each server; repeat during idle periods to prevent election timeouts (§5.2)
    fn tick_leader(&mut self) -> Result<()> {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;
        let election_timeout = self.election_elapsed >= self.config.election_tick;
        if election_timeout {
            self.election_elapsed = 0;
        }
        let snapshot_timeout = self.config.election_tick as u64;
        let id = self.id;
        if let States::Leader(leader) = &mut self.state {
            leader.ticks += 1;
            let now = leader.ticks;
            if election_timeout {
                if let Some(target) = leader.transferee.take() {
                    info!("{}; abandoning leadership transfer to {}", id, target);
                }
            }
            for (_, progress) in leader.progress.iter_mut() {
                if progress.snapshot_timed_out(now, snapshot_timeout) {
                    progress.become_probe();
                }
            }
        }
        if self.heartbeat_elapsed >= self.config.heartbeat_tick {
            self.heartbeat_elapsed = 0;
            self.broadcast_heartbeat()?;
        }
        Ok(())
    }

    /// # Candidates (§5.2):
    /// - On conversion to candidate, start election:
    /// -- Increment currentTerm
    /// -- Vote for self
    /// -- Reset election timer
    /// -- Send RequestVote RPCs to all other servers
    fn campaign(&mut self) -> Result<()> {
        let term = self.hard_state.term + 1;
        self.hard_state.set_term(term);
        self.hard_state.voted_for = Some(self.id);
        self.leader_id = None;
        self.reset_election_timer();
        let mut candidate = Candidate::default();
        candidate.record(self.id, true);
        self.state = States::Candidate(candidate);
        info!("{}; starting election for term {}", self.id, term);
        let req = RequestVoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let peers: Vec<NodeId> = self.membership.voters().filter(|&id| id != self.id).collect();
        for peer in peers {
            self.send(peer, Rpc::RequestVote(req.clone()));
        }
        self.check_votes()
    }

    /// If votes received from majority of servers: become leader.
    /// A majority of rejections means this election is lost.
    fn check_votes(&mut self) -> Result<()> {
        let (won, lost) = match &self.state {
            States::Candidate(candidate) => (
                self.membership.is_quorum(candidate.granted()),
                self.membership.is_quorum(candidate.rejected()),
            ),
            _ => return Ok(()),
        };
        if won {
            self.become_leader()
        } else {
            if lost {
                info!(
                    "{}; lost the election for term {}",
                    self.id, self.hard_state.term
                );
                self.become_follower(self.hard_state.term, None);
            }
            Ok(())
        }
    }

    fn become_leader(&mut self) -> Result<()> {
        let last = self.log.last_index();
        let progress = ProgressTracker::new(self.id, self.membership.ids(), last);
        self.state = States::Leader(Leader::new(progress));
        self.leader_id = Some(self.id);
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        // a configuration change may be hiding in the uncommitted tail
        self.pending_config_index = last;
        info!(
            "{}; became leader at term {}",
            self.id, self.hard_state.term
        );
        self.append_and_replicate(Payload::Blank).map(|_| ())
    }

    /// Append to the leader's own log, write it through, and replicate it
    fn append_and_replicate(&mut self, payload: Payload) -> Result<(LogIndex, Term)> {
        let term = self.hard_state.term;
        let index = self.log.append(term, payload);
        self.storage.append(self.log.slice(index, index))?;
        let id = self.id;
        if let Some(progress) = self.leader_mut().and_then(|l| l.progress.get_mut(id)) {
            progress.maybe_update(index);
        }
        self.maybe_commit();
        self.broadcast_append()?;
        Ok((index, term))
    }

    /// If there exists an N such that N > commitIndex, a majority of matchIndex[i] ≥ N, and log[N].term == currentTerm: set commitIndex = N (§5.3, §5.4).
    fn maybe_commit(&mut self) -> bool {
        let n = match &self.state {
            States::Leader(leader) => leader.progress.majority_match(self.membership.voters()),
            _ => return false,
        };
        if n > self.hard_state.commit && self.log.term(n) == Some(self.hard_state.term) {
            trace!("{}; committed up to {}", self.id, n);
            self.hard_state.set_commit(n);
            true
        } else {
            false
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        match &self.state {
            States::Leader(leader) => leader.progress.ids().filter(|&id| id != self.id).collect(),
            _ => vec![],
        }
    }

    fn broadcast_append(&mut self) -> Result<()> {
        for peer in self.peers() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    fn broadcast_heartbeat(&mut self) -> Result<()> {
        for peer in self.peers() {
            self.send_heartbeat(peer)?;
        }
        Ok(())
    }

    /// A heartbeat doubles as a retry: a probe whose answer was lost is sent again
    fn send_heartbeat(&mut self, to: NodeId) -> Result<()> {
        let pending = match self.leader_mut().and_then(|l| l.progress.get_mut(to)) {
            Some(progress) => match progress.state {
                ProgressState::Snapshot { pending } => Some(pending),
                _ => {
                    progress.resume();
                    None
                }
            },
            None => return Ok(()),
        };
        match pending {
            // keep the follower from campaigning while it receives the snapshot
            Some(pending) => {
                let prev_log_term = self.log.term(pending).unwrap_or(self.log.snapshot_term());
                let req = AppendEntriesRequest {
                    term: self.hard_state.term,
                    leader_id: self.id,
                    prev_log_index: pending,
                    prev_log_term,
                    entries: vec![],
                    leader_commit: self.hard_state.commit,
                };
                self.send(to, Rpc::AppendEntries(req));
                Ok(())
            }
            None => self.send_append(to),
        }
    }

    /// If last log index ≥ nextIndex for a follower: send AppendEntries RPC with log entries starting at nextIndex.
    /// Falls back to a snapshot when those entries have been compacted.
    fn send_append(&mut self, to: NodeId) -> Result<()> {
        let max = self.config.max_append_entries;
        let (next, state) = match self.leader_mut().and_then(|l| l.progress.get(to)) {
            Some(progress) if !progress.is_paused() => (progress.next_index, progress.state),
            _ => return Ok(()),
        };
        let prev_log_index = next - 1;
        let (prev_log_term, entries) = match (self.log.term(prev_log_index), self.log.entries_from(next, max)) {
            (Some(term), Some(entries)) => (term, entries),
            _ => return self.send_snapshot(to),
        };
        let last = prev_log_index + entries.len() as LogIndex;
        if let Some(progress) = self.leader_mut().and_then(|l| l.progress.get_mut(to)) {
            match state {
                ProgressState::Replicate if last >= next => progress.optimistic_update(last),
                ProgressState::Probe => progress.pause(),
                _ => {}
            }
        }
        let req = AppendEntriesRequest {
            term: self.hard_state.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.hard_state.commit,
        };
        self.send(to, Rpc::AppendEntries(req));
        Ok(())
    }

    fn send_snapshot(&mut self, to: NodeId) -> Result<()> {
        let snapshot = match self.storage.snapshot()? {
            Some(snapshot) => snapshot,
            None => {
                warn!(
                    "{}; {} needs compacted entries but there is no snapshot",
                    self.id, to
                );
                return Ok(());
            }
        };
        if let Some(leader) = self.leader_mut() {
            let now = leader.ticks;
            if let Some(progress) = leader.progress.get_mut(to) {
                progress.become_snapshot(snapshot.index(), now);
            }
        }
        info!(
            "{}; sending snapshot at {} to {}",
            self.id,
            snapshot.index(),
            to
        );
        let req = InstallSnapshotRequest {
            term: self.hard_state.term,
            leader_id: self.id,
            snapshot,
        };
        self.send(to, Rpc::InstallSnapshot(req));
        Ok(())
    }

    /// # Receiver implementation:
    /// 1.  Reply false if term < currentTerm (§5.1)
    /// 2.  Reply false if log doesn’t contain an entry at prevLogIndex whose term matches prevLogTerm (§5.3)
    /// 3.  If an existing entry conflicts with a new one (same index but different terms), delete the existing entry and all that follow it (§5.3)
    /// 4.  Append any new entries not already in the log
    /// 5.  If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
    fn handle_append_entries(&mut self, from: NodeId, req: AppendEntriesRequest) -> Result<()> {
        if self.is_leader() {
            warn!(
                "{}; ignoring append from {} claiming to lead term {}",
                self.id, from, req.term
            );
            return Ok(());
        }
        self.follow_leader(from);
        let term = self.hard_state.term;
        let commit = self.hard_state.commit;
        if req.prev_log_index < commit {
            // everything up to the commit index is known to match
            self.send(
                from,
                Rpc::AppendEntriesResponse(AppendEntriesResponse {
                    term,
                    success: true,
                    match_index: commit,
                    conflict: None,
                }),
            );
            return Ok(());
        }
        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let conflict = match self.log.term(req.prev_log_index) {
                Some(conflict_term) => ConflictHint {
                    term: Some(conflict_term),
                    index: self.log.first_index_of_term_at(req.prev_log_index),
                },
                None => ConflictHint {
                    term: None,
                    index: self.log.last_index() + 1,
                },
            };
            debug!(
                "{}; rejecting append after {} from {}, conflict {:?}",
                self.id, req.prev_log_index, from, conflict
            );
            self.send(
                from,
                Rpc::AppendEntriesResponse(AppendEntriesResponse {
                    term,
                    success: false,
                    match_index: req.prev_log_index,
                    conflict: Some(conflict),
                }),
            );
            return Ok(());
        }
        let last_new = req.prev_log_index + req.entries.len() as LogIndex;
        if let Some(changed) = self.log.truncate_if_different_and_append(req.entries) {
            assert!(
                changed > commit,
                "Committed entry {} would be overwritten (commit index {})",
                changed,
                commit
            );
            self.storage
                .append(self.log.slice(changed, self.log.last_index()))?;
        }
        let new_commit = core::cmp::min(req.leader_commit, last_new);
        if new_commit > commit {
            self.hard_state.set_commit(new_commit);
        }
        self.send(
            from,
            Rpc::AppendEntriesResponse(AppendEntriesResponse {
                term,
                success: true,
                match_index: last_new,
                conflict: None,
            }),
        );
        Ok(())
    }

    /// - If successful: update nextIndex and matchIndex for follower (§5.3)
    /// - If AppendEntries fails because of log inconsistency: decrement nextIndex and retry (§5.3)
    fn handle_append_entries_response(&mut self, from: NodeId, res: AppendEntriesResponse) -> Result<()> {
        let last_index = self.log.last_index();
        let hint = match res.conflict {
            Some(ConflictHint {
                term: Some(term),
                index,
            }) => self
                .log
                .last_index_of_term(term)
                .map_or(index, |last| last + 1),
            Some(ConflictHint { term: None, index }) => index,
            None => res.match_index,
        };
        let id = self.id;
        let leader = match self.leader_mut() {
            Some(leader) => leader,
            None => return Ok(()),
        };
        let now = leader.ticks;
        let transferee = leader.transferee;
        let progress = match leader.progress.get_mut(from) {
            Some(progress) => progress,
            None => return Ok(()),
        };
        progress.last_contact = now;
        if !res.success {
            if progress.maybe_decrement(res.match_index, hint) {
                debug!(
                    "{}; {} rejected append after {}, retrying from {}",
                    id, from, res.match_index, progress.next_index
                );
                if progress.state == ProgressState::Replicate {
                    progress.become_probe();
                }
                self.send_append(from)?;
            }
            return Ok(());
        }
        let updated = progress.maybe_update(res.match_index);
        match progress.state {
            ProgressState::Probe if updated => progress.become_replicate(),
            ProgressState::Snapshot { pending } if progress.match_index >= pending => progress.become_probe(),
            _ => {}
        }
        let caught_up = progress.match_index == last_index;
        // an acknowledgement with nothing left to send is the end of the exchange
        let unsent = progress.next_index <= last_index;
        if updated && self.maybe_commit() {
            self.broadcast_append()?;
        } else if unsent {
            self.send_append(from)?;
        }
        if transferee == Some(from) && caught_up {
            self.send_timeout_now(from);
        }
        Ok(())
    }

    fn send_timeout_now(&mut self, to: NodeId) {
        info!("{}; handing leadership to {}", self.id, to);
        self.send(
            to,
            Rpc::TimeoutNow(TimeoutNow {
                term: self.hard_state.term,
                leader_id: self.id,
            }),
        );
    }

    /// # Receiver implementation:
    /// 1.  Reply false if term < currentTerm (§5.1)
    /// 2.  If votedFor is null or candidateId, and candidate’s log is at least as up-to-date as receiver’s log, grant vote (§5.2, §5.4)
    fn handle_request_vote(&mut self, from: NodeId, req: RequestVoteRequest) {
        let term = self.hard_state.term;
        let can_vote = self.hard_state.voted_for == Some(req.candidate_id)
            || (self.hard_state.voted_for.is_none() && self.leader_id.is_none());
        let up_to_date = self.log.compare_last(req.last_log_index, req.last_log_term) != Ordering::Greater;
        let vote_granted = can_vote && up_to_date;
        if vote_granted {
            self.hard_state.voted_for = Some(req.candidate_id);
            self.reset_election_timer();
        }
        debug!(
            "{}; vote for {} at term {}: {}",
            self.id, req.candidate_id, term, vote_granted
        );
        self.send(
            from,
            Rpc::RequestVoteResponse(RequestVoteResponse { term, vote_granted }),
        );
    }

    fn handle_vote_response(&mut self, from: NodeId, res: RequestVoteResponse) -> Result<()> {
        match &mut self.state {
            States::Candidate(candidate) => candidate.record(from, res.vote_granted),
            _ => return Ok(()),
        }
        self.check_votes()
    }

    fn handle_install_snapshot(&mut self, from: NodeId, req: InstallSnapshotRequest) -> Result<()> {
        if self.is_leader() {
            warn!(
                "{}; ignoring snapshot from {} claiming to lead term {}",
                self.id, from, req.term
            );
            return Ok(());
        }
        self.follow_leader(from);
        let term = self.hard_state.term;
        let snapshot = req.snapshot;
        let (index, snapshot_term) = (snapshot.index(), snapshot.term());
        let match_index = if index <= self.hard_state.commit {
            self.hard_state.commit
        } else if self.log.matches(index, snapshot_term) {
            // the entries are already here, only their commitment is news
            self.hard_state.set_commit(index);
            index
        } else {
            self.restore_snapshot(snapshot)?;
            index
        };
        self.send(
            from,
            Rpc::InstallSnapshotResponse(InstallSnapshotResponse { term, match_index }),
        );
        Ok(())
    }

    /// Replace the whole log and application state with a snapshot
    fn restore_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term) = (snapshot.index(), snapshot.term());
        info!("{}; restoring snapshot at {} term {}", self.id, index, term);
        self.storage.save_snapshot(&snapshot)?;
        self.storage.truncate(0)?;
        self.state_machine.restore(&snapshot.data)?;
        self.log.restore(index, term);
        self.membership = snapshot.meta.membership;
        self.hard_state.set_commit(index);
        self.last_applied = index;
        self.last_snapshot_index = index;
        Ok(())
    }

    fn handle_install_snapshot_response(&mut self, from: NodeId, res: InstallSnapshotResponse) -> Result<()> {
        let leader = match self.leader_mut() {
            Some(leader) => leader,
            None => return Ok(()),
        };
        let now = leader.ticks;
        if let Some(progress) = leader.progress.get_mut(from) {
            progress.last_contact = now;
            progress.maybe_update(res.match_index);
            if let ProgressState::Snapshot { .. } = progress.state {
                progress.become_probe();
            }
        }
        self.send_append(from)
    }

    fn handle_timeout_now(&mut self, from: NodeId) -> Result<()> {
        if !self.is_promotable() {
            debug!("{}; ignoring leadership transfer from {}", self.id, from);
            return Ok(());
        }
        info!("{}; taking over leadership from {}", self.id, from);
        self.campaign()
    }

    fn propose_config_change_inner(&mut self, change: ConfigChange) -> Result<(LogIndex, Term)> {
        self.check_proposable()?;
        if self.pending_config_index > self.last_applied {
            return Err(Error::ConfigChangeInFlight);
        }
        self.membership.validate(&change)?;
        if let ConfigChange::RemoveNode { id } = change {
            let window = self.config.election_tick as u64;
            let active = match &self.state {
                States::Leader(leader) => leader.progress.active(self.id, leader.ticks, window),
                _ => Default::default(),
            };
            if !self.membership.can_remove(id, &active) {
                return Err(Error::CannotRemoveMember(id));
            }
        }
        info!("{}; proposing {:?}", self.id, change);
        let (index, term) = self.append_and_replicate(Payload::ConfigChange(change))?;
        self.pending_config_index = index;
        Ok((index, term))
    }

    fn transfer_leadership_inner(&mut self, target: NodeId) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader {
                leader: self.leader_id,
            });
        }
        if target == self.id {
            return Ok(());
        }
        if !self.membership.is_voter(target) {
            return Err(Error::NotMember(target));
        }
        let last_index = self.log.last_index();
        self.election_elapsed = 0;
        let caught_up = match self.leader_mut() {
            Some(leader) => {
                leader.transferee = Some(target);
                leader.progress.get(target).map_or(false, |p| p.match_index == last_index)
            }
            None => false,
        };
        info!("{}; transferring leadership to {}", self.id, target);
        if caught_up {
            self.send_timeout_now(target);
            Ok(())
        } else {
            self.send_append(target)
        }
    }

    /// If commitIndex > lastApplied: increment lastApplied, apply log[lastApplied] to state machine (§5.3)
    fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.hard_state.commit {
            let index = self.last_applied + 1;
            let entry = self.log[index].clone();
            match &entry.payload {
                Payload::Blank => {}
                Payload::Command(command) => self.state_machine.apply(index, command),
                Payload::ConfigChange(change) => self.apply_config_change(change)?,
            }
            self.last_applied = index;
            self.applied.push(Applied {
                index,
                term: entry.term,
            });
        }
        Ok(())
    }

    fn apply_config_change(&mut self, change: &ConfigChange) -> Result<()> {
        info!("{}; applying {:?}", self.id, change);
        self.membership.apply(change);
        let next = self.log.last_index() + 1;
        match *change {
            ConfigChange::AddVoter { id, .. } | ConfigChange::AddNonVoter { id, .. } => {
                if let Some(leader) = self.leader_mut() {
                    leader.progress.insert(id, next);
                    self.send_append(id)?;
                }
            }
            ConfigChange::RemoveNode { id } if id == self.id => {
                info!("{}; removed from the cluster", self.id);
                if self.is_leader() {
                    // let the others learn the removal is committed, then hand over
                    self.broadcast_append()?;
                    if let Some(successor) = self.most_up_to_date_voter() {
                        self.send_timeout_now(successor);
                    }
                }
                self.state = States::Follower;
                self.leader_id = None;
            }
            ConfigChange::RemoveNode { id } => {
                let removed = match self.leader_mut() {
                    Some(leader) => {
                        if leader.transferee == Some(id) {
                            leader.transferee = None;
                        }
                        leader.progress.remove(id).is_some()
                    }
                    None => false,
                };
                // the quorum shrank, entries may now be committed
                if removed && self.maybe_commit() {
                    self.broadcast_append()?;
                }
            }
        }
        Ok(())
    }

    fn most_up_to_date_voter(&self) -> Option<NodeId> {
        let leader = match &self.state {
            States::Leader(leader) => leader,
            _ => return None,
        };
        self.membership
            .voters()
            .filter(|&id| id != self.id)
            .filter_map(|id| leader.progress.get(id).map(|p| (p.match_index, id)))
            .max()
            .map(|(_, id)| id)
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        let policy = self.config.snapshot_policy();
        if !policy.should_snapshot(self.last_applied, self.last_snapshot_index) {
            return Ok(());
        }
        let index = self.last_applied;
        let term = match self.log.term(index) {
            Some(term) => term,
            None => return Ok(()),
        };
        let data = self.state_machine.snapshot()?;
        let snapshot = Snapshot::new(index, term, self.membership.clone(), data);
        self.storage.save_snapshot(&snapshot)?;
        let compact = policy.compact_to(index);
        if compact > self.log.snapshot_index() {
            self.storage.compact(compact)?;
            self.log.compact(compact);
        }
        self.last_snapshot_index = index;
        info!(
            "{}; snapshot at {}, log compacted up to {}",
            self.id,
            index,
            self.log.snapshot_index()
        );
        Ok(())
    }
}





/// - If last log index ≥ nextIndex for a follower: send AppendEntries RPC with log entries starting at nextIndex
/// - If successful: update nextIndex and matchIndex for follower (§5.3)
/// - If AppendEntries fails because of log inconsistency: decrement nextIndex and retry (§5.3)
/// - If there exists an N such that N > commitIndex, a majority of matchIndex[i] ≥ N, and log[N].term == currentTerm: set commitIndex = N (§5.3, §5.4).
#[cfg(test)]
mod leader_rules {
    use super::test_support::*;
    use super::*;

    fn elect(s: &mut TestServer) {
        tick_until_candidate(s);
        let term = s.term();
        let voters: Vec<NodeId> = s.membership().voters().filter(|&v| v != s.id()).collect();
        for v in voters {
            s.step(msg(
                v,
                s.id(),
                Rpc::RequestVoteResponse(RequestVoteResponse {
                    term,
                    vote_granted: true,
                }),
            ))
            .unwrap();
        }
        assert!(s.is_leader());
        s.take_messages();
    }

    fn ack(s: &mut TestServer, from: NodeId, match_index: LogIndex) {
        let term = s.term();
        s.step(msg(
            from,
            s.id(),
            Rpc::AppendEntriesResponse(AppendEntriesResponse {
                term,
                success: true,
                match_index,
                conflict: None,
            }),
        ))
        .unwrap();
    }

    #[test]
    fn previous_term_entries_commit_only_through_current_term() {
        let mut s = server(1, &[1, 2, 3], 1, &[1, 1]);
        elect(&mut s);
        assert_eq!(s.term(), 2);
        assert_eq!(s.log().last_index(), 3);
        // a majority holds the old entries, but they are not from this term
        ack(&mut s, 2, 2);
        assert_eq!(s.commit_index(), 0);
        ack(&mut s, 2, 3);
        assert_eq!(s.commit_index(), 3);
        assert_eq!(s.last_applied(), 3);
    }

    #[test]
    fn proposals_on_followers_redirect() {
        let mut s = server(1, &[1, 2, 3], 1, &[]);
        s.step(msg(
            2,
            1,
            Rpc::AppendEntries(AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }),
        ))
        .unwrap();
        assert!(matches!(
            s.propose(b"x".to_vec()),
            Err(Error::NotLeader { leader: Some(2) })
        ));
    }

    #[test]
    fn proposal_is_replicated_and_committed() {
        let mut s = server(1, &[1, 2, 3], 0, &[]);
        elect(&mut s);
        ack(&mut s, 2, 1);
        let (index, term) = s.propose(b"x".to_vec()).unwrap();
        assert_eq!((index, term), (2, 1));
        let out = s.take_messages();
        assert!(out.iter().any(|m| m.to == 2
            && matches!(&m.rpc, Rpc::AppendEntries(req) if req.entries.len() == 1 && req.entries[0].index == 2)));
        assert_eq!(s.commit_index(), 1);
        ack(&mut s, 3, 2);
        assert_eq!(s.commit_index(), 2);
        assert_eq!(s.state_machine(), &vec![b"x".to_vec()]);
        let applied = s.take_applied();
        assert_eq!(applied.last(), Some(&Applied { index: 2, term: 1 }));
    }

    #[test]
    fn caught_up_follower_gets_no_reply_to_its_ack() {
        let mut s = server(1, &[1, 2, 3], 0, &[]);
        elect(&mut s);
        ack(&mut s, 2, 1);
        assert_eq!(s.commit_index(), 1);
        s.take_messages();
        // a heartbeat answer, or a duplicate of the last one, ends the exchange
        ack(&mut s, 2, 1);
        assert!(s.take_messages().is_empty());
        ack(&mut s, 3, 1);
        assert!(s.take_messages().is_empty());
        // the next heartbeat still goes out
        s.tick().unwrap();
        let out = s.take_messages();
        assert!(out.iter().any(|m| m.to == 2 && matches!(m.rpc, Rpc::AppendEntries(_))));
    }

    #[test]
    fn lagging_follower_is_sent_the_rest_after_its_ack() {
        let mut s = server(1, &[1, 2, 3], 0, &[]);
        elect(&mut s);
        ack(&mut s, 2, 1);
        s.propose(b"x".to_vec()).unwrap();
        s.take_messages();
        // node 3 confirms only the blank entry while the proposal is still unsent to it
        ack(&mut s, 3, 1);
        let out = s.take_messages();
        assert!(out.iter().any(|m| m.to == 3
            && matches!(&m.rpc, Rpc::AppendEntries(req) if req.entries.iter().any(|e| e.index == 2))));
    }

    #[test]
    fn rejection_walks_back_using_hint() {
        let mut s = server(1, &[1, 2], 3, &[1, 1, 1, 3, 3]);
        elect(&mut s);
        let term = s.term();
        s.step(msg(
            2,
            1,
            Rpc::AppendEntriesResponse(AppendEntriesResponse {
                term,
                success: false,
                match_index: 5,
                conflict: Some(ConflictHint {
                    term: Some(2),
                    index: 4,
                }),
            }),
        ))
        .unwrap();
        // we have no entries of term 2, so retry from where the follower's term 2 starts
        let out = s.take_messages();
        assert_eq!(out.len(), 1);
        match &out[0].rpc {
            Rpc::AppendEntries(req) => {
                assert_eq!(req.prev_log_index, 3);
                assert_eq!(req.prev_log_term, 1);
                assert_eq!(req.entries.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn one_config_change_at_a_time() {
        let mut s = server(1, &[1, 2, 3], 0, &[]);
        elect(&mut s);
        ack(&mut s, 2, 1);
        s.propose_config_change(ConfigChange::AddVoter {
            id: 4,
            addr: "n4".into(),
        })
        .unwrap();
        assert!(matches!(
            s.propose_config_change(ConfigChange::AddVoter {
                id: 5,
                addr: "n5".into()
            }),
            Err(Error::ConfigChangeInFlight)
        ));
        ack(&mut s, 2, 2);
        assert!(s.membership().is_voter(4));
        assert!(matches!(
            s.propose_config_change(ConfigChange::AddVoter {
                id: 4,
                addr: "n4".into()
            }),
            Err(Error::MemberExists(4))
        ));
    }

    #[test]
    fn removal_needs_reachable_quorum() {
        let mut s = server(1, &[1, 2, 3], 0, &[]);
        elect(&mut s);
        ack(&mut s, 2, 1);
        // node 3 has not been heard from for an election timeout
        for _ in 0..12 {
            s.tick().unwrap();
            ack(&mut s, 2, 1);
        }
        assert!(matches!(
            s.propose_config_change(ConfigChange::RemoveNode { id: 2 }),
            Err(Error::CannotRemoveMember(2))
        ));
        s.propose_config_change(ConfigChange::RemoveNode { id: 3 })
            .unwrap();
    }

    #[test]
    fn transfer_refuses_proposals() {
        let mut s = server(1, &[1, 2, 3], 0, &[]);
        elect(&mut s);
        s.transfer_leadership(2).unwrap();
        assert!(matches!(
            s.propose(b"x".to_vec()),
            Err(Error::ProposalDropped)
        ));
        ack(&mut s, 2, 1);
        let out = s.take_messages();
        assert!(out
            .iter()
            .any(|m| m.to == 2 && matches!(m.rpc, Rpc::TimeoutNow(_))));
    }

    #[test]
    fn snapshot_and_compaction() {
        let mut s = server(1, &[1], 0, &[]);
        s.config.snapshot_interval = 5;
        s.config.log_entries_for_slow_followers = 2;
        for _ in 0..20 {
            s.tick().unwrap();
        }
        assert!(s.is_leader());
        for i in 0..6u8 {
            s.propose(vec![i]).unwrap();
        }
        assert_eq!(s.last_applied(), 7);
        let snapshot = s.storage().snapshot().unwrap().unwrap();
        assert_eq!(snapshot.index(), 5);
        assert_eq!(s.log().snapshot_index(), 3);
        assert_eq!(s.log().last_index(), 7);
        let restarted: TestServer = Server::restart(config(1), s.storage().clone(), vec![]).unwrap();
        assert_eq!(restarted.state_machine(), s.state_machine());
    }
}
