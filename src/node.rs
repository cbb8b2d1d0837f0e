//! The actor around a [`Server`].
//!
//! Every input to the core goes through the actor's mailbox, so state transitions never interleave. Outbound
//! messages are handed to the [`Router`] after each input, and proposals are answered once the entry they created
//! is applied, or it turns out it never will be.

use super::error::{Error, Result};
use super::log::LogIndex;
use super::membership::{ConfigChange, Member, Role};
use super::rpc::{self, JoinRequest, JoinResponse, LeaveRequest};
use super::server::{Applied, Server, Status};
use super::state_machine::StateMachine;
use super::storage::Storage;
use super::transport::{
    Destination, ForwardLeave, Leave, Register, Registration, RouteJoin, RouteLeave, Router, Unregister,
};
use super::{NodeId, Term};
use actix::prelude::*;
use futures::channel::oneshot;
use log::{debug, error, info, trace};
use std::collections::HashMap;

type Waiter = (Term, oneshot::Sender<Result<Applied>>);

pub struct Node<M, S> {
    server: Server<M, S>,
    addr: String,
    router: Addr<Router>,
    registration: Option<Registration>,
    /// proposers waiting for the entry at an index, and the term it was proposed in
    waiters: HashMap<LogIndex, Waiter>,
}

impl<M, S> Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    pub fn new(server: Server<M, S>, addr: impl Into<String>, router: Addr<Router>) -> Self {
        Node {
            server,
            addr: addr.into(),
            router,
            registration: None,
            waiters: HashMap::new(),
        }
    }

    fn id(&self) -> NodeId {
        self.server.id()
    }

    fn tick(&mut self, ctx: &mut Context<Self>) {
        if let Err(e) = self.server.tick() {
            debug!("{}; tick failed: {}", self.id(), e);
        }
        self.flush(ctx);
    }

    /// Send what the server produced and answer proposers whose entries were applied
    fn flush(&mut self, ctx: &mut Context<Self>) {
        for msg in self.server.take_messages() {
            self.router.do_send(msg);
        }
        for applied in self.server.take_applied() {
            if let Some((term, tx)) = self.waiters.remove(&applied.index) {
                let result = if term == applied.term {
                    Ok(applied)
                } else {
                    // another leader's entry took the index
                    Err(Error::ProposalDropped)
                };
                let _ = tx.send(result);
            }
        }
        // indexes covered by an installed snapshot are never reported as applied
        let last_applied = self.server.last_applied();
        let skipped: Vec<LogIndex> = self
            .waiters
            .keys()
            .copied()
            .filter(|&index| index <= last_applied)
            .collect();
        for index in skipped {
            if let Some((_, tx)) = self.waiters.remove(&index) {
                let _ = tx.send(Err(Error::ClusterUnavailable));
            }
        }
        self.waiters.retain(|_, (_, tx)| !tx.is_canceled());

        if let Some(e) = self.server.failed() {
            error!("{}; stopping: {}", self.id(), e);
            ctx.stop();
        } else if self.server.is_removed() {
            info!("{}; stopping after removal from the cluster", self.id());
            ctx.stop();
        }
    }

    /// Wait for a proposed entry to be applied. Giving up after the proposal timeout leaves the entry in the log,
    /// where it may still commit.
    fn await_commit(
        &mut self,
        proposed: Result<(LogIndex, Term)>,
        ctx: &mut Context<Self>,
    ) -> ResponseActFuture<Self, Result<Applied>> {
        let rx = match proposed {
            Ok((index, term)) => {
                let (tx, rx) = oneshot::channel();
                self.waiters.insert(index, (term, tx));
                rx
            }
            Err(e) => {
                self.flush(ctx);
                return Box::pin(fut::ready(Err(e)));
            }
        };
        self.flush(ctx);
        let timeout = self.server.config().proposal_timeout();
        Box::pin(
            async move {
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(oneshot::Canceled)) => Err(Error::Shutdown),
                    Err(_) => Err(Error::ClusterUnavailable),
                }
            }
            .into_actor(self),
        )
    }
}

impl<M, S> Actor for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let me = ctx.address();
        // nothing else is handled until the router has answered
        self.router
            .send(Register {
                id: self.id(),
                addr: self.addr.clone(),
                raft: me.clone().recipient(),
                join: me.clone().recipient(),
                leave: me.recipient(),
            })
            .into_actor(self)
            .map(|res, node, ctx| match res {
                Ok(registration) => node.registration = Some(registration),
                Err(e) => {
                    error!("{}; could not register with the router: {}", node.id(), e);
                    ctx.stop();
                }
            })
            .wait(ctx);
        if let Some(interval) = self.server.config().tick_interval() {
            ctx.run_interval(interval, |node, ctx| node.tick(ctx));
        }
        info!("{}; started at {}", self.id(), self.addr);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(registration) = self.registration.take() {
            self.router.do_send(Unregister(registration));
        }
        for (_, (_, tx)) in self.waiters.drain() {
            let _ = tx.send(Err(Error::Shutdown));
        }
        info!("{}; stopped", self.id());
    }
}

/// Advance the node's clock by one tick, for nodes configured without a tick interval
#[derive(Message)]
#[rtype(result = "()")]
pub struct Tick;

impl<M, S> Handler<Tick> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ();

    fn handle(&mut self, _: Tick, ctx: &mut Self::Context) -> Self::Result {
        self.tick(ctx);
    }
}

impl<M, S> Handler<rpc::Message> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ();

    fn handle(&mut self, msg: rpc::Message, ctx: &mut Self::Context) -> Self::Result {
        trace!("{}; <- {} {:?}", self.id(), msg.from, msg.rpc);
        if let Err(e) = self.server.step(msg) {
            if !e.is_fatal() {
                debug!("{}; ignored message: {}", self.id(), e);
            }
        }
        self.flush(ctx);
    }
}

/// Replicate a command; resolves once it is applied
#[derive(Message)]
#[rtype(result = "Result<Applied>")]
pub struct Propose(pub Vec<u8>);

impl<M, S> Handler<Propose> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseActFuture<Self, Result<Applied>>;

    fn handle(&mut self, Propose(command): Propose, ctx: &mut Self::Context) -> Self::Result {
        let proposed = self.server.propose(command);
        self.await_commit(proposed, ctx)
    }
}

#[derive(Message)]
#[rtype(result = "Result<Applied>")]
pub struct AddMember {
    pub id: NodeId,
    pub addr: String,
    pub role: Role,
}

impl<M, S> Handler<AddMember> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseActFuture<Self, Result<Applied>>;

    fn handle(&mut self, AddMember { id, addr, role }: AddMember, ctx: &mut Self::Context) -> Self::Result {
        let change = match role {
            Role::Voter => ConfigChange::AddVoter { id, addr },
            Role::NonVoter => ConfigChange::AddNonVoter { id, addr },
        };
        let proposed = self.server.propose_config_change(change);
        self.await_commit(proposed, ctx)
    }
}

#[derive(Message)]
#[rtype(result = "Result<Applied>")]
pub struct RemoveMember(pub NodeId);

impl<M, S> Handler<RemoveMember> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseActFuture<Self, Result<Applied>>;

    fn handle(&mut self, RemoveMember(id): RemoveMember, ctx: &mut Self::Context) -> Self::Result {
        let proposed = self
            .server
            .propose_config_change(ConfigChange::RemoveNode { id });
        self.await_commit(proposed, ctx)
    }
}

/// A join call delivered by the router. Members that are not the leader forward it to the leader.
#[derive(Message)]
#[rtype(result = "Result<JoinResponse>")]
pub struct Join(pub JoinRequest);

impl<M, S> Handler<Join> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseActFuture<Self, Result<JoinResponse>>;

    fn handle(&mut self, Join(req): Join, ctx: &mut Self::Context) -> Self::Result {
        if !self.server.is_leader() {
            return match self.server.leader() {
                Some(leader) => {
                    debug!(
                        "{}; forwarding join of {} to leader {}",
                        self.id(),
                        req.id,
                        leader
                    );
                    let request = self.router.send(RouteJoin {
                        to: Destination::Id(leader),
                        req,
                    });
                    Box::pin(
                        async move {
                            request
                                .await
                                .unwrap_or_else(|e| Err(Error::Unreachable(e.to_string())))
                        }
                        .into_actor(self),
                    )
                }
                None => Box::pin(fut::ready(Err(Error::QuorumLost))),
            };
        }
        if self.server.membership().is_voter(req.id) {
            let res = JoinResponse {
                leader: self.id(),
                members: self.server.members(),
            };
            return Box::pin(fut::ready(Ok(res)));
        }
        info!("{}; {} is joining from {}", self.id(), req.id, req.addr);
        let proposed = self.server.propose_config_change(ConfigChange::AddVoter {
            id: req.id,
            addr: req.addr,
        });
        Box::pin(self.await_commit(proposed, ctx).map(|result, node, _ctx| {
            result.map(|_| JoinResponse {
                leader: node.id(),
                members: node.server.members(),
            })
        }))
    }
}

/// A removal authorised by the router. Members that are not the leader forward it to the leader.
impl<M, S> Handler<Leave> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseActFuture<Self, Result<()>>;

    fn handle(&mut self, leave: Leave, ctx: &mut Self::Context) -> Self::Result {
        if !self.server.is_leader() {
            return match self.server.leader() {
                Some(leader) => {
                    debug!(
                        "{}; forwarding removal of {} to leader {}",
                        self.id(),
                        leave.req.id,
                        leader
                    );
                    let request = self.router.send(ForwardLeave { to: leader, leave });
                    Box::pin(
                        async move {
                            request
                                .await
                                .unwrap_or_else(|e| Err(Error::Unreachable(e.to_string())))
                        }
                        .into_actor(self),
                    )
                }
                None => Box::pin(fut::ready(Err(Error::QuorumLost))),
            };
        }
        info!("{}; {} asked to remove {}", self.id(), leave.caller, leave.req.id);
        let proposed = self
            .server
            .propose_config_change(ConfigChange::RemoveNode { id: leave.req.id });
        Box::pin(
            self.await_commit(proposed, ctx)
                .map(|result, _node, _ctx| result.map(|_| ())),
        )
    }
}

/// Ask the member at `via` to add this node to its cluster
#[derive(Message)]
#[rtype(result = "Result<JoinResponse>")]
pub struct JoinCluster {
    pub via: String,
}

impl<M, S> Handler<JoinCluster> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseFuture<Result<JoinResponse>>;

    fn handle(&mut self, JoinCluster { via }: JoinCluster, _ctx: &mut Self::Context) -> Self::Result {
        info!("{}; joining through {}", self.id(), via);
        let request = self.router.send(RouteJoin {
            to: Destination::Addr(via),
            req: JoinRequest {
                id: self.id(),
                addr: self.addr.clone(),
            },
        });
        Box::pin(async move {
            request
                .await
                .unwrap_or_else(|e| Err(Error::Unreachable(e.to_string())))
        })
    }
}

impl<M, S> Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    /// Ask the member at `via` to remove `id`, in this node's name
    fn request_removal(&self, via: Destination, id: NodeId) -> ResponseFuture<Result<()>> {
        let from = match self.registration {
            Some(registration) => registration,
            None => return Box::pin(async { Err(Error::Unreachable("router".to_string())) }),
        };
        let request = self.router.send(RouteLeave {
            from,
            to: via,
            req: LeaveRequest { id },
        });
        Box::pin(async move {
            request
                .await
                .unwrap_or_else(|e| Err(Error::Unreachable(e.to_string())))
        })
    }
}

/// Ask to be removed from the cluster, through the member at `via`
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct LeaveCluster {
    pub via: Destination,
}

impl<M, S> Handler<LeaveCluster> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseFuture<Result<()>>;

    fn handle(&mut self, LeaveCluster { via }: LeaveCluster, _ctx: &mut Self::Context) -> Self::Result {
        info!("{}; leaving through {:?}", self.id(), via);
        self.request_removal(via, self.id())
    }
}

/// Ask the member at `via` to remove another node. The router only lets this through if its
/// authorizer allows this node to remove `id`.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct RequestRemoval {
    pub via: Destination,
    pub id: NodeId,
}

impl<M, S> Handler<RequestRemoval> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ResponseFuture<Result<()>>;

    fn handle(&mut self, RequestRemoval { via, id }: RequestRemoval, _ctx: &mut Self::Context) -> Self::Result {
        info!("{}; asking {:?} to remove {}", self.id(), via, id);
        self.request_removal(via, id)
    }
}

#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct TransferLeadership(pub NodeId);

impl<M, S> Handler<TransferLeadership> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = Result<()>;

    fn handle(&mut self, TransferLeadership(target): TransferLeadership, ctx: &mut Self::Context) -> Self::Result {
        let result = self.server.transfer_leadership(target);
        self.flush(ctx);
        result
    }
}

#[derive(Message)]
#[rtype(result = "Status")]
pub struct GetStatus;

impl<M, S> Handler<GetStatus> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.server.status())
    }
}

#[derive(Message)]
#[rtype(result = "Vec<Member>")]
pub struct Members;

impl<M, S> Handler<Members> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = MessageResult<Members>;

    fn handle(&mut self, _: Members, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.server.members())
    }
}

#[derive(Message)]
#[rtype(result = "Option<NodeId>")]
pub struct GetLeader;

impl<M, S> Handler<GetLeader> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = MessageResult<GetLeader>;

    fn handle(&mut self, _: GetLeader, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.server.leader())
    }
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct IsLeader;

impl<M, S> Handler<IsLeader> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = MessageResult<IsLeader>;

    fn handle(&mut self, _: IsLeader, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.server.is_leader())
    }
}

/// Read the application state
pub struct Inspect<M, R>(pub Box<dyn FnOnce(&M) -> R + Send>);

impl<M: 'static, R: 'static> Message for Inspect<M, R> {
    type Result = R;
}

impl<M, S, R> Handler<Inspect<M, R>> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
    R: 'static,
{
    type Result = MessageResult<Inspect<M, R>>;

    fn handle(&mut self, Inspect(f): Inspect<M, R>, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(f(self.server.state_machine()))
    }
}

/// Stop the node. Waiting proposers get `Shutdown`.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

impl<M, S> Handler<Shutdown> for Node<M, S>
where
    M: StateMachine + Unpin + 'static,
    S: Storage + Unpin + 'static,
{
    type Result = ();

    fn handle(&mut self, _: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        ctx.stop();
    }
}
