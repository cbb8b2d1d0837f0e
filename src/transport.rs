//! In-process transport between node actors.
//!
//! The [`Router`] is the connection registry: nodes register under their id and address and refer to each other
//! only by id. It delivers raft messages fire-and-forget, so they may be lost, and it carries the join and leave
//! control calls. Each registration is answered with a [`Registration`] that only the router can make; leave calls
//! present it, and are checked against an [`Authorizer`] for the node it was issued to. Links can be cut to simulate
//! partitions.

use super::error::{Error, Result};
use super::node::Join;
use super::rpc::{self, JoinRequest, JoinResponse, LeaveRequest};
use super::NodeId;
use actix::prelude::*;
use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};

impl Message for rpc::Message {
    type Result = ();
}

/// Decides which registered node may ask for which node to be removed
pub trait Authorizer {
    fn authorize_removal(&self, caller: NodeId, target: NodeId) -> bool;
}

/// A node may only remove itself
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfOnly;

impl Authorizer for SelfOnly {
    fn authorize_removal(&self, caller: NodeId, target: NodeId) -> bool {
        caller == target
    }
}

/// Any registered node may remove any node
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyMember;

impl Authorizer for AnyMember {
    fn authorize_removal(&self, _caller: NodeId, _target: NodeId) -> bool {
        true
    }
}

/// Where a control call should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Id(NodeId),
    Addr(String),
}

/// Proof of being registered under an id, issued by the router on [`Register`].
/// A node that registers again under the same id makes earlier registrations stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    id: NodeId,
    generation: u64,
}

impl Registration {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

struct Peer {
    generation: u64,
    addr: String,
    raft: Recipient<rpc::Message>,
    join: Recipient<Join>,
    leave: Recipient<Leave>,
}

pub struct Router {
    peers: HashMap<NodeId, Peer>,
    by_addr: HashMap<String, NodeId>,
    isolated: HashSet<NodeId>,
    authorizer: Box<dyn Authorizer>,
    generation: u64,
}

impl Default for Router {
    fn default() -> Self {
        Self::with_authorizer(SelfOnly)
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authorizer(authorizer: impl Authorizer + 'static) -> Self {
        Router {
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            isolated: HashSet::new(),
            authorizer: Box::new(authorizer),
            generation: 0,
        }
    }

    fn is_current(&self, registration: &Registration) -> bool {
        self.peers
            .get(&registration.id)
            .map_or(false, |peer| peer.generation == registration.generation)
    }

    fn resolve(&self, to: &Destination) -> Result<&Peer> {
        let id = match to {
            Destination::Id(id) => *id,
            Destination::Addr(addr) => *self
                .by_addr
                .get(addr)
                .ok_or_else(|| Error::Unreachable(addr.clone()))?,
        };
        match self.peers.get(&id) {
            Some(peer) if !self.isolated.contains(&id) => Ok(peer),
            Some(peer) => Err(Error::Unreachable(peer.addr.clone())),
            None => Err(Error::Unreachable(format!("node {}", id))),
        }
    }
}

impl Actor for Router {
    type Context = Context<Self>;
}

#[derive(Message)]
#[rtype(result = "Registration")]
pub struct Register {
    pub id: NodeId,
    pub addr: String,
    pub raft: Recipient<rpc::Message>,
    pub join: Recipient<Join>,
    pub leave: Recipient<Leave>,
}

impl Handler<Register> for Router {
    type Result = MessageResult<Register>;

    fn handle(&mut self, msg: Register, _ctx: &mut Self::Context) -> Self::Result {
        self.generation += 1;
        let generation = self.generation;
        info!("R; registered {} at {} ({})", msg.id, msg.addr, generation);
        if let Some(old) = self.peers.get(&msg.id) {
            self.by_addr.remove(&old.addr);
        }
        self.by_addr.insert(msg.addr.clone(), msg.id);
        self.peers.insert(
            msg.id,
            Peer {
                generation,
                addr: msg.addr,
                raft: msg.raft,
                join: msg.join,
                leave: msg.leave,
            },
        );
        MessageResult(Registration { id: msg.id, generation })
    }
}

/// Drops the registration, unless the id has been registered again since
#[derive(Message)]
#[rtype(result = "()")]
pub struct Unregister(pub Registration);

impl Handler<Unregister> for Router {
    type Result = ();

    fn handle(&mut self, Unregister(registration): Unregister, _ctx: &mut Self::Context) -> Self::Result {
        if !self.is_current(&registration) {
            debug!("R; ignoring stale unregistration of {}", registration.id);
            return;
        }
        if let Some(peer) = self.peers.remove(&registration.id) {
            info!("R; unregistered {}", registration.id);
            self.by_addr.remove(&peer.addr);
        }
    }
}

/// Raft messages are delivered unless either end is isolated
impl Handler<rpc::Message> for Router {
    type Result = ();

    fn handle(&mut self, msg: rpc::Message, _ctx: &mut Self::Context) -> Self::Result {
        if self.isolated.contains(&msg.from) || self.isolated.contains(&msg.to) {
            trace!("R; dropped {} -> {}", msg.from, msg.to);
            return;
        }
        match self.peers.get(&msg.to) {
            Some(peer) => {
                trace!("R; {} -> {}", msg.from, msg.to);
                peer.raft.do_send(msg);
            }
            None => debug!("R; no route from {} to {}", msg.from, msg.to),
        }
    }
}

/// A join call, either from a new node to any member's address or forwarded by a member to the leader
#[derive(Message)]
#[rtype(result = "Result<JoinResponse>")]
pub struct RouteJoin {
    pub to: Destination,
    pub req: JoinRequest,
}

impl Handler<RouteJoin> for Router {
    type Result = ResponseFuture<Result<JoinResponse>>;

    fn handle(&mut self, RouteJoin { to, req }: RouteJoin, _ctx: &mut Self::Context) -> Self::Result {
        let join = match self.resolve(&to) {
            Ok(peer) => peer.join.clone(),
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        debug!("R; join of {} routed to {:?}", req.id, to);
        let request = join.send(Join(req));
        Box::pin(async move {
            request
                .await
                .unwrap_or_else(|e| Err(Error::Unreachable(e.to_string())))
        })
    }
}

/// A removal requested by `caller` that the router has authorised. Only the router makes these.
#[derive(Debug)]
pub struct Leave {
    pub caller: NodeId,
    pub req: LeaveRequest,
    _authorized: (),
}

impl Message for Leave {
    type Result = Result<()>;
}

impl Router {
    fn deliver_leave(&self, to: &Destination, leave: Leave) -> ResponseFuture<Result<()>> {
        let recipient = match self.resolve(to) {
            Ok(peer) => peer.leave.clone(),
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let request = recipient.send(leave);
        Box::pin(async move {
            request
                .await
                .unwrap_or_else(|e| Err(Error::Unreachable(e.to_string())))
        })
    }
}

/// A leave call made by the holder of `from`
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct RouteLeave {
    pub from: Registration,
    pub to: Destination,
    pub req: LeaveRequest,
}

impl Handler<RouteLeave> for Router {
    type Result = ResponseFuture<Result<()>>;

    fn handle(&mut self, RouteLeave { from, to, req }: RouteLeave, _ctx: &mut Self::Context) -> Self::Result {
        let caller = from.id;
        let authorized = self.is_current(&from) && self.authorizer.authorize_removal(caller, req.id);
        if !authorized {
            info!("R; refused removal of {} requested by {}", req.id, caller);
            let target = req.id;
            return Box::pin(async move { Err(Error::Unauthorized { caller, target }) });
        }
        let leave = Leave {
            caller,
            req,
            _authorized: (),
        };
        self.deliver_leave(&to, leave)
    }
}

/// Pass an authorised removal on to another node, the leader as far as the sender knows
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct ForwardLeave {
    pub to: NodeId,
    pub leave: Leave,
}

impl Handler<ForwardLeave> for Router {
    type Result = ResponseFuture<Result<()>>;

    fn handle(&mut self, ForwardLeave { to, leave }: ForwardLeave, _ctx: &mut Self::Context) -> Self::Result {
        debug!("R; removal of {} forwarded to {}", leave.req.id, to);
        self.deliver_leave(&Destination::Id(to), leave)
    }
}

/// Cut a node off from everyone else
#[derive(Message)]
#[rtype(result = "()")]
pub struct Isolate(pub NodeId);

impl Handler<Isolate> for Router {
    type Result = ();

    fn handle(&mut self, Isolate(id): Isolate, _ctx: &mut Self::Context) -> Self::Result {
        info!("R; isolating {}", id);
        self.isolated.insert(id);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Heal(pub NodeId);

impl Handler<Heal> for Router {
    type Result = ();

    fn handle(&mut self, Heal(id): Heal, _ctx: &mut Self::Context) -> Self::Result {
        info!("R; healing {}", id);
        self.isolated.remove(&id);
    }
}
