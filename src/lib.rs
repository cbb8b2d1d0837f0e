//! A replicated log consensus core.
//!
//! The deterministic heart is [`server::Server`]: every state transition goes through
//! [`server::Server::step`] or [`server::Server::tick`], and the outbound messages it
//! produces are collected rather than sent. [`node::Node`] wraps a server in an actor so
//! that concurrent callers are serialised through one mailbox, and [`transport::Router`]
//! moves messages between nodes.

/// Process-lifetime-stable identity of a cluster member, distinct from its network address.
pub type NodeId = u64;
/// Time is divided into terms, and each term begins with an election. After a successful election, a single leader
/// manages the cluster until the end of the term. Some elections fail, in which case the term ends without choosing
/// a leader. The transitions between terms may be observed at different times on different servers.
pub type Term = u64;

pub mod config;
pub mod error;
pub mod log;
pub mod membership;
pub mod node;
pub mod progress;
pub mod rpc;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result, StorageError};
pub use self::log::{Entry, LogIndex, Payload};
pub use membership::{ConfigChange, Member, Membership, Role};
pub use node::Node;
pub use server::{Applied, Server, Status};
pub use snapshot::Snapshot;
pub use state::{HardState, States};
pub use state_machine::StateMachine;
pub use storage::{FileStorage, MemStorage, Storage};
pub use transport::Router;
