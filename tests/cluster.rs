//! Clusters of node actors talking through the router, with storage on disk.
//!
//! Nodes are configured without a tick interval and the tests tick them by hand, leaving a moment after each round
//! for the messages it caused to be delivered.

use actix::prelude::*;
use log::info;
use replog::node::{
    AddMember, GetStatus, Inspect, IsLeader, JoinCluster, LeaveCluster, Members, Node, Propose, RequestRemoval,
    Shutdown, Tick, TransferLeadership,
};
use replog::transport::{Destination, Heal, Isolate};
use replog::{Config, Error, FileStorage, NodeId, Role, Router, Server};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

type AppliedCommands = Vec<Vec<u8>>;
type TestNode = Node<AppliedCommands, FileStorage>;

fn addr(id: NodeId) -> String {
    format!("node-{}", id)
}

fn config(id: NodeId) -> Config {
    Config {
        id,
        seed: Some(id),
        tick_interval_ms: None,
        proposal_timeout_ms: 300,
        ..Config::default()
    }
}

struct Cluster {
    dir: TempDir,
    router: Addr<Router>,
    nodes: BTreeMap<NodeId, Addr<TestNode>>,
}

impl Cluster {
    /// Must be called from inside a running system
    fn new() -> Self {
        Cluster {
            dir: TempDir::new().unwrap(),
            router: Router::new().start(),
            nodes: BTreeMap::new(),
        }
    }

    fn storage(&self, id: NodeId) -> FileStorage {
        FileStorage::open(self.dir.path().join(id.to_string())).unwrap()
    }

    fn start(&mut self, id: NodeId, server: Server<AppliedCommands, FileStorage>) -> Addr<TestNode> {
        let node = Node::new(server, addr(id), self.router.clone()).start();
        self.nodes.insert(id, node.clone());
        node
    }

    fn init(&mut self, id: NodeId) -> Addr<TestNode> {
        let server = Server::init(config(id), addr(id), self.storage(id), vec![]).unwrap();
        self.start(id, server)
    }

    fn fresh(&mut self, id: NodeId) -> Addr<TestNode> {
        let server = Server::join(config(id), self.storage(id), vec![]).unwrap();
        self.start(id, server)
    }

    fn restart(&mut self, id: NodeId) -> Addr<TestNode> {
        let server = Server::restart(config(id), self.storage(id), vec![]).unwrap();
        self.start(id, server)
    }

    fn node(&self, id: NodeId) -> &Addr<TestNode> {
        &self.nodes[&id]
    }

    async fn stop(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            let _ = node.send(Shutdown).await;
        }
    }

    async fn tick(&self) {
        for node in self.nodes.values() {
            let _ = node.send(Tick).await;
        }
        sleep(Duration::from_millis(2)).await;
    }

    async fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }

    async fn leader(&self) -> Option<NodeId> {
        for (&id, node) in &self.nodes {
            if let Ok(true) = node.send(IsLeader).await {
                return Some(id);
            }
        }
        None
    }

    async fn wait_for_leader(&self) -> NodeId {
        for _ in 0..300 {
            if let Some(id) = self.leader().await {
                return id;
            }
            self.tick().await;
        }
        panic!("no leader elected");
    }

    async fn join(&mut self, id: NodeId, via: NodeId) {
        let node = self.fresh(id);
        let res = node.send(JoinCluster { via: addr(via) }).await.unwrap().unwrap();
        info!("{} joined, leader {}", id, res.leader);
        assert!(res.members.iter().any(|m| m.id == id));
        self.ticks(3).await;
    }

    /// A cluster of `n` nodes started on node 1, each other node joining through node 1
    async fn of(n: NodeId) -> Self {
        let mut cluster = Cluster::new();
        cluster.init(1);
        cluster.wait_for_leader().await;
        for id in 2..=n {
            cluster.join(id, 1).await;
        }
        cluster
    }

    async fn applied(&self, id: NodeId) -> AppliedCommands {
        let inspect: Inspect<AppliedCommands, AppliedCommands> =
            Inspect(Box::new(|sm: &AppliedCommands| sm.clone()));
        self.node(id).send(inspect).await.unwrap()
    }

    async fn wait_applied(&self, id: NodeId, command: &[u8]) -> bool {
        for _ in 0..100 {
            if self.applied(id).await.iter().any(|c| c == command) {
                return true;
            }
            self.tick().await;
        }
        false
    }
}

#[test]
fn bootstrap_and_join_through_a_follower() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(2).await;
        // node 2 is a follower, it passes the join on to the leader
        cluster.join(3, 2).await;
        let leader = cluster.wait_for_leader().await;
        assert_eq!(leader, 1);
        for id in 1..=3 {
            let members = cluster.node(id).send(Members).await.unwrap();
            assert_eq!(members.len(), 3, "members seen by {}", id);
            let status = cluster.node(id).send(GetStatus).await.unwrap();
            assert_eq!(status.leader, Some(1));
        }
    });
}

#[test]
fn proposals_apply_everywhere() {
    System::new().block_on(async {
        let cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        let applied = cluster
            .node(leader)
            .send(Propose(b"hello".to_vec()))
            .await
            .unwrap()
            .unwrap();
        let status = cluster.node(leader).send(GetStatus).await.unwrap();
        assert!(status.commit >= applied.index);
        assert_eq!(status.term, applied.term);
        for id in 1..=3 {
            assert!(cluster.wait_applied(id, b"hello").await, "not applied on {}", id);
        }

        let follower = (1..=3).find(|&id| id != leader).unwrap();
        let refused = cluster.node(follower).send(Propose(b"nope".to_vec())).await.unwrap();
        assert!(matches!(refused, Err(Error::NotLeader { leader: Some(l) }) if l == leader));
    });
}

#[test]
fn proposal_times_out_without_a_quorum() {
    System::new().block_on(async {
        let cluster = Cluster::of(5).await;
        let leader = cluster.wait_for_leader().await;
        let cut_off: Vec<NodeId> = (1..=5).filter(|&id| id != leader).take(3).collect();
        let survivor = (1..=5).find(|&id| id != leader && !cut_off.contains(&id)).unwrap();
        for &id in &cut_off {
            cluster.router.send(Isolate(id)).await.unwrap();
        }
        let result = cluster
            .node(leader)
            .send(Propose(b"in doubt".to_vec()))
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, Error::ClusterUnavailable));
        assert!(err.is_uncertain());
        for id in [leader, survivor] {
            assert!(!cluster.applied(id).await.iter().any(|c| c == b"in doubt"));
        }

        // the entry is still in the leader's log and commits once the others are back
        for &id in &cut_off {
            cluster.router.send(Heal(id)).await.unwrap();
        }
        let new_leader = cluster.wait_for_leader().await;
        if new_leader == leader {
            assert!(cluster.wait_applied(survivor, b"in doubt").await);
        }
    });
}

#[test]
fn members_may_only_remove_themselves() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        let follower = (1..=3).find(|&id| id != leader).unwrap();

        let refused = cluster
            .node(follower)
            .send(RequestRemoval {
                via: Destination::Id(leader),
                id: leader,
            })
            .await
            .unwrap();
        assert!(matches!(
            refused,
            Err(Error::Unauthorized { caller, target }) if caller == follower && target == leader
        ));
        assert_eq!(cluster.node(leader).send(Members).await.unwrap().len(), 3);

        // leaving through a follower's address reaches the leader
        let other = (1..=3).find(|&id| id != leader && id != follower).unwrap();
        cluster
            .node(follower)
            .send(LeaveCluster {
                via: Destination::Addr(addr(other)),
            })
            .await
            .unwrap()
            .unwrap();
        cluster.ticks(3).await;
        let members = cluster.node(leader).send(Members).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.id != follower));

        cluster.stop(follower).await;
        cluster
            .node(leader)
            .send(Propose(b"two left".to_vec()))
            .await
            .unwrap()
            .unwrap();
    });
}

#[test]
fn leader_leaves_and_the_rest_carry_on() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(3).await;
        let old = cluster.wait_for_leader().await;
        cluster
            .node(old)
            .send(LeaveCluster {
                via: Destination::Id(old),
            })
            .await
            .unwrap()
            .unwrap();
        // the old leader stops itself once its removal is applied
        cluster.nodes.remove(&old);
        let leader = cluster.wait_for_leader().await;
        assert_ne!(leader, old);
        let members = cluster.node(leader).send(Members).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.id != old));
        cluster
            .node(leader)
            .send(Propose(b"after the leader left".to_vec()))
            .await
            .unwrap()
            .unwrap();
        for &id in cluster.nodes.keys() {
            assert!(cluster.wait_applied(id, b"after the leader left").await);
        }
    });
}

#[test]
fn member_added_before_it_is_reachable_catches_up() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        // node 4 is in the configuration before anything listens at its address
        cluster
            .node(leader)
            .send(AddMember {
                id: 4,
                addr: addr(4),
                role: Role::Voter,
            })
            .await
            .unwrap()
            .unwrap();
        cluster
            .node(leader)
            .send(Propose(b"while 4 is away".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert!(!cluster.nodes.contains_key(&4));

        cluster.fresh(4);
        assert!(cluster.wait_applied(4, b"while 4 is away").await);
        let members = cluster.node(4).send(Members).await.unwrap();
        assert_eq!(members.len(), 4);
        assert_eq!(cluster.applied(4).await, cluster.applied(leader).await);
    });
}

#[test]
fn node_restarted_at_once_stays_reachable() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        let follower = (1..=3).find(|&id| id != leader).unwrap();
        // the old actor unregisters while the new one has already registered
        cluster.stop(follower).await;
        cluster.restart(follower);
        cluster.ticks(3).await;
        cluster
            .node(leader)
            .send(Propose(b"after the bounce".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert!(cluster.wait_applied(follower, b"after the bounce").await);
        assert!(cluster
            .node(follower)
            .send(LeaveCluster {
                via: Destination::Id(leader),
            })
            .await
            .unwrap()
            .is_ok());
    });
}

#[test]
fn restart_from_disk_catches_up() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        let follower = (1..=3).find(|&id| id != leader).unwrap();
        cluster
            .node(leader)
            .send(Propose(b"before".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert!(cluster.wait_applied(follower, b"before").await);

        cluster.stop(follower).await;
        cluster
            .node(leader)
            .send(Propose(b"while down".to_vec()))
            .await
            .unwrap()
            .unwrap();

        cluster.restart(follower);
        let status = cluster.node(follower).send(GetStatus).await.unwrap();
        assert_eq!(status.members.len(), 3);
        assert!(cluster.wait_applied(follower, b"while down").await);
        assert_eq!(cluster.applied(follower).await, cluster.applied(leader).await);
    });
}

#[test]
fn force_new_cluster_from_one_survivor() {
    System::new().block_on(async {
        let mut cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        cluster
            .node(leader)
            .send(Propose(b"survives".to_vec()))
            .await
            .unwrap()
            .unwrap();
        cluster.ticks(2).await;
        for id in 1..=3 {
            cluster.stop(id).await;
        }

        let survivor = 3;
        let server = Server::force_new_cluster(config(survivor), addr(survivor), cluster.storage(survivor), vec![])
            .unwrap();
        cluster.start(survivor, server);
        assert_eq!(cluster.wait_for_leader().await, survivor);
        let members = cluster.node(survivor).send(Members).await.unwrap();
        assert_eq!(members.len(), 1);

        cluster.join(4, survivor).await;
        assert!(cluster.wait_applied(4, b"survives").await);
        cluster
            .node(survivor)
            .send(Propose(b"grown again".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert!(cluster.wait_applied(4, b"grown again").await);
    });
}

#[test]
fn leadership_moves_on_request() {
    System::new().block_on(async {
        let cluster = Cluster::of(3).await;
        let leader = cluster.wait_for_leader().await;
        let target = (1..=3).find(|&id| id != leader).unwrap();
        cluster
            .node(leader)
            .send(TransferLeadership(target))
            .await
            .unwrap()
            .unwrap();
        cluster.ticks(3).await;
        assert!(cluster.node(target).send(IsLeader).await.unwrap());
        assert!(!cluster.node(leader).send(IsLeader).await.unwrap());
    });
}
