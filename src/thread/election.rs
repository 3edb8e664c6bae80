//! # Summary
//!
//! Both leader election algorithms implement `GroupElection` and run under
//! the same driver task, which feeds them triggers and protocol messages and
//! fires their timer. Everything around the algorithm itself lives in
//! `Context`: sending with failure bookkeeping, adopting a leader, and
//! handing a freshly won leadership to the meta-coordinator election.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::message::{self, Group, Message, NodeId};
use crate::report::{Event, Sink};
use crate::shared::{Nodes, Roles};
use crate::thread::{self, meta, recovery::Recovery, Rx, Tx};
use crate::transport::Outbox;

#[derive(Debug)]
pub enum In {
    /// Leader presumed dead; start an election
    Trigger,
    Message(NodeId, message::Election),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Electing,
    WaitingAck,
    Coordinator,
}

#[async_trait]
pub trait GroupElection: Send {
    fn state(&self) -> State;

    /// Pending timer, if any.
    fn deadline(&self) -> Option<Instant>;

    /// Starts an election. A no-op while one is already running.
    async fn trigger(&mut self);

    async fn respond(&mut self, from: NodeId, message: message::Election);

    /// Called once the deadline passes.
    async fn expire(&mut self);
}

/// Runs `election` until its channel closes.
pub async fn run<E: GroupElection>(mut election: E, mut rx: Rx<In>) {
    loop {
        let deadline = election.deadline();
        tokio::select! {
            message = rx.recv() => match message {
            | Some(In::Trigger) => election.trigger().await,
            | Some(In::Message(from, message)) => {
                trace!("received {:?} from {}", message, from);
                election.respond(from, message).await
            }
            | None => return,
            },
            _ = thread::wait(deadline) => election.expire().await,
        }
    }
}

/// Surroundings shared by both algorithms.
pub struct Context {
    pub id: NodeId,
    pub group: Group,
    pub outbox: Outbox,
    pub nodes: Nodes,
    pub roles: Roles,
    pub recovery: Recovery,
    pub meta_tx: Tx<meta::In>,
    pub sink: Arc<dyn Sink>,
}

impl Context {

    /// Sends an election message. A failed send marks the peer inactive and
    /// registers the failure; returns whether the send succeeded.
    pub async fn send(&self, to: NodeId, message: message::Election) -> bool {
        match self.outbox.send(to, Message::Election(message)).await {
        | Ok(()) => true,
        | Err(error) => {
            debug!("election send to {} failed: {}", to, error);
            if self.nodes.write().mark_inactive(to) {
                info!("marking {} inactive", to);
            }
            self.recovery.register_failure(to);
            false
        }
        }
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.nodes.read().is_active(id)
    }

    /// Active peers in ascending id order.
    pub fn active(&self) -> Vec<NodeId> {
        self.nodes.read().active()
    }

    /// Records `leader` as the group leader. Winning leadership starts one
    /// meta-coordinator round; losing it gives up the meta-coordinator role.
    pub fn adopt(&self, leader: NodeId) {
        let previous = self.roles.set_leader(leader);
        if previous == Some(leader) {
            return
        }
        info!("adopting {} as group {} leader", leader, self.group);
        self.sink.emit(self.id, Event::LeaderElected { group: self.group, leader });
        if leader == self.id {
            self.meta_tx.send(meta::In::Start);
        } else if previous == Some(self.id) && self.roles.set_meta(false) {
            info!("lost group leadership; leaving meta-coordinator role");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {

    use super::*;
    use crate::clock::Clock;
    use crate::config::Cluster;
    use crate::internal;
    use crate::message::Envelope;
    use crate::transport::memory::Network;

    /// The peer side of a test context: inboxes of the group peers plus the
    /// meta-election and event channels.
    pub(crate) struct Fixture {
        pub network: Network,
        pub inboxes: Vec<(NodeId, internal::Rx<Envelope>)>,
        pub meta_rx: internal::Rx<meta::In>,
        pub events: internal::Rx<(NodeId, Event)>,
    }

    /// A context for `id` of the classic cluster.
    pub(crate) fn fixture(id: NodeId) -> (Context, Fixture) {
        let cluster = Cluster::classic();
        let spec = cluster.group_of(id).unwrap().clone();
        let network = Network::new();
        let (transport, _) = network.connect(id);
        let inboxes = spec.ids()
            .into_iter()
            .filter(|peer| *peer != id)
            .map(|peer| (peer, network.connect(peer).1))
            .collect();
        let (meta_rx, meta_tx) = internal::new();
        let (events, sink) = internal::new();
        let sink: Arc<dyn Sink> = Arc::new(sink);
        let context = Context {
            id,
            group: spec.group,
            outbox: Outbox::new(id, spec.group, Arc::new(Clock::new()), Arc::new(cluster), Arc::new(transport)),
            nodes: Nodes::new(id, &spec.ids()),
            roles: Roles::new(id, spec.initial_leader()),
            recovery: Recovery::new(id, 1000, sink.clone()),
            meta_tx,
            sink,
        };
        (context, Fixture { network, inboxes, meta_rx, events })
    }

    impl Fixture {
        /// Next election message delivered to `peer`, if one is queued.
        pub(crate) fn take(&mut self, peer: NodeId) -> Option<message::Election> {
            let (_, inbox) = self.inboxes.iter_mut().find(|(id, _)| *id == peer)?;
            match inbox.try_recv()?.message {
            | Message::Election(election) => Some(election),
            | _ => None,
            }
        }
    }

    #[tokio::test]
    async fn failed_send_marks_inactive_and_registers() {
        let (context, fixture) = fixture(1);
        fixture.network.crash(3);
        assert!(!context.send(3, message::Election::Call).await);
        assert!(!context.is_active(3));
        assert!(context.recovery.is_tracked(3));
        assert!(context.send(2, message::Election::Call).await);
    }

    #[tokio::test]
    async fn winning_leadership_starts_one_meta_round() {
        let (context, mut fixture) = fixture(2);
        context.adopt(2);
        context.adopt(2);
        assert!(matches!(fixture.meta_rx.try_recv(), Some(meta::In::Start)));
        assert!(fixture.meta_rx.try_recv().is_none());
        assert_eq!(
            fixture.events.try_recv(),
            Some((2, Event::LeaderElected { group: Group::A, leader: 2 })),
        );
    }

    #[tokio::test]
    async fn losing_leadership_drops_meta_role() {
        let (context, _fixture) = fixture(3);
        context.roles.set_meta(true);
        context.adopt(2);
        assert!(!context.roles.is_meta());
        assert_eq!(context.roles.leader(), Some(2));
    }
}
