//! # Summary
//!
//! Periodic duties that depend on the local node's role.
//!
//! As group leader, the node polls its active peers for status and, once a
//! client has authenticated, reports what it collected. As meta-coordinator,
//! it announces itself across the cluster, polls the other group's leader to
//! keep `GroupState` fresh, flags the other group as partitioned when it has
//! been silent for too long, and starts periodic snapshots. Every node
//! answers status requests from its own group; only leaders answer foreign
//! ones.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::Config;
use crate::message::{Group, Message, NodeId, Status};
use crate::report::{Event, Sink};
use crate::sampler::{self, Sampler};
use crate::shared::{Nodes, Roles};
use crate::thread::{recovery::Recovery, snapshot, Rx, Tx};
use crate::transport::{Outbox, Scope};

#[derive(Debug)]
pub enum In {
    Request {
        from: NodeId,
        group: Group,
    },
    Response {
        from: NodeId,
        group: Group,
        status: Status,
    },
}

/// What the meta-coordinator knows about a remote group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupState {
    pub group: Group,
    pub active: bool,
    pub last_contact: Option<Instant>,
    pub leader: Option<NodeId>,
}

pub struct Coordinator {
    id: NodeId,
    group: Group,
    rx: Rx<In>,
    roles: Roles,
    nodes: Nodes,
    outbox: Outbox,
    recovery: Recovery,
    sampler: Arc<dyn Sampler>,
    snapshot_tx: Tx<snapshot::In>,
    sink: Arc<dyn Sink>,
    status_interval: Duration,
    poll_interval: Duration,
    snapshot_interval: Duration,
    group_timeout: Duration,
    collected: BTreeMap<NodeId, Status>,
    remote: GroupState,
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: Rx<In>,
        roles: Roles,
        nodes: Nodes,
        outbox: Outbox,
        recovery: Recovery,
        sampler: Arc<dyn Sampler>,
        snapshot_tx: Tx<snapshot::In>,
        sink: Arc<dyn Sink>,
        config: &Config,
    ) -> Self {
        let group = outbox.group();
        Coordinator {
            id: outbox.id(),
            group,
            rx,
            roles,
            nodes,
            outbox,
            recovery,
            sampler,
            snapshot_tx,
            sink,
            status_interval: config.status_interval,
            poll_interval: config.poll_interval,
            snapshot_interval: config.snapshot_interval,
            group_timeout: config.group_timeout,
            collected: BTreeMap::new(),
            remote: GroupState { group: group.other(), active: false, last_contact: None, leader: None },
        }
    }

    pub async fn run(mut self) {
        let mut status = ticker(self.status_interval);
        let mut poll = ticker(self.poll_interval);
        let mut snapshot = ticker(self.snapshot_interval);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                | Some(message) => self.respond(message).await,
                | None => return,
                },
                _ = status.tick() => self.tick_status().await,
                _ = poll.tick() => self.tick_poll().await,
                _ = snapshot.tick() => self.tick_snapshot(),
            }
        }
    }

    fn status(&self) -> Status {
        sampler::status(self.id, &*self.sampler, self.outbox.clock().now())
    }

    async fn respond(&mut self, message: In) {
        match message {
        | In::Request { from, group } => {
            if group != self.group && !self.roles.is_leader() {
                trace!("ignoring foreign status request from {}", from);
                return
            }
            let response = Message::StatusResponse(self.status());
            if let Err(error) = self.outbox.send(from, response).await {
                debug!("status response to {} lost: {}", from, error);
            }
        }
        | In::Response { from, group, status } if group == self.group => {
            if self.recovery.is_tracked(from) {
                self.recovery.register_recovery(from);
            }
            self.collected.insert(from, status);
        }
        | In::Response { from, group, .. } => {
            if !self.remote.active {
                info!("contact with group {} established through {}", group, from);
            }
            self.remote.active = true;
            self.remote.last_contact = Some(Instant::now());
            self.remote.leader = Some(from);
        }
        }
    }

    /// Reports the previous round of group status, then starts the next one.
    async fn tick_status(&mut self) {
        let collected = std::mem::take(&mut self.collected);
        if !self.roles.is_leader() {
            return
        }
        if self.roles.is_authenticated() {
            let mut statuses = vec![self.status()];
            statuses.extend(collected.into_values());
            self.sink.emit(self.id, Event::StatusReport { leader: self.id, statuses });
        }
        let peers = self.nodes.read().active();
        for peer in peers {
            if let Err(error) = self.outbox.send(peer, Message::StatusRequest).await {
                debug!("status request to {} failed: {}", peer, error);
                self.recovery.register_failure(peer);
            }
        }
    }

    async fn tick_poll(&mut self) {
        if !self.roles.is_meta() {
            return
        }
        self.outbox.broadcast(Scope::CrossGroup, Message::MetaHeartbeat).await;
        self.outbox.broadcast(Scope::Remote, Message::StatusRequest).await;

        let silent = self.remote.last_contact
            .map_or(false, |contact| Instant::now().duration_since(contact) > self.group_timeout);
        if self.remote.active && silent {
            warn!(
                "group {} silent for over {:?}; last leader {:?}",
                self.remote.group, self.group_timeout, self.remote.leader,
            );
            self.remote.active = false;
            self.sink.emit(self.id, Event::Partition { group: self.remote.group });
        }
    }

    fn tick_snapshot(&self) {
        if self.roles.is_meta() {
            self.snapshot_tx.send(snapshot::In::Initiate);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::clock::Clock;
    use crate::config::Cluster;
    use crate::internal;
    use crate::message::Envelope;
    use crate::sampler::{Fixed, Usage};
    use crate::transport::memory::Network;

    struct Fixture {
        tx: internal::Tx<In>,
        roles: Roles,
        network: Network,
        inboxes: BTreeMap<NodeId, internal::Rx<Envelope>>,
        snapshot_rx: internal::Rx<snapshot::In>,
        events: internal::Rx<(NodeId, Event)>,
    }

    fn spawn(id: NodeId, leader: NodeId) -> Fixture {
        let config = Config::default().with_polling(
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let cluster = Cluster::classic();
        let spec = cluster.group_of(id).unwrap().clone();
        let network = Network::new();
        let (transport, _) = network.connect(id);
        let inboxes = cluster.ids()
            .into_iter()
            .filter(|peer| *peer != id)
            .map(|peer| (peer, network.connect(peer).1))
            .collect();
        let outbox = Outbox::new(id, spec.group, Arc::new(Clock::new()), Arc::new(cluster), Arc::new(transport));
        let roles = Roles::new(id, Some(leader));
        let nodes = Nodes::new(id, &spec.ids());
        let (events, sink) = internal::new();
        let sink: Arc<dyn Sink> = Arc::new(sink);
        let recovery = Recovery::new(id, 1000, sink.clone());
        let sampler = Arc::new(Fixed(Usage { cpu_percent: 12, mem_percent: 34 }));
        let (snapshot_rx, snapshot_tx) = internal::new();
        let (rx, tx) = internal::new();
        let coordinator = Coordinator::new(
            rx, roles.clone(), nodes, outbox, recovery, sampler, snapshot_tx, sink, &config,
        );
        tokio::spawn(coordinator.run());
        Fixture { tx, roles, network, inboxes, snapshot_rx, events }
    }

    fn drain(inbox: &mut internal::Rx<Envelope>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(envelope) = inbox.try_recv() {
            messages.push(envelope.message);
        }
        messages
    }

    #[tokio::test(start_paused = true)]
    async fn leader_polls_group_and_reports_when_authenticated() {
        let mut fixture = spawn(3, 3);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(drain(fixture.inboxes.get_mut(&1).unwrap()), vec![Message::StatusRequest]);
        assert!(drain(fixture.inboxes.get_mut(&4).unwrap()).is_empty());
        assert!(fixture.events.try_recv().is_none());

        fixture.roles.set_authenticated(true);
        let status = Status { node: 1, cpu_percent: 1, mem_percent: 2, clock: 3 };
        fixture.tx.send(In::Response { from: 1, group: Group::A, status: status.clone() });
        tokio::time::sleep(Duration::from_secs(10)).await;
        match fixture.events.try_recv() {
        | Some((3, Event::StatusReport { leader: 3, statuses })) => {
            assert_eq!(statuses.len(), 2);
            assert_eq!(statuses[0].cpu_percent, 12);
            assert_eq!(statuses[1], status);
        }
        | other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn followers_answer_only_their_own_group() {
        let mut fixture = spawn(2, 3);
        fixture.tx.send(In::Request { from: 5, group: Group::B });
        fixture.tx.send(In::Request { from: 1, group: Group::A });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(fixture.inboxes.get_mut(&5).unwrap()).is_empty());
        match drain(fixture.inboxes.get_mut(&1).unwrap()).as_slice() {
        | [Message::StatusResponse(status)] => assert_eq!(status.node, 2),
        | other => panic!("unexpected messages {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn meta_polls_remote_group_and_detects_partition() {
        let mut fixture = spawn(6, 6);
        fixture.roles.set_meta(true);
        let status = Status { node: 3, cpu_percent: 0, mem_percent: 0, clock: 0 };
        fixture.tx.send(In::Response { from: 3, group: Group::A, status });

        tokio::time::sleep(Duration::from_secs(31)).await;
        let polled = drain(fixture.inboxes.get_mut(&3).unwrap());
        assert!(polled.contains(&Message::MetaHeartbeat));
        assert!(polled.contains(&Message::StatusRequest));
        assert!(drain(fixture.inboxes.get_mut(&4).unwrap()).contains(&Message::MetaHeartbeat));

        fixture.network.crash(3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        let partition = std::iter::from_fn(|| fixture.events.try_recv())
            .filter(|(_, event)| *event == Event::Partition { group: Group::A })
            .count();
        assert_eq!(partition, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn meta_starts_periodic_snapshots() {
        let mut fixture = spawn(6, 6);
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(fixture.snapshot_rx.try_recv().is_none());
        fixture.roles.set_meta(true);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(matches!(fixture.snapshot_rx.try_recv(), Some(snapshot::In::Initiate)));
    }
}
