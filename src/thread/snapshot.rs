//! # Summary
//!
//! Chandy-Lamport snapshot coordinator.
//!
//! A round starts either when the local meta-coordinator initiates one or
//! when the first marker of an unseen round arrives. Starting a round
//! records the local logical clock as the local state and sends a marker on
//! every outbound channel. Until a channel's own marker arrives, every
//! message received on it is buffered as that channel's recorded state.
//! The round ends when every channel is marked, or when the timeout fires,
//! in which case the unmarked channels are reported as unknown.
//!
//! All round state is owned by this task. Inbound messages are forwarded
//! here by the node dispatcher in arrival order, so marker and message
//! order per channel is preserved.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap as Map;
use tokio::time::Instant;

use crate::message::{Message, NodeId, SnapshotId};
use crate::report::{Event, Sink};
use crate::shared::Roles;
use crate::thread::{self, Rx};
use crate::transport::{Outbox, Scope};

#[derive(Debug)]
pub enum In {
    /// Start a round if this node is the active meta-coordinator
    Initiate,
    Marker {
        from: NodeId,
        snapshot: SnapshotId,
        state: u64,
    },
    /// Non-marker traffic received on the channel from `from`
    Record {
        from: NodeId,
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Messages in flight when the snapshot was taken, possibly none
    Recorded(Vec<String>),

    /// Marker never arrived before the timeout
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotReport {
    pub snapshot: SnapshotId,
    pub node: NodeId,
    pub initiator: bool,
    pub local_state: u64,

    /// Recorded state of every node whose marker reached this node
    pub node_states: BTreeMap<NodeId, Option<u64>>,

    /// Incoming channels, keyed by sender
    pub channels: BTreeMap<NodeId, ChannelState>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl SnapshotReport {
    pub fn unknown(&self) -> Vec<NodeId> {
        self.channels.iter()
            .filter(|(_, state)| **state == ChannelState::Unknown)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl std::fmt::Display for SnapshotReport {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "snapshot {} local state {}: {} of {} channels recorded in {:?}",
            self.snapshot,
            self.local_state,
            self.channels.len() - self.unknown().len(),
            self.channels.len(),
            self.duration,
        )?;
        if self.timed_out {
            write!(fmt, ", unknown {:?}", self.unknown())?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Channel {
    marked: bool,
    buffered: Vec<String>,
}

#[derive(Debug)]
struct Round {
    id: SnapshotId,
    started: Instant,
    deadline: Instant,
    local: u64,
    channels: BTreeMap<NodeId, Channel>,
    states: BTreeMap<NodeId, Option<u64>>,
}

impl Round {
    fn is_complete(&self) -> bool {
        self.channels.values().all(|channel| channel.marked)
    }
}

pub struct Snapshot {
    id: NodeId,
    rx: Rx<In>,
    roles: Roles,
    outbox: Outbox,
    sink: Arc<dyn Sink>,
    timeout: Duration,
    channels: Vec<NodeId>,
    round: Option<Round>,
    sequence: u64,
    /// Highest finished sequence per initiator.
    finished: Map<NodeId, u64>,
}

impl Snapshot {
    pub fn new(rx: Rx<In>, roles: Roles, outbox: Outbox, sink: Arc<dyn Sink>, timeout: Duration) -> Self {
        let channels = outbox.targets(Scope::CrossGroup);
        Snapshot {
            id: outbox.id(),
            rx,
            roles,
            outbox,
            sink,
            timeout,
            channels,
            round: None,
            sequence: 0,
            finished: Map::default(),
        }
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.round.as_ref().map(|round| round.deadline);
            tokio::select! {
                message = self.rx.recv() => match message {
                | Some(message) => self.respond(message).await,
                | None => return,
                },
                _ = thread::wait(deadline) => self.complete(true),
            }
        }
    }

    async fn respond(&mut self, message: In) {
        match message {
        | In::Initiate => self.respond_initiate().await,
        | In::Marker { from, snapshot, state } => self.respond_marker(from, snapshot, state).await,
        | In::Record { from, message } => self.respond_record(from, message),
        }
    }

    async fn respond_initiate(&mut self) {
        if !self.roles.is_meta() {
            debug!("not meta-coordinator; ignoring snapshot request");
            return
        }
        if let Some(round) = &self.round {
            debug!("snapshot {} already in progress", round.id);
            return
        }
        self.sequence += 1;
        let snapshot = SnapshotId { initiator: self.id, sequence: self.sequence };
        info!("initiating snapshot {}", snapshot);
        self.start(snapshot, None).await;
    }

    async fn respond_marker(&mut self, from: NodeId, snapshot: SnapshotId, state: u64) {
        debug!("received marker for {} from {}", snapshot, from);
        if self.round.is_none() {
            if self.is_finished(snapshot) {
                debug!("late marker for finished snapshot {}", snapshot);
            } else {
                self.start(snapshot, Some((from, state))).await;
            }
            return
        }
        let round = match self.round.as_mut() {
        | Some(round) if round.id == snapshot => round,
        | Some(round) => {
            debug!("ignoring marker for {} during {}", snapshot, round.id);
            return
        }
        | None => return,
        };
        match round.channels.get_mut(&from) {
        | Some(channel) if !channel.marked => {
            channel.marked = true;
            round.states.insert(from, Some(state));
        }
        | Some(_) => debug!("duplicate marker from {}", from),
        | None => debug!("marker on unknown channel {}", from),
        }
        if round.is_complete() {
            self.complete(false);
        }
    }

    fn is_finished(&self, snapshot: SnapshotId) -> bool {
        self.finished
            .get(&snapshot.initiator)
            .map_or(false, |highest| snapshot.sequence <= *highest)
    }

    fn respond_record(&mut self, from: NodeId, message: String) {
        if let Some(round) = &mut self.round {
            if let Some(channel) = round.channels.get_mut(&from) {
                if !channel.marked {
                    channel.buffered.push(message);
                }
            }
        }
    }

    /// Records local state, then sends markers on every outbound channel.
    async fn start(&mut self, snapshot: SnapshotId, first: Option<(NodeId, u64)>) {
        let now = Instant::now();
        let local = self.outbox.clock().now();
        let mut channels = self.channels.iter()
            .map(|id| (*id, Channel::default()))
            .collect::<BTreeMap<_, _>>();
        let mut states = self.channels.iter()
            .map(|id| (*id, None))
            .collect::<BTreeMap<_, _>>();
        states.insert(self.id, Some(local));
        if let Some((from, state)) = first {
            if let Some(channel) = channels.get_mut(&from) {
                channel.marked = true;
            }
            states.insert(from, Some(state));
        }
        self.round = Some(Round {
            id: snapshot,
            started: now,
            deadline: now + self.timeout,
            local,
            channels,
            states,
        });

        for peer in self.channels.clone() {
            let marker = Message::Marker { snapshot, state: local };
            if let Err(error) = self.outbox.send(peer, marker).await {
                debug!("marker to {} lost: {}", peer, error);
            }
        }

        if self.round.as_ref().map_or(false, Round::is_complete) {
            self.complete(false);
        }
    }

    fn complete(&mut self, timed_out: bool) {
        let round = match self.round.take() {
        | Some(round) => round,
        | None => return,
        };
        let highest = self.finished.entry(round.id.initiator).or_insert(0);
        *highest = (*highest).max(round.id.sequence);
        let channels = round.channels
            .into_iter()
            .map(|(id, channel)| {
                let state = if channel.marked {
                    ChannelState::Recorded(channel.buffered)
                } else {
                    ChannelState::Unknown
                };
                (id, state)
            })
            .collect();
        let report = SnapshotReport {
            snapshot: round.id,
            node: self.id,
            initiator: round.id.initiator == self.id,
            local_state: round.local,
            node_states: round.states,
            channels,
            duration: Instant::now().duration_since(round.started),
            timed_out,
        };
        self.sink.emit(self.id, Event::Snapshot(report));
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::clock::Clock;
    use crate::config::{Algorithm, Cluster, GroupSpec, Member};
    use crate::internal;
    use crate::message::{Envelope, Group};
    use crate::transport::memory::Network;

    fn cluster() -> Cluster {
        let members = |ids: &[NodeId]| ids.iter().map(|id| Member { id: *id, address: None }).collect();
        Cluster {
            groups: vec![
                GroupSpec { group: Group::A, algorithm: Algorithm::Priority, members: members(&[1, 2, 3]) },
                GroupSpec { group: Group::B, algorithm: Algorithm::Ring, members: members(&[4, 5]) },
            ],
        }
    }

    struct Harness {
        tx: internal::Tx<In>,
        events: internal::Rx<(NodeId, Event)>,
        inboxes: Vec<internal::Rx<Envelope>>,
        roles: Roles,
    }

    fn spawn(id: NodeId, timeout: Duration) -> Harness {
        let network = Network::new();
        let (transport, _) = network.connect(id);
        let inboxes = cluster().ids()
            .into_iter()
            .filter(|peer| *peer != id)
            .map(|peer| network.connect(peer).1)
            .collect();
        let outbox = Outbox::new(id, Group::A, Arc::new(Clock::new()), Arc::new(cluster()), Arc::new(transport));
        let roles = Roles::new(id, Some(3));
        let (rx, tx) = internal::new();
        let (events, sink) = internal::new();
        tokio::spawn(Snapshot::new(rx, roles.clone(), outbox, Arc::new(sink), timeout).run());
        Harness { tx, events, inboxes, roles }
    }

    async fn report(events: &mut internal::Rx<(NodeId, Event)>) -> SnapshotReport {
        loop {
            match events.recv().await {
            | Some((_, Event::Snapshot(report))) => return report,
            | Some(_) => continue,
            | None => panic!("sink closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channels_become_unknown_at_timeout() {
        let mut harness = spawn(1, Duration::from_secs(15));
        harness.roles.set_meta(true);
        let snapshot = SnapshotId { initiator: 1, sequence: 1 };

        harness.tx.send(In::Initiate);
        harness.tx.send(In::Record { from: 2, message: "application".to_string() });
        harness.tx.send(In::Marker { from: 2, snapshot, state: 4 });
        harness.tx.send(In::Record { from: 2, message: "after marker".to_string() });
        harness.tx.send(In::Marker { from: 3, snapshot, state: 7 });

        let report = report(&mut harness.events).await;
        assert!(report.timed_out);
        assert!(report.initiator);
        assert!(report.duration >= Duration::from_secs(15));
        assert_eq!(report.channels[&2], ChannelState::Recorded(vec!["application".to_string()]));
        assert_eq!(report.channels[&3], ChannelState::Recorded(Vec::new()));
        assert_eq!(report.unknown(), vec![4, 5]);
        assert_eq!(report.node_states[&3], Some(7));
        assert_eq!(report.node_states[&4], None);
    }

    #[tokio::test(start_paused = true)]
    async fn first_marker_records_and_forwards() {
        let mut harness = spawn(2, Duration::from_secs(15));
        let snapshot = SnapshotId { initiator: 1, sequence: 1 };

        harness.tx.send(In::Marker { from: 1, snapshot, state: 3 });
        for inbox in &mut harness.inboxes {
            let envelope = inbox.recv().await.unwrap();
            assert_eq!(envelope.message, Message::Marker { snapshot, state: 0 });
        }
        for from in &[3, 4, 5] {
            harness.tx.send(In::Marker { from: *from, snapshot, state: 1 });
        }

        let report = report(&mut harness.events).await;
        assert!(!report.timed_out);
        assert!(!report.initiator);
        assert!(report.unknown().is_empty());
        assert_eq!(report.channels[&1], ChannelState::Recorded(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_markers_are_not_recorded_twice() {
        let mut harness = spawn(2, Duration::from_secs(15));
        let snapshot = SnapshotId { initiator: 1, sequence: 1 };
        harness.tx.send(In::Marker { from: 1, snapshot, state: 3 });
        harness.tx.send(In::Record { from: 3, message: "first".to_string() });
        harness.tx.send(In::Marker { from: 3, snapshot, state: 1 });
        harness.tx.send(In::Marker { from: 3, snapshot, state: 99 });
        harness.tx.send(In::Record { from: 3, message: "second".to_string() });

        let report = report(&mut harness.events).await;
        assert_eq!(report.channels[&3], ChannelState::Recorded(vec!["first".to_string()]));
        assert_eq!(report.node_states[&3], Some(1));
        assert_eq!(report.unknown(), vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn markers_of_older_rounds_do_not_restart_them() {
        let mut harness = spawn(2, Duration::from_secs(1));
        let second = SnapshotId { initiator: 1, sequence: 2 };
        harness.tx.send(In::Marker { from: 1, snapshot: second, state: 3 });
        assert_eq!(report(&mut harness.events).await.snapshot, second);
        for inbox in &mut harness.inboxes {
            assert!(inbox.try_recv().is_some());
        }

        let first = SnapshotId { initiator: 1, sequence: 1 };
        harness.tx.send(In::Marker { from: 3, snapshot: first, state: 1 });
        harness.tx.send(In::Marker { from: 3, snapshot: second, state: 1 });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(harness.events.try_recv().is_none());
        for inbox in &mut harness.inboxes {
            assert!(inbox.try_recv().is_none());
        }

        let third = SnapshotId { initiator: 1, sequence: 3 };
        harness.tx.send(In::Marker { from: 1, snapshot: third, state: 4 });
        assert_eq!(report(&mut harness.events).await.snapshot, third);
    }

    #[tokio::test(start_paused = true)]
    async fn only_meta_coordinator_initiates() {
        let mut harness = spawn(1, Duration::from_secs(1));
        harness.tx.send(In::Initiate);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(harness.events.try_recv().is_none());
        for inbox in &mut harness.inboxes {
            assert!(inbox.try_recv().is_none());
        }
    }
}
