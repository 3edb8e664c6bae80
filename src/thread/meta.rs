//! # Summary
//!
//! Meta-coordinator election between the group leaders.
//!
//! A node that has just become group leader opens a collection window,
//! puts itself in the candidate set, and broadcasts its candidacy across
//! both groups. Candidacies received while the window is open join the set;
//! a leader that receives one while idle joins in by opening its own window.
//! When the window closes the highest candidate id wins, and since every
//! participant sees the same set it reaches the same conclusion.
//!
//! An active meta-coordinator announces itself with heartbeats. One that
//! hears a heartbeat from a higher id stands down, so a race during the
//! window still ends with a single meta-coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{Group, Message, NodeId};
use crate::report::{Event, Sink};
use crate::shared::Roles;
use crate::thread::{self, Rx};
use crate::transport::{Outbox, Scope};

#[derive(Debug)]
pub enum In {
    /// Local node has just become group leader
    Start,
    Candidacy {
        from: NodeId,
        group: Group,
    },
    Heartbeat {
        from: NodeId,
    },
}

#[derive(Debug)]
struct Round {
    deadline: Instant,
    candidates: BTreeMap<NodeId, Group>,
}

pub struct Meta {
    id: NodeId,
    group: Group,
    rx: Rx<In>,
    roles: Roles,
    outbox: Outbox,
    sink: Arc<dyn Sink>,
    window: Duration,
    round: Option<Round>,
}

impl Meta {
    pub fn new(rx: Rx<In>, roles: Roles, outbox: Outbox, sink: Arc<dyn Sink>, window: Duration) -> Self {
        Meta {
            id: outbox.id(),
            group: outbox.group(),
            rx,
            roles,
            outbox,
            sink,
            window,
            round: None,
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
                _ = thread::wait(deadline) => self.conclude().await,
            }
        }
    }

    async fn respond(&mut self, message: In) {
        trace!("received {:?}", message);
        match message {
        | In::Start => self.respond_start().await,
        | In::Candidacy { from, group } => self.respond_candidacy(from, group).await,
        | In::Heartbeat { from } => self.respond_heartbeat(from),
        }
    }

    async fn respond_start(&mut self) {
        if !self.roles.is_leader() {
            debug!("no longer group leader; skipping candidacy");
            return
        }
        if self.round.is_some() {
            debug!("candidacy round already open");
            return
        }
        info!("{} running for meta-coordinator", self.id);
        let mut candidates = BTreeMap::new();
        candidates.insert(self.id, self.group);
        self.round = Some(Round { deadline: Instant::now() + self.window, candidates });
        self.outbox.broadcast(Scope::CrossGroup, Message::Candidacy).await;
    }

    async fn respond_candidacy(&mut self, from: NodeId, group: Group) {
        if let Some(round) = &mut self.round {
            round.candidates.insert(from, group);
            return
        }
        if !self.roles.is_leader() || from == self.id {
            trace!("ignoring candidacy from {}", from);
            return
        }
        debug!("joining candidacy round opened by {}", from);
        self.respond_start().await;
        if let Some(round) = &mut self.round {
            round.candidates.insert(from, group);
        }
    }

    fn respond_heartbeat(&mut self, from: NodeId) {
        if from == self.id {
            return
        }
        if self.roles.is_meta() {
            if from > self.id {
                self.roles.set_meta(false);
                self.roles.set_meta_view(from);
                self.sink.emit(self.id, Event::MetaConflict { kept: from, dropped: self.id });
            } else {
                debug!("ignoring heartbeat from lower meta-coordinator {}", from);
            }
        } else {
            self.roles.set_meta_view(from);
        }
    }

    async fn conclude(&mut self) {
        let round = match self.round.take() {
        | Some(round) => round,
        | None => return,
        };
        if !self.roles.is_leader() {
            debug!("lost group leadership during candidacy round");
            return
        }
        let candidates = round.candidates.keys().copied().collect::<Vec<_>>();
        let winner = match candidates.last() {
        | Some(winner) => *winner,
        | None => return,
        };
        self.roles.set_meta_view(winner);
        self.sink.emit(self.id, Event::MetaElected { winner, candidates });
        if winner == self.id {
            if !self.roles.set_meta(true) {
                info!("{} is now meta-coordinator", self.id);
            }
            self.outbox.broadcast(Scope::CrossGroup, Message::MetaHeartbeat).await;
        } else if self.roles.set_meta(false) {
            info!("{} yielding meta-coordinator role to {}", self.id, winner);
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
    use crate::transport::memory::Network;

    struct Fixture {
        tx: internal::Tx<In>,
        roles: Roles,
        events: internal::Rx<(NodeId, Event)>,
        inboxes: Vec<(NodeId, internal::Rx<Envelope>)>,
    }

    fn spawn(id: NodeId) -> Fixture {
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
        let roles = Roles::new(id, Some(id));
        let (rx, tx) = internal::new();
        let (events, sink) = internal::new();
        tokio::spawn(Meta::new(rx, roles.clone(), outbox, Arc::new(sink), Duration::from_secs(8)).run());
        Fixture { tx, roles, events, inboxes }
    }

    async fn elected(events: &mut internal::Rx<(NodeId, Event)>) -> (NodeId, Vec<NodeId>) {
        loop {
            match events.recv().await {
            | Some((_, Event::MetaElected { winner, candidates })) => return (winner, candidates),
            | Some(_) => continue,
            | None => panic!("sink closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn candidacy_is_broadcast_to_every_other_node() {
        let mut fixture = spawn(3);
        fixture.tx.send(In::Start);
        for (_, inbox) in &mut fixture.inboxes {
            assert_eq!(inbox.recv().await.unwrap().message, Message::Candidacy);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn highest_candidate_wins() {
        let mut fixture = spawn(6);
        fixture.tx.send(In::Start);
        fixture.tx.send(In::Candidacy { from: 3, group: Group::A });
        assert_eq!(elected(&mut fixture.events).await, (6, vec![3, 6]));
        assert!(fixture.roles.is_meta());
        assert_eq!(fixture.roles.meta_view(), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_candidate_stays_plain_leader() {
        let mut fixture = spawn(3);
        fixture.tx.send(In::Start);
        fixture.tx.send(In::Candidacy { from: 6, group: Group::B });
        fixture.tx.send(In::Candidacy { from: 6, group: Group::B });
        assert_eq!(elected(&mut fixture.events).await, (6, vec![3, 6]));
        assert!(!fixture.roles.is_meta());
        assert_eq!(fixture.roles.meta_view(), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_leader_joins_foreign_round() {
        let mut fixture = spawn(3);
        fixture.tx.send(In::Candidacy { from: 6, group: Group::B });
        assert_eq!(elected(&mut fixture.events).await, (6, vec![3, 6]));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_from_higher_id_resolves_conflict() {
        let mut fixture = spawn(5);
        fixture.roles.set_meta(true);
        fixture.tx.send(In::Heartbeat { from: 3 });
        fixture.tx.send(In::Heartbeat { from: 6 });
        match fixture.events.recv().await {
        | Some((5, Event::MetaConflict { kept: 6, dropped: 5 })) => (),
        | other => panic!("unexpected event {:?}", other),
        }
        assert!(!fixture.roles.is_meta());
        assert_eq!(fixture.roles.meta_view(), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn round_is_discarded_after_losing_leadership() {
        let mut fixture = spawn(3);
        fixture.tx.send(In::Start);
        tokio::time::sleep(Duration::from_secs(1)).await;
        fixture.roles.set_leader(2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fixture.events.try_recv().is_none());
        assert!(!fixture.roles.is_meta());
    }
}
