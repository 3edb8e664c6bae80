//! # Summary
//!
//! Failure detector for the local group.
//!
//! Every probe interval each peer gets one bounded liveness round-trip. A
//! success clears the peer's failure count and brings it back if it was
//! inactive; a failure only counts towards the threshold. The transition
//! to inactive is reported once, registered with the recovery manager, and
//! starts an election if the peer was the group leader.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::message::NodeId;
use crate::report::{Event, Sink};
use crate::shared::{Nodes, Roles, Transition};
use crate::thread::{election, recovery::Recovery, Tx};
use crate::transport::Outbox;

pub struct Detector {
    id: NodeId,
    nodes: Nodes,
    roles: Roles,
    outbox: Outbox,
    recovery: Recovery,
    election_tx: Tx<election::In>,
    sink: Arc<dyn Sink>,
    interval: Duration,
    delay: Duration,
    timeout: Duration,
    threshold: u32,
}

impl Detector {
    pub fn new(
        nodes: Nodes,
        roles: Roles,
        outbox: Outbox,
        recovery: Recovery,
        election_tx: Tx<election::In>,
        sink: Arc<dyn Sink>,
        config: &Config,
    ) -> Self {
        Detector {
            id: outbox.id(),
            nodes,
            roles,
            outbox,
            recovery,
            election_tx,
            sink,
            interval: config.probe_interval,
            delay: config.probe_delay,
            timeout: config.probe_timeout,
            threshold: config.failure_threshold,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.delay, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe_all().await;
        }
    }

    async fn probe_all(&self) {
        let peers = self.nodes.read().peers();
        for peer in peers {
            let alive = match tokio::time::timeout(self.timeout, self.outbox.probe(peer)).await {
            | Ok(Ok(())) => true,
            | Ok(Err(error)) => {
                trace!("probe of {} failed: {}", peer, error);
                false
            }
            | Err(_) => {
                trace!("probe of {} timed out", peer);
                false
            }
            };
            let transition = self.nodes.write().observe(peer, alive, self.threshold);
            match transition {
            | Some(transition) => self.respond_transition(peer, transition),
            | None if !alive => debug!("{} missed a probe", peer),
            | None => (),
            }
        }
    }

    fn respond_transition(&self, peer: NodeId, transition: Transition) {
        match transition {
        | Transition::Failed => {
            self.sink.emit(self.id, Event::Failed { node: peer });
            self.recovery.register_failure(peer);
            if self.roles.leader() == Some(peer) {
                info!("group leader {} failed; starting election", peer);
                self.election_tx.send(election::In::Trigger);
            }
        }
        | Transition::Reconnected => {
            self.sink.emit(self.id, Event::Reconnected { node: peer });
            self.recovery.register_recovery(peer);
        }
        }
    }
}
