//! # Summary
//!
//! In-process transport. Every node registers an inbox with a shared
//! `Network`; sends are pushed straight onto the target's inbox, so
//! per-sender FIFO order is preserved. Nodes can be crashed and restored
//! to inject failures: a crashed node neither sends nor receives.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::{HashMap as Map, HashSet as Set};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::internal;
use crate::message::{Envelope, NodeId};
use crate::transport::Transport;

#[derive(Clone, Debug, Default)]
pub struct Network(Arc<RwLock<Hub>>);

#[derive(Debug, Default)]
struct Hub {
    inboxes: Map<NodeId, internal::Tx<Envelope>>,
    down: Set<NodeId>,
    delivered: u64,
    dropped: u64,
}

impl Hub {
    fn reachable(&self, from: NodeId, to: NodeId) -> Option<&internal::Tx<Envelope>> {
        if self.down.contains(&from) || self.down.contains(&to) {
            return None;
        }
        self.inboxes.get(&to).filter(|inbox| !inbox.is_closed())
    }
}

impl Network {
    pub fn new() -> Self {
        Network::default()
    }

    /// Registers `id` and returns its transport plus inbox. Replaces any
    /// previous registration, which also brings a crashed id back up.
    pub fn connect(&self, id: NodeId) -> (Memory, internal::Rx<Envelope>) {
        let (rx, tx) = internal::new();
        let mut hub = self.0.write();
        hub.inboxes.insert(id, tx);
        hub.down.remove(&id);
        (Memory { id, network: self.clone() }, rx)
    }

    pub fn crash(&self, id: NodeId) {
        info!("crashing {}", id);
        self.0.write().down.insert(id);
    }

    pub fn restore(&self, id: NodeId) {
        info!("restoring {}", id);
        self.0.write().down.remove(&id);
    }

    pub fn is_down(&self, id: NodeId) -> bool {
        self.0.read().down.contains(&id)
    }

    /// Delivered and dropped envelope counts.
    pub fn counters(&self) -> (u64, u64) {
        let hub = self.0.read();
        (hub.delivered, hub.dropped)
    }
}

/// One node's handle on a `Network`.
#[derive(Clone, Debug)]
pub struct Memory {
    id: NodeId,
    network: Network,
}

#[async_trait]
impl Transport for Memory {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<()> {
        let mut hub = self.network.0.write();
        let inbox = hub.reachable(self.id, to).cloned();
        match inbox {
        | Some(inbox) => {
            inbox.send(envelope);
            hub.delivered += 1;
            Ok(())
        }
        | None => {
            hub.dropped += 1;
            Err(Error::Unreachable(to))
        }
        }
    }

    async fn probe(&self, to: NodeId) -> Result<()> {
        match self.network.0.read().reachable(self.id, to) {
        | Some(_) => Ok(()),
        | None => Err(Error::Unreachable(to)),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::message::{Group, Message};

    fn envelope(from: NodeId) -> Envelope {
        Envelope { from, group: Group::A, clock: 0, message: Message::Application("hi".to_string()) }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let network = Network::new();
        let (one, _) = network.connect(1);
        let (_, mut inbox) = network.connect(2);
        one.send(2, envelope(1)).await.unwrap();
        let mut second = envelope(1);
        second.clock = 1;
        one.send(2, second).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().clock, 0);
        assert_eq!(inbox.recv().await.unwrap().clock, 1);
        assert_eq!(network.counters(), (2, 0));
    }

    #[tokio::test]
    async fn crashed_nodes_are_unreachable_both_ways() {
        let network = Network::new();
        let (one, _) = network.connect(1);
        let (two, _inbox) = network.connect(2);
        network.crash(2);
        assert!(one.probe(2).await.is_err());
        assert!(matches!(one.send(2, envelope(1)).await, Err(Error::Unreachable(2))));
        assert!(two.send(1, envelope(2)).await.is_err());
        network.restore(2);
        assert!(one.probe(2).await.is_ok());
        assert_eq!(network.counters(), (0, 2));
    }

    #[tokio::test]
    async fn unknown_and_stopped_nodes_are_unreachable() {
        let network = Network::new();
        let (one, _) = network.connect(1);
        assert!(one.probe(9).await.is_err());
        let (_, inbox) = network.connect(2);
        drop(inbox);
        assert!(one.probe(2).await.is_err());
    }
}
