//! # Summary
//!
//! This module defines the boundary to the network. A `Transport` only
//! knows how to deliver an `Envelope` to one node and how to check that a
//! node is alive. The `Outbox` sits on top of it: it stamps outgoing
//! messages with the local logical clock and resolves broadcast scopes from
//! static membership.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::config::Cluster;
use crate::error::Result;
use crate::message::{Envelope, Group, Message, NodeId};

pub mod memory;
pub mod tcp;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Point-to-point delivery; failure is reported synchronously.
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<()>;

    /// Liveness round-trip.
    async fn probe(&self, to: NodeId) -> Result<()>;

    /// Best-effort delivery to every target. Lost deliveries are not reported.
    async fn broadcast(&self, targets: &[NodeId], envelope: Envelope) {
        let sends = targets.iter().map(|to| self.send(*to, envelope.clone()));
        for (to, result) in targets.iter().zip(futures::future::join_all(sends).await) {
            if let Err(error) = result {
                trace!("broadcast to {} lost: {}", to, error);
            }
        }
    }
}

/// Broadcast audience.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Peers in the local group
    Group,

    /// Every other node of the cluster, in both groups
    CrossGroup,

    /// Members of the other group only
    Remote,
}

/// Clock-stamping front end to a `Transport`.
#[derive(Clone)]
pub struct Outbox {
    id: NodeId,
    group: Group,
    clock: Arc<Clock>,
    cluster: Arc<Cluster>,
    transport: Arc<dyn Transport>,
}

impl Outbox {
    pub fn new(
        id: NodeId,
        group: Group,
        clock: Arc<Clock>,
        cluster: Arc<Cluster>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Outbox { id, group, clock, cluster, transport }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn envelope(&self, message: Message) -> Envelope {
        Envelope {
            from: self.id,
            group: self.group,
            clock: self.clock.tick(),
            message,
        }
    }

    pub async fn send(&self, to: NodeId, message: Message) -> Result<()> {
        trace!("sending {:?} to {}", message, to);
        self.transport.send(to, self.envelope(message)).await
    }

    pub async fn probe(&self, to: NodeId) -> Result<()> {
        self.transport.probe(to).await
    }

    pub fn targets(&self, scope: Scope) -> Vec<NodeId> {
        let ids = match scope {
        | Scope::Group => self.cluster.group(self.group).map(|spec| spec.ids()).unwrap_or_default(),
        | Scope::CrossGroup => self.cluster.ids(),
        | Scope::Remote => self.cluster.group(self.group.other()).map(|spec| spec.ids()).unwrap_or_default(),
        };
        ids.into_iter().filter(|id| *id != self.id).collect()
    }

    pub async fn broadcast(&self, scope: Scope, message: Message) {
        let targets = self.targets(scope);
        trace!("broadcasting {:?} to {:?}", message, targets);
        self.transport.broadcast(&targets, self.envelope(message)).await
    }
}
