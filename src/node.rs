//! # Summary
//!
//! A `Node` is one coordination process. Spawning it starts every component
//! task and wires them together:
//!
//! - inbox: receives envelopes from the transport and dispatches them
//! - detector: probes group peers
//! - election: the group's `GroupElection` variant
//! - meta: meta-coordinator candidacy rounds
//! - snapshot: Chandy-Lamport rounds
//! - recovery: failure registry reconciliation
//! - coordinator: leader and meta-coordinator periodic duties
//!
//! Dropping the node aborts all of them.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{Algorithm, Config};
use crate::error::{Error, Result};
use crate::internal;
use crate::message::{Envelope, Group, Message, NodeId};
use crate::report::Sink;
use crate::sampler::Sampler;
use crate::shared::{Nodes, Roles};
use crate::thread::{bully, coordinator, detector, election, meta, recovery, ring, snapshot, Tx};
use crate::transport::{self, Outbox, Transport};

/// Routes inbound envelopes to the component that handles them.
#[derive(Clone)]
struct Dispatcher {
    clock: Arc<Clock>,
    election_tx: Tx<election::In>,
    meta_tx: Tx<meta::In>,
    snapshot_tx: Tx<snapshot::In>,
    coordinator_tx: Tx<coordinator::In>,
}

impl Dispatcher {
    fn dispatch(&self, envelope: Envelope) {
        let Envelope { from, group, clock, message } = envelope;
        let local = self.clock.observe(clock);
        trace!("received {:?} from {} at {}", message, from, local);

        if !matches!(message, Message::Marker { .. }) {
            let recorded = match &message {
            | Message::Application(payload) => payload.clone(),
            | other => format!("{} from {} at {}", other.kind(), from, clock),
            };
            self.snapshot_tx.send(snapshot::In::Record { from, message: recorded });
        }

        match message {
        | Message::Election(election) => self.election_tx.send(election::In::Message(from, election)),
        | Message::Candidacy => self.meta_tx.send(meta::In::Candidacy { from, group }),
        | Message::MetaHeartbeat => self.meta_tx.send(meta::In::Heartbeat { from }),
        | Message::Marker { snapshot, state } => {
            self.snapshot_tx.send(snapshot::In::Marker { from, snapshot, state })
        }
        | Message::StatusRequest => self.coordinator_tx.send(coordinator::In::Request { from, group }),
        | Message::StatusResponse(status) => {
            self.coordinator_tx.send(coordinator::In::Response { from, group, status })
        }
        | Message::Application(_) => (),
        }
    }
}

pub struct Node {
    id: NodeId,
    group: Group,
    clock: Arc<Clock>,
    roles: Roles,
    nodes: Nodes,
    recovery: recovery::Recovery,
    outbox: Outbox,
    dispatcher: Dispatcher,
    handles: Vec<JoinHandle<()>>,
}

impl Node {

    /// Starts node `id` on the current tokio runtime, reading envelopes from `inbox`.
    pub fn spawn(
        config: &Config,
        id: NodeId,
        transport: Arc<dyn Transport>,
        inbox: internal::Rx<Envelope>,
        sink: Arc<dyn Sink>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        config.validate()?;
        let spec = config.cluster
            .group_of(id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("node {} is not a cluster member", id)))?;
        let members = spec.ids();

        let clock = Arc::new(Clock::new());
        let cluster = Arc::new(config.cluster.clone());
        let outbox = Outbox::new(id, spec.group, clock.clone(), cluster, transport);
        let nodes = Nodes::new(id, &members);
        let roles = Roles::new(id, spec.initial_leader());
        let recovery = recovery::Recovery::new(id, config.substitute_base, sink.clone());

        let (election_rx, election_tx) = internal::new();
        let (meta_rx, meta_tx) = internal::new();
        let (snapshot_rx, snapshot_tx) = internal::new();
        let (coordinator_rx, coordinator_tx) = internal::new();

        let dispatcher = Dispatcher {
            clock: clock.clone(),
            election_tx: election_tx.clone(),
            meta_tx: meta_tx.clone(),
            snapshot_tx: snapshot_tx.clone(),
            coordinator_tx,
        };

        let mut handles = Vec::new();

        let inbox_dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let mut inbox = inbox;
            while let Some(envelope) = inbox.recv().await {
                inbox_dispatcher.dispatch(envelope);
            }
        }));

        let context = election::Context {
            id,
            group: spec.group,
            outbox: outbox.clone(),
            nodes: nodes.clone(),
            roles: roles.clone(),
            recovery: recovery.clone(),
            meta_tx: meta_tx.clone(),
            sink: sink.clone(),
        };
        handles.push(match spec.algorithm {
        | Algorithm::Priority => {
            let bully = bully::Bully::new(context, config.ack_timeout);
            tokio::spawn(election::run(bully, election_rx))
        }
        | Algorithm::Ring => {
            let ring = ring::Ring::new(context, members, config.ring_retry_delay, config.ack_timeout);
            tokio::spawn(election::run(ring, election_rx))
        }
        });

        let detector = detector::Detector::new(
            nodes.clone(),
            roles.clone(),
            outbox.clone(),
            recovery.clone(),
            election_tx.clone(),
            sink.clone(),
            config,
        );
        handles.push(tokio::spawn(detector.run()));

        let meta = meta::Meta::new(meta_rx, roles.clone(), outbox.clone(), sink.clone(), config.collection_window);
        handles.push(tokio::spawn(meta.run()));

        let snapshot = snapshot::Snapshot::new(
            snapshot_rx,
            roles.clone(),
            outbox.clone(),
            sink.clone(),
            config.snapshot_timeout,
        );
        handles.push(tokio::spawn(snapshot.run()));

        let policy = recovery::Policy {
            backoff: config.recovery_backoff,
            max_attempts: config.max_recovery_attempts,
            substitution_timeout: config.substitution_timeout,
        };
        let reconciler = recovery::Reconciler::new(
            recovery.clone(),
            nodes.clone(),
            roles.clone(),
            policy,
            config.recovery_interval,
        );
        handles.push(tokio::spawn(reconciler.run()));

        let coordinator = coordinator::Coordinator::new(
            coordinator_rx,
            roles.clone(),
            nodes.clone(),
            outbox.clone(),
            recovery.clone(),
            sampler,
            snapshot_tx,
            sink,
            config,
        );
        handles.push(tokio::spawn(coordinator.run()));

        // The designated initial leader runs the first candidacy round. It also
        // asserts itself in its group, since a restarted leader may find a peer
        // that took over while it was down.
        if roles.is_leader() {
            let delay = config.meta_delay;
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                meta_tx.send(meta::In::Start);
            }));
            let delay = config.probe_delay;
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                election_tx.send(election::In::Trigger);
            }));
        }

        info!("started node {} in group {} ({:?})", id, spec.group, spec.algorithm);
        Ok(Node { id, group: spec.group, clock, roles, nodes, recovery, outbox, dispatcher, handles })
    }

    /// Starts node `id` listening on its configured TCP address.
    pub async fn listen(
        config: &Config,
        id: NodeId,
        sink: Arc<dyn Sink>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        let address = config.cluster.address(id).ok_or(Error::Unknown(id))?;
        let listener = tokio::net::TcpListener::bind(address).await?;
        let (inbox, tx) = internal::new();
        let tcp = transport::tcp::Tcp::new(&config.cluster, config.probe_timeout);
        let mut node = Node::spawn(config, id, Arc::new(tcp), inbox, sink, sampler)?;
        node.handles.push(tokio::spawn(async move {
            if let Err(error) = transport::tcp::serve(listener, tx).await {
                warn!("listener on {} stopped: {}", address, error);
            }
        }));
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn group(&self) -> Group {
        self.group
    }

    /// Hands an inbound envelope to the node, as a transport would.
    pub fn deliver(&self, envelope: Envelope) {
        self.dispatcher.dispatch(envelope);
    }

    /// Sends opaque application traffic to `to`.
    pub async fn send(&self, to: NodeId, payload: String) -> Result<()> {
        self.outbox.send(to, Message::Application(payload)).await
    }

    /// Whether the authentication service should run on this node.
    pub fn is_acting_leader(&self) -> bool {
        self.roles.is_leader()
    }

    /// A client authenticated against this node; enables status reports.
    pub fn client_authenticated(&self) {
        self.roles.set_authenticated(true);
    }

    /// Starts a snapshot round now. Ignored unless this node is meta-coordinator.
    pub fn initiate_snapshot(&self) {
        self.dispatcher.snapshot_tx.send(snapshot::In::Initiate);
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.roles.leader()
    }

    pub fn is_meta(&self) -> bool {
        self.roles.is_meta()
    }

    pub fn meta_view(&self) -> Option<NodeId> {
        self.roles.meta_view()
    }

    pub fn active_peers(&self) -> Vec<NodeId> {
        self.nodes.read().active()
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    pub fn recovery(&self) -> &recovery::Recovery {
        &self.recovery
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        info!("stopping node {}", self.id);
        for handle in &self.handles {
            handle.abort();
        }
    }
}
