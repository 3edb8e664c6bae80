//! # Summary
//!
//! The recovery manager keeps one registry entry per failed peer. A periodic
//! reconciliation pass gives each entry a bounded number of recovery
//! attempts, spaced by a backoff interval. An attempt clears the peer's
//! consecutive failure count so the next probe cycle judges it afresh. Once
//! the attempts are spent and the substitution timeout has passed since the
//! first failure, the peer is replaced by a freshly minted id.
//!
//! Every node tracks failures, but only the acting group leader runs the
//! reconciliation pass. Substitute ids are derived from the replaced id
//! (`substitute_base + replaced`), so two leaders that both replace a node
//! mint the same identity and distinct failed nodes never collide.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hashbrown::HashMap as Map;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::message::NodeId;
use crate::report::{Event, Sink};
use crate::shared::{Nodes, Roles};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubstitutionRecord {
    pub replaced: NodeId,
    pub substitute: NodeId,
    pub at: SystemTime,
}

#[derive(Clone, Debug)]
struct Entry {
    first_failure: Instant,
    last_attempt: Instant,
    attempts: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct Policy {
    pub backoff: Duration,
    pub max_attempts: u32,
    pub substitution_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Action {
    Attempt { node: NodeId, attempt: u32 },
    Substitute(SubstitutionRecord),
}

#[derive(Debug)]
struct Registry {
    entries: Map<NodeId, Entry>,
    substitutions: Vec<SubstitutionRecord>,
    substitute_base: NodeId,
}

impl Registry {
    fn reconcile(&mut self, now: Instant, policy: &Policy) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut nodes = self.entries.keys().copied().collect::<Vec<_>>();
        nodes.sort_unstable();
        for node in nodes {
            let entry = match self.entries.get_mut(&node) {
            | Some(entry) => entry,
            | None => continue,
            };
            if entry.attempts >= policy.max_attempts {
                if now.duration_since(entry.first_failure) >= policy.substitution_timeout {
                    self.entries.remove(&node);
                    let record = SubstitutionRecord {
                        replaced: node,
                        substitute: self.substitute_base + node,
                        at: SystemTime::now(),
                    };
                    self.substitutions.push(record.clone());
                    actions.push(Action::Substitute(record));
                }
            } else if now.duration_since(entry.last_attempt) >= policy.backoff {
                entry.attempts += 1;
                entry.last_attempt = now;
                actions.push(Action::Attempt { node, attempt: entry.attempts });
            }
        }
        actions
    }
}

/// Handle on the failure registry, shared by every component that can observe a failure.
#[derive(Clone)]
pub struct Recovery {
    id: NodeId,
    registry: Arc<Mutex<Registry>>,
    sink: Arc<dyn Sink>,
}

impl Recovery {
    pub fn new(id: NodeId, substitute_base: NodeId, sink: Arc<dyn Sink>) -> Self {
        let registry = Registry {
            entries: Map::default(),
            substitutions: Vec::new(),
            substitute_base,
        };
        Recovery { id, registry: Arc::new(Mutex::new(registry)), sink }
    }

    /// Starts tracking `node` unless it is already tracked.
    pub fn register_failure(&self, node: NodeId) {
        let now = Instant::now();
        let mut registry = self.registry.lock();
        if !registry.entries.contains_key(&node) {
            debug!("registering failure of {}", node);
            registry.entries.insert(node, Entry { first_failure: now, last_attempt: now, attempts: 0 });
        }
    }

    /// Stops tracking `node`, reporting the recovery if it was tracked.
    pub fn register_recovery(&self, node: NodeId) {
        let removed = self.registry.lock().entries.remove(&node).is_some();
        if removed {
            self.sink.emit(self.id, Event::Recovered { node });
        }
    }

    pub fn is_tracked(&self, node: NodeId) -> bool {
        self.registry.lock().entries.contains_key(&node)
    }

    /// Nodes currently awaiting recovery or substitution.
    pub fn pending(&self) -> Vec<NodeId> {
        let mut pending = self.registry.lock().entries.keys().copied().collect::<Vec<_>>();
        pending.sort_unstable();
        pending
    }

    pub fn substitutions(&self) -> Vec<SubstitutionRecord> {
        self.registry.lock().substitutions.clone()
    }

    /// Runs one reconciliation pass at `now`.
    pub(crate) fn reconcile(&self, nodes: &Nodes, policy: &Policy, now: Instant) {
        let actions = self.registry.lock().reconcile(now, policy);
        for action in actions {
            match action {
            | Action::Attempt { node, attempt } => {
                nodes.write().reset_failures(node);
                self.sink.emit(self.id, Event::RecoveryAttempt { node, attempt });
            }
            | Action::Substitute(record) => {
                self.sink.emit(self.id, Event::Substituted(record));
            }
            }
        }
    }
}

/// Background task driving `Recovery::reconcile` while this node leads its group.
pub struct Reconciler {
    recovery: Recovery,
    nodes: Nodes,
    roles: Roles,
    policy: Policy,
    interval: Duration,
}

impl Reconciler {
    pub fn new(recovery: Recovery, nodes: Nodes, roles: Roles, policy: Policy, interval: Duration) -> Self {
        Reconciler { recovery, nodes, roles, policy, interval }
    }

    /// One tick: followers keep their registry but leave attempts and substitution to the leader.
    fn tick(&self, now: Instant) {
        if self.roles.is_leader() {
            self.recovery.reconcile(&self.nodes, &self.policy, now);
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        loop {
            ticker.tick().await;
            self.tick(Instant::now());
        }
    }
}
