//! # Summary
//!
//! This module implements the state shared between component tasks of one
//! process. Each structure is wrapped in `Arc` plus a lock or atomics so that
//! it can be injected into exactly the components that need it:
//!
//! - `Nodes`: the liveness table of group peers, written by the failure
//!   detector and read by elections and recovery.
//! - `Roles`: the group-leader and meta-coordinator flags, written by the
//!   election components and read by everyone else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::HashMap as Map;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message::NodeId;

/// Liveness belief about one group peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub active: bool,
    pub failures: u32,
}

/// Observable outcome of a probe result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Peer crossed the failure threshold and is now inactive
    Failed,

    /// Previously inactive peer answered a probe
    Reconnected,
}

/// Thread-safe wrapper around the group's `Table` of peers.
#[derive(Clone, Debug)]
pub struct Nodes(Arc<RwLock<Table>>);

impl Nodes {

    /// Creates a table with every peer except `id` marked active.
    pub fn new(id: NodeId, members: &[NodeId]) -> Self {
        Nodes(Arc::new(RwLock::new(Table::new(id, members))))
    }

    /// Acquires a read lock on the underlying table.
    pub fn read(&self) -> RwLockReadGuard<Table> {
        self.0.read()
    }

    /// Acquires a write lock on the underlying table.
    pub fn write(&self) -> RwLockWriteGuard<Table> {
        self.0.write()
    }
}

#[derive(Debug)]
pub struct Table {
    id: NodeId,
    records: Map<NodeId, NodeRecord>,
}

impl Table {
    fn new(id: NodeId, members: &[NodeId]) -> Self {
        let records = members.iter()
            .filter(|peer| **peer != id)
            .map(|peer| (*peer, NodeRecord { id: *peer, active: true, failures: 0 }))
            .collect();
        Table { id, records }
    }

    /// Peer ids in ascending order.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers = self.records.keys().copied().collect::<Vec<_>>();
        peers.sort_unstable();
        peers
    }

    /// Active peer ids in ascending order.
    pub fn active(&self) -> Vec<NodeId> {
        let mut active = self.records.values()
            .filter(|record| record.active)
            .map(|record| record.id)
            .collect::<Vec<_>>();
        active.sort_unstable();
        active
    }

    /// The local node counts as active.
    pub fn is_active(&self, id: NodeId) -> bool {
        id == self.id || self.get(id).map_or(false, |record| record.active)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeRecord> {
        self.records.get(&id)
    }

    /// Applies one probe result with a hysteresis of `threshold` consecutive
    /// failures. Returns a transition only when the active flag flips.
    pub fn observe(&mut self, id: NodeId, alive: bool, threshold: u32) -> Option<Transition> {
        let record = self.records.get_mut(&id)?;
        if alive {
            record.failures = 0;
            if record.active {
                None
            } else {
                record.active = true;
                Some(Transition::Reconnected)
            }
        } else {
            record.failures = record.failures.saturating_add(1);
            if record.active && record.failures >= threshold {
                record.active = false;
                Some(Transition::Failed)
            } else {
                None
            }
        }
    }

    /// Marks a peer inactive after a failed send. Returns whether it was active.
    pub fn mark_inactive(&mut self, id: NodeId) -> bool {
        match self.records.get_mut(&id) {
        | Some(record) if record.active => {
            record.active = false;
            true
        }
        | _ => false,
        }
    }

    /// Clears the consecutive failure count so the next probe starts fresh.
    pub fn reset_failures(&mut self, id: NodeId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.failures = 0;
        }
    }
}

const NONE: usize = usize::MAX;

/// Role flags of the local node. Single writer per flag, many readers;
/// all accesses are sequentially consistent.
#[derive(Clone, Debug)]
pub struct Roles(Arc<Flags>);

#[derive(Debug)]
struct Flags {
    id: NodeId,
    leader: AtomicUsize,
    meta: AtomicBool,
    meta_view: AtomicUsize,
    authenticated: AtomicBool,
}

impl Roles {
    pub fn new(id: NodeId, leader: Option<NodeId>) -> Self {
        Roles(Arc::new(Flags {
            id,
            leader: AtomicUsize::new(leader.unwrap_or(NONE)),
            meta: AtomicBool::new(false),
            meta_view: AtomicUsize::new(NONE),
            authenticated: AtomicBool::new(false),
        }))
    }

    /// Currently recognized group leader.
    pub fn leader(&self) -> Option<NodeId> {
        match self.0.leader.load(Ordering::SeqCst) {
        | NONE => None,
        | id => Some(id),
        }
    }

    /// Records the group leader. Returns the previous one.
    pub fn set_leader(&self, leader: NodeId) -> Option<NodeId> {
        match self.0.leader.swap(leader, Ordering::SeqCst) {
        | NONE => None,
        | id => Some(id),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.0.id)
    }

    pub fn is_meta(&self) -> bool {
        self.0.meta.load(Ordering::SeqCst)
    }

    /// Sets the meta-coordinator flag. Returns the previous value.
    pub fn set_meta(&self, meta: bool) -> bool {
        self.0.meta.swap(meta, Ordering::SeqCst)
    }

    /// Meta-coordinator as last seen by this node.
    pub fn meta_view(&self) -> Option<NodeId> {
        match self.0.meta_view.load(Ordering::SeqCst) {
        | NONE => None,
        | id => Some(id),
        }
    }

    pub fn set_meta_view(&self, meta: NodeId) {
        self.0.meta_view.store(meta, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.0.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.0.authenticated.store(authenticated, Ordering::SeqCst);
    }
}
