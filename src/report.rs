//! # Summary
//!
//! Every user-visible outcome of the coordination engine is an `Event`
//! handed to a `Sink`. The default `Log` sink renders them through the
//! `log` facade; tests plug in a channel instead.

use crate::internal;
use crate::message::{Group, NodeId, Status};
use crate::thread::recovery::SubstitutionRecord;
use crate::thread::snapshot::SnapshotReport;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Peer crossed the failure threshold
    Failed { node: NodeId },

    /// Previously inactive peer answered again
    Reconnected { node: NodeId },

    /// Local node adopted a group leader
    LeaderElected { group: Group, leader: NodeId },

    /// Candidacy round finished with this winner
    MetaElected { winner: NodeId, candidates: Vec<NodeId> },

    /// Two active meta-coordinators were observed; `dropped` stood down
    MetaConflict { kept: NodeId, dropped: NodeId },

    /// No contact with the remote group for too long
    Partition { group: Group },

    Snapshot(SnapshotReport),

    RecoveryAttempt { node: NodeId, attempt: u32 },

    Recovered { node: NodeId },

    Substituted(SubstitutionRecord),

    /// Periodic group status, emitted by a leader with an authenticated client
    StatusReport { leader: NodeId, statuses: Vec<Status> },
}

pub trait Sink: Send + Sync {
    fn emit(&self, node: NodeId, event: Event);
}

/// Renders events as log lines.
#[derive(Copy, Clone, Debug, Default)]
pub struct Log;

impl Sink for Log {
    fn emit(&self, node: NodeId, event: Event) {
        match event {
        | Event::Failed { node: peer } => info!("[{}] node {} is inactive", node, peer),
        | Event::Reconnected { node: peer } => info!("[{}] node {} reconnected", node, peer),
        | Event::LeaderElected { group, leader } => info!("[{}] group {} leader is {}", node, group, leader),
        | Event::MetaElected { winner, candidates } => {
            info!("[{}] meta-coordinator is {} among {:?}", node, winner, candidates)
        }
        | Event::MetaConflict { kept, dropped } => {
            warn!("[{}] meta-coordinator conflict: keeping {}, deactivating {}", node, kept, dropped)
        }
        | Event::Partition { group } => warn!("[{}] lost contact with group {}", node, group),
        | Event::Snapshot(report) => {
            if report.timed_out {
                warn!("[{}] {}", node, report);
            } else {
                info!("[{}] {}", node, report);
            }
        }
        | Event::RecoveryAttempt { node: peer, attempt } => {
            info!("[{}] recovery attempt {} for node {}", node, attempt, peer)
        }
        | Event::Recovered { node: peer } => info!("[{}] node {} recovered", node, peer),
        | Event::Substituted(record) => {
            warn!("[{}] node {} substituted by {}", node, record.replaced, record.substitute)
        }
        | Event::StatusReport { leader, statuses } => {
            for status in statuses {
                info!(
                    "[{}] leader {} status: node {} cpu {}% mem {}% clock {}",
                    node, leader, status.node, status.cpu_percent, status.mem_percent, status.clock,
                );
            }
        }
        }
    }
}

impl Sink for internal::Tx<(NodeId, Event)> {
    fn emit(&self, node: NodeId, event: Event) {
        self.send((node, event));
    }
}
