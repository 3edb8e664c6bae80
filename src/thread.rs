//! # Summary
//!
//! This module contains every long-running task of a coordination node.
//!
//! Each task owns its private state and receives work through an `In`
//! message enum over an internal channel, or wakes up on its own timer.
//! State that more than one task touches lives in `crate::shared`.

pub(crate) use crate::internal::{Rx, Tx};

/// Priority (bully) leader election.
pub(crate) mod bully;

/// Leader and meta-coordinator periodic duties.
pub(crate) mod coordinator;

/// Peer liveness probing.
pub(crate) mod detector;

/// Common election interface and driver.
pub(crate) mod election;

/// Meta-coordinator candidacy rounds and reconciliation.
pub(crate) mod meta;

/// Failure registry and substitution.
pub mod recovery;

/// Ring (token circulation) leader election.
pub(crate) mod ring;

/// Chandy-Lamport snapshots.
pub mod snapshot;

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn wait(deadline: Option<tokio::time::Instant>) {
    match deadline {
    | Some(deadline) => tokio::time::sleep_until(deadline).await,
    | None => futures::future::pending().await,
    }
}
