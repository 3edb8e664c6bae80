//! # Summary
//!
//! Wire-level message types. Every inbound payload is decoded into an
//! `Envelope` carrying the sender, its group, its logical clock, and one
//! variant of the closed `Message` enum. The node dispatches on the variant
//! with an exhaustive match.

use serde_derive::{Serialize, Deserialize};

pub type NodeId = usize;

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    A,
    B,
}

impl Group {
    pub fn other(self) -> Self {
        match self {
        | Group::A => Group::B,
        | Group::B => Group::A,
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
        | Group::A => write!(fmt, "A"),
        | Group::B => write!(fmt, "B"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub group: Group,
    pub clock: u64,
    pub message: Message,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Group leader election traffic
    Election(Election),

    /// Meta-coordinator candidacy from a group leader
    Candidacy,

    /// Periodic announcement from an active meta-coordinator
    MetaHeartbeat,

    /// Chandy-Lamport marker; `state` is the sender's recorded local state
    Marker {
        snapshot: SnapshotId,
        state: u64,
    },

    StatusRequest,

    StatusResponse(Status),

    /// Opaque application traffic
    Application(String),
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Election {
    /// Priority variant: challenge sent to higher ids
    Call,

    /// Priority variant: a higher id is alive and takes over
    Ack,

    /// Priority variant: sender is the new leader
    Coordinator,

    /// Ring variant: first circuit, gathering the maximum id
    Token {
        max: NodeId,
        visited: Vec<NodeId>,
    },

    /// Ring variant: second circuit, announcing the elected id
    Leader {
        leader: NodeId,
        visited: Vec<NodeId>,
    },
}

/// Identifies one snapshot round cluster-wide.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId {
    pub initiator: NodeId,
    pub sequence: u64,
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}#{}", self.initiator, self.sequence)
    }
}

/// Resource usage and clock sample embedded in status traffic.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub node: NodeId,
    pub cpu_percent: u8,
    pub mem_percent: u8,
    pub clock: u64,
}

impl Message {
    /// Short name used when recording channel state and in traces.
    pub fn kind(&self) -> &'static str {
        match self {
        | Message::Election(Election::Call) => "election",
        | Message::Election(Election::Ack) => "ack",
        | Message::Election(Election::Coordinator) => "coordinator",
        | Message::Election(Election::Token { .. }) => "ring-token",
        | Message::Election(Election::Leader { .. }) => "ring-leader",
        | Message::Candidacy => "candidacy",
        | Message::MetaHeartbeat => "meta-heartbeat",
        | Message::Marker { .. } => "marker",
        | Message::StatusRequest => "status-request",
        | Message::StatusResponse(_) => "status-response",
        | Message::Application(_) => "application",
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn envelope_survives_bincode() {
        let envelope = Envelope {
            from: 5,
            group: Group::B,
            clock: 42,
            message: Message::Election(Election::Token { max: 5, visited: vec![4, 5] }),
        };
        let bytes = bincode::serialize(&envelope).unwrap();
        let decoded: Envelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn other_group_is_involutive() {
        assert_eq!(Group::A.other(), Group::B);
        assert_eq!(Group::B.other().other(), Group::B);
    }
}
