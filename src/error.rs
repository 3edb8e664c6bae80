//! # Summary
//!
//! This module defines the single error type shared by the transport
//! boundary and configuration loading. Coordination components never let
//! these escape their loops: a failed send or probe is turned into a
//! liveness transition or a failure registration instead.

use crate::message::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("timed out waiting for node {0}")]
    Timeout(NodeId),

    #[error("no address known for node {0}")]
    Unknown(NodeId),

    #[error("connection closed before a reply")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
