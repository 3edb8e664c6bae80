#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

mod clock;
mod config;
mod error;
mod message;
mod node;
mod report;
mod sampler;
mod shared;
mod socket;
mod thread;

pub mod internal;
pub mod transport;

pub use crate::clock::Clock;
pub use crate::config::{Algorithm, Cluster, Config, GroupSpec, Member};
pub use crate::error::{Error, Result};
pub use crate::message::{Election, Envelope, Group, Message, NodeId, SnapshotId, Status};
pub use crate::node::Node;
pub use crate::report::{Event, Log, Sink};
pub use crate::sampler::{Fixed, Sampler, Usage};
pub use crate::thread::recovery::{Recovery, SubstitutionRecord};
pub use crate::thread::snapshot::{ChannelState, SnapshotReport};
