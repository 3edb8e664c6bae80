//! Local resource sampling boundary.

use crate::message::{NodeId, Status};

/// CPU and memory load in percent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_percent: u8,
    pub mem_percent: u8,
}

pub trait Sampler: Send + Sync {
    fn sample(&self) -> Usage;
}

/// Always reports the same usage.
#[derive(Copy, Clone, Debug, Default)]
pub struct Fixed(pub Usage);

impl Sampler for Fixed {
    fn sample(&self) -> Usage {
        self.0
    }
}

/// Embeds the current logical clock into a usage sample.
pub fn status(node: NodeId, sampler: &dyn Sampler, clock: u64) -> Status {
    let usage = sampler.sample();
    Status {
        node,
        cpu_percent: usage.cpu_percent.min(100),
        mem_percent: usage.mem_percent.min(100),
        clock,
    }
}
