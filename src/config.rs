use std::net::SocketAddr;
use std::time::Duration;

use serde_derive::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::message::{Group, NodeId};

/// Leader election algorithm run by a group.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// Bully-style: highest active id wins
    Priority,

    /// Token circulation around a sorted ring
    Ring,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Member {
    pub id: NodeId,

    /// Listening address, only used by the TCP transport
    #[serde(default)]
    pub address: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct GroupSpec {
    pub group: Group,
    pub algorithm: Algorithm,
    pub members: Vec<Member>,
}

impl GroupSpec {
    /// Member ids in ring order.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = self.members.iter().map(|member| member.id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Initial designated leader: the maximum id.
    pub fn initial_leader(&self) -> Option<NodeId> {
        self.members.iter().map(|member| member.id).max()
    }
}

/// Static membership of both groups.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Cluster {
    pub groups: Vec<GroupSpec>,
}

impl Cluster {

    /// Group A runs the priority algorithm over {1, 2, 3} and group B
    /// runs the ring algorithm over {4, 5, 6}.
    pub fn classic() -> Self {
        let members = |ids: &[NodeId]| ids.iter()
            .map(|id| Member { id: *id, address: None })
            .collect();
        Cluster {
            groups: vec![
                GroupSpec { group: Group::A, algorithm: Algorithm::Priority, members: members(&[1, 2, 3]) },
                GroupSpec { group: Group::B, algorithm: Algorithm::Ring, members: members(&[4, 5, 6]) },
            ],
        }
    }

    pub fn group(&self, group: Group) -> Option<&GroupSpec> {
        self.groups.iter().find(|spec| spec.group == group)
    }

    pub fn group_of(&self, id: NodeId) -> Option<&GroupSpec> {
        self.groups.iter().find(|spec| spec.members.iter().any(|member| member.id == id))
    }

    /// Every id in the cluster, sorted.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = self.groups.iter().flat_map(GroupSpec::ids).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn max_id(&self) -> NodeId {
        self.ids().last().copied().unwrap_or(0)
    }

    pub fn address(&self, id: NodeId) -> Option<SocketAddr> {
        self.groups.iter()
            .flat_map(|spec| spec.members.iter())
            .find(|member| member.id == id)
            .and_then(|member| member.address)
    }
}

/// Timers and thresholds for every coordination component.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub cluster: Cluster,

    /// Interval between liveness probe cycles
    #[serde(with = "millis")]
    pub probe_interval: Duration,

    /// Bound on a single liveness round-trip
    #[serde(with = "millis")]
    pub probe_timeout: Duration,

    /// Delay before the first probe cycle
    #[serde(with = "millis")]
    pub probe_delay: Duration,

    /// Consecutive failed probes before a peer is declared inactive
    pub failure_threshold: u32,

    /// Priority election: wait for an ack from a higher id
    #[serde(with = "millis")]
    pub ack_timeout: Duration,

    /// Ring election: pause before retrying with the next successor
    #[serde(with = "millis")]
    pub ring_retry_delay: Duration,

    /// Meta-coordinator candidacy collection window
    #[serde(with = "millis")]
    pub collection_window: Duration,

    /// Delay before the initial leaders run their first candidacy round
    #[serde(with = "millis")]
    pub meta_delay: Duration,

    #[serde(with = "millis")]
    pub snapshot_timeout: Duration,

    #[serde(with = "millis")]
    pub snapshot_interval: Duration,

    /// Group leader status polling and reporting
    #[serde(with = "millis")]
    pub status_interval: Duration,

    /// Meta-coordinator cross-group polling and heartbeat
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Silence after which a remote group is considered partitioned
    #[serde(with = "millis")]
    pub group_timeout: Duration,

    /// Recovery reconciliation loop
    #[serde(with = "millis")]
    pub recovery_interval: Duration,

    /// Minimum time between recovery attempts for one node
    #[serde(with = "millis")]
    pub recovery_backoff: Duration,

    pub max_recovery_attempts: u32,

    /// Time since first failure before an unrecovered node is substituted
    #[serde(with = "millis")]
    pub substitution_timeout: Duration,

    /// A node replaced by substitution takes id `substitute_base + id`
    pub substitute_base: NodeId,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster: Cluster::classic(),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            probe_delay: Duration::from_secs(10),
            failure_threshold: 3,
            ack_timeout: Duration::from_secs(3),
            ring_retry_delay: Duration::from_secs(1),
            collection_window: Duration::from_secs(8),
            meta_delay: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(15),
            snapshot_interval: Duration::from_secs(120),
            status_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(30),
            group_timeout: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(10),
            recovery_backoff: Duration::from_secs(30),
            max_recovery_attempts: 3,
            substitution_timeout: Duration::from_secs(60),
            substitute_base: 1000,
        }
    }
}

impl Config {
    pub fn new(cluster: Cluster) -> Self {
        Config { cluster, ..Config::default() }
    }

    pub fn with_probe(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_collection_window(mut self, window: Duration) -> Self {
        self.collection_window = window;
        self
    }

    pub fn with_meta_delay(mut self, delay: Duration) -> Self {
        self.meta_delay = delay;
        self
    }

    pub fn with_snapshot(mut self, interval: Duration, timeout: Duration) -> Self {
        self.snapshot_interval = interval;
        self.snapshot_timeout = timeout;
        self
    }

    pub fn with_polling(mut self, status: Duration, poll: Duration, group_timeout: Duration) -> Self {
        self.status_interval = status;
        self.poll_interval = poll;
        self.group_timeout = group_timeout;
        self
    }

    pub fn with_recovery(mut self, interval: Duration, backoff: Duration, attempts: u32) -> Self {
        self.recovery_interval = interval;
        self.recovery_backoff = backoff;
        self.max_recovery_attempts = attempts;
        self
    }

    pub fn with_substitution(mut self, timeout: Duration, base: NodeId) -> Self {
        self.substitution_timeout = timeout;
        self.substitute_base = base;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for spec in &self.cluster.groups {
            if spec.members.is_empty() {
                return Err(Error::Config(format!("group {} has no members", spec.group)));
            }
            for id in spec.ids() {
                if seen.contains(&id) {
                    return Err(Error::Config(format!("node {} listed twice", id)));
                }
                seen.push(id);
            }
        }
        if self.cluster.group(Group::A).is_none() || self.cluster.group(Group::B).is_none() {
            return Err(Error::Config("both groups A and B must be configured".to_string()));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure threshold must be positive".to_string()));
        }
        if self.collection_window == Duration::from_secs(0) {
            return Err(Error::Config("collection window must be positive".to_string()));
        }
        let max_id = self.cluster.max_id();
        if self.substitute_base < max_id || self.substitute_base.checked_add(max_id).is_none() {
            return Err(Error::Config(format!(
                "substitute base {} must lie above static ids up to {} without overflowing",
                self.substitute_base,
                max_id,
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn classic_cluster_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cluster.ids(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(config.cluster.group(Group::A).unwrap().initial_leader(), Some(3));
        assert_eq!(config.cluster.group_of(5).unwrap().algorithm, Algorithm::Ring);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = Config::default();
        config.cluster.groups[1].members.push(Member { id: 2, address: None });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn substitute_base_must_clear_static_ids() {
        let config = Config::default().with_substitution(Duration::from_secs(60), 4);
        assert!(config.validate().is_err());
        let config = Config::default().with_substitution(Duration::from_secs(60), usize::MAX - 2);
        assert!(config.validate().is_err());
        let config = Config::default().with_substitution(Duration::from_secs(60), 6);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{ "ack_timeout": 500, "failure_threshold": 2 }"#).unwrap();
        assert_eq!(config.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.probe_interval, Duration::from_secs(5));
        assert_eq!(config.cluster.ids().len(), 6);
    }
}
