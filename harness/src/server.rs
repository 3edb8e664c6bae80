use std::collections::BTreeMap;
use std::sync::Arc;

use metacoord::transport::memory::Network;
use metacoord::{Config, Log, Node, NodeId, Result};

use crate::sampler::Proc;

enum Mode {
    Memory(Network),
    Tcp,
}

/// Running nodes of one scenario. Dropping a node stops all of its tasks.
pub struct Servers {
    config: Config,
    mode: Mode,
    nodes: BTreeMap<NodeId, Node>,
}

impl Servers {
    pub fn new(config: Config, tcp: bool) -> Self {
        let mode = if tcp { Mode::Tcp } else { Mode::Memory(Network::new()) };
        Servers { config, mode, nodes: BTreeMap::new() }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.config.cluster.ids()
    }

    pub async fn start(&mut self, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            warn!("node {} is already running", id);
            return Ok(())
        }
        let node = match &self.mode {
        | Mode::Memory(network) => {
            let (transport, inbox) = network.connect(id);
            Node::spawn(&self.config, id, Arc::new(transport), inbox, Arc::new(Log), Arc::new(Proc))?
        }
        | Mode::Tcp => Node::listen(&self.config, id, Arc::new(Log), Arc::new(Proc)).await?,
        };
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn crash(&mut self, id: NodeId) {
        if let Mode::Memory(network) = &self.mode {
            network.crash(id);
        }
        if self.nodes.remove(&id).is_none() {
            warn!("node {} is not running", id);
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        let node = self.nodes.get(&id);
        if node.is_none() {
            warn!("node {} is not running", id);
        }
        node
    }

    pub fn status(&self) {
        for node in self.nodes.values() {
            let role = match (node.is_meta(), node.is_acting_leader()) {
            | (true, _) => "meta-coordinator",
            | (false, true) => "leader",
            | (false, false) => "follower",
            };
            println!(
                "node {} (group {}, {}): leader {:?}, meta {:?}, clock {}, active {:?}, pending {:?}",
                node.id(),
                node.group(),
                role,
                node.leader(),
                node.meta_view(),
                node.clock(),
                node.active_peers(),
                node.recovery().pending(),
            );
        }
        let metas = self.nodes.values().filter(|node| node.is_meta()).count();
        if metas > 1 {
            warn!("{} nodes are acting as meta-coordinator", metas);
        }
        if let Mode::Memory(network) = &self.mode {
            let (delivered, dropped) = network.counters();
            println!("network: {} delivered, {} dropped", delivered, dropped);
        }
    }
}
