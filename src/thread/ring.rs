//! # Summary
//!
//! Ring election over the group members sorted by id.
//!
//! The initiator sends a token holding the highest id seen so far and the
//! list of visited nodes to its next active successor. Each node folds its
//! own id in and passes the token on. When the token reaches a node that
//! already visited it, the first circuit is over: that node turns it into a
//! leader announcement for the highest id, which makes a second circuit and
//! stops at the first node that has already seen it.
//!
//! Successors are recomputed for every hop, skipping peers believed to be
//! inactive. A failed hop waits briefly and moves on to the next successor;
//! a node that cannot reach anyone proclaims itself leader.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::message::{Election, NodeId};
use crate::thread::election::{Context, GroupElection, State};

pub struct Ring {
    context: Context,
    members: Vec<NodeId>,
    state: State,
    deadline: Option<Instant>,
    retry_delay: Duration,
    election_timeout: Duration,
}

impl Ring {
    pub fn new(context: Context, members: Vec<NodeId>, retry_delay: Duration, hop_timeout: Duration) -> Self {
        let mut members = members;
        members.sort_unstable();
        members.dedup();
        let state = if context.roles.is_leader() { State::Coordinator } else { State::Idle };
        let election_timeout = hop_timeout * members.len().max(1) as u32 * 2;
        Ring { context, members, state, deadline: None, retry_delay, election_timeout }
    }

    /// Every other member, in ring order starting after the local node.
    fn successors(&self) -> Vec<NodeId> {
        let id = self.context.id;
        let after = self.members.iter().copied().filter(|member| *member > id);
        let before = self.members.iter().copied().filter(|member| *member < id);
        after.chain(before).collect()
    }

    /// Hands `message` to the nearest reachable active successor.
    async fn forward(&self, message: Election) -> bool {
        let mut retry = false;
        for peer in self.successors() {
            if !self.context.is_active(peer) {
                continue
            }
            if retry {
                tokio::time::sleep(self.retry_delay).await;
            }
            if self.context.send(peer, message.clone()).await {
                return true
            }
            retry = true;
        }
        false
    }

    fn settle(&mut self, leader: NodeId) {
        self.state = if leader == self.context.id { State::Coordinator } else { State::Idle };
        self.deadline = None;
        self.context.adopt(leader);
    }

    fn electing(&mut self) {
        if self.state != State::Electing {
            self.state = State::Electing;
            self.deadline = Some(Instant::now() + self.election_timeout);
        }
    }

    async fn respond_token(&mut self, max: NodeId, mut visited: Vec<NodeId>) {
        let id = self.context.id;
        if visited.contains(&id) {
            info!("{} completed election circuit; leader is {}", id, max);
            self.settle(max);
            let announcement = Election::Leader { leader: max, visited: vec![id] };
            if !self.forward(announcement).await && max != id {
                self.isolated();
            }
        } else {
            self.electing();
            visited.push(id);
            let token = Election::Token { max: max.max(id), visited };
            if !self.forward(token).await {
                self.isolated();
            }
        }
    }

    async fn respond_leader(&mut self, leader: NodeId, mut visited: Vec<NodeId>) {
        let id = self.context.id;
        self.settle(leader);
        if visited.contains(&id) {
            debug!("leader announcement for {} returned to {}", leader, id);
            return
        }
        visited.push(id);
        if !self.forward(Election::Leader { leader, visited }).await && leader != id {
            self.isolated();
        }
    }

    fn isolated(&mut self) {
        warn!("{} has no reachable successor; proclaiming itself leader", self.context.id);
        self.settle(self.context.id);
    }
}

#[async_trait]
impl GroupElection for Ring {
    fn state(&self) -> State {
        self.state
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    async fn trigger(&mut self) {
        if self.state == State::Electing {
            debug!("election already in progress");
            return
        }
        let id = self.context.id;
        debug!("{} starting ring election", id);
        self.electing();
        if !self.forward(Election::Token { max: id, visited: vec![id] }).await {
            self.isolated();
        }
    }

    async fn respond(&mut self, from: NodeId, message: Election) {
        match message {
        | Election::Token { max, visited } => self.respond_token(max, visited).await,
        | Election::Leader { leader, visited } => self.respond_leader(leader, visited).await,
        | Election::Call | Election::Ack | Election::Coordinator => {
            debug!("ignoring priority election message from {}", from);
        }
        }
    }

    async fn expire(&mut self) {
        self.deadline = None;
        if self.state == State::Electing {
            debug!("token lost; restarting ring election");
            self.state = State::Idle;
            self.trigger().await;
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::thread::election::tests::fixture;
    use crate::thread::meta;

    fn ring(context: Context) -> Ring {
        Ring::new(context, vec![4, 5, 6], Duration::from_secs(1), Duration::from_secs(3))
    }

    #[tokio::test]
    async fn successors_wrap_around() {
        let (context, _fixture) = fixture(5);
        assert_eq!(ring(context).successors(), vec![6, 4]);
    }

    #[tokio::test]
    async fn trigger_skips_inactive_successor() {
        let (context, mut fixture) = fixture(5);
        context.nodes.write().mark_inactive(6);
        let mut ring = ring(context);
        ring.trigger().await;
        assert_eq!(ring.state(), State::Electing);
        assert_eq!(fixture.take(4), Some(Election::Token { max: 5, visited: vec![5] }));
        assert_eq!(fixture.take(6), None);

        ring.trigger().await;
        assert_eq!(fixture.take(4), None);
    }

    #[tokio::test]
    async fn receiver_forwards_higher_carried_max() {
        let (context, mut fixture) = fixture(4);
        let mut ring = ring(context);
        ring.respond(6, Election::Token { max: 6, visited: vec![6] }).await;
        assert_eq!(ring.state(), State::Electing);
        assert_eq!(fixture.take(5), Some(Election::Token { max: 6, visited: vec![6, 4] }));
    }

    #[tokio::test]
    async fn receiver_replaces_lower_carried_max() {
        let (context, mut fixture) = fixture(4);
        let mut ring = ring(context);
        ring.respond(5, Election::Token { max: 3, visited: vec![5] }).await;
        assert_eq!(fixture.take(5), Some(Election::Token { max: 4, visited: vec![5, 4] }));
    }

    #[tokio::test]
    async fn returning_token_becomes_announcement() {
        let (context, mut fixture) = fixture(5);
        context.nodes.write().mark_inactive(6);
        let mut ring = ring(context);
        ring.trigger().await;
        fixture.take(4);

        ring.respond(4, Election::Token { max: 5, visited: vec![5, 4] }).await;
        assert_eq!(ring.state(), State::Coordinator);
        assert!(ring.context.roles.is_leader());
        assert!(matches!(fixture.meta_rx.try_recv(), Some(meta::In::Start)));
        assert_eq!(fixture.take(4), Some(Election::Leader { leader: 5, visited: vec![5] }));

        ring.respond(4, Election::Leader { leader: 5, visited: vec![5, 4] }).await;
        assert_eq!(fixture.take(4), None);
        assert!(fixture.meta_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn announcement_is_adopted_and_forwarded() {
        let (context, mut fixture) = fixture(4);
        let mut ring = ring(context);
        ring.respond(5, Election::Leader { leader: 5, visited: vec![5] }).await;
        assert_eq!(ring.state(), State::Idle);
        assert_eq!(ring.context.roles.leader(), Some(5));
        assert_eq!(fixture.take(5), Some(Election::Leader { leader: 5, visited: vec![5, 4] }));
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_node_proclaims_itself() {
        let (context, fixture) = fixture(4);
        fixture.network.crash(5);
        fixture.network.crash(6);
        let mut ring = ring(context);
        ring.trigger().await;
        assert_eq!(ring.state(), State::Coordinator);
        assert_eq!(ring.context.roles.leader(), Some(4));
        assert!(!ring.context.is_active(5));
        assert!(!ring.context.is_active(6));
    }
}
