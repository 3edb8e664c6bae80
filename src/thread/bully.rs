//! # Summary
//!
//! Priority (bully) election: the highest active id becomes leader.
//!
//! A triggered node challenges every active peer with a higher id. With no
//! such peer it proclaims itself; otherwise it waits for an ack and
//! proclaims itself if none arrives in time. A challenged node acks the
//! lower id and runs its own election, so the challenge cascades upwards.
//! The last coordinator announcement received always wins.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::message::{Election, NodeId};
use crate::thread::election::{Context, GroupElection, State};

pub struct Bully {
    context: Context,
    state: State,
    deadline: Option<Instant>,
    ack_timeout: Duration,
}

impl Bully {
    pub fn new(context: Context, ack_timeout: Duration) -> Self {
        let state = if context.roles.is_leader() { State::Coordinator } else { State::Idle };
        Bully { context, state, deadline: None, ack_timeout }
    }

    async fn proclaim(&mut self) {
        info!("{} proclaiming itself coordinator", self.context.id);
        self.state = State::Coordinator;
        self.deadline = None;
        self.context.adopt(self.context.id);
        self.announce().await;
    }

    async fn announce(&self) {
        for peer in self.context.active() {
            self.context.send(peer, Election::Coordinator).await;
        }
    }
}

#[async_trait]
impl GroupElection for Bully {
    fn state(&self) -> State {
        self.state
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    async fn trigger(&mut self) {
        match self.state {
        | State::Electing | State::WaitingAck => {
            debug!("election already in progress");
            return
        }
        | State::Coordinator if self.context.roles.is_leader() => {
            debug!("already coordinator; announcing again");
            self.announce().await;
            return
        }
        | State::Coordinator | State::Idle => (),
        }

        debug!("{} starting election", self.context.id);
        self.state = State::Electing;
        let id = self.context.id;
        let mut contacted = false;
        for peer in self.context.active().into_iter().filter(|peer| *peer > id) {
            contacted |= self.context.send(peer, Election::Call).await;
        }

        if contacted {
            self.state = State::WaitingAck;
            self.deadline = Some(Instant::now() + self.ack_timeout);
        } else {
            self.proclaim().await;
        }
    }

    async fn respond(&mut self, from: NodeId, message: Election) {
        match message {
        | Election::Call if from < self.context.id => {
            self.context.send(from, Election::Ack).await;
            self.trigger().await;
        }
        | Election::Call => debug!("ignoring challenge from higher id {}", from),
        | Election::Ack if self.state == State::WaitingAck => {
            debug!("{} deferring to {}", self.context.id, from);
            self.state = State::Idle;
            // Wait for the announcement, and start over if it never comes.
            self.deadline = Some(Instant::now() + self.ack_timeout * 2);
        }
        | Election::Ack => (),
        | Election::Coordinator => {
            self.state = State::Idle;
            self.deadline = None;
            self.context.adopt(from);
        }
        | Election::Token { .. } | Election::Leader { .. } => {
            debug!("ignoring ring election message from {}", from);
        }
        }
    }

    async fn expire(&mut self) {
        self.deadline = None;
        match self.state {
        | State::WaitingAck => self.proclaim().await,
        | State::Idle => {
            let leader = self.context.roles.leader();
            if leader.map_or(true, |leader| !self.context.is_active(leader)) {
                debug!("no coordinator announced; restarting election");
                self.trigger().await;
            }
        }
        | State::Electing | State::Coordinator => (),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::thread::election::tests::fixture;

    #[tokio::test]
    async fn highest_active_node_proclaims_immediately() {
        let (context, mut fixture) = fixture(2);
        context.nodes.write().mark_inactive(3);
        let mut bully = Bully::new(context, Duration::from_secs(3));
        bully.trigger().await;
        assert_eq!(bully.state(), State::Coordinator);
        assert!(bully.context.roles.is_leader());
        assert_eq!(fixture.take(1), Some(Election::Coordinator));
        assert_eq!(fixture.take(3), None);
    }

    #[tokio::test]
    async fn lower_node_challenges_higher_and_waits() {
        let (context, mut fixture) = fixture(1);
        let mut bully = Bully::new(context, Duration::from_secs(3));
        bully.trigger().await;
        assert_eq!(bully.state(), State::WaitingAck);
        assert!(bully.deadline().is_some());
        assert_eq!(fixture.take(2), Some(Election::Call));
        assert_eq!(fixture.take(3), Some(Election::Call));

        bully.trigger().await;
        assert_eq!(fixture.take(2), None);

        bully.respond(2, Election::Ack).await;
        assert_eq!(bully.state(), State::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_leads_to_self_proclamation() {
        let (context, mut fixture) = fixture(1);
        let mut bully = Bully::new(context, Duration::from_secs(3));
        bully.trigger().await;
        bully.expire().await;
        assert_eq!(bully.state(), State::Coordinator);
        assert_eq!(bully.context.roles.leader(), Some(1));
        fixture.take(2);
        assert_eq!(fixture.take(2), Some(Election::Coordinator));
    }

    #[tokio::test]
    async fn challenge_from_lower_is_acked_and_cascades() {
        let (context, mut fixture) = fixture(2);
        let mut bully = Bully::new(context, Duration::from_secs(3));
        bully.respond(1, Election::Call).await;
        assert_eq!(fixture.take(1), Some(Election::Ack));
        assert_eq!(fixture.take(3), Some(Election::Call));
        assert_eq!(bully.state(), State::WaitingAck);
    }

    #[tokio::test]
    async fn coordinator_wins_even_mid_election() {
        let (context, mut fixture) = fixture(1);
        let mut bully = Bully::new(context, Duration::from_secs(3));
        bully.trigger().await;
        bully.respond(2, Election::Coordinator).await;
        assert_eq!(bully.state(), State::Idle);
        assert_eq!(bully.deadline(), None);
        assert_eq!(bully.context.roles.leader(), Some(2));

        bully.respond(2, Election::Coordinator).await;
        assert_eq!(bully.context.roles.leader(), Some(2));
    }
}
