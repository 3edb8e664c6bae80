//! # Summary
//!
//! TCP transport. Every destination gets one persistent connection, dialed
//! on first use. A send or probe takes that connection's lock, writes one
//! frame and waits for the matching reply, bounded by a timeout, so frames
//! to one destination go out strictly one after another in send order. Any
//! failure drops the connection and the next exchange dials afresh. `serve`
//! is the listening half: it answers probes and pushes delivered envelopes
//! into the local inbox in the order they arrive on each connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap as Map;
use serde_derive::{Serialize, Deserialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::config::Cluster;
use crate::error::{Error, Result};
use crate::internal;
use crate::message::{Envelope, NodeId};
use crate::socket;
use crate::transport::Transport;

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
enum Frame {
    Ping,
    Pong,
    Deliver(Envelope),
    Ack,
}

struct Connection {
    rx: socket::Rx<Frame>,
    tx: socket::Tx<Frame>,
}

impl Connection {
    async fn dial(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = socket::split::<Frame, Frame>(stream);
        Ok(Connection { rx, tx })
    }

    async fn exchange(&mut self, to: NodeId, frame: &Frame, expect: &Frame) -> Result<()> {
        self.tx.send(frame).await?;
        match self.rx.recv().await? {
        | Some(reply) if reply == *expect => Ok(()),
        | Some(_) => Err(Error::Unreachable(to)),
        | None => Err(Error::Closed),
        }
    }
}

struct Peer {
    address: SocketAddr,
    connection: Mutex<Option<Connection>>,
}

#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct Tcp {
    #[derivative(Debug = "ignore")]
    peers: Arc<Map<NodeId, Peer>>,
    timeout: Duration,
}

impl Tcp {
    /// Uses the addresses listed in the cluster membership.
    pub fn new(cluster: &Cluster, timeout: Duration) -> Self {
        let addresses = cluster.ids()
            .into_iter()
            .filter_map(|id| cluster.address(id).map(|address| (id, address)));
        Tcp::with_addresses(addresses, timeout)
    }

    pub fn with_addresses<I>(addresses: I, timeout: Duration) -> Self
        where I: IntoIterator<Item = (NodeId, SocketAddr)>
    {
        let peers = addresses.into_iter()
            .map(|(id, address)| (id, Peer { address, connection: Mutex::new(None) }))
            .collect();
        Tcp { peers: Arc::new(peers), timeout }
    }

    async fn exchange(&self, to: NodeId, frame: Frame, expect: Frame) -> Result<()> {
        let peer = self.peers.get(&to).ok_or(Error::Unknown(to))?;
        let mut slot = peer.connection.lock().await;
        let round_trip = async {
            // A connection kept from earlier may have died with the old peer
            // process; such a failure gets one retry on a fresh connection.
            let reused = slot.is_some();
            if let Some(connection) = slot.as_mut() {
                match connection.exchange(to, &frame, &expect).await {
                | Ok(()) => return Ok(()),
                | Err(error) => {
                    trace!("connection to {} went stale: {}", to, error);
                    *slot = None;
                }
                }
            }
            let mut connection = Connection::dial(peer.address).await?;
            let result = connection.exchange(to, &frame, &expect).await;
            if result.is_ok() {
                *slot = Some(connection);
            } else if reused {
                debug!("exchange with {} failed after reconnecting", to);
            }
            result
        };
        let result = tokio::time::timeout(self.timeout, round_trip).await;
        match result {
        | Ok(result) => result,
        | Err(_) => {
            *slot = None;
            Err(Error::Timeout(to))
        }
        }
    }
}

#[async_trait]
impl Transport for Tcp {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<()> {
        self.exchange(to, Frame::Deliver(envelope), Frame::Ack).await
    }

    async fn probe(&self, to: NodeId) -> Result<()> {
        self.exchange(to, Frame::Ping, Frame::Pong).await
    }
}

/// Accepts connections forever, answering probes and forwarding envelopes to `inbox`.
pub async fn serve(listener: TcpListener, inbox: internal::Tx<Envelope>) -> Result<()> {
    loop {
        let (stream, address) = listener.accept().await?;
        trace!("accepted connection from {}", address);
        tokio::spawn(respond(stream, inbox.clone()));
    }
}

async fn respond(stream: TcpStream, inbox: internal::Tx<Envelope>) {
    let (mut rx, mut tx) = socket::split::<Frame, Frame>(stream);
    loop {
        let reply = match rx.recv().await {
        | Ok(Some(Frame::Ping)) => Frame::Pong,
        | Ok(Some(Frame::Deliver(_))) if inbox.is_closed() => return,
        | Ok(Some(Frame::Deliver(envelope))) => {
            inbox.send(envelope);
            Frame::Ack
        }
        | Ok(Some(frame)) => {
            debug!("unexpected frame {:?}", frame);
            continue
        }
        | Ok(None) => return,
        | Err(error) => {
            debug!("dropping connection: {}", error);
            return
        }
        };
        if let Err(error) = tx.send(&reply).await {
            debug!("failed to reply: {}", error);
            return
        }
    }
}
