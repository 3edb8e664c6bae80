//! # Summary
//!
//! This module abstracts over internal connections between component tasks.
//!
//! Currently backed by `tokio::sync::mpsc` unbounded channels. Since every
//! channel is unbounded, the only way for a send to fail is if the receiving
//! task has stopped, which happens when a node is shut down. Sends to a
//! stopped component are dropped with a trace line.

use tokio::sync::mpsc;

/// Intra-process receiving channel.
#[derive(Debug)]
pub struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-process transmission channel. All clones send to the same receiving end.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
#[derive(Debug)]
pub struct Tx<T>(mpsc::UnboundedSender<T>);

/// Create a new pair of linked receiving and transmitting channels.
pub fn new<T>() -> (Rx<T>, Tx<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Rx(rx), Tx(tx))
}

impl<T> Tx<T> {
    /// Attempt to send a message through the channel.
    /// Does nothing if the receiving end has been dropped.
    pub fn send(&self, message: T) {
        if self.0.send(message).is_err() {
            trace!("dropping message to stopped component");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl<T> Rx<T> {
    /// Waits for the next message; `None` once every `Tx` is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }

    /// Takes a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.0.try_recv().ok()
    }
}
