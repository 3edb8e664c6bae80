//! # Summary
//!
//! This module abstracts over external connections to peer processes.
//!
//! Currently wraps `tokio-util`'s length-delimited codec around each half of
//! a TCP stream and serializes frames with `bincode`. This allows us to
//! send and receive Rust structs through a TCP connection with minimal
//! boilerplate on the sending and receiving ends.

use std::marker::PhantomData;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{Error, Result};

pub struct Rx<T> {
    inner: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    _marker: PhantomData<T>,
}

pub struct Tx<T> {
    inner: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    _marker: PhantomData<T>,
}

pub fn split<T, R>(stream: TcpStream) -> (Rx<R>, Tx<T>)
where T: serde::Serialize,
      R: serde::de::DeserializeOwned,
{
    let (rx, tx) = stream.into_split();
    let rx = FramedRead::new(rx, LengthDelimitedCodec::new());
    let tx = FramedWrite::new(tx, LengthDelimitedCodec::new());
    (Rx { inner: rx, _marker: PhantomData }, Tx { inner: tx, _marker: PhantomData })
}

impl<T: serde::de::DeserializeOwned> Rx<T> {
    /// Next decoded frame, or `None` once the peer closes the connection.
    pub async fn recv(&mut self) -> Result<Option<T>> {
        match self.inner.next().await {
        | None => Ok(None),
        | Some(Err(error)) => Err(Error::Io(error)),
        | Some(Ok(bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
        }
    }
}

impl<T: serde::Serialize> Tx<T> {
    pub async fn send(&mut self, item: &T) -> Result<()> {
        let bytes = bincode::serialize(item)?;
        self.inner.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }
}
