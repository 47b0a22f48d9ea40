//! In-memory [Transport] for testing.

use crate::{transport::Transport, Error};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    lock::Mutex,
    StreamExt,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// One end of an in-memory duplex channel.
pub struct Endpoint {
    sender: UnboundedSender<Vec<u8>>,
    receiver: Mutex<UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
    sent: AtomicUsize,
}

/// Constructor for connected [Endpoint] pairs.
pub struct Channel;

impl Channel {
    /// Create two connected endpoints.
    pub fn init() -> (Endpoint, Endpoint) {
        let (a_sender, b_receiver) = mpsc::unbounded();
        let (b_sender, a_receiver) = mpsc::unbounded();
        (
            Endpoint::new(a_sender, a_receiver),
            Endpoint::new(b_sender, b_receiver),
        )
    }
}

impl Endpoint {
    fn new(sender: UnboundedSender<Vec<u8>>, receiver: UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            sent: AtomicUsize::new(0),
        }
    }

    /// Whether [Transport::close] was called on this endpoint.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of messages written by this endpoint.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Transport for Endpoint {
    async fn read(&self) -> Result<Vec<u8>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Closed),
            message = receiver.next() => message.ok_or(Error::Closed),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        self.sender
            .unbounded_send(data.to_vec())
            .map_err(|_| Error::Closed)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        self.sender.close_channel();
        Ok(())
    }
}
