use crate::Error;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::sync::Arc;

/// Message types that can be sent to the coordination loop.
pub enum Message<T> {
    /// Force a refresh (or join the one in flight).
    ///
    /// The responder is sent the refreshed value, or the error of the failed refresh.
    Fetch {
        responder: oneshot::Sender<Result<Arc<T>, Error>>,
    },
}

/// Ingress mailbox for the coordination loop.
pub struct Mailbox<T> {
    sender: mpsc::Sender<Message<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> Mailbox<T> {
    pub(super) fn new(sender: mpsc::Sender<Message<T>>) -> Self {
        Self { sender }
    }

    /// Request a refresh and wait for its result.
    pub async fn fetch(&mut self) -> Result<Arc<T>, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Fetch { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }
}
