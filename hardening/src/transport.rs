//! Abstract message channel the handshake runs over.

use crate::Error;
use bastion_tunnel::Encryptor;
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// A bidirectional channel carrying one logical message per call.
pub trait Transport: Send + Sync + 'static {
    /// Receive the next message.
    fn read(&self) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Send a message.
    fn write(&self, data: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Close the channel. Pending and future reads on both ends fail.
    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Receive the next message, aborting if `context` is cancelled.
pub async fn recv<T: Transport>(context: &CancellationToken, transport: &T) -> Result<Vec<u8>, Error> {
    tokio::select! {
        _ = context.cancelled() => Err(Error::Cancelled),
        result = transport.read() => result,
    }
}

/// Like [recv], but fails with [Error::Timeout] if nothing arrives within `timeout`.
pub async fn recv_timeout<T: Transport>(
    context: &CancellationToken,
    transport: &T,
    timeout: Duration,
) -> Result<Vec<u8>, Error> {
    tokio::time::timeout(timeout, recv(context, transport))
        .await
        .map_err(|_| Error::Timeout)?
}

/// Send a message, aborting if `context` is cancelled.
pub async fn send<T: Transport>(
    context: &CancellationToken,
    transport: &T,
    data: &[u8],
) -> Result<(), Error> {
    tokio::select! {
        _ = context.cancelled() => Err(Error::Cancelled),
        result = transport.write(data) => result,
    }
}

/// A [Transport] whose messages are encrypted with a tunnel [Encryptor].
pub struct Secured<T> {
    inner: Arc<T>,
    encryptor: Arc<dyn Encryptor>,
}

impl<T: Transport> Secured<T> {
    pub fn new(inner: Arc<T>, encryptor: Arc<dyn Encryptor>) -> Self {
        Self { inner, encryptor }
    }
}

impl<T: Transport> Transport for Secured<T> {
    async fn read(&self) -> Result<Vec<u8>, Error> {
        let ciphertext = self.inner.read().await?;
        Ok(self.encryptor.decrypt(&ciphertext)?)
    }

    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let ciphertext = self.encryptor.encrypt(data)?;
        self.inner.write(&ciphertext).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}
