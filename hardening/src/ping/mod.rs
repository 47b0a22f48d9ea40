//! Keep-alive for established connections.
//!
//! The server runs a [Pinger] that sends a [crate::wire::Ping] carrying a fresh nonce every
//! [Config::interval]. The agent runs a [Pingee] that answers each ping with a
//! [crate::wire::Pong] carrying the nonce encrypted under its challenge key. Each side runs a
//! watchdog: if no valid acknowledgment (pinger) or ping (pingee) arrives within its timeout,
//! the watchdog closes the transport and cancels the connection context. This is the only
//! way a dead peer is detected.
//!
//! Incoming messages are not read by this module. The connection's reader hands pongs to
//! [Pinger::process] and pings to [Pingee::process].

use crate::transport::Transport;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

mod nonces;
pub use nonces::Nonces;
mod pinger;
pub use pinger::Pinger;
mod pingee;
pub use pingee::Pingee;

/// Length of a ping nonce.
pub const PING_NONCE_LENGTH: usize = 16;

/// Configuration for the keep-alive.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time between two pings.
    pub interval: Duration,

    /// Time the pinger waits for a valid acknowledgment before closing the connection.
    ///
    /// Also bounds the lifetime of each nonce.
    pub timeout: Duration,
}

impl Config {
    pub fn recommended() -> Self {
        let interval = Duration::from_secs(5);
        Self {
            interval,
            timeout: interval * 3,
        }
    }

    /// Time the pingee waits for a ping before closing the connection.
    pub fn pingee_timeout(&self) -> Duration {
        self.interval * 3
    }
}

/// Close `transport` and cancel `governing` unless `activity` is signalled at least once per
/// `timeout`. Returns early when `context` is cancelled.
async fn watchdog<T: Transport>(
    context: CancellationToken,
    governing: CancellationToken,
    transport: Arc<T>,
    activity: Arc<Notify>,
    timeout: Duration,
    side: &'static str,
) {
    let mut deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            biased;

            _ = context.cancelled() => return,
            _ = activity.notified() => {
                deadline = Instant::now() + timeout;
            },
            _ = tokio::time::sleep_until(deadline) => {
                error!(side, ?timeout, "keep-alive timeout exceeded, closing connection");
                if let Err(err) = transport.close().await {
                    warn!(?err, side, "failed to close connection after keep-alive timeout");
                }
                governing.cancel();
                return;
            },
        }
    }
}
