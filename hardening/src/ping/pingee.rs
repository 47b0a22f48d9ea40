use super::{watchdog, Config};
use crate::{
    challenge::{self, Key},
    transport::Transport,
    wire::{self, MessageType},
    Error,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Agent side of the keep-alive.
pub struct Pingee<T: Transport> {
    cfg: Config,
    transport: Arc<T>,
    key: Key,

    pings: Arc<Notify>,
    governing: CancellationToken,
    context: CancellationToken,
    started: AtomicBool,
}

impl<T: Transport> Pingee<T> {
    /// Create a pingee that answers pings with nonces encrypted under `key`.
    pub fn new(context: CancellationToken, transport: Arc<T>, key: Key, cfg: Config) -> Self {
        Self {
            cfg,
            transport,
            key,
            pings: Arc::new(Notify::new()),
            context: context.child_token(),
            governing: context,
            started: AtomicBool::new(false),
        }
    }

    /// Start watching for pings. Subsequent calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) || self.context.is_cancelled() {
            return;
        }
        tokio::spawn(watchdog(
            self.context.clone(),
            self.governing.clone(),
            self.transport.clone(),
            self.pings.clone(),
            self.cfg.pingee_timeout(),
            "pingee",
        ));
        debug!(cfg = ?self.cfg, "started pingee");
    }

    /// Stop the pingee. The connection is left open.
    pub fn stop(&self) {
        self.context.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.context.is_cancelled()
    }

    /// Answer a [wire::Ping] message.
    pub async fn process(&self, raw: &[u8]) -> Result<(), Error> {
        if self.context.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let ping: wire::Ping = wire::unpack(MessageType::Ping, raw)?;
        self.pings.notify_one();
        let pong = wire::Pong {
            payload: challenge::encrypt(&self.key, &ping.nonce),
        };
        let message = wire::pack(MessageType::Pong, &pong);
        tokio::select! {
            biased;

            _ = self.context.cancelled() => Err(Error::Cancelled),
            result = self.transport.write(&message) => result,
        }
    }
}

impl<T: Transport> Drop for Pingee<T> {
    fn drop(&mut self) {
        self.context.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use std::time::Duration;
    use tokio::time::Instant;

    const AGENT_ID: &str = "0123456789abcdef0123456789abcdef";

    fn pingee(
        context: &CancellationToken,
    ) -> (Pingee<mocks::Endpoint>, Arc<mocks::Endpoint>, mocks::Endpoint) {
        let (agent, server) = mocks::Channel::init();
        let agent = Arc::new(agent);
        let key = challenge::challenge_key(AGENT_ID, &[0xde, 0xad, 0xbe, 0xef]);
        let pingee = Pingee::new(context.clone(), agent.clone(), key, Config::recommended());
        pingee.start();
        (pingee, agent, server)
    }

    fn ping(nonce: &[u8]) -> Vec<u8> {
        wire::pack(
            MessageType::Ping,
            &wire::Ping {
                nonce: nonce.to_vec(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_with_encrypted_nonce() {
        let context = CancellationToken::new();
        let (pingee, _agent, server) = pingee(&context);
        pingee.process(&ping(&[9u8; 16])).await.unwrap();

        let pong: wire::Pong = wire::unpack(MessageType::Pong, &server.read().await.unwrap()).unwrap();
        assert_ne!(pong.payload[challenge::IV_LENGTH..], [9u8; 16]);
        let key = challenge::challenge_key(AGENT_ID, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(challenge::decrypt(&key, &pong.payload).unwrap(), [9u8; 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_other_messages() {
        let context = CancellationToken::new();
        let (pingee, agent, _server) = pingee(&context);
        let pong = wire::pack(MessageType::Pong, &wire::Pong { payload: vec![1] });
        assert!(matches!(
            pingee.process(&pong).await,
            Err(Error::UnexpectedMessage { .. })
        ));
        assert_eq!(agent.sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_without_pings() {
        let context = CancellationToken::new();
        let start = Instant::now();
        let (pingee, agent, _server) = pingee(&context);
        context.cancelled().await;
        assert!(start.elapsed() >= Config::recommended().pingee_timeout());
        assert!(agent.is_closed());
        assert!(pingee.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_connection_alive() {
        let context = CancellationToken::new();
        let (pingee, agent, _server) = pingee(&context);
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            pingee.process(&ping(&[1u8; 16])).await.unwrap();
        }
        assert!(!context.is_cancelled());
        assert!(!agent.is_closed());
        assert_eq!(agent.sent(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_connection_open() {
        let context = CancellationToken::new();
        let (pingee, agent, _server) = pingee(&context);
        pingee.stop();
        pingee.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!context.is_cancelled());
        assert!(!agent.is_closed());
        assert!(matches!(
            pingee.process(&ping(&[1u8; 16])).await,
            Err(Error::Cancelled)
        ));
    }
}
