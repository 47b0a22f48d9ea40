use super::{watchdog, Config, Nonces, PING_NONCE_LENGTH};
use crate::{
    abh::{Abh, AgentBinaryIdentity, ConnectionKind},
    challenge,
    transport::Transport,
    wire::{self, MessageType},
    Error,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::Notify,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Server side of the keep-alive.
pub struct Pinger<T: Transport> {
    cfg: Config,
    transport: Arc<T>,
    abh: Abh,
    kind: ConnectionKind,
    identity: AgentBinaryIdentity,
    agent_id: String,

    nonces: Arc<Nonces>,
    acks: Arc<Notify>,
    governing: CancellationToken,
    context: CancellationToken,
    started: AtomicBool,
}

impl<T: Transport> Pinger<T> {
    /// Create a pinger for the connection of `agent_id` governed by `context`.
    ///
    /// Acknowledgments are checked against the challenge keys of every hash `abh` currently
    /// accepts for `identity`.
    pub fn new(
        context: CancellationToken,
        transport: Arc<T>,
        abh: Abh,
        kind: ConnectionKind,
        identity: AgentBinaryIdentity,
        agent_id: &str,
        cfg: Config,
    ) -> Self {
        let nonces = Arc::new(Nonces::new(PING_NONCE_LENGTH, cfg.timeout));
        Self {
            cfg,
            transport,
            abh,
            kind,
            identity,
            agent_id: agent_id.to_string(),
            nonces,
            acks: Arc::new(Notify::new()),
            context: context.child_token(),
            governing: context,
            started: AtomicBool::new(false),
        }
    }

    /// Start sending pings and watching for acknowledgments. Subsequent calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) || self.context.is_cancelled() {
            return;
        }
        tokio::spawn(ping_loop(
            self.context.clone(),
            self.transport.clone(),
            self.nonces.clone(),
            self.cfg.clone(),
            self.agent_id.clone(),
        ));
        tokio::spawn(watchdog(
            self.context.clone(),
            self.governing.clone(),
            self.transport.clone(),
            self.acks.clone(),
            self.cfg.timeout,
            "pinger",
        ));
        debug!(agent_id = %self.agent_id, cfg = ?self.cfg, "started pinger");
    }

    /// Stop the pinger. The connection is left open.
    pub fn stop(&self) {
        self.context.cancel();
    }

    /// Whether the pinger was stopped or the connection cancelled.
    pub fn is_stopped(&self) -> bool {
        self.context.is_cancelled()
    }

    /// Process a [wire::Pong] message.
    ///
    /// The acknowledgment must decrypt to an outstanding nonce under one of the challenge keys
    /// of the peer. Replayed or unknown nonces are rejected with [Error::UnknownNonce].
    pub fn process(&self, raw: &[u8]) -> Result<(), Error> {
        if self.context.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let pong: wire::Pong = wire::unpack(MessageType::Pong, raw)?;
        let hashes = self.abh.get_abh(self.kind, &self.identity)?;
        for hash in &hashes {
            let key = challenge::challenge_key(&self.agent_id, hash);
            let Ok(nonce) = challenge::decrypt(&key, &pong.payload) else {
                continue;
            };
            if self.nonces.accept(&nonce) {
                self.acks.notify_one();
                return Ok(());
            }
        }
        debug!(agent_id = %self.agent_id, "rejected keep-alive acknowledgment");
        Err(Error::UnknownNonce)
    }
}

impl<T: Transport> Drop for Pinger<T> {
    fn drop(&mut self) {
        self.context.cancel();
    }
}

async fn ping_loop<T: Transport>(
    context: CancellationToken,
    transport: Arc<T>,
    nonces: Arc<Nonces>,
    cfg: Config,
    agent_id: String,
) {
    let mut ticker = interval_at(Instant::now() + cfg.interval, cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            _ = context.cancelled() => return,
            _ = ticker.tick() => {},
        }
        let nonce = nonces.issue();
        let message = wire::pack(MessageType::Ping, &wire::Ping { nonce: nonce.clone() });
        let result = tokio::select! {
            biased;

            _ = context.cancelled() => return,
            result = transport.write(&message) => result,
        };
        if let Err(err) = result {
            warn!(?err, %agent_id, "failed to send ping");
            nonces.forget(&nonce);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use bastion_cache::{Config as CacheConfig, DataSource};
    use bastion_persistence::memory;
    use std::time::Duration;

    const AGENT_ID: &str = "0123456789abcdef0123456789abcdef";
    const ABH: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

    async fn abh() -> Abh {
        let files = Arc::new(memory::Files::new());
        files.put(
            crate::abh::FILE_PATH,
            r#"{"v1":{"agents":{"1.2.3/linux/amd64":["00ff","deadbeef"]}}}"#,
        );
        Abh::new(
            CancellationToken::new(),
            DataSource::File(files),
            CacheConfig::recommended(),
        )
        .await
        .unwrap()
    }

    async fn pinger(
        context: &CancellationToken,
    ) -> (Arc<Pinger<mocks::Endpoint>>, Arc<mocks::Endpoint>, mocks::Endpoint) {
        let (server, agent) = mocks::Channel::init();
        let server = Arc::new(server);
        let pinger = Arc::new(Pinger::new(
            context.clone(),
            server.clone(),
            abh().await,
            ConnectionKind::Agent,
            AgentBinaryIdentity::agent("1.2.3", "linux", "amd64"),
            AGENT_ID,
            Config::recommended(),
        ));
        pinger.start();
        (pinger, server, agent)
    }

    /// Read the next ping and build its acknowledgment.
    async fn ack(agent: &mocks::Endpoint) -> Vec<u8> {
        let ping: wire::Ping = wire::unpack(MessageType::Ping, &agent.read().await.unwrap()).unwrap();
        assert_eq!(ping.nonce.len(), PING_NONCE_LENGTH);
        let key = challenge::challenge_key(AGENT_ID, &ABH);
        wire::pack(
            MessageType::Pong,
            &wire::Pong {
                payload: challenge::encrypt(&key, &ping.nonce),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_rejected() {
        let context = CancellationToken::new();
        let (pinger, _server, agent) = pinger(&context).await;
        let pong = ack(&agent).await;
        pinger.process(&pong).unwrap();
        assert!(matches!(pinger.process(&pong), Err(Error::UnknownNonce)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_nonce_rejected() {
        let context = CancellationToken::new();
        let (pinger, _server, agent) = pinger(&context).await;

        // Never sent
        let key = challenge::challenge_key(AGENT_ID, &ABH);
        let forged = wire::pack(
            MessageType::Pong,
            &wire::Pong {
                payload: challenge::encrypt(&key, &[7u8; PING_NONCE_LENGTH]),
            },
        );
        assert!(matches!(pinger.process(&forged), Err(Error::UnknownNonce)));

        // Sent, but acknowledged with a key outside the directory
        let ping: wire::Ping = wire::unpack(MessageType::Ping, &agent.read().await.unwrap()).unwrap();
        let key = challenge::challenge_key(AGENT_ID, &[0xca, 0xfe, 0xba, 0xbe]);
        let wrong = wire::pack(
            MessageType::Pong,
            &wire::Pong {
                payload: challenge::encrypt(&key, &ping.nonce),
            },
        );
        assert!(matches!(pinger.process(&wrong), Err(Error::UnknownNonce)));

        // Wrong message type
        let ping = wire::pack(MessageType::Ping, &ping);
        assert!(matches!(
            pinger.process(&ping),
            Err(Error::UnexpectedMessage { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_without_acks() {
        let context = CancellationToken::new();
        let start = Instant::now();
        let (pinger, server, _agent) = pinger(&context).await;
        context.cancelled().await;
        assert!(start.elapsed() >= Config::recommended().timeout);
        assert!(server.is_closed());
        assert!(pinger.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_keep_connection_alive() {
        let context = CancellationToken::new();
        let (pinger, server, agent) = pinger(&context).await;
        for _ in 0..12 {
            let pong = ack(&agent).await;
            pinger.process(&pong).unwrap();
        }
        // A minute has passed, well beyond the timeout
        assert!(!context.is_cancelled());
        assert!(!server.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let context = CancellationToken::new();
        let (pinger, server, _agent) = pinger(&context).await;
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(server.sent(), 2);

        pinger.stop();
        pinger.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.sent(), 2);
        assert!(!server.is_closed());
        assert!(!context.is_cancelled());
        assert!(matches!(pinger.process(&[]), Err(Error::Cancelled)));

        // Starting again does nothing
        pinger.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.sent(), 2);
    }
}
