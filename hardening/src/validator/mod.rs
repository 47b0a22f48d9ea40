//! Server side of connection hardening.
//!
//! A [Validator] runs two handshakes:
//!
//! - [Validator::on_init_connect]: bootstrap of an agent without credentials. The agent proves
//!   it runs an approved binary, waits for approval, and receives a long-term agent
//!   certificate (LTAC) signed from its certificate signing request.
//! - [Validator::on_connect]: start of every live connection. The agent authenticates with
//!   its session token, answers a challenge keyed by its binary hash, and receives fresh
//!   tunnel key material. A [crate::ping::Pinger] then keeps the connection alive.
//!
//! Both handshakes are strictly sequential and observe the cancellation token they are given.
//! Connections are never retried here: callers decide from the returned error (see
//! [Error::requires_init_connection] and [Error::is_permanent]) whether to try again.

use crate::{
    abh::Abh, approver::Approver, ping, pki::CertificateAuthority, sbh::Sbh,
    token::TokenIssuer, Error,
};
use bastion_persistence::AgentStore;
use bastion_tunnel::Strength;
use std::{sync::Arc, time::Duration};

mod connect;
pub use connect::ConnectionMetadata;
mod init;
pub use init::InitConnectionInfo;

/// Configuration for the [Validator].
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait for the init connection request.
    pub init_request_timeout: Duration,

    /// Interval at which the connected date of an agent waiting for approval is refreshed.
    pub liveness_interval: Duration,

    /// Cipher strategy of the tunnels handed out.
    pub tunnel_strength: Strength,

    /// Keep-alive of established connections.
    pub ping: ping::Config,
}

impl Config {
    pub fn recommended() -> Self {
        Self {
            init_request_timeout: Duration::from_secs(60),
            liveness_interval: Duration::from_secs(60),
            tunnel_strength: Strength::Strong,
            ping: ping::Config::recommended(),
        }
    }
}

/// Generates the integrity script returned with a new credential.
pub trait ScriptGenerator: Send + Sync + 'static {
    fn generate(&self, agent_id: &str) -> Result<Vec<u8>, Error>;
}

/// [ScriptGenerator] returning an empty script.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopScriptGenerator;

impl ScriptGenerator for NopScriptGenerator {
    fn generate(&self, _agent_id: &str) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }
}

/// Collaborators of the [Validator].
#[derive(Clone)]
pub struct Components {
    pub abh: Abh,
    pub sbh: Sbh,
    pub ca: Arc<CertificateAuthority>,
    pub store: Arc<dyn AgentStore>,
    pub approver: Arc<dyn Approver>,
    pub tokens: Arc<TokenIssuer>,
    pub scripts: Arc<dyn ScriptGenerator>,
}

/// Validates connections of agents.
#[derive(Clone)]
pub struct Validator {
    cfg: Config,

    abh: Abh,
    sbh: Sbh,
    ca: Arc<CertificateAuthority>,
    store: Arc<dyn AgentStore>,
    approver: Arc<dyn Approver>,
    tokens: Arc<TokenIssuer>,
    scripts: Arc<dyn ScriptGenerator>,
}

impl Validator {
    pub fn new(cfg: Config, components: Components) -> Self {
        Self {
            cfg,
            abh: components.abh,
            sbh: components.sbh,
            ca: components.ca,
            store: components.store,
            approver: components.approver,
            tokens: components.tokens,
            scripts: components.scripts,
        }
    }

    /// The binary hash directory used to validate peers.
    pub fn abh(&self) -> &Abh {
        &self.abh
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        approver::Registry,
        pki::tests::{domain, store, Domain},
    };
    use bastion_cache::{Config as CacheConfig, DataSource};
    use bastion_persistence::{memory, settings::MemorySettings};
    use tokio_util::sync::CancellationToken;

    pub(crate) const AGENT_ID: &str = "0123456789abcdef0123456789abcdef";
    pub(crate) const VERSION: &str = "1.2.3";
    pub(crate) const SERVER_NAME: &str = "v1";
    pub(crate) const ABH: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
    pub(crate) const SBH: &[u8] = b"secret blob";

    /// A validator over in-memory collaborators.
    pub(crate) struct Harness {
        pub validator: Validator,
        pub db: Arc<memory::Database>,
        pub registry: Arc<Registry>,
        pub domain: Domain,
    }

    impl Harness {
        /// A token for the server end of a connection.
        pub fn server_token(&self) -> String {
            self.validator
                .tokens
                .issue("server", crate::abh::ConnectionKind::Aggregate)
        }
    }

    pub(crate) async fn harness() -> Harness {
        let context = CancellationToken::new();
        let files = Arc::new(memory::Files::new());
        files.put(
            crate::abh::FILE_PATH,
            r#"{"v1":{"agents":{"1.2.3/linux/amd64":["00ff","deadbeef"]}}}"#,
        );
        files.put(crate::sbh::FILE_PATH, r#"{"v1":{"v1":"c2VjcmV0IGJsb2I="}}"#);
        let domain = domain("main");
        store(&files, "certs", "main", &domain);

        let abh = Abh::new(
            context.clone(),
            DataSource::File(files.clone()),
            CacheConfig::recommended(),
        )
        .await
        .unwrap();
        let sbh = Sbh::new(
            context,
            DataSource::File(files.clone()),
            CacheConfig::recommended(),
        )
        .await
        .unwrap();
        let ca = CertificateAuthority::load(files, "certs").await.unwrap();
        let db = Arc::new(memory::Database::new());
        let registry = Arc::new(Registry::new());
        let tokens = TokenIssuer::from_settings(&MemorySettings::new()).unwrap();

        let validator = Validator::new(
            Config::recommended(),
            Components {
                abh,
                sbh,
                ca: Arc::new(ca),
                store: db.clone(),
                approver: registry.clone(),
                tokens: Arc::new(tokens),
                scripts: Arc::new(NopScriptGenerator),
            },
        );
        Harness {
            validator,
            db,
            registry,
            domain,
        }
    }

    #[test]
    fn test_recommended() {
        let cfg = Config::recommended();
        assert_eq!(cfg.init_request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.liveness_interval, Duration::from_secs(60));
        assert_eq!(cfg.ping.timeout, cfg.ping.interval * 3);
    }

    #[test]
    fn test_nop_script() {
        assert!(NopScriptGenerator.generate(AGENT_ID).unwrap().is_empty());
    }
}
