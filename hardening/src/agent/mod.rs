//! Agent side of connection hardening.
//!
//! An [Agent] mirrors [crate::validator::Validator]: [Agent::on_init_connect] obtains
//! [Credentials] from a CSR, and [Agent::on_connect] authenticates a live connection, answers
//! the challenge, adopts the tunnel key, and answers pings with a [crate::ping::Pingee].

use crate::{
    abh::AgentBinaryIdentity,
    challenge::{self, Key},
    ping,
};
use std::{fmt, sync::Arc, time::Duration};
use zeroize::Zeroizing;

mod connect;
pub use connect::Session;
mod init;

/// Identity of the running agent, computed once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Hex-encoded hash identifying the agent.
    pub agent_id: String,

    /// Build of the running binary.
    pub binary: AgentBinaryIdentity,

    /// Hash of the running binary.
    pub abh: Vec<u8>,
}

impl AgentIdentity {
    pub fn new(agent_id: &str, binary: AgentBinaryIdentity, abh: Vec<u8>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            binary,
            abh,
        }
    }

    /// Protocol version announced to the server.
    pub fn version(&self) -> &str {
        &self.binary.version
    }

    /// Key answering challenges and pings.
    pub fn key(&self) -> Key {
        challenge::challenge_key(&self.agent_id, &self.abh)
    }
}

/// Material received at the end of an init connection.
#[derive(Clone)]
pub struct Credentials {
    /// Long-term agent certificate, DER encoded.
    pub ltac: Vec<u8>,

    /// Private key of the LTAC, PEM encoded.
    pub key_pem: Zeroizing<String>,

    /// Secret blob of the protocol version.
    pub sbh: Vec<u8>,

    /// Integrity script.
    pub ssa: Vec<u8>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ltac", &self.ltac.len())
            .field("key_pem", &"<redacted>")
            .field("sbh", &self.sbh.len())
            .field("ssa", &self.ssa.len())
            .finish()
    }
}

/// Configuration for the [Agent].
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait for the init connection response, approval included.
    pub init_response_timeout: Duration,

    /// Keep-alive of established connections.
    pub ping: ping::Config,
}

impl Config {
    pub fn recommended() -> Self {
        Self {
            init_response_timeout: Duration::from_secs(24 * 60 * 60),
            ping: ping::Config::recommended(),
        }
    }
}

/// Hardens the connections of one agent.
#[derive(Clone)]
pub struct Agent {
    cfg: Config,
    identity: Arc<AgentIdentity>,
}

impl Agent {
    pub fn new(cfg: Config, identity: Arc<AgentIdentity>) -> Self {
        Self { cfg, identity }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }
}
