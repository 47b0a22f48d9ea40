use crate::Error;
use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Length of a hex-encoded agent hash.
const HASH_LENGTH: usize = 32;

/// Connection status of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connected,
    Disconnected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization status of an agent, set by an operator or policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Authorized,
    Unauthorized,
    Blocked,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorized => "authorized",
            Self::Unauthorized => "unauthorized",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOs {
    #[serde(rename = "type")]
    pub kind: String,
    pub arch: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNet {
    pub hostname: String,
    pub ips: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUser {
    pub name: String,
    pub groups: Vec<String>,
}

/// Host information reported by an agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub os: AgentOs,
    pub net: AgentNet,
    pub users: Vec<AgentUser>,
}

/// The subset of a persisted agent record read or written by the protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Hex-encoded agent hash (the agent ID).
    pub hash: String,

    /// Address the agent connected from (host only).
    pub ip: String,

    /// Human-readable description derived from the connection.
    pub description: String,

    /// Agent binary version.
    pub version: String,

    /// Host information reported by the agent.
    pub info: AgentInfo,

    /// Connection status.
    pub status: Status,

    /// Authorization status.
    pub auth_status: AuthStatus,

    /// Last time the agent was seen connected.
    pub connected_date: SystemTime,
}

impl AgentRecord {
    /// Build the record of an agent performing its initial connection.
    ///
    /// New records start `connected` and `unauthorized`.
    pub fn connecting(hash: &str, ip: &str, version: &str, info: AgentInfo) -> Self {
        let short = hash.get(..6).unwrap_or(hash);
        let description = [ip, &info.os.kind, &info.net.hostname, short].join("_");
        Self {
            hash: hash.to_string(),
            ip: ip.to_string(),
            description,
            version: version.to_string(),
            info,
            status: Status::Connected,
            auth_status: AuthStatus::Unauthorized,
            connected_date: SystemTime::now(),
        }
    }

    /// Check the record is well-formed before it is persisted.
    pub fn validate(&self) -> Result<(), Error> {
        if self.hash.len() != HASH_LENGTH
            || !self
                .hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::InvalidRecord("hash must be 32 lowercase hex characters"));
        }
        if self.version.is_empty() {
            return Err(Error::InvalidRecord("version must not be empty"));
        }
        if self.ip.is_empty() {
            return Err(Error::InvalidRecord("ip must not be empty"));
        }
        Ok(())
    }
}
