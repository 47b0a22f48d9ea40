//! Messages exchanged during the handshake and keep-alive.
//!
//! Every message travels in an [Envelope] tagged with its [MessageType]. Requests and
//! responses of the same exchange share a type.

use crate::Error;
use bastion_persistence::{AgentInfo, AgentNet, AgentOs, AgentUser};
use bastion_tunnel::STRONG_SECRET_LENGTH;
use prost::Message;
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unspecified = 0,
    InitConnection = 1,
    Authentication = 2,
    ConnectionChallenge = 3,
    ConnectionStart = 4,
    Ping = 5,
    Pong = 6,
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentBinaryId {
    #[prost(string, tag = "1")]
    pub os: String,
    #[prost(string, tag = "2")]
    pub arch: String,
    #[prost(string, tag = "3")]
    pub version: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Os {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub arch: String,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Net {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, repeated, tag = "2")]
    pub ips: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub groups: Vec<String>,
}

/// Host information announced by an agent.
#[derive(Clone, PartialEq, Message)]
pub struct Information {
    #[prost(message, optional, tag = "1")]
    pub os: Option<Os>,
    #[prost(message, optional, tag = "2")]
    pub net: Option<Net>,
    #[prost(message, repeated, tag = "3")]
    pub users: Vec<User>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InitConnectionRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(message, optional, tag = "2")]
    pub agent_binary_id: Option<AgentBinaryId>,
    #[prost(bytes = "vec", tag = "3")]
    pub abh: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub csr: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub info: Option<Information>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InitConnectionResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub ltac: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub sbh: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ssa: Vec<u8>,
    #[prost(string, tag = "4")]
    pub status: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthenticationRequest {
    /// Unix timestamp (seconds) of the request.
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub atoken: String,
    #[prost(string, tag = "3")]
    pub aversion: String,
    #[prost(message, optional, tag = "4")]
    pub ainfo: Option<Information>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthenticationResponse {
    #[prost(string, tag = "1")]
    pub atoken: String,
    #[prost(string, tag = "2")]
    pub stoken: String,
    #[prost(string, tag = "3")]
    pub sversion: String,
    #[prost(string, tag = "4")]
    pub status: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectionChallengeRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectionChallengeResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub ct: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SimpleTunnel {
    #[prost(uint32, tag = "1")]
    pub key: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct StrongTunnel {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Tunnel {
    #[prost(message, tag = "1")]
    Simple(SimpleTunnel),
    #[prost(message, tag = "2")]
    Strong(StrongTunnel),
}

#[derive(Clone, PartialEq, Message)]
pub struct TunnelConfig {
    #[prost(oneof = "Tunnel", tags = "1, 2")]
    pub config: Option<Tunnel>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectionStartRequest {
    #[prost(message, optional, tag = "1")]
    pub tunnel_config: Option<TunnelConfig>,
    #[prost(bytes = "vec", tag = "2")]
    pub sbh: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectionStartResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Pong {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

/// Wrap `message` in an [Envelope] of the given type.
pub fn pack(kind: MessageType, message: &impl Message) -> Vec<u8> {
    Envelope {
        kind: kind as i32,
        payload: message.encode_to_vec(),
    }
    .encode_to_vec()
}

/// Decode an [Envelope] and return its type and payload.
pub fn open(raw: &[u8]) -> Result<(MessageType, Vec<u8>), Error> {
    let envelope = Envelope::decode(raw)?;
    let kind = MessageType::try_from(envelope.kind)
        .map_err(|_| Error::UnknownMessageType(envelope.kind))?;
    Ok((kind, envelope.payload))
}

/// Decode an [Envelope] that must be of type `expected`.
pub fn unpack<M: Message + Default>(expected: MessageType, raw: &[u8]) -> Result<M, Error> {
    let (kind, payload) = open(raw)?;
    if kind != expected {
        return Err(Error::UnexpectedMessage {
            expected,
            got: kind,
        });
    }
    Ok(M::decode(payload.as_slice())?)
}

/// Outcome of an exchange, as reported to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Authorized,
    Unauthorized,
    Blocked,
    Corrupted,
    TunnelError,
    InternalError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorized => "authorized",
            Self::Unauthorized => "unauthorized",
            Self::Blocked => "blocked",
            Self::Corrupted => "corrupted",
            Self::TunnelError => "tunnel error",
            Self::InternalError => "internal error",
        }
    }

    /// Map a status reported by the peer to the matching error.
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Self::Authorized => Ok(()),
            Self::Unauthorized => Err(Error::Unauthorized),
            Self::Blocked => Err(Error::Blocked),
            Self::Corrupted => Err(Error::Corrupted),
            Self::TunnelError => Err(Error::TunnelRejected),
            Self::InternalError => Err(Error::PeerInternal),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorized" => Ok(Self::Authorized),
            "unauthorized" => Ok(Self::Unauthorized),
            "blocked" => Ok(Self::Blocked),
            "corrupted" => Ok(Self::Corrupted),
            "tunnel error" => Ok(Self::TunnelError),
            "internal error" => Ok(Self::InternalError),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

impl From<&bastion_tunnel::TunnelConfig> for TunnelConfig {
    fn from(config: &bastion_tunnel::TunnelConfig) -> Self {
        let config = match config {
            bastion_tunnel::TunnelConfig::Simple { key } => Tunnel::Simple(SimpleTunnel {
                key: u32::from(*key),
            }),
            bastion_tunnel::TunnelConfig::Strong { key } => {
                Tunnel::Strong(StrongTunnel { key: key.to_vec() })
            }
        };
        Self {
            config: Some(config),
        }
    }
}

impl TryFrom<&TunnelConfig> for bastion_tunnel::TunnelConfig {
    type Error = Error;

    fn try_from(config: &TunnelConfig) -> Result<Self, Self::Error> {
        match &config.config {
            Some(Tunnel::Simple(simple)) => {
                let key = u8::try_from(simple.key)
                    .map_err(|_| Error::InvalidTunnelConfig("simple key exceeds one byte"))?;
                Ok(Self::Simple { key })
            }
            Some(Tunnel::Strong(strong)) => {
                let key: [u8; STRONG_SECRET_LENGTH] = strong
                    .key
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidTunnelConfig("strong key has the wrong length"))?;
                Ok(Self::Strong { key })
            }
            None => Err(Error::InvalidTunnelConfig("missing config")),
        }
    }
}

impl From<&AgentInfo> for Information {
    fn from(info: &AgentInfo) -> Self {
        Self {
            os: Some(Os {
                kind: info.os.kind.clone(),
                arch: info.os.arch.clone(),
                name: info.os.name.clone(),
            }),
            net: Some(Net {
                hostname: info.net.hostname.clone(),
                ips: info.net.ips.clone(),
            }),
            users: info
                .users
                .iter()
                .map(|user| User {
                    name: user.name.clone(),
                    groups: user.groups.clone(),
                })
                .collect(),
        }
    }
}

impl From<&Information> for AgentInfo {
    fn from(info: &Information) -> Self {
        let os = info.os.clone().unwrap_or_default();
        let net = info.net.clone().unwrap_or_default();
        Self {
            os: AgentOs {
                kind: os.kind,
                arch: os.arch,
                name: os.name,
            },
            net: AgentNet {
                hostname: net.hostname,
                ips: net.ips,
            },
            users: info
                .users
                .iter()
                .map(|user| AgentUser {
                    name: user.name.clone(),
                    groups: user.groups.clone(),
                })
                .collect(),
        }
    }
}
