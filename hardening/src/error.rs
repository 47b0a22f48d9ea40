use crate::{abh::ConnectionKind, wire::MessageType, wire::Status};
use std::fmt;
use thiserror::Error;

/// The step of a handshake an error occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    // Init connection
    InitRequest,
    ValidateBinary,
    UpsertAgent,
    Approval,
    IssueCredential,
    InitResponse,

    // Main handshake
    Authentication,
    Challenge,
    TunnelSetup,
    PingerStart,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitRequest => "init request",
            Self::ValidateBinary => "binary validation",
            Self::UpsertAgent => "agent upsert",
            Self::Approval => "approval",
            Self::IssueCredential => "credential issuance",
            Self::InitResponse => "init response",
            Self::Authentication => "authentication",
            Self::Challenge => "challenge",
            Self::TunnelSetup => "tunnel setup",
            Self::PingerStart => "pinger start",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while hardening a connection.
#[derive(Error, Debug)]
pub enum Error {
    // Integrity errors
    #[error("binary hash mismatch for {0}")]
    AbhMismatch(String),
    #[error("challenge mismatch")]
    ChallengeMismatch,
    #[error("corrupted message")]
    Corrupted,
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("unknown or replayed ping nonce")]
    UnknownNonce,

    // Policy errors
    #[error("agent is unauthorized")]
    Unauthorized,
    #[error("agent is blocked")]
    Blocked,
    #[error("agent approval denied")]
    Denied,
    #[error("peer reported a tunnel error")]
    TunnelRejected,
    #[error("peer reported an internal error")]
    PeerInternal,

    // Lookup errors
    #[error("no binary hash for {kind} {identity}")]
    NotFound {
        kind: ConnectionKind,
        identity: String,
    },
    #[error("no secret blob for version {0}")]
    SbhNotFound(String),
    #[error("path {path} has {matches} binary identities")]
    AmbiguousIdentity { path: String, matches: usize },
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    // Protocol errors
    #[error("unexpected message: expected {expected:?}, got {got:?}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(i32),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unknown status: {0}")]
    UnknownStatus(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid tunnel config: {0}")]
    InvalidTunnelConfig(&'static str),
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    // Certificate errors
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("invalid certificate chain: {0}")]
    InvalidChain(String),
    #[error("no signing authority for the presented root")]
    UnknownRoot,

    // Infrastructure errors
    #[error("cache error: {0}")]
    Cache(#[from] bastion_cache::Error),
    #[error("storage error: {0}")]
    Storage(#[from] bastion_persistence::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] bastion_tunnel::Error),
    #[error("invalid directory data: {0}")]
    InvalidDirectory(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,

    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        source: Box<Error>,
    },
}

impl Error {
    /// Return the innermost error, looking through phase annotations.
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Return the outermost phase annotation, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether the agent must run the init connection again before its next handshake.
    pub fn requires_init_connection(&self) -> bool {
        matches!(
            self.root(),
            Self::Unauthorized | Self::Blocked | Self::Corrupted | Self::TunnelRejected
        )
    }

    /// Whether retrying (with or without a new init connection) cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self.root(), Self::Blocked)
    }

    /// Whether the error is an expected outcome rather than a fault.
    ///
    /// Expected outcomes are logged without alerting.
    pub fn is_expected(&self) -> bool {
        matches!(
            self.root(),
            Self::Denied | Self::AbhMismatch(_) | Self::NotFound { .. }
        )
    }

    /// The status reported to the peer for this error.
    ///
    /// Integrity and protocol failures share a generic status so the peer cannot learn which
    /// check failed.
    pub fn status(&self) -> Status {
        match self.root() {
            Self::Unauthorized | Self::Denied => Status::Unauthorized,
            Self::Blocked => Status::Blocked,
            Self::TunnelRejected => Status::TunnelError,
            Self::AbhMismatch(_)
            | Self::ChallengeMismatch
            | Self::Corrupted
            | Self::CiphertextTooShort(_)
            | Self::UnknownNonce
            | Self::NotFound { .. }
            | Self::AmbiguousIdentity { .. }
            | Self::InvalidIdentity(_)
            | Self::UnexpectedMessage { .. }
            | Self::UnknownMessageType(_)
            | Self::MissingField(_)
            | Self::InvalidToken
            | Self::InvalidTunnelConfig(_)
            | Self::Decode(_)
            | Self::InvalidChain(_)
            | Self::UnknownRoot => Status::Corrupted,
            _ => Status::InternalError,
        }
    }
}

/// Annotate errors with the [Phase] they occurred in.
pub trait PhaseExt<T> {
    fn phase(self, phase: Phase) -> Result<T, Error>;
}

impl<T, E: Into<Error>> PhaseExt<T> for Result<T, E> {
    fn phase(self, phase: Phase) -> Result<T, Error> {
        self.map_err(|err| Error::Phase {
            phase,
            source: Box::new(err.into()),
        })
    }
}
