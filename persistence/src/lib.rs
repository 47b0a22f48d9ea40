//! Collaborator interfaces for agent records, binary checksums, files, and settings.
//!
//! The hardening protocol never talks to a database or object store directly. Instead, it
//! consumes the traits in this crate:
//!
//! - [AgentStore]: create-or-update agent records and their connection/authorization status.
//! - [BinaryStore]: relational source of binary checksums and secret blobs.
//! - [FileReader]: object/file storage (local directory in production, memory in tests).
//! - [Settings]: a small key/value capability for process configuration.
//!
//! In-memory implementations of every trait live in [memory].

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

mod agent;
pub use agent::{AgentInfo, AgentNet, AgentOs, AgentRecord, AgentUser, AuthStatus, Status};
pub mod fs;
pub mod memory;
pub mod settings;
pub use settings::Settings;

/// Errors that can occur when interacting with a collaborator.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result of [AgentStore::upsert_agent].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// No record existed for the hash and one was created.
    Created,
    /// The existing record was marked as connected.
    Updated,
    /// The existing record is blocked and was left untouched.
    Blocked,
}

/// Persisted agent records, keyed by agent hash.
#[async_trait]
pub trait AgentStore: Send + Sync + 'static {
    /// Return the record for `hash`, if any.
    async fn find_agent_by_hash(&self, hash: &str) -> Result<Option<AgentRecord>, Error>;

    /// Atomically create the record or mark the existing one as connected.
    ///
    /// Implementations must perform the read and the write in a single repeatable-read
    /// transaction keyed by the record hash. A blocked record must not be modified.
    async fn upsert_agent(&self, record: AgentRecord) -> Result<Upsert, Error>;

    /// Set the connection status of the record for `hash`.
    async fn set_agent_status(&self, hash: &str, status: Status) -> Result<(), Error>;

    /// Refresh the connected date of the record for `hash` to now.
    async fn touch_connected_date(&self, hash: &str) -> Result<(), Error>;
}

/// A row of binary checksums for one connection kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumRow {
    /// Connection kind (`agent`, `aggregate`, `browser`, `external`).
    pub kind: String,

    /// Storage path of each file mapped to its hex-encoded SHA-256.
    pub files: HashMap<String, String>,
}

/// Relational source of directory data.
#[async_trait]
pub trait BinaryStore: Send + Sync + 'static {
    /// Return the checksums of all registered binaries.
    async fn binary_checksums(&self) -> Result<Vec<ChecksumRow>, Error>;

    /// Return the secret blobs, keyed by protocol version.
    async fn secret_blobs(&self) -> Result<HashMap<String, Vec<u8>>, Error>;
}

/// Read-only access to object/file storage.
///
/// Paths are `/`-separated and relative to the root of the store.
#[async_trait]
pub trait FileReader: Send + Sync + 'static {
    /// Read the entire file at `path`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// List the names (not paths) of the files directly inside `path`, sorted.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, Error>;
}
