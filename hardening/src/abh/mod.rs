//! Directory of expected agent binary hashes (ABH).
//!
//! The directory maps a [ConnectionKind] and [AgentBinaryIdentity] to the ordered list of
//! hashes currently accepted for that build. More than one hash may be accepted at once, for
//! example while a new build is being rolled out.
//!
//! The directory is held in a [Cache] and rebuilt wholesale on every refresh, either from
//! relational checksum rows or from the versioned JSON file at [FILE_PATH].

use crate::Error;
use bastion_cache::{
    Cache, Config as CacheConfig, ConnectorParams, DataSource, Error as CacheError,
};
use bastion_persistence::{BinaryStore, FileReader};
use futures::FutureExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod identity;
pub use identity::{extract_identity, AgentBinaryIdentity, ConnectionKind, Platform};
mod list;
pub use list::AbhList;

/// Location of the directory in file storage.
pub const FILE_PATH: &str = "hardening/abh.json";

/// Peer metadata learned by the transport layer.
pub trait PeerSocket {
    /// Version announced by the peer.
    fn version(&self) -> &str;

    /// Platform announced by the peer, if any.
    fn platform(&self) -> Option<Platform>;

    /// Identity of the peer binary, as a directory key for `kind`.
    fn binary_identity(&self, kind: ConnectionKind) -> Result<AgentBinaryIdentity, Error> {
        if self.version().is_empty() {
            return Err(Error::MissingField("version"));
        }
        if kind != ConnectionKind::Agent {
            return Ok(AgentBinaryIdentity::versioned(self.version()));
        }
        let platform = self.platform().ok_or(Error::MissingField("platform"))?;
        Ok(AgentBinaryIdentity {
            version: self.version().to_string(),
            platform: Some(platform),
        })
    }
}

async fn fetch_db(db: Arc<dyn BinaryStore>) -> Result<AbhList, CacheError> {
    let rows = db.binary_checksums().await?;
    AbhList::from_rows(&rows).map_err(CacheError::fetch)
}

async fn fetch_file(reader: Arc<dyn FileReader>) -> Result<AbhList, CacheError> {
    let raw = reader.read_file(FILE_PATH).await?;
    AbhList::from_json(&raw).map_err(CacheError::fetch)
}

/// Fetch strategies for every [DataSource].
pub fn params() -> ConnectorParams<AbhList> {
    ConnectorParams {
        db_fetcher: Some(Arc::new(|db: Arc<dyn BinaryStore>| fetch_db(db).boxed())),
        file_fetcher: Some(Arc::new(|reader: Arc<dyn FileReader>| {
            fetch_file(reader).boxed()
        })),
    }
}

/// Cached directory of expected binary hashes.
#[derive(Clone)]
pub struct Abh {
    cache: Cache<AbhList>,
}

impl Abh {
    /// Load the directory from `source` and keep it refreshed until `context` is cancelled.
    pub async fn new(
        context: CancellationToken,
        source: DataSource,
        cfg: CacheConfig,
    ) -> Result<Self, Error> {
        let cache = Cache::connect(context, source, params(), cfg).await?;
        Ok(Self { cache })
    }

    /// Return the hashes accepted for `identity`.
    ///
    /// Only an exact match is returned. A missing identity is [Error::NotFound].
    pub fn get_abh(
        &self,
        kind: ConnectionKind,
        identity: &AgentBinaryIdentity,
    ) -> Result<Vec<Vec<u8>>, Error> {
        self.cache.dump().get(kind, identity)
    }

    /// Return the hashes accepted for the binary announced by `socket`.
    pub fn get_abh_with_socket(
        &self,
        kind: ConnectionKind,
        socket: &impl PeerSocket,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let identity = socket.binary_identity(kind)?;
        self.get_abh(kind, &identity)
    }

    /// Force a refresh of the directory.
    pub async fn refresh(&self) -> Result<(), Error> {
        self.cache.fetch().await?;
        Ok(())
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Cache<AbhList> {
        &self.cache
    }
}
