//! Directory of secret blobs (SBH), keyed by protocol version.

use crate::Error;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bastion_cache::{
    Cache, Config as CacheConfig, ConnectorParams, DataSource, Error as CacheError,
};
use bastion_persistence::{BinaryStore, FileReader};
use futures::FutureExt;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Location of the directory in file storage.
pub const FILE_PATH: &str = "lic/sbh.json";

/// Version served when the requested one is absent.
pub const FALLBACK_VERSION: &str = "old";

/// Secret blobs keyed by protocol version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SbhList(HashMap<String, Vec<u8>>);

#[derive(Deserialize)]
struct VersionedFile {
    v1: HashMap<String, String>,
}

impl SbhList {
    pub fn new(blobs: HashMap<String, Vec<u8>>) -> Self {
        Self(blobs)
    }

    /// Parse the versioned JSON directory file (base64 blobs).
    pub fn from_json(raw: &[u8]) -> Result<Self, Error> {
        let file: VersionedFile = serde_json::from_slice(raw)
            .map_err(|err| Error::InvalidDirectory(err.to_string()))?;
        file.v1
            .into_iter()
            .map(|(version, blob)| {
                let blob = STANDARD
                    .decode(blob)
                    .map_err(|err| Error::InvalidDirectory(format!("{version}: {err}")))?;
                Ok((version, blob))
            })
            .collect::<Result<_, Error>>()
            .map(Self)
    }

    /// Return the blob of `version`, or of [FALLBACK_VERSION] if it is absent.
    pub fn get(&self, version: &str) -> Result<Vec<u8>, Error> {
        if let Some(blob) = self.0.get(version) {
            return Ok(blob.clone());
        }
        debug!(version, "no secret blob for version, using fallback");
        self.0
            .get(FALLBACK_VERSION)
            .cloned()
            .ok_or_else(|| Error::SbhNotFound(version.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

async fn fetch_db(db: Arc<dyn BinaryStore>) -> Result<SbhList, CacheError> {
    Ok(SbhList::new(db.secret_blobs().await?))
}

async fn fetch_file(reader: Arc<dyn FileReader>) -> Result<SbhList, CacheError> {
    let raw = reader.read_file(FILE_PATH).await?;
    SbhList::from_json(&raw).map_err(CacheError::fetch)
}

/// Fetch strategies for every [DataSource].
pub fn params() -> ConnectorParams<SbhList> {
    ConnectorParams {
        db_fetcher: Some(Arc::new(|db: Arc<dyn BinaryStore>| fetch_db(db).boxed())),
        file_fetcher: Some(Arc::new(|reader: Arc<dyn FileReader>| {
            fetch_file(reader).boxed()
        })),
    }
}

/// Cached directory of secret blobs.
#[derive(Clone)]
pub struct Sbh {
    cache: Cache<SbhList>,
}

impl Sbh {
    /// Load the directory from `source` and keep it refreshed until `context` is cancelled.
    pub async fn new(
        context: CancellationToken,
        source: DataSource,
        cfg: CacheConfig,
    ) -> Result<Self, Error> {
        let cache = Cache::connect(context, source, params(), cfg).await?;
        Ok(Self { cache })
    }

    /// Return the blob for `version`.
    pub fn get(&self, context: &CancellationToken, version: &str) -> Result<Vec<u8>, Error> {
        if context.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.cache.dump().get(version)
    }

    /// Force a refresh of the directory.
    pub async fn refresh(&self) -> Result<(), Error> {
        self.cache.fetch().await?;
        Ok(())
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Cache<SbhList> {
        &self.cache
    }
}
