use crate::{Error, Fetcher};
use bastion_persistence::{BinaryStore, FileReader};
use futures::future::BoxFuture;
use std::{fmt, sync::Arc};

/// Fetch strategy for a relational [DataSource].
pub type DbFetcher<T> =
    Arc<dyn Fn(Arc<dyn BinaryStore>) -> BoxFuture<'static, Result<T, Error>> + Send + Sync>;

/// Fetch strategy for a file-backed [DataSource].
pub type FileFetcher<T> =
    Arc<dyn Fn(Arc<dyn FileReader>) -> BoxFuture<'static, Result<T, Error>> + Send + Sync>;

/// The store a cache is populated from.
#[derive(Clone)]
pub enum DataSource {
    /// Relational store.
    Db(Arc<dyn BinaryStore>),
    /// Object/file store.
    File(Arc<dyn FileReader>),
}

impl DataSource {
    fn name(&self) -> &'static str {
        match self {
            Self::Db(_) => "db",
            Self::File(_) => "file",
        }
    }

    /// Bind the fetch strategy matching this source.
    pub fn fetcher<T: 'static>(self, params: ConnectorParams<T>) -> Result<Fetcher<T>, Error> {
        let name = self.name();
        match self {
            Self::Db(db) => {
                let fetch = params.db_fetcher.ok_or(Error::MissingFetcher(name))?;
                Ok(Arc::new(move || fetch(db.clone())))
            }
            Self::File(reader) => {
                let fetch = params.file_fetcher.ok_or(Error::MissingFetcher(name))?;
                Ok(Arc::new(move || fetch(reader.clone())))
            }
        }
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-source fetch strategies of a cached value.
pub struct ConnectorParams<T> {
    /// Strategy used when the source is [DataSource::Db].
    pub db_fetcher: Option<DbFetcher<T>>,

    /// Strategy used when the source is [DataSource::File].
    pub file_fetcher: Option<FileFetcher<T>>,
}
