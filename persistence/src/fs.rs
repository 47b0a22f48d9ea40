//! [FileReader] backed by a local directory.

use crate::{Error, FileReader};
use async_trait::async_trait;
use std::{io::ErrorKind, path::PathBuf};

/// Reads files relative to a root directory.
#[derive(Clone, Debug)]
pub struct LocalReader {
    root: PathBuf,
}

impl LocalReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            resolved.push(segment);
        }
        resolved
    }
}

fn map_io(path: &str, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        return Error::NotFound(path.to_string());
    }
    Error::Io(err)
}

#[async_trait]
impl FileReader for LocalReader {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|err| map_io(path, err))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, Error> {
        let mut entries = tokio::fs::read_dir(self.resolve(path))
            .await
            .map_err(|err| map_io(path, err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
