//! Key/value configuration capability.
//!
//! Components that need a configurable value take a [Settings] handle instead of one
//! getter/setter pair per field. Each backing store implements the trait once.

use crate::Error;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};
use tracing::debug;

/// Read and write configuration values by key.
pub trait Settings: Send + Sync + 'static {
    /// Return the value stored for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Store `value` for `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;
}

/// Settings held in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings persisted as a flat YAML mapping.
///
/// The file is read once on open and rewritten in full on every [Settings::set].
pub struct YamlSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl YamlSettings {
    /// Open the settings file at `path`. A missing file is treated as empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read(&path) {
            Ok(raw) if raw.is_empty() => BTreeMap::new(),
            Ok(raw) => serde_yaml::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "settings file missing, starting empty");
                BTreeMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }
}

impl Settings for YamlSettings {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut values = self.values.lock().unwrap();
        let mut updated = values.clone();
        updated.insert(key.to_string(), value.to_string());

        // Write to a sibling file and rename so readers never see a partial file
        let encoded = serde_yaml::to_string(&updated)?;
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, encoded)?;
        std::fs::rename(&staging, &self.path)?;
        *values = updated;
        Ok(())
    }
}
