//! In-memory implementations of the collaborator traits.
//!
//! Useful for tests and single-node development deployments.

use crate::{
    AgentRecord, AgentStore, AuthStatus, BinaryStore, ChecksumRow, Error, FileReader, Status,
    Upsert,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::SystemTime,
};

/// In-memory [AgentStore] and [BinaryStore].
///
/// All operations on the agent table are performed under a single lock, which gives
/// [AgentStore::upsert_agent] the same isolation as a repeatable-read transaction.
#[derive(Default)]
pub struct Database {
    agents: Mutex<HashMap<String, AgentRecord>>,
    checksums: Mutex<Vec<ChecksumRow>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
    queries: AtomicUsize,
    touches: AtomicUsize,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a record without any status checks.
    pub fn insert_agent(&self, record: AgentRecord) {
        self.agents
            .lock()
            .unwrap()
            .insert(record.hash.clone(), record);
    }

    /// Return a copy of the record for `hash`.
    pub fn agent(&self, hash: &str) -> Option<AgentRecord> {
        self.agents.lock().unwrap().get(hash).cloned()
    }

    /// Set the authorization status of an existing record.
    pub fn set_auth_status(&self, hash: &str, auth_status: AuthStatus) {
        if let Some(record) = self.agents.lock().unwrap().get_mut(hash) {
            record.auth_status = auth_status;
        }
    }

    /// Replace all binary checksums.
    pub fn set_checksums(&self, rows: Vec<ChecksumRow>) {
        *self.checksums.lock().unwrap() = rows;
    }

    /// Replace all secret blobs.
    pub fn set_blobs(&self, blobs: HashMap<String, Vec<u8>>) {
        *self.blobs.lock().unwrap() = blobs;
    }

    /// Make every subsequent query fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of directory queries served.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of connected-date refreshes served.
    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("database is unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentStore for Database {
    async fn find_agent_by_hash(&self, hash: &str) -> Result<Option<AgentRecord>, Error> {
        self.check()?;
        Ok(self.agent(hash))
    }

    async fn upsert_agent(&self, record: AgentRecord) -> Result<Upsert, Error> {
        self.check()?;
        record.validate()?;
        let mut agents = self.agents.lock().unwrap();
        let Some(existing) = agents.get_mut(&record.hash) else {
            agents.insert(record.hash.clone(), record);
            return Ok(Upsert::Created);
        };
        if existing.auth_status == AuthStatus::Blocked {
            return Ok(Upsert::Blocked);
        }
        existing.status = Status::Connected;
        existing.connected_date = record.connected_date;
        Ok(Upsert::Updated)
    }

    async fn set_agent_status(&self, hash: &str, status: Status) -> Result<(), Error> {
        self.check()?;
        let mut agents = self.agents.lock().unwrap();
        let record = agents
            .get_mut(hash)
            .ok_or_else(|| Error::NotFound(hash.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn touch_connected_date(&self, hash: &str) -> Result<(), Error> {
        self.check()?;
        let mut agents = self.agents.lock().unwrap();
        let record = agents
            .get_mut(hash)
            .ok_or_else(|| Error::NotFound(hash.to_string()))?;
        record.connected_date = SystemTime::now();
        self.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BinaryStore for Database {
    async fn binary_checksums(&self) -> Result<Vec<ChecksumRow>, Error> {
        self.check()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.checksums.lock().unwrap().clone())
    }

    async fn secret_blobs(&self) -> Result<HashMap<String, Vec<u8>>, Error> {
        self.check()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.blobs.lock().unwrap().clone())
    }
}

/// In-memory [FileReader].
#[derive(Default)]
pub struct Files {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    reads: AtomicUsize,
}

impl Files {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the file at `path`.
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.trim_matches('/').to_string(), data.into());
    }

    /// Remove the file at `path`.
    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path.trim_matches('/'));
    }

    /// Number of file reads served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileReader for Files {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(path.trim_matches('/'))
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, Error> {
        let prefix = format!("{}/", path.trim_matches('/'));
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect())
    }
}
