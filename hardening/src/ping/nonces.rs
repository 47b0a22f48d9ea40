use rand::{rngs::OsRng, RngCore};
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tokio::time::Instant;

/// Outstanding ping nonces of one connection.
///
/// A nonce is accepted at most once, and only before it expires.
pub struct Nonces {
    length: usize,
    ttl: Duration,
    outstanding: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl Nonces {
    pub fn new(length: usize, ttl: Duration) -> Self {
        Self {
            length,
            ttl,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Generate and register a fresh nonce.
    pub fn issue(&self) -> Vec<u8> {
        let now = Instant::now();
        let mut outstanding = self.outstanding.lock().unwrap();
        outstanding.retain(|_, expiry| *expiry > now);
        let mut nonce = vec![0u8; self.length];
        loop {
            OsRng.fill_bytes(&mut nonce);
            if !outstanding.contains_key(&nonce) {
                break;
            }
        }
        outstanding.insert(nonce.clone(), now + self.ttl);
        nonce
    }

    /// Consume `nonce`. Returns false if it was never issued, already accepted, or expired.
    pub fn accept(&self, nonce: &[u8]) -> bool {
        let mut outstanding = self.outstanding.lock().unwrap();
        match outstanding.get(nonce) {
            Some(expiry) if *expiry > Instant::now() => {
                outstanding.remove(nonce);
                true
            }
            Some(_) => {
                outstanding.remove(nonce);
                false
            }
            None => false,
        }
    }

    /// Forget `nonce` without accepting it.
    pub fn forget(&self, nonce: &[u8]) {
        self.outstanding.lock().unwrap().remove(nonce);
    }

    /// Number of registered nonces, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
