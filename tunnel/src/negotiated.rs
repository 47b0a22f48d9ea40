//! Switch between strategies when the key is reset.

use crate::{simple, strong, Compressor, Error, TunnelConfig};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Delegates to the strategy selected by the most recent [TunnelConfig].
///
/// Unlike the individual strategies, resetting with a config of a different strength is
/// allowed and replaces the strategy.
pub struct Encryptor {
    current: RwLock<Arc<dyn crate::Encryptor>>,
    compressor: Compressor,
}

impl Encryptor {
    pub fn new(config: &TunnelConfig, compressor: Compressor) -> Self {
        Self {
            current: RwLock::new(build(config, &compressor)),
            compressor,
        }
    }

    fn current(&self) -> Arc<dyn crate::Encryptor> {
        self.current.read().unwrap().clone()
    }
}

fn build(config: &TunnelConfig, compressor: &Compressor) -> Arc<dyn crate::Encryptor> {
    match config {
        TunnelConfig::Simple { key } => {
            Arc::new(simple::Encryptor::from_key(*key, compressor.clone()))
        }
        TunnelConfig::Strong { key } => {
            Arc::new(strong::Encryptor::from_secret(key, compressor.clone()))
        }
    }
}

impl crate::Encryptor for Encryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.current().encrypt(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.current().decrypt(data)
    }

    fn reset(&self, config: &TunnelConfig) -> Result<(), Error> {
        debug!(strength = %config.strength(), "resetting tunnel");
        *self.current.write().unwrap() = build(config, &self.compressor);
        Ok(())
    }
}
