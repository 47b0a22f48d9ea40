//! XOR with a single-byte key.

use crate::{Compressor, Error, Strength, TunnelConfig};
use std::sync::RwLock;

/// Encrypts frames by XOR-ing every byte with a one-byte key.
pub struct Encryptor {
    key: RwLock<u8>,
    compressor: Compressor,
}

impl Encryptor {
    /// Create an encryptor from a [TunnelConfig::Simple].
    pub fn new(config: &TunnelConfig, compressor: Compressor) -> Result<Self, Error> {
        Ok(Self::from_key(key(config)?, compressor))
    }

    pub(crate) fn from_key(key: u8, compressor: Compressor) -> Self {
        Self {
            key: RwLock::new(key),
            compressor,
        }
    }
}

fn key(config: &TunnelConfig) -> Result<u8, Error> {
    match config {
        TunnelConfig::Simple { key } => Ok(*key),
        other => Err(Error::ConfigMismatch(other.strength(), Strength::Simple)),
    }
}

fn apply(key: u8, data: &mut [u8]) {
    data.iter_mut().for_each(|b| *b ^= key);
}

impl crate::Encryptor for Encryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut frame = self.compressor.compress(data);
        apply(*self.key.read().unwrap(), &mut frame);
        Ok(frame)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut frame = data.to_vec();
        apply(*self.key.read().unwrap(), &mut frame);
        self.compressor.decompress(&frame)
    }

    fn reset(&self, config: &TunnelConfig) -> Result<(), Error> {
        *self.key.write().unwrap() = key(config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Encryptor as _, STRONG_SECRET_LENGTH};

    #[test]
    fn test_ciphertext_differs_from_frame() {
        let config = TunnelConfig::Simple { key: 0xa5 };
        let encryptor = Encryptor::new(&config, Compressor::default()).unwrap();
        let ciphertext = encryptor.encrypt(b"hello").unwrap();
        let frame = Compressor::default().compress(b"hello");
        assert_eq!(ciphertext.len(), frame.len());
        assert!(ciphertext.iter().zip(&frame).all(|(c, f)| c ^ f == 0xa5));
    }

    #[test]
    fn test_rejects_strong_config() {
        let strong = TunnelConfig::Strong {
            key: [1u8; STRONG_SECRET_LENGTH],
        };
        assert!(matches!(
            Encryptor::new(&strong, Compressor::default()),
            Err(Error::ConfigMismatch(Strength::Strong, Strength::Simple))
        ));

        let encryptor =
            Encryptor::new(&TunnelConfig::Simple { key: 1 }, Compressor::default()).unwrap();
        assert!(encryptor.reset(&strong).is_err());
    }
}
