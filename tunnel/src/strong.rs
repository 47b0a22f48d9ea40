//! ChaCha20-Poly1305 keyed with the SHA-256 of a shared secret.

use crate::{Compressor, Error, Strength, TunnelConfig, STRONG_SECRET_LENGTH};
use chacha20poly1305::{
    aead::{generic_array::typenum::Unsigned, Aead},
    AeadCore, ChaCha20Poly1305, KeyInit as _, Nonce,
};
use rand::{thread_rng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::RwLock;
use zeroize::Zeroize;

/// How many bytes are in a nonce.
const NONCE_SIZE_BYTES: usize = <ChaCha20Poly1305 as AeadCore>::NonceSize::USIZE;

/// The amount of overhead in a tag.
const TAG_SIZE_BYTES: usize = <ChaCha20Poly1305 as AeadCore>::TagSize::USIZE;

/// Encrypts frames with ChaCha20-Poly1305.
///
/// Both endpoints of a tunnel share the key, so nonces are drawn at random and prefixed to
/// each ciphertext rather than derived from a per-direction counter.
pub struct Encryptor {
    cipher: RwLock<ChaCha20Poly1305>,
    compressor: Compressor,
}

impl Encryptor {
    /// Create an encryptor from a [TunnelConfig::Strong].
    pub fn new(config: &TunnelConfig, compressor: Compressor) -> Result<Self, Error> {
        Ok(Self {
            cipher: RwLock::new(cipher(config)?),
            compressor,
        })
    }

    pub(crate) fn from_secret(secret: &[u8; STRONG_SECRET_LENGTH], compressor: Compressor) -> Self {
        Self {
            cipher: RwLock::new(derive(secret)),
            compressor,
        }
    }
}

fn cipher(config: &TunnelConfig) -> Result<ChaCha20Poly1305, Error> {
    let TunnelConfig::Strong { key: secret } = config else {
        return Err(Error::ConfigMismatch(config.strength(), Strength::Strong));
    };
    Ok(derive(secret))
}

fn derive(secret: &[u8; STRONG_SECRET_LENGTH]) -> ChaCha20Poly1305 {
    let mut key: [u8; 32] = Sha256::digest(secret).into();
    let cipher = ChaCha20Poly1305::new(&key.into());
    key.zeroize();
    cipher
}

impl crate::Encryptor for Encryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let frame = self.compressor.compress(data);
        let mut nonce = [0u8; NONCE_SIZE_BYTES];
        thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .read()
            .unwrap()
            .encrypt(Nonce::from_slice(&nonce), frame.as_slice())
            .map_err(|_| Error::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < NONCE_SIZE_BYTES + TAG_SIZE_BYTES {
            return Err(Error::DecryptionFailed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE_BYTES);
        let frame = self
            .cipher
            .read()
            .unwrap()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::DecryptionFailed)?;
        self.compressor.decompress(&frame)
    }

    fn reset(&self, config: &TunnelConfig) -> Result<(), Error> {
        let cipher = cipher(config)?;
        *self.cipher.write().unwrap() = cipher;
        Ok(())
    }
}
