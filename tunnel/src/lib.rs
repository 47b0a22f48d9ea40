//! Compress and encrypt post-handshake payloads with a rotating key.
//!
//! Every payload is compressed with a [Compressor] before it is encrypted and decompressed
//! after it is decrypted. Two cipher strategies implement [Encryptor]:
//!
//! - [simple::Encryptor]: XOR with a single-byte key. Cheap, used by default.
//! - [strong::Encryptor]: ChaCha20-Poly1305 keyed with the SHA-256 of a 48-byte secret.
//!
//! [negotiated::Encryptor] wraps either strategy and switches between them on
//! [Encryptor::reset], which is how endpoints adopt whatever [TunnelConfig] the server
//! generated during the handshake.
//!
//! Key material is guarded by a read/write lock: [Encryptor::reset] may be called
//! concurrently with [Encryptor::encrypt] and [Encryptor::decrypt], and every in-flight
//! operation completes entirely under the old or the new key.

use rand::RngCore;
use std::{fmt, str::FromStr};
use thiserror::Error;
use zeroize::Zeroize;

mod compressor;
pub use compressor::Compressor;
pub mod negotiated;
pub mod simple;
pub mod strong;

/// Length of the secret a [strong::Encryptor] is keyed with.
pub const STRONG_SECRET_LENGTH: usize = 48;

/// Errors that can occur when interacting with a tunnel.
#[derive(Error, Debug)]
pub enum Error {
    // Compression errors
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("decompressed size {0} exceeds limit of {1} bytes")]
    FrameTooLarge(u64, usize),
    #[error("decompression failed: {0}")]
    DecompressionFailed(std::io::Error),
    #[error("decompressed size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    // Cipher errors
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("{0} tunnel config cannot reset a {1} encryptor")]
    ConfigMismatch(Strength, Strength),
}

/// Compresses, encrypts, and decrypts tunnel payloads.
pub trait Encryptor: Send + Sync + 'static {
    /// Compress and encrypt `data`.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error>;

    /// Decrypt and decompress `data`.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error>;

    /// Replace the key material.
    fn reset(&self, config: &TunnelConfig) -> Result<(), Error>;
}

/// Cipher strategy of a tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strength {
    Simple,
    Strong,
}

impl Strength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Strong => "strong",
        }
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "strong" => Ok(Self::Strong),
            other => Err(format!("unknown tunnel strength: {other}")),
        }
    }
}

/// Key material exchanged during tunnel setup.
#[derive(Clone, PartialEq, Eq)]
pub enum TunnelConfig {
    Simple { key: u8 },
    Strong { key: [u8; STRONG_SECRET_LENGTH] },
}

impl TunnelConfig {
    /// Generate fresh key material for the given strategy.
    pub fn generate(strength: Strength, rng: &mut impl RngCore) -> Self {
        match strength {
            Strength::Simple => {
                // Zero would leave payloads unencrypted
                let mut key = [0u8; 1];
                while key[0] == 0 {
                    rng.fill_bytes(&mut key);
                }
                Self::Simple { key: key[0] }
            }
            Strength::Strong => {
                let mut key = [0u8; STRONG_SECRET_LENGTH];
                rng.fill_bytes(&mut key);
                Self::Strong { key }
            }
        }
    }

    pub fn strength(&self) -> Strength {
        match self {
            Self::Simple { .. } => Strength::Simple,
            Self::Strong { .. } => Strength::Strong,
        }
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelConfig({}, <redacted>)", self.strength())
    }
}

impl Drop for TunnelConfig {
    fn drop(&mut self) {
        match self {
            Self::Simple { key } => key.zeroize(),
            Self::Strong { key } => key.zeroize(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::Arc;
    use test_case::test_case;

    fn payload(kind: &str, rng: &mut StdRng) -> Vec<u8> {
        match kind {
            "empty" => Vec::new(),
            "single" => vec![0x42],
            "random" => {
                let mut data = vec![0u8; 4096];
                rng.fill_bytes(&mut data);
                data
            }
            "text" => b"module message ".repeat(200),
            _ => unreachable!(),
        }
    }

    fn encryptors(rng: &mut StdRng) -> Vec<(Arc<dyn Encryptor>, Strength)> {
        let simple = TunnelConfig::generate(Strength::Simple, rng);
        let strong = TunnelConfig::generate(Strength::Strong, rng);
        vec![
            (
                Arc::new(simple::Encryptor::new(&simple, Compressor::default()).unwrap()),
                Strength::Simple,
            ),
            (
                Arc::new(strong::Encryptor::new(&strong, Compressor::default()).unwrap()),
                Strength::Strong,
            ),
            (
                Arc::new(negotiated::Encryptor::new(&strong, Compressor::default())),
                Strength::Strong,
            ),
        ]
    }

    #[test_case("empty")]
    #[test_case("single")]
    #[test_case("random")]
    #[test_case("text")]
    fn test_round_trip(kind: &str) {
        let mut rng = StdRng::seed_from_u64(7);
        let data = payload(kind, &mut rng);
        for (encryptor, _) in encryptors(&mut rng) {
            let ciphertext = encryptor.encrypt(&data).unwrap();
            assert_eq!(encryptor.decrypt(&ciphertext).unwrap(), data);
        }
    }

    #[test_case("empty")]
    #[test_case("single")]
    #[test_case("random")]
    fn test_round_trip_after_reset(kind: &str) {
        let mut rng = StdRng::seed_from_u64(11);
        let data = payload(kind, &mut rng);
        for (encryptor, strength) in encryptors(&mut rng) {
            let before = encryptor.encrypt(&data).unwrap();
            encryptor
                .reset(&TunnelConfig::generate(strength, &mut rng))
                .unwrap();
            let after = encryptor.encrypt(&data).unwrap();
            assert_eq!(encryptor.decrypt(&after).unwrap(), data);
            if strength == Strength::Strong {
                assert!(encryptor.decrypt(&before).is_err());
            }
        }
    }

    #[test]
    fn test_reset_during_traffic() {
        let mut rng = StdRng::seed_from_u64(19);
        let configs: Vec<TunnelConfig> = (0..4)
            .map(|_| TunnelConfig::generate(Strength::Strong, &mut rng))
            .collect();
        let peers: Vec<strong::Encryptor> = configs
            .iter()
            .map(|config| strong::Encryptor::new(config, Compressor::default()).unwrap())
            .collect();
        let shared: Vec<Arc<dyn Encryptor>> = vec![
            Arc::new(strong::Encryptor::new(&configs[0], Compressor::default()).unwrap()),
            Arc::new(negotiated::Encryptor::new(&configs[0], Compressor::default())),
        ];
        let data = b"module message ".repeat(64);

        for encryptor in shared {
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for round in 0..400 {
                        encryptor.reset(&configs[round % configs.len()]).unwrap();
                    }
                });
                for worker in 0..4 {
                    let (encryptor, peers, data) = (&encryptor, &peers, &data);
                    scope.spawn(move || {
                        for round in 0..200 {
                            // Sealed under exactly one of the configs
                            let ciphertext = encryptor.encrypt(data).unwrap();
                            let opened = peers
                                .iter()
                                .filter_map(|peer| peer.decrypt(&ciphertext).ok())
                                .collect::<Vec<_>>();
                            assert_eq!(opened, vec![data.clone()]);

                            // Opened under the current key or rejected, never garbled
                            let sealed = peers[(worker + round) % peers.len()]
                                .encrypt(data)
                                .unwrap();
                            if let Ok(plaintext) = encryptor.decrypt(&sealed) {
                                assert_eq!(&plaintext, data);
                            }
                        }
                    });
                }
            });
        }
    }

    #[test]
    fn test_peers_share_key() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = TunnelConfig::generate(Strength::Strong, &mut rng);
        let server = strong::Encryptor::new(&config, Compressor::default()).unwrap();
        let agent = strong::Encryptor::new(&config, Compressor::default()).unwrap();
        let ciphertext = server.encrypt(b"ping").unwrap();
        assert_eq!(agent.decrypt(&ciphertext).unwrap(), b"ping");
    }

    #[test]
    fn test_simple_key_is_never_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1_000 {
            let TunnelConfig::Simple { key } = TunnelConfig::generate(Strength::Simple, &mut rng)
            else {
                unreachable!()
            };
            assert_ne!(key, 0);
        }
    }

    #[test]
    fn test_strength_parse() {
        assert_eq!("strong".parse::<Strength>().unwrap(), Strength::Strong);
        assert_eq!(Strength::Simple.to_string(), "simple");
        assert!("rc4".parse::<Strength>().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = TunnelConfig::Simple { key: 0x5a };
        assert_eq!(format!("{config:?}"), "TunnelConfig(simple, <redacted>)");
    }
}
