//! Challenge-response proving possession of a key derived from an agent id and the hash of
//! its binary.
//!
//! Keys are derived as `SHA256(agent_id || hash)`. Messages are encrypted with AES-256 in CFB
//! mode under a fresh random IV, which is prefixed to the ciphertext.

use crate::Error;
use aes::Aes256;
use cfb_mode::cipher::{generic_array::GenericArray, AsyncStreamCipher, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

/// Length of a connection challenge nonce.
pub const CHALLENGE_NONCE_LENGTH: usize = 32;

/// Length of the IV prefixed to every ciphertext.
pub const IV_LENGTH: usize = 16;

type CfbEncryptor = cfb_mode::Encryptor<Aes256>;
type CfbDecryptor = cfb_mode::Decryptor<Aes256>;

/// A key derived from an agent id and a binary hash.
pub type Key = Zeroizing<[u8; 32]>;

/// Generate a fresh challenge nonce.
pub fn connection_challenge() -> Vec<u8> {
    let mut nonce = vec![0u8; CHALLENGE_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Derive the key shared by the holder of `agent_id` running the binary hashed as `abh`.
pub fn challenge_key(agent_id: &str, abh: &[u8]) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update(abh);
    Zeroizing::new(hasher.finalize().into())
}

/// Encrypt `plaintext` under `key` with a random IV.
pub fn encrypt(key: &Key, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    let mut out = Vec::with_capacity(IV_LENGTH + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);
    CfbEncryptor::new(GenericArray::from_slice(&key[..]), GenericArray::from_slice(&iv))
        .encrypt(&mut out[IV_LENGTH..]);
    out
}

/// Decrypt a ciphertext produced by [encrypt].
///
/// A ciphertext must carry at least one byte past its IV.
pub fn decrypt(key: &Key, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    if ciphertext.len() <= IV_LENGTH {
        return Err(Error::CiphertextTooShort(ciphertext.len()));
    }
    let (iv, body) = ciphertext.split_at(IV_LENGTH);
    let mut out = body.to_vec();
    CfbDecryptor::new(GenericArray::from_slice(&key[..]), GenericArray::from_slice(iv))
        .decrypt(&mut out);
    Ok(out)
}

/// Answer a challenge `nonce` (agent side).
pub fn respond(nonce: &[u8], agent_id: &str, abh: &[u8]) -> Vec<u8> {
    encrypt(&challenge_key(agent_id, abh), nonce)
}

/// Check that `ct` decrypts to `expected` under the key of one of `candidates`.
///
/// Candidates are tried in order and the first match wins. Returns the index of the matching
/// hash.
pub fn check_connection_challenge(
    ct: &[u8],
    expected: &[u8],
    agent_id: &str,
    candidates: &[Vec<u8>],
) -> Result<usize, Error> {
    for (index, abh) in candidates.iter().enumerate() {
        let plaintext = match decrypt(&challenge_key(agent_id, abh), ct) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(?err, agent_id, index, "challenge response did not decrypt");
                continue;
            }
        };
        if bool::from(plaintext.ct_eq(expected)) {
            return Ok(index);
        }
    }
    Err(Error::ChallengeMismatch)
}
