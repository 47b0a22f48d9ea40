//! Reusable session tokens exchanged during authentication.
//!
//! A token is 40 hex characters encoding `secret || crc32(secret)`, where the 16-byte secret
//! is `payload || tag`. The 12-byte payload is `random || flags || state`:
//!
//! - `random`: 4 random bytes, or `crc32(agent_id)` for agents so their tokens are stable.
//! - `flags`: reserved, zero.
//! - `state`: `crc32("{agent_id}:{kind}:" || random)`, binding the token to its holder.
//!
//! The 4-byte `tag` is a truncated HMAC-SHA256 of the payload under the server token key, so
//! only the server can mint tokens. Anyone can check the outer CRC.

use crate::{abh::ConnectionKind, Error};
use bastion_persistence::Settings;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;
use zeroize::Zeroizing;

/// Settings key holding the hex-encoded token key.
pub const TOKEN_KEY_SETTING: &str = "token_key";

/// Length of an encoded token.
pub const TOKEN_LENGTH: usize = 40;

const TOKEN_KEY_LENGTH: usize = 32;
const PAYLOAD_LENGTH: usize = 12;
const TAG_LENGTH: usize = 4;
const SECRET_LENGTH: usize = PAYLOAD_LENGTH + TAG_LENGTH;

fn crc32(data: &[u8]) -> [u8; 4] {
    crc32fast::hash(data).to_be_bytes()
}

fn state(agent_id: &str, kind: ConnectionKind, random: &[u8]) -> [u8; 4] {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(format!("{agent_id}:{kind}:").as_bytes());
    hasher.update(random);
    hasher.finalize().to_be_bytes()
}

/// Split a token into its secret, checking the outer CRC.
fn secret(token: &str) -> Option<[u8; SECRET_LENGTH]> {
    if token.len() != TOKEN_LENGTH {
        return None;
    }
    let raw = hex::decode(token).ok()?;
    let (secret, checksum) = raw.split_at(SECRET_LENGTH);
    if crc32(secret) != checksum {
        return None;
    }
    secret.try_into().ok()
}

/// Whether `token` is well formed and its outer CRC matches.
pub fn is_crc_valid(token: &str) -> bool {
    secret(token).is_some()
}

/// Mints and validates session tokens.
pub struct TokenIssuer {
    key: Zeroizing<Vec<u8>>,
}

impl TokenIssuer {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Load the token key from `settings`, generating and storing one on first use.
    pub fn from_settings(settings: &dyn Settings) -> Result<Self, Error> {
        if let Some(encoded) = settings.get(TOKEN_KEY_SETTING)? {
            let key = hex::decode(encoded.trim())
                .map_err(|err| Error::InvalidDirectory(format!("{TOKEN_KEY_SETTING}: {err}")))?;
            return Ok(Self::new(key));
        }
        let mut key = vec![0u8; TOKEN_KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        settings.set(TOKEN_KEY_SETTING, &hex::encode(&key))?;
        info!("generated new token key");
        Ok(Self::new(key))
    }

    fn tag(&self, payload: &[u8]) -> [u8; TAG_LENGTH] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&digest[..TAG_LENGTH]);
        tag
    }

    /// Issue a token for `agent_id` connecting as `kind`.
    pub fn issue(&self, agent_id: &str, kind: ConnectionKind) -> String {
        let random = match kind {
            ConnectionKind::Agent => crc32(agent_id.as_bytes()),
            _ => {
                let mut random = [0u8; 4];
                OsRng.fill_bytes(&mut random);
                random
            }
        };
        let mut token = Vec::with_capacity(SECRET_LENGTH + 4);
        token.extend_from_slice(&random);
        token.extend_from_slice(&[0u8; 4]);
        token.extend_from_slice(&state(agent_id, kind, &random));
        let tag = self.tag(&token);
        token.extend_from_slice(&tag);
        let checksum = crc32(&token);
        token.extend_from_slice(&checksum);
        hex::encode(token)
    }

    /// Whether `token` was issued by this key for `agent_id` connecting as `kind`.
    pub fn is_valid(&self, token: &str, agent_id: &str, kind: ConnectionKind) -> bool {
        let Some(secret) = secret(token) else {
            return false;
        };
        let (payload, tag) = secret.split_at(PAYLOAD_LENGTH);
        if !bool::from(self.tag(payload)[..].ct_eq(tag)) {
            return false;
        }
        let random = &payload[..4];
        if kind == ConnectionKind::Agent && random != crc32(agent_id.as_bytes()) {
            return false;
        }
        payload[8..] == state(agent_id, kind, random)
    }
}
