//! Record sealing for the encrypted candidate-release path.
//!
//! A silo issues one AES-256-GCM key per process and hands it to whoever
//! calls `GetEncryptionKey`. The key travels over the same channel as the
//! records, so sealing only keeps third parties on the wire from reading
//! released records; it offers nothing against the coordinator itself.
//!
//! # Quickstart
//! ```
//! use fedgeo_core::Record;
//! use fedgeo_crypto::{PayloadCipher, PayloadKey};
//!
//! let key = PayloadKey::generate();
//! let cipher = PayloadCipher::new(&key).unwrap();
//! let sealed = cipher.seal(&Record::new(4, 1.0, 2.0), b"session-9").unwrap();
//! let opened = PayloadCipher::new(&key).unwrap().open(&sealed, b"session-9").unwrap();
//! assert_eq!(opened.id, 4);
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use fedgeo_core::Record;
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;

type Result<T> = std::result::Result<T, CipherError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("payload key must be 32 bytes (got {0})")]
    InvalidKeyLength(usize),
    #[error("payload key is not valid hex: {0}")]
    InvalidKeyHex(String),
    #[error("key derivation failed")]
    Derivation,
    #[error("sealing record failed")]
    Seal,
    #[error("sealed record {0} failed authentication")]
    Open(u64),
    #[error("sealed record {0} does not decode to a record")]
    Malformed(u64),
}

/// 256-bit payload key; serialised as hex.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayloadKey([u8; KEY_BYTES]);

impl PayloadKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// HKDF-SHA256 expansion of `seed`, bound to `label`.
    pub fn derive(seed: &[u8], label: &str) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(b"fedgeo-payload-key"), seed);
        let mut key = [0u8; KEY_BYTES];
        hk.expand(label.as_bytes(), &mut key)
            .map_err(|_| CipherError::Derivation)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes =
            hex::decode(encoded).map_err(|err| CipherError::InvalidKeyHex(err.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadKey(..)")
    }
}

impl TryFrom<String> for PayloadKey {
    type Error = CipherError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<PayloadKey> for String {
    fn from(key: PayloadKey) -> Self {
        key.to_hex()
    }
}

/// One sealed record as it travels on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub seq: u64,
    pub nonce: [u8; NONCE_BYTES],
    pub ciphertext: Vec<u8>,
}

pub struct PayloadCipher {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 4],
    seq: AtomicU64,
}

impl PayloadCipher {
    pub fn new(key: &PayloadKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| CipherError::InvalidKeyLength(KEY_BYTES))?;
        let mut nonce_prefix = [0u8; 4];
        OsRng.fill_bytes(&mut nonce_prefix);
        Ok(Self {
            cipher,
            nonce_prefix,
            seq: AtomicU64::new(0),
        })
    }

    /// Seals `record`; `aad` must be presented again to open it.
    pub fn seal(&self, record: &Record, aad: &[u8]) -> Result<EncryptedRecord> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nonce = compose_nonce(&self.nonce_prefix, seq);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &record.to_bytes(),
                    aad,
                },
            )
            .map_err(|_| CipherError::Seal)?;
        Ok(EncryptedRecord {
            seq,
            nonce,
            ciphertext,
        })
    }

    pub fn open(&self, sealed: &EncryptedRecord, aad: &[u8]) -> Result<Record> {
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| CipherError::Open(sealed.seq))?;
        Record::from_bytes(&plain).ok_or(CipherError::Malformed(sealed.seq))
    }
}

fn compose_nonce(prefix: &[u8; 4], seq: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[..4].copy_from_slice(prefix);
    nonce[4..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_aad_fails_authentication() {
        let key = PayloadKey::generate();
        let cipher = PayloadCipher::new(&key).unwrap();
        let sealed = cipher.seal(&Record::new(1, 0.5, 0.5), b"session-1").unwrap();
        assert_eq!(
            cipher.open(&sealed, b"session-2").unwrap_err(),
            CipherError::Open(sealed.seq)
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = PayloadCipher::new(&PayloadKey::generate()).unwrap();
        let mut sealed = cipher.seal(&Record::new(1, 0.5, 0.5), b"").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(cipher.open(&sealed, b"").is_err());
    }

    #[test]
    fn nonces_never_repeat_within_a_cipher() {
        let cipher = PayloadCipher::new(&PayloadKey::generate()).unwrap();
        let record = Record::new(3, 1.0, 1.0);
        let a = cipher.seal(&record, b"").unwrap();
        let b = cipher.seal(&record, b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn derived_keys_are_label_bound_and_hex_stable() {
        let a = PayloadKey::derive(b"seed", "silo-0").unwrap();
        let b = PayloadKey::derive(b"seed", "silo-1").unwrap();
        assert_ne!(a, b);
        assert_eq!(PayloadKey::from_hex(&a.to_hex()).unwrap(), a);
        assert!(matches!(
            PayloadKey::from_bytes(&[0u8; 5]),
            Err(CipherError::InvalidKeyLength(5))
        ));
    }
}
