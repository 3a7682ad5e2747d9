//! AEAD packet crypto: key store, nonce derivation, and the two
//! supported ciphers.
//!
//! Nonce = `base_nonce[0..4] || big_endian_u64(sequence)`, 12 bytes for
//! both supported ciphers. The base nonce is per-session and random;
//! the sequence number is the uniqueness source and MUST be strictly
//! monotonic per session key — replays (sequence <= highest previously
//! accepted) are rejected on decrypt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use ahash::AHashMap;
use chacha20poly1305::ChaCha20Poly1305;
use parking_lot::RwLock;
use protocol::EncryptionKind;
use rand::RngCore;

use crate::error::{Error, Result};

const KEY_LEN: usize = 32;
const BASE_NONCE_LEN: usize = 4;
const SESSION_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct SessionKey {
    pub id: u64,
    pub key: [u8; KEY_LEN],
    pub base_nonce: [u8; BASE_NONCE_LEN],
    pub peer_id: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl SessionKey {
    fn generate(id: u64, peer_id: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut base_nonce = [0u8; BASE_NONCE_LEN];
        rand::rng().fill_bytes(&mut key);
        rand::rng().fill_bytes(&mut base_nonce);

        let now = Instant::now();
        Self {
            id,
            key,
            base_nonce,
            peer_id: peer_id.to_string(),
            issued_at: now,
            expires_at: now + SESSION_KEY_TTL,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn nonce(&self, sequence: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..BASE_NONCE_LEN].copy_from_slice(&self.base_nonce);
        nonce[BASE_NONCE_LEN..].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }
}

struct Entry {
    key: SessionKey,
    highest_accepted_sequence: AtomicU64,
    has_accepted: std::sync::atomic::AtomicBool,
}

impl Entry {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            highest_accepted_sequence: AtomicU64::new(0),
            has_accepted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Returns `true` and records `sequence` if it is strictly greater
    /// than every sequence previously accepted on this key.
    fn try_accept(&self, sequence: u64) -> bool {
        if self.has_accepted.load(Ordering::Acquire) {
            let highest = self.highest_accepted_sequence.load(Ordering::Acquire);
            if sequence <= highest {
                return false;
            }
        }
        self.highest_accepted_sequence.store(sequence, Ordering::Release);
        self.has_accepted.store(true, Ordering::Release);
        true
    }
}

#[derive(Default)]
pub struct KeyStore {
    entries: RwLock<AHashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current key for `peer_id` if not expired, else a freshly
    /// generated (key, base-nonce) pair with a 24h TTL.
    pub fn get_or_create_session_key(&self, peer_id: &str) -> SessionKey {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(peer_id) {
                if !entry.key.is_expired() {
                    return entry.key.clone();
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fresh = SessionKey::generate(id, peer_id);
        self.entries.write().insert(peer_id.to_string(), Entry::new(fresh.clone()));
        fresh
    }

    /// Regenerate every session key atomically. Callers must tolerate
    /// decryption failures for in-flight packets during the rollover.
    pub fn rotate(&self) {
        let mut entries = self.entries.write();
        let peer_ids: Vec<String> = entries.keys().cloned().collect();
        for peer_id in peer_ids {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entries.insert(peer_id.clone(), Entry::new(SessionKey::generate(id, &peer_id)));
        }
    }

    fn try_accept_sequence(&self, peer_id: &str, sequence: u64) -> Result<()> {
        let entries = self.entries.read();
        match entries.get(peer_id) {
            Some(entry) if entry.try_accept(sequence) => Ok(()),
            Some(_) => Err(Error::ReplayDetected),
            None => Err(Error::DecryptionFailed),
        }
    }
}

/// Encrypt `plaintext` under `key` using `kind`, sequencing the nonce
/// with `sequence`. `kind == EncryptionKind::None` is rejected here —
/// callers send plaintext payloads directly without going through this
/// function.
pub fn encrypt(key: &SessionKey, kind: EncryptionKind, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = key.nonce(sequence);

    match kind {
        EncryptionKind::None => Err(Error::InvalidKeySize),
        EncryptionKind::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.key).map_err(|_| Error::InvalidKeySize)?;
            cipher
                .encrypt(AesNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &[] })
                .map_err(|_| Error::DecryptionFailed)
        }
        EncryptionKind::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(&key.key).map_err(|_| Error::InvalidKeySize)?;
            cipher
                .encrypt(
                    chacha20poly1305::Nonce::from_slice(&nonce),
                    Payload { msg: plaintext, aad: &[] },
                )
                .map_err(|_| Error::DecryptionFailed)
        }
    }
}

/// Decrypt `ciphertext` (tag included) under `key`, rejecting replays
/// via `store`'s per-peer highest-accepted-sequence tracking.
pub fn decrypt(
    store: &KeyStore,
    key: &SessionKey,
    kind: EncryptionKind,
    sequence: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if key.is_expired() {
        return Err(Error::ExpiredKey);
    }

    store.try_accept_sequence(&key.peer_id, sequence)?;

    let nonce = key.nonce(sequence);
    let plaintext = match kind {
        EncryptionKind::None => return Err(Error::InvalidKeySize),
        EncryptionKind::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.key).map_err(|_| Error::InvalidKeySize)?;
            cipher
                .decrypt(AesNonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &[] })
                .map_err(|_| Error::DecryptionFailed)?
        }
        EncryptionKind::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(&key.key).map_err(|_| Error::InvalidKeySize)?;
            cipher
                .decrypt(
                    chacha20poly1305::Nonce::from_slice(&nonce),
                    Payload { msg: ciphertext, aad: &[] },
                )
                .map_err(|_| Error::DecryptionFailed)?
        }
    };

    Ok(plaintext)
}

pub type SharedKeyStore = Arc<KeyStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_aes_gcm() {
        let store = KeyStore::new();
        let key = store.get_or_create_session_key("peer-a");

        let ciphertext = encrypt(&key, EncryptionKind::Aes256Gcm, 1, b"Encrypted integration test data").unwrap();
        let plaintext = decrypt(&store, &key, EncryptionKind::Aes256Gcm, 1, &ciphertext).unwrap();
        assert_eq!(plaintext, b"Encrypted integration test data");
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let store = KeyStore::new();
        let key = store.get_or_create_session_key("peer-a");

        let mut ciphertext = encrypt(&key, EncryptionKind::Aes256Gcm, 1, b"hello world").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;

        assert_eq!(
            decrypt(&store, &key, EncryptionKind::Aes256Gcm, 1, &ciphertext).unwrap_err(),
            Error::DecryptionFailed
        );
    }

    #[test]
    fn replay_of_same_sequence_is_rejected_after_success() {
        let store = KeyStore::new();
        let key = store.get_or_create_session_key("peer-a");

        let ciphertext = encrypt(&key, EncryptionKind::Aes256Gcm, 1, b"hello").unwrap();
        decrypt(&store, &key, EncryptionKind::Aes256Gcm, 1, &ciphertext).unwrap();

        let replay = decrypt(&store, &key, EncryptionKind::Aes256Gcm, 1, &ciphertext);
        assert_eq!(replay.unwrap_err(), Error::ReplayDetected);
    }

    #[test]
    fn sequence_must_strictly_increase() {
        let store = KeyStore::new();
        let key = store.get_or_create_session_key("peer-a");

        let c5 = encrypt(&key, EncryptionKind::Aes256Gcm, 5, b"hi").unwrap();
        decrypt(&store, &key, EncryptionKind::Aes256Gcm, 5, &c5).unwrap();

        let c3 = encrypt(&key, EncryptionKind::Aes256Gcm, 3, b"hi").unwrap();
        assert_eq!(
            decrypt(&store, &key, EncryptionKind::Aes256Gcm, 3, &c3).unwrap_err(),
            Error::ReplayDetected
        );
    }

    #[test]
    fn chacha20poly1305_round_trips() {
        let store = KeyStore::new();
        let key = store.get_or_create_session_key("peer-b");
        let ciphertext = encrypt(&key, EncryptionKind::ChaCha20Poly1305, 1, b"payload").unwrap();
        let plaintext = decrypt(&store, &key, EncryptionKind::ChaCha20Poly1305, 1, &ciphertext).unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn rotate_replaces_every_session_key() {
        let store = KeyStore::new();
        let before = store.get_or_create_session_key("peer-a");
        store.rotate();
        let after = store.get_or_create_session_key("peer-a");
        assert_ne!(before.key, after.key);
    }
}
