use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::crypt::token::TokenKey;
use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::identity::{DerivedKey, PrivateIdentity, PUBLIC_KEY_LENGTH};

const RATCHET_EXPIRY_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Remembered peer ratchet keyed by destination, persisted one msgpack
/// record per destination under the store directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RatchetRecord {
    pub ratchet: ByteBuf,
    pub received: f64,
}

#[derive(Debug)]
pub struct RatchetStore {
    ratchet_dir: PathBuf,
    cache: HashMap<AddressHash, RatchetRecord>,
}

impl RatchetStore {
    pub fn new(path: PathBuf) -> Self {
        Self { ratchet_dir: path, cache: HashMap::new() }
    }

    pub fn remember(
        &mut self,
        destination: &AddressHash,
        ratchet: [u8; PUBLIC_KEY_LENGTH],
    ) -> Result<(), RnsError> {
        if let Some(existing) = self.cache.get(destination) {
            if existing.ratchet.as_ref() == ratchet.as_slice() {
                return Ok(());
            }
        }

        let record = RatchetRecord { ratchet: ByteBuf::from(ratchet.to_vec()), received: now_secs() };
        self.cache.insert(*destination, record.clone());
        self.persist_record(destination, &record)
    }

    pub fn get(&mut self, destination: &AddressHash) -> Option<[u8; PUBLIC_KEY_LENGTH]> {
        let now = now_secs();

        if let Some(record) = self.cache.get(destination) {
            if now <= record.received + RATCHET_EXPIRY_SECS {
                return record.ratchet.as_ref().try_into().ok();
            }
            self.cache.remove(destination);
            self.remove_record(destination);
        }

        let record = self.load_record(destination)?;
        if now > record.received + RATCHET_EXPIRY_SECS {
            self.remove_record(destination);
            return None;
        }
        let ratchet = record.ratchet.as_ref().try_into().ok();
        self.cache.insert(*destination, record);
        ratchet
    }

    pub fn clean_expired(&mut self, now: f64) {
        self.cache.retain(|_, record| now <= record.received + RATCHET_EXPIRY_SECS);
        if let Ok(entries) = fs::read_dir(&self.ratchet_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Ok(data) = fs::read(&path) {
                    if let Ok(record) = rmp_serde::from_slice::<RatchetRecord>(&data) {
                        if now > record.received + RATCHET_EXPIRY_SECS {
                            let _ = fs::remove_file(path);
                        }
                    }
                }
            }
        }
    }

    fn persist_record(
        &self,
        destination: &AddressHash,
        record: &RatchetRecord,
    ) -> Result<(), RnsError> {
        ensure_dir(&self.ratchet_dir)?;
        let encoded = rmp_serde::to_vec_named(record).map_err(|_| RnsError::PacketError)?;
        let path = self.path_for(destination);
        let tmp_path = path.with_extension("out");
        fs::write(&tmp_path, encoded).map_err(|_| RnsError::PacketError)?;
        if path.exists() {
            let _ = fs::remove_file(&path);
        }
        fs::rename(&tmp_path, &path).map_err(|_| RnsError::PacketError)
    }

    fn load_record(&self, destination: &AddressHash) -> Option<RatchetRecord> {
        let data = fs::read(self.path_for(destination)).ok()?;
        rmp_serde::from_slice::<RatchetRecord>(&data).ok()
    }

    fn remove_record(&self, destination: &AddressHash) {
        let _ = fs::remove_file(self.path_for(destination));
    }

    fn path_for(&self, destination: &AddressHash) -> PathBuf {
        self.ratchet_dir.join(destination.to_hex_string())
    }
}

/// Encrypts for a bare public key (a destination identity key or an
/// announced ratchet): ephemeral X25519, HKDF with the given salt, Token
/// encryption; the ephemeral public key is prepended to the token.
pub fn encrypt_for_public_key<R: CryptoRngCore + Copy>(
    public_key: &PublicKey,
    salt: &[u8],
    plaintext: &[u8],
    rng: R,
) -> Result<Vec<u8>, RnsError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(public_key);
    let derived = DerivedKey::new(&shared, Some(salt));

    let mut out = vec![0u8; PUBLIC_KEY_LENGTH + TokenKey::sealed_len(plaintext.len())];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token_len = derived
        .token_key()
        .seal(rng, plaintext, &mut out[PUBLIC_KEY_LENGTH..])
        .map_err(|_| RnsError::CryptoError)?;
    out.truncate(PUBLIC_KEY_LENGTH + token_len);
    Ok(out)
}

pub fn decrypt_with_private_key(
    private_key: &StaticSecret,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RnsError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(RnsError::InvalidArgument);
    }
    let mut pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
    pub_bytes.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let shared = private_key.diffie_hellman(&PublicKey::from(pub_bytes));
    let derived = DerivedKey::new(&shared, Some(salt));
    decrypt_token(&derived, &ciphertext[PUBLIC_KEY_LENGTH..])
}

pub fn decrypt_with_identity(
    identity: &PrivateIdentity,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RnsError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(RnsError::InvalidArgument);
    }
    let mut pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
    pub_bytes.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let derived = identity.derive_key(&PublicKey::from(pub_bytes), Some(salt));
    decrypt_token(&derived, &ciphertext[PUBLIC_KEY_LENGTH..])
}

fn decrypt_token(derived: &DerivedKey, token_data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let mut out = vec![0u8; token_data.len()];
    let plain =
        derived.token_key().open(token_data, &mut out).map_err(|_| RnsError::CryptoError)?;
    Ok(plain.to_vec())
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn ensure_dir(path: &Path) -> Result<(), RnsError> {
    fs::create_dir_all(path).map_err(|_| RnsError::PacketError)
}
