use core::fmt;
use std::fmt::Write as _;

use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::RnsError;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 16;

/// Full SHA-256 digest.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// Truncated digest used to address destinations, links, and interfaces.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

impl Hash {
    pub fn generator() -> Sha256 {
        Sha256::new()
    }

    pub const fn new(hash: [u8; HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        Self(Sha256::new().chain_update(data).finalize().into())
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut data = [0u8; HASH_SIZE];
        rng.fill_bytes(&mut data);
        Self::new_from_slice(&data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl AddressHash {
    pub const fn new(hash: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; ADDRESS_HASH_SIZE])
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        Self::new_from_hash(&Hash::new_from_slice(data))
    }

    pub fn new_from_hash(hash: &Hash) -> Self {
        let mut truncated = [0u8; ADDRESS_HASH_SIZE];
        truncated.copy_from_slice(&hash.0[..ADDRESS_HASH_SIZE]);
        Self(truncated)
    }

    pub fn new_from_rand<R: CryptoRngCore>(rng: R) -> Self {
        Self::new_from_hash(&Hash::new_from_rand(rng))
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < ADDRESS_HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        bytes.copy_from_slice(&data[..ADDRESS_HASH_SIZE]);
        Ok(Self(bytes))
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        if hex_string.len() < ADDRESS_HASH_SIZE * 2 {
            return Err(RnsError::IncorrectHash);
        }

        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex_string[i * 2..i * 2 + 2], 16)
                .map_err(|_| RnsError::IncorrectHash)?;
        }

        Ok(Self(bytes))
    }

    pub fn to_hex_string(&self) -> String {
        let mut hex_string = String::with_capacity(ADDRESS_HASH_SIZE * 2);
        for byte in self.0 {
            let _ = write!(&mut hex_string, "{:02x}", byte);
        }
        hex_string
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_HASH_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        Self::new_from_hash(&hash)
    }
}

impl Default for AddressHash {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:0>2x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for byte in self.0.iter() {
            write!(f, "{:0>2x}", byte)?;
        }
        write!(f, "/")
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::AddressHash;

    #[test]
    fn address_hex_round_trip() {
        let original = AddressHash::new_from_rand(OsRng);
        let restored =
            AddressHash::new_from_hex_string(&original.to_hex_string()).expect("valid hash");
        assert_eq!(restored, original);
    }

    #[test]
    fn truncation_takes_leading_bytes() {
        let hash = super::Hash::new_from_slice(b"weft");
        let address = AddressHash::new_from_hash(&hash);
        assert_eq!(address.as_slice(), &hash.as_slice()[..16]);
    }
}
