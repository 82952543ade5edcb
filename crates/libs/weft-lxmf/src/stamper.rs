use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::constants::WORKBLOCK_EXPAND_ROUNDS;

const STAMP_SIZE: usize = 32;
const OKM_PER_ROUND: usize = 256;

/// Expands the stamp material into the search buffer: per round, the
/// salt is the hash of the material plus the msgpacked round number,
/// and HKDF contributes 256 bytes of output keyed by the material.
/// Search and validation must agree on this derivation exactly.
pub fn stamp_workblock(material: &[u8], expand_rounds: usize) -> Vec<u8> {
    let mut workblock = Vec::with_capacity(expand_rounds * OKM_PER_ROUND);

    for round in 0..expand_rounds {
        let mut salt_data = Vec::with_capacity(material.len() + 8);
        salt_data.extend_from_slice(material);
        let packed_round = rmp_serde::to_vec(&round).unwrap_or_default();
        salt_data.extend_from_slice(&packed_round);
        let salt_hash = rns::hash::Hash::new_from_slice(&salt_data);

        let hk = Hkdf::<Sha256>::new(Some(salt_hash.as_slice()), material);
        let mut okm = [0u8; OKM_PER_ROUND];
        if hk.expand(&[], &mut okm).is_err() {
            break;
        }
        workblock.extend_from_slice(&okm);
    }

    workblock
}

pub fn message_workblock(material: &[u8]) -> Vec<u8> {
    stamp_workblock(material, WORKBLOCK_EXPAND_ROUNDS)
}

/// Leading zero bits of SHA-256(workblock || stamp).
pub fn stamp_value(workblock: &[u8], stamp: &[u8]) -> u32 {
    let hash = rns::hash::Hash::new_from_slice(&[workblock, stamp].concat());
    let mut value = 0u32;

    for byte in hash.as_slice() {
        if *byte == 0 {
            value += 8;
        } else {
            value += byte.leading_zeros();
            break;
        }
    }

    value
}

pub fn stamp_valid(stamp: &[u8], target_cost: u32, workblock: &[u8]) -> bool {
    stamp_value(workblock, stamp) >= target_cost
}

/// Bounded random search for a stamp meeting the target cost. Returns
/// the stamp and its achieved value, or None if the round budget runs
/// out first.
pub fn generate_stamp(
    workblock: &[u8],
    target_cost: u32,
    max_rounds: usize,
) -> Option<(Vec<u8>, u32)> {
    let mut stamp = [0u8; STAMP_SIZE];

    for _ in 0..max_rounds {
        OsRng.fill_bytes(&mut stamp);
        let value = stamp_value(workblock, &stamp);
        if value >= target_cost {
            return Some((stamp.to_vec(), value));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workblock_size_follows_round_count() {
        let material = [0x42u8; 32];
        assert_eq!(stamp_workblock(&material, WORKBLOCK_EXPAND_ROUNDS).len(), 2560);
        assert_eq!(stamp_workblock(&material, 3).len(), 768);
    }

    #[test]
    fn workblock_is_deterministic() {
        let material = [0x11u8; 32];
        assert_eq!(stamp_workblock(&material, 4), stamp_workblock(&material, 4));
        assert_ne!(stamp_workblock(&material, 4), stamp_workblock(&[0x12u8; 32], 4));
    }

    #[test]
    fn generated_stamp_validates() {
        let workblock = message_workblock(&[0x33u8; 32]);
        let (stamp, value) =
            generate_stamp(&workblock, 4, 1_000_000).expect("stamp within budget");

        assert!(value >= 4);
        assert!(stamp_valid(&stamp, 4, &workblock));
    }

    #[test]
    fn zero_cost_accepts_any_stamp() {
        let workblock = message_workblock(&[0x44u8; 32]);
        assert!(stamp_valid(&[0u8; 32], 0, &workblock));
    }
}
