use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, Key, KeyIvInit};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::RnsError;
use crate::identity::{DerivedKey, DERIVED_KEY_LENGTH};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_HALF: usize = DERIVED_KEY_LENGTH / 2;

/// Fixed token framing cost: leading IV plus trailing MAC tag. Padding
/// comes on top, up to one cipher block.
pub const TOKEN_OVERHEAD: usize = IV_SIZE + MAC_SIZE;
pub const TOKEN_BLOCK: usize = 16;

/// Keyed codec for the encrypted tokens that carry all link, ratchet,
/// and group traffic: `IV || AES-256-CBC ciphertext || HMAC-SHA256 tag`.
///
/// This is the Fernet construction with the version and timestamp
/// fields stripped; they cost bytes on constrained links and leak
/// initiator metadata, so the wire format omits them. The signing half
/// of the key material MACs, the cipher half encrypts.
pub struct TokenKey {
    sign_key: [u8; KEY_HALF],
    enc_key: Key<aes::Aes256>,
}

impl TokenKey {
    /// Splits HKDF output into its signing and cipher halves. Link and
    /// ratchet keys all arrive through this layout.
    pub fn from_derived(derived: &DerivedKey) -> Self {
        let material = derived.as_bytes();
        let mut sign_key = [0u8; KEY_HALF];
        sign_key.copy_from_slice(&material[..KEY_HALF]);
        let mut enc_key = [0u8; KEY_HALF];
        enc_key.copy_from_slice(&material[KEY_HALF..]);

        Self { sign_key, enc_key: enc_key.into() }
    }

    /// GROUP destinations share one 16-byte key; it keys both halves,
    /// stretched to width, matching the reference group tokens.
    pub fn from_group_key(key: &[u8; 16]) -> Self {
        let mut sign_key = [0u8; KEY_HALF];
        sign_key[..key.len()].copy_from_slice(key);
        let mut enc_key = [0u8; KEY_HALF];
        enc_key[..key.len()].copy_from_slice(key);

        Self { sign_key, enc_key: enc_key.into() }
    }

    pub fn random<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut material = [0u8; DERIVED_KEY_LENGTH];
        rng.fill_bytes(&mut material);

        let mut sign_key = [0u8; KEY_HALF];
        sign_key.copy_from_slice(&material[..KEY_HALF]);
        let mut enc_key = [0u8; KEY_HALF];
        enc_key.copy_from_slice(&material[KEY_HALF..]);

        Self { sign_key, enc_key: enc_key.into() }
    }

    /// Exact sealed size for a plaintext: IV, ciphertext padded to the
    /// next whole block, tag.
    pub fn sealed_len(plain_len: usize) -> usize {
        TOKEN_OVERHEAD + (plain_len / TOKEN_BLOCK + 1) * TOKEN_BLOCK
    }

    /// Seals `plaintext` into the front of `out_buf` and returns the
    /// token length. Fails when the buffer cannot hold the padded
    /// token.
    pub fn seal<R: CryptoRngCore>(
        &self,
        mut rng: R,
        plaintext: &[u8],
        out_buf: &mut [u8],
    ) -> Result<usize, RnsError> {
        let token_len = Self::sealed_len(plaintext.len());
        if out_buf.len() < token_len {
            return Err(RnsError::OutOfMemory);
        }

        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);
        out_buf[..IV_SIZE].copy_from_slice(&iv);

        let ciphertext_end = token_len - MAC_SIZE;
        Aes256CbcEnc::new(&self.enc_key, &iv.into())
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut out_buf[IV_SIZE..ciphertext_end])
            .map_err(|_| RnsError::CryptoError)?;

        let tag = self.tag_over(&out_buf[..ciphertext_end])?;
        out_buf[ciphertext_end..token_len].copy_from_slice(&tag);

        Ok(token_len)
    }

    /// Authenticates `token` and decrypts it into `out_buf`, returning
    /// the plaintext slice. A bad tag fails before any decryption runs.
    pub fn open<'a>(&self, token: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        if token.len() < TOKEN_OVERHEAD + TOKEN_BLOCK {
            return Err(RnsError::PacketError);
        }

        let (signed_part, received_tag) = token.split_at(token.len() - MAC_SIZE);
        let expected_tag = self.tag_over(signed_part)?;

        // Accumulate the comparison over every byte so timing reveals
        // nothing about where a forgery diverges.
        let difference = received_tag
            .iter()
            .zip(expected_tag.iter())
            .fold(0u8, |acc, (left, right)| acc | (left ^ right));
        if difference != 0 {
            return Err(RnsError::IncorrectSignature);
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&signed_part[..IV_SIZE]);

        let plaintext = Aes256CbcDec::new(&self.enc_key, &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(&signed_part[IV_SIZE..], out_buf)
            .map_err(|_| RnsError::CryptoError)?;

        Ok(plaintext)
    }

    fn tag_over(&self, data: &[u8]) -> Result<[u8; MAC_SIZE], RnsError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::CryptoError)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{TokenKey, TOKEN_BLOCK, TOKEN_OVERHEAD};
    use crate::error::RnsError;

    #[test]
    fn seal_then_open() {
        let key = TokenKey::random(OsRng);
        let plaintext = b"token round trip across a link";

        let mut token = [0u8; 256];
        let token_len = key.seal(OsRng, plaintext, &mut token).expect("sealed");

        let mut out = [0u8; 256];
        let opened = key.open(&token[..token_len], &mut out).expect("opened");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn sealed_len_is_exact() {
        let key = TokenKey::random(OsRng);

        // 4 bytes pad to a single block; 16 bytes roll into a second.
        for (plain_len, expected) in
            [(4, TOKEN_OVERHEAD + TOKEN_BLOCK), (16, TOKEN_OVERHEAD + 2 * TOKEN_BLOCK)]
        {
            let mut token = [0u8; 256];
            let token_len =
                key.seal(OsRng, &vec![0u8; plain_len], &mut token).expect("sealed");
            assert_eq!(token_len, expected);
            assert_eq!(token_len, TokenKey::sealed_len(plain_len));
        }
    }

    #[test]
    fn undersized_buffer_is_refused() {
        let key = TokenKey::random(OsRng);
        let mut token = [0u8; TOKEN_OVERHEAD + TOKEN_BLOCK - 1];
        assert_eq!(key.seal(OsRng, b"hello", &mut token), Err(RnsError::OutOfMemory));
    }

    #[test]
    fn flipped_bit_fails_authentication() {
        let key = TokenKey::random(OsRng);
        let mut token = [0u8; 256];
        let token_len = key.seal(OsRng, b"payload", &mut token).expect("sealed");

        for index in [0, token_len / 2, token_len - 1] {
            let mut tampered = token;
            tampered[index] ^= 0x01;
            let mut out = [0u8; 256];
            assert_eq!(
                key.open(&tampered[..token_len], &mut out),
                Err(RnsError::IncorrectSignature)
            );
        }
    }

    #[test]
    fn wrong_key_cannot_open() {
        let key = TokenKey::random(OsRng);
        let other = TokenKey::random(OsRng);

        let mut token = [0u8; 256];
        let token_len = key.seal(OsRng, b"secret", &mut token).expect("sealed");

        let mut out = [0u8; 256];
        assert!(other.open(&token[..token_len], &mut out).is_err());
    }
}
