use ed25519_dalek::ed25519::signature::Signer;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::crypt::token::TokenKey;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};

pub const PUBLIC_KEY_LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const DERIVED_KEY_LENGTH: usize = 512 / 8;

pub trait HashIdentity {
    fn as_address_hash_slice(&self) -> &[u8];
}

pub trait EncryptIdentity {
    fn encrypt<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        text: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], RnsError>;
}

pub trait DecryptIdentity {
    fn decrypt<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        data: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], RnsError>;
}

/// Public half of a long-lived keypair: X25519 encryption key plus
/// Ed25519 verification key. The address hash is the truncated SHA-256
/// of their 64-byte concatenation.
#[derive(Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(public_key.as_bytes())
                .chain_update(verifying_key.as_bytes())
                .finalize()
                .into(),
        );

        Self { public_key, verifying_key, address_hash: AddressHash::new_from_hash(&hash) }
    }

    pub fn new_from_slices(public_key: &[u8], verifying_key: &[u8]) -> Self {
        let public_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(public_key);
            PublicKey::from(key_data)
        };

        let verifying_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(verifying_key);
            VerifyingKey::from_bytes(&key_data).unwrap_or_default()
        };

        Self::new(public_key, verifying_key)
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        let bytes = hex::decode(hex_string).map_err(|_| RnsError::IncorrectHash)?;
        if bytes.len() != PUBLIC_KEY_LENGTH * 2 {
            return Err(RnsError::IncorrectHash);
        }

        Ok(Self::new_from_slices(&bytes[..PUBLIC_KEY_LENGTH], &bytes[PUBLIC_KEY_LENGTH..]))
    }

    pub fn to_hex_string(&self) -> String {
        format!(
            "{}{}",
            hex::encode(self.public_key.as_bytes()),
            hex::encode(self.verifying_key.as_bytes())
        )
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.verifying_key.verify_strict(data, signature).map_err(|_| RnsError::IncorrectSignature)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(PublicKey::from([0u8; PUBLIC_KEY_LENGTH]), VerifyingKey::default())
    }
}

impl HashIdentity for Identity {
    fn as_address_hash_slice(&self) -> &[u8] {
        self.address_hash.as_slice()
    }
}

/// Identity for unaddressed PLAIN destinations.
pub struct EmptyIdentity;

impl HashIdentity for EmptyIdentity {
    fn as_address_hash_slice(&self) -> &[u8] {
        &[]
    }
}

/// Full keypair: identity plus the private X25519 and Ed25519 halves.
#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    private_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(private_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&private_key).into(), sign_key.verifying_key()),
            private_key,
            sign_key,
        }
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let private_key = StaticSecret::random_from_rng(rng);

        Self::new(private_key, sign_key)
    }

    /// Deterministic identity from a name, for tests and tooling.
    pub fn new_from_name(name: &str) -> Self {
        let hash = Hash::new_from_slice(name.as_bytes());
        let private_key = StaticSecret::from(hash.to_bytes());

        let hash = Hash::new_from_slice(hash.as_bytes());
        let sign_key = SigningKey::from_bytes(hash.as_bytes());

        Self::new(private_key, sign_key)
    }

    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut private_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        let mut sign_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        private_key_bytes.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        sign_key_bytes.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(StaticSecret::from(private_key_bytes), SigningKey::from_bytes(&sign_key_bytes)))
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.private_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::new_from_private_key(&self.private_key, public_key, salt)
    }
}

impl HashIdentity for PrivateIdentity {
    fn as_address_hash_slice(&self) -> &[u8] {
        self.identity.address_hash.as_slice()
    }
}

impl EncryptIdentity for PrivateIdentity {
    fn encrypt<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        text: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], RnsError> {
        let token_len = derived_key.token_key().seal(rng, text, out_buf)?;
        Ok(&out_buf[..token_len])
    }
}

impl DecryptIdentity for PrivateIdentity {
    fn decrypt<'a, R: CryptoRngCore + Copy>(
        &self,
        _rng: R,
        data: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], RnsError> {
        derived_key.token_key().open(data, out_buf)
    }
}

/// HKDF-SHA256 expansion of an X25519 shared secret; the halves key the
/// Token HMAC and AES sides respectively.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_LENGTH],
}

impl DerivedKey {
    pub fn new(shared_key: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(salt, shared_key.as_bytes()).expand(&[], &mut key[..]);
        Self { key }
    }

    pub fn new_empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_LENGTH] }
    }

    pub fn new_from_private_key(
        priv_key: &StaticSecret,
        pub_key: &PublicKey,
        salt: Option<&[u8]>,
    ) -> Self {
        Self::new(&priv_key.diffie_hellman(pub_key), salt)
    }

    pub fn new_from_ephemeral_key<R: CryptoRngCore + Copy>(
        rng: R,
        pub_key: &PublicKey,
        salt: Option<&[u8]>,
    ) -> Self {
        let secret = EphemeralSecret::random_from_rng(rng);
        Self::new(&secret.diffie_hellman(pub_key), salt)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LENGTH] {
        &self.key
    }

    /// The token codec keyed by this derivation; all link, ratchet, and
    /// opportunistic payloads are sealed under it.
    pub fn token_key(&self) -> TokenKey {
        TokenKey::from_derived(self)
    }
}
