pub mod link;

use core::fmt;
use core::marker::PhantomData;

use ed25519_dalek::{Signature, SIGNATURE_LENGTH};
use rand_core::{CryptoRngCore, OsRng};
use sha2::Digest;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypt::token::TokenKey;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};
use crate::identity::{EmptyIdentity, HashIdentity, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH};
use crate::packet::{
    self, ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
    PacketDataBuffer, PacketType, PropagationType,
};
use crate::ratchets::{decrypt_with_identity, decrypt_with_private_key, now_secs};

//***************************************************************************//

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

//***************************************************************************//

pub trait Type {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Plain;
pub struct Group;

impl Type for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Type for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

impl Type for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

/// Symmetric helpers for GROUP destinations sharing one 16-byte key.
pub fn group_encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let token_key = TokenKey::from_group_key(key);
    let mut out_buf = vec![0u8; TokenKey::sealed_len(data.len())];
    let token_len = token_key.seal(OsRng, data, &mut out_buf)?;
    out_buf.truncate(token_len);
    Ok(out_buf)
}

pub fn group_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let token_key = TokenKey::from_group_key(key);
    let mut out_buf = vec![0u8; data.len()];
    let plaintext = token_key.open(data, &mut out_buf)?;
    Ok(plaintext.to_vec())
}

pub const NAME_HASH_LENGTH: usize = 10;
pub const RAND_HASH_LENGTH: usize = 10;
pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
pub const MIN_ANNOUNCE_DATA_LENGTH: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_LENGTH + RAND_HASH_LENGTH + SIGNATURE_LENGTH;

const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_RETAINED_RATCHETS: usize = 512;

/// Own-ratchet rotation state for an IN destination. Newest secret
/// first; older secrets stay around so packets encrypted to a ratchet
/// announced before a rotation still decrypt.
#[derive(Clone)]
struct RatchetState {
    enabled: bool,
    ratchets: Vec<[u8; RATCHET_LENGTH]>,
    ratchet_interval_secs: u64,
    retained_ratchets: usize,
    latest_ratchet_time: Option<f64>,
    enforce_ratchets: bool,
}

impl Default for RatchetState {
    fn default() -> Self {
        Self {
            enabled: false,
            ratchets: Vec::new(),
            ratchet_interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
            retained_ratchets: DEFAULT_RETAINED_RATCHETS,
            latest_ratchet_time: None,
            enforce_ratchets: false,
        }
    }
}

impl RatchetState {
    fn rotate_if_needed(&mut self, now: f64) {
        if !self.enabled {
            return;
        }
        let last = self.latest_ratchet_time.unwrap_or(0.0);
        if self.ratchets.is_empty() || now > last + self.ratchet_interval_secs as f64 {
            let secret = StaticSecret::random_from_rng(OsRng);
            self.ratchets.insert(0, secret.to_bytes());
            self.latest_ratchet_time = Some(now);
            if self.ratchets.len() > self.retained_ratchets {
                self.ratchets.truncate(self.retained_ratchets);
            }
        }
    }

    fn current_ratchet_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        let ratchet = self.ratchets.first()?;
        let secret = StaticSecret::from(*ratchet);
        Some(*PublicKey::from(&secret).as_bytes())
    }
}

/// Name hash over `"appname.aspect1.aspect2"`.
#[derive(Copy, Clone)]
pub struct DestinationName {
    pub hash: Hash,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &str) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(app_name.as_bytes())
                .chain_update(".".as_bytes())
                .chain_update(aspects.as_bytes())
                .finalize()
                .into(),
        );

        Self { hash }
    }

    pub fn new_from_hash_slice(hash_slice: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        hash[..hash_slice.len()].copy_from_slice(hash_slice);

        Self { hash: Hash::new(hash) }
    }

    pub fn as_name_hash_slice(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_LENGTH]
    }
}

/// Public face of a destination: identity, address hash, and name.
#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: AddressHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

pub type DestinationAnnounce = Packet;

pub struct AnnounceInfo<'a> {
    pub destination: SingleOutputDestination,
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
}

impl DestinationAnnounce {
    /// Validates an inbound announce: layout, destination-hash
    /// consistency, and signature over the full announced material.
    pub fn validate(packet: &Packet) -> Result<AnnounceInfo<'_>, RnsError> {
        if packet.header.packet_type != PacketType::Announce {
            return Err(RnsError::PacketError);
        }

        let announce_data = packet.data.as_slice();

        if announce_data.len() < MIN_ANNOUNCE_DATA_LENGTH {
            return Err(RnsError::PacketError);
        }

        let mut offset = 0usize;

        let public_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(&announce_data[offset..offset + PUBLIC_KEY_LENGTH]);
            offset += PUBLIC_KEY_LENGTH;
            PublicKey::from(key_data)
        };

        let verifying_key_bytes = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;

        let identity = Identity::new_from_slices(public_key.as_bytes(), verifying_key_bytes);

        let name_hash = &announce_data[offset..offset + NAME_HASH_LENGTH];
        offset += NAME_HASH_LENGTH;
        let rand_hash = &announce_data[offset..offset + RAND_HASH_LENGTH];
        offset += RAND_HASH_LENGTH;

        let destination = &packet.destination;
        let expected_hash =
            create_address_hash(&identity, &DestinationName::new_from_hash_slice(name_hash));
        if expected_hash != *destination {
            return Err(RnsError::IncorrectHash);
        }

        let verify_announce =
            |ratchet: Option<&[u8]>, signature: &[u8], app_data: &[u8]| -> Result<(), RnsError> {
                let mut signed_data = PacketDataBuffer::new();
                signed_data
                    .chain_write(destination.as_slice())?
                    .chain_write(public_key.as_bytes())?
                    .chain_write(verifying_key_bytes)?
                    .chain_write(name_hash)?
                    .chain_write(rand_hash)?;
                if let Some(ratchet) = ratchet {
                    signed_data.chain_write(ratchet)?;
                }
                if !app_data.is_empty() {
                    signed_data.chain_write(app_data)?;
                }
                let signature =
                    Signature::from_slice(signature).map_err(|_| RnsError::CryptoError)?;
                identity
                    .verify(signed_data.as_slice(), &signature)
                    .map_err(|_| RnsError::IncorrectSignature)
            };

        let remaining = announce_data.len().saturating_sub(offset);
        if remaining < SIGNATURE_LENGTH {
            return Err(RnsError::PacketError);
        }

        let parse_with_ratchet = || -> Result<AnnounceInfo<'_>, RnsError> {
            if remaining < SIGNATURE_LENGTH + RATCHET_LENGTH {
                return Err(RnsError::PacketError);
            }
            let ratchet = &announce_data[offset..offset + RATCHET_LENGTH];
            let sig_start = offset + RATCHET_LENGTH;
            let signature = &announce_data[sig_start..sig_start + SIGNATURE_LENGTH];
            let app_data = &announce_data[sig_start + SIGNATURE_LENGTH..];
            verify_announce(Some(ratchet), signature, app_data)?;
            let mut ratchet_bytes = [0u8; RATCHET_LENGTH];
            ratchet_bytes.copy_from_slice(ratchet);
            Ok(AnnounceInfo {
                destination: SingleOutputDestination::new(
                    identity,
                    DestinationName::new_from_hash_slice(name_hash),
                ),
                app_data,
                ratchet: Some(ratchet_bytes),
            })
        };

        let parse_without_ratchet = || -> Result<AnnounceInfo<'_>, RnsError> {
            let signature = &announce_data[offset..offset + SIGNATURE_LENGTH];
            let app_data = &announce_data[offset + SIGNATURE_LENGTH..];
            verify_announce(None, signature, app_data)?;

            Ok(AnnounceInfo {
                destination: SingleOutputDestination::new(
                    identity,
                    DestinationName::new_from_hash_slice(name_hash),
                ),
                app_data,
                ratchet: None,
            })
        };

        if packet.header.context_flag == ContextFlag::Set {
            return parse_with_ratchet();
        }

        // Some peers include ratchet bytes even without the header flag.
        // Prefer no-ratchet parsing, fall back if the signature fails.
        match parse_without_ratchet() {
            Ok(info) => Ok(info),
            Err(err_without_ratchet) => {
                if remaining >= SIGNATURE_LENGTH + RATCHET_LENGTH {
                    parse_with_ratchet().or(Err(err_without_ratchet))
                } else {
                    Err(err_without_ratchet)
                }
            }
        }
    }
}

pub struct Destination<I: HashIdentity, D: Direction, T: Type> {
    pub direction: PhantomData<D>,
    pub r#type: PhantomData<T>,
    pub identity: I,
    pub desc: DestinationDesc,
    ratchet_state: RatchetState,
}

impl<I: HashIdentity, D: Direction, T: Type> Destination<I, D, T> {
    pub fn destination_type(&self) -> packet::DestinationType {
        <T as Type>::destination_type()
    }
}

impl Destination<PrivateIdentity, Input, Single> {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        let pub_identity = *identity.as_identity();

        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity: pub_identity, name, address_hash },
            ratchet_state: RatchetState::default(),
        }
    }

    pub fn enable_ratchets(&mut self) {
        self.ratchet_state.enabled = true;
        self.ratchet_state.rotate_if_needed(now_secs());
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) -> Result<(), RnsError> {
        if retained == 0 {
            return Err(RnsError::InvalidArgument);
        }
        self.ratchet_state.retained_ratchets = retained;
        if self.ratchet_state.ratchets.len() > retained {
            self.ratchet_state.ratchets.truncate(retained);
        }
        Ok(())
    }

    pub fn set_ratchet_interval_secs(&mut self, secs: u64) -> Result<(), RnsError> {
        if secs == 0 {
            return Err(RnsError::InvalidArgument);
        }
        self.ratchet_state.ratchet_interval_secs = secs;
        Ok(())
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.ratchet_state.enforce_ratchets = enforce;
    }

    /// Decrypts an inbound opportunistic payload, trying the retained
    /// ratchet secrets first and falling back to the identity key unless
    /// ratchets are enforced. Returns the plaintext and whether a
    /// ratchet key did the work.
    pub fn decrypt_with_ratchets(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), RnsError> {
        let salt = self.identity.as_identity().address_hash.as_slice();
        if self.ratchet_state.enabled {
            for ratchet in &self.ratchet_state.ratchets {
                let secret = StaticSecret::from(*ratchet);
                if let Ok(plaintext) = decrypt_with_private_key(&secret, salt, ciphertext) {
                    return Ok((plaintext, true));
                }
            }
            if self.ratchet_state.enforce_ratchets {
                return Err(RnsError::CryptoError);
            }
        }

        let plaintext = decrypt_with_identity(&self.identity, salt, ciphertext)?;
        Ok((plaintext, false))
    }

    /// Builds an announce packet. The random blob is 5 random bytes
    /// followed by a 5-byte big-endian unix timestamp, matching the
    /// reference layout so freshness ordering interoperates.
    pub fn announce<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        let mut packet_data = PacketDataBuffer::new();

        let mut rand_hash = [0u8; RAND_HASH_LENGTH];
        let mut random_part = [0u8; RAND_HASH_LENGTH / 2];
        let mut rng_mut = rng;
        rng_mut.fill_bytes(&mut random_part);
        rand_hash[..RAND_HASH_LENGTH / 2].copy_from_slice(&random_part);
        let emitted_be = (now_secs().floor() as u64).to_be_bytes();
        rand_hash[RAND_HASH_LENGTH / 2..].copy_from_slice(&emitted_be[3..8]);

        let pub_key = self.identity.as_identity().public_key_bytes();
        let verifying_key = self.identity.as_identity().verifying_key_bytes();

        let ratchet = if self.ratchet_state.enabled {
            self.ratchet_state.rotate_if_needed(now_secs());
            self.ratchet_state.current_ratchet_public()
        } else {
            None
        };

        packet_data
            .chain_safe_write(self.desc.address_hash.as_slice())
            .chain_safe_write(pub_key)
            .chain_safe_write(verifying_key)
            .chain_safe_write(self.desc.name.as_name_hash_slice())
            .chain_safe_write(&rand_hash);

        if let Some(ratchet) = ratchet {
            packet_data.chain_safe_write(&ratchet);
        }

        if let Some(data) = app_data {
            packet_data.chain_safe_write(data);
        }

        let signature = self.identity.sign(packet_data.as_slice());

        packet_data.reset();

        packet_data
            .chain_safe_write(pub_key)
            .chain_safe_write(verifying_key)
            .chain_safe_write(self.desc.name.as_name_hash_slice())
            .chain_safe_write(&rand_hash);

        if let Some(ratchet) = ratchet {
            packet_data.chain_safe_write(&ratchet);
        }

        packet_data.chain_safe_write(&signature.to_bytes());

        if let Some(data) = app_data {
            packet_data.write(data)?;
        }

        Ok(Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: if ratchet.is_some() { ContextFlag::Set } else { ContextFlag::Unset },
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 0,
            },
            destination: self.desc.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        })
    }

    pub fn path_response<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }
}

impl Destination<Identity, Output, Single> {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity, name, address_hash },
            ratchet_state: RatchetState::default(),
        }
    }
}

impl<D: Direction> Destination<EmptyIdentity, D, Plain> {
    pub fn new(identity: EmptyIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity: Default::default(), name, address_hash },
            ratchet_state: RatchetState::default(),
        }
    }
}

fn create_address_hash<I: HashIdentity>(identity: &I, name: &DestinationName) -> AddressHash {
    AddressHash::new_from_hash(&Hash::new(
        Hash::generator()
            .chain_update(name.as_name_hash_slice())
            .chain_update(identity.as_address_hash_slice())
            .finalize()
            .into(),
    ))
}

pub type SingleInputDestination = Destination<PrivateIdentity, Input, Single>;
pub type SingleOutputDestination = Destination<Identity, Output, Single>;
pub type PlainInputDestination = Destination<EmptyIdentity, Input, Plain>;
pub type PlainOutputDestination = Destination<EmptyIdentity, Output, Plain>;

pub fn new_in(identity: PrivateIdentity, app_name: &str, aspect: &str) -> SingleInputDestination {
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspect))
}

pub fn new_out(identity: Identity, app_name: &str, aspect: &str) -> SingleOutputDestination {
    SingleOutputDestination::new(identity, DestinationName::new(app_name, aspect))
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{DestinationAnnounce, DestinationName, SingleInputDestination, RATCHET_LENGTH};
    use crate::error::RnsError;
    use crate::identity::PrivateIdentity;

    #[test]
    fn announce_validates() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut destination =
            SingleInputDestination::new(identity, DestinationName::new("weft", "delivery"));

        let announce = destination.announce(OsRng, None).expect("valid announce packet");
        DestinationAnnounce::validate(&announce).expect("valid announce");
    }

    #[test]
    fn announce_signature_covers_app_data() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut destination =
            SingleInputDestination::new(identity, DestinationName::new("weft", "delivery"));

        let announce =
            destination.announce(OsRng, Some(b"weft announce app-data")).expect("valid announce");

        let mut tampered = announce;
        let payload = tampered.data.as_mut_slice();
        let app_data_offset = 32 + 32 + 10 + 10 + 64;
        assert!(payload.len() > app_data_offset);
        payload[app_data_offset] ^= 0x01;

        match DestinationAnnounce::validate(&tampered) {
            Ok(_) => panic!("tampered app_data should fail signature verification"),
            Err(err) => assert!(matches!(err, RnsError::IncorrectSignature)),
        }
    }

    #[test]
    fn announce_includes_ratchet_when_enabled() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut destination =
            SingleInputDestination::new(identity, DestinationName::new("weft", "delivery"));
        destination.enable_ratchets();

        let announce = destination.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");
        assert!(info.ratchet.is_some());
    }

    #[test]
    fn announce_without_ratchet_flag_keeps_ratchet_sized_app_data() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut destination =
            SingleInputDestination::new(identity, DestinationName::new("weft", "delivery"));

        let app_data = vec![0u8; RATCHET_LENGTH];
        let announce = destination.announce(OsRng, Some(&app_data)).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");
        assert!(info.ratchet.is_none());
        assert_eq!(info.app_data, app_data.as_slice());
    }

    #[test]
    fn ratchet_decrypt_round_trip() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut destination =
            SingleInputDestination::new(identity, DestinationName::new("weft", "delivery"));
        destination.enable_ratchets();

        let announce = destination.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");
        let ratchet_pub = x25519_dalek::PublicKey::from(info.ratchet.expect("ratchet"));

        let ciphertext = crate::ratchets::encrypt_for_public_key(
            &ratchet_pub,
            destination.desc.identity.address_hash.as_slice(),
            b"ratcheted payload",
            OsRng,
        )
        .expect("ciphertext");

        let (plain, used_ratchet) =
            destination.decrypt_with_ratchets(&ciphertext).expect("plaintext");
        assert!(used_ratchet);
        assert_eq!(plain, b"ratcheted payload");
    }
}
