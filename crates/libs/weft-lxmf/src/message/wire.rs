use base64::Engine;
use ed25519_dalek::Signature;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use rns::crypt::token::TokenKey;
use rns::identity::{DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::constants::{DESTINATION_LENGTH, LXMF_MAX_SIZE, SIGNATURE_LENGTH};
use crate::error::LxmfError;
use crate::message::Payload;

pub const LXM_URI_PREFIX: &str = "lxm://";

pub type MessageId = [u8; 32];

/// The packed, signed form of a message: destination hash, source
/// hash, signature, then the msgpack payload.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub destination: [u8; DESTINATION_LENGTH],
    pub source: [u8; DESTINATION_LENGTH],
    pub signature: Option<[u8; SIGNATURE_LENGTH]>,
    pub payload: Payload,
}

impl WireMessage {
    pub fn new(
        destination: [u8; DESTINATION_LENGTH],
        source: [u8; DESTINATION_LENGTH],
        payload: Payload,
    ) -> Self {
        Self { destination, source, signature: None, payload }
    }

    /// Message id: hash over destination, source, and the unstamped
    /// payload. Stable across stamp attachment and retransmissions.
    pub fn message_id(&self) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(self.destination);
        hasher.update(self.source);
        hasher.update(self.payload.to_msgpack_without_stamp().unwrap_or_default());
        hasher.finalize().into()
    }

    fn signed_part(&self) -> Result<Vec<u8>, LxmfError> {
        let payload = self.payload.to_msgpack_without_stamp()?;
        let mut data = Vec::with_capacity(DESTINATION_LENGTH * 2 + payload.len() + 32);
        data.extend_from_slice(&self.destination);
        data.extend_from_slice(&self.source);
        data.extend_from_slice(&payload);
        data.extend_from_slice(&self.message_id());
        Ok(data)
    }

    pub fn sign(&mut self, signer: &PrivateIdentity) -> Result<(), LxmfError> {
        let data = self.signed_part()?;
        self.signature = Some(signer.sign(&data).to_bytes());
        Ok(())
    }

    pub fn verify(&self, identity: &Identity) -> Result<bool, LxmfError> {
        let Some(sig_bytes) = self.signature else {
            return Ok(false);
        };
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|err| LxmfError::Decode(err.to_string()))?;
        let data = self.signed_part()?;
        Ok(identity.verify(&data, &signature).is_ok())
    }

    pub fn pack(&self) -> Result<Vec<u8>, LxmfError> {
        let signature =
            self.signature.ok_or_else(|| LxmfError::Encode("missing signature".into()))?;

        let payload = self.payload.to_msgpack()?;
        let mut out =
            Vec::with_capacity(DESTINATION_LENGTH * 2 + SIGNATURE_LENGTH + payload.len());
        out.extend_from_slice(&self.destination);
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&signature);
        out.extend_from_slice(&payload);

        if out.len() > LXMF_MAX_SIZE {
            return Err(LxmfError::TooLarge);
        }

        Ok(out)
    }

    /// The wire form for links and opportunistic packets, where the
    /// destination hash is implied by the addressing layer.
    pub fn pack_without_destination(&self) -> Result<Vec<u8>, LxmfError> {
        Ok(self.pack()?[DESTINATION_LENGTH..].to_vec())
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        let min_len = DESTINATION_LENGTH * 2 + SIGNATURE_LENGTH;
        if bytes.len() < min_len {
            return Err(LxmfError::Decode("wire message too short".into()));
        }
        if bytes.len() > LXMF_MAX_SIZE {
            return Err(LxmfError::TooLarge);
        }

        let mut destination = [0u8; DESTINATION_LENGTH];
        let mut source = [0u8; DESTINATION_LENGTH];
        let mut signature = [0u8; SIGNATURE_LENGTH];
        destination.copy_from_slice(&bytes[..DESTINATION_LENGTH]);
        source.copy_from_slice(&bytes[DESTINATION_LENGTH..DESTINATION_LENGTH * 2]);
        signature.copy_from_slice(&bytes[DESTINATION_LENGTH * 2..min_len]);

        let payload = Payload::from_msgpack(&bytes[min_len..])?;

        Ok(Self { destination, source, signature: Some(signature), payload })
    }

    /// Rebuilds a message whose destination hash was stripped for link
    /// or opportunistic delivery.
    pub fn unpack_with_destination(
        destination: [u8; DESTINATION_LENGTH],
        bytes: &[u8],
    ) -> Result<Self, LxmfError> {
        let mut full = Vec::with_capacity(DESTINATION_LENGTH + bytes.len());
        full.extend_from_slice(&destination);
        full.extend_from_slice(bytes);
        Self::unpack(&full)
    }

    /// Propagation envelope: the destination-prefixed ciphertext inside
    /// a timestamped msgpack list, as propagation nodes expect custody
    /// submissions.
    pub fn pack_propagation_with_rng<R: CryptoRngCore + Copy>(
        &self,
        destination: &Identity,
        timestamp: f64,
        rng: R,
    ) -> Result<Vec<u8>, LxmfError> {
        let lxmf_data = self.pack_paper_with_rng(destination, rng)?;

        let envelope = rmpv::Value::Array(vec![
            rmpv::Value::F64(timestamp),
            rmpv::Value::Array(vec![rmpv::Value::Binary(lxmf_data)]),
        ]);
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &envelope)
            .map_err(|err| LxmfError::Encode(err.to_string()))?;
        Ok(out)
    }

    /// Paper form: destination hash followed by the identity-encrypted
    /// remainder, suitable for QR and print transports.
    pub fn pack_paper_with_rng<R: CryptoRngCore + Copy>(
        &self,
        destination: &Identity,
        rng: R,
    ) -> Result<Vec<u8>, LxmfError> {
        let packed = self.pack()?;
        let encrypted = encrypt_for_identity(destination, &packed[DESTINATION_LENGTH..], rng)?;
        let mut out = Vec::with_capacity(DESTINATION_LENGTH + encrypted.len());
        out.extend_from_slice(&packed[..DESTINATION_LENGTH]);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    pub fn encode_lxm_uri(paper_bytes: &[u8]) -> String {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(paper_bytes);
        format!("{LXM_URI_PREFIX}{encoded}")
    }

    pub fn decode_lxm_uri(uri: &str) -> Result<Vec<u8>, LxmfError> {
        let encoded = uri
            .strip_prefix(LXM_URI_PREFIX)
            .ok_or_else(|| LxmfError::Decode("invalid lxm uri prefix".into()))?;

        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(encoded))
            .map_err(|err| LxmfError::Decode(format!("invalid lxm uri payload: {err}")))
    }
}

fn encrypt_for_identity<R: CryptoRngCore + Copy>(
    destination: &Identity,
    plaintext: &[u8],
    rng: R,
) -> Result<Vec<u8>, LxmfError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&destination.public_key);
    let derived = DerivedKey::new(&shared, Some(destination.address_hash.as_slice()));

    // Token sizing comes from the shared codec so this never drifts
    // from what the transport expects on the wire.
    let mut out = vec![0u8; PUBLIC_KEY_LENGTH + TokenKey::sealed_len(plaintext.len())];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token_len = derived
        .token_key()
        .seal(rng, plaintext, &mut out[PUBLIC_KEY_LENGTH..])
        .map_err(|err| LxmfError::Crypto(format!("{err:?}")))?;
    out.truncate(PUBLIC_KEY_LENGTH + token_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use rns::identity::PrivateIdentity;

    use super::*;

    fn sample_message() -> (WireMessage, PrivateIdentity) {
        let source = PrivateIdentity::new_from_rand(OsRng);
        let mut source_hash = [0u8; DESTINATION_LENGTH];
        source_hash.copy_from_slice(source.address_hash().as_slice());

        let payload = Payload::new(
            1_700_000_000.0,
            Vec::new(),
            b"hi".to_vec(),
            rmpv::Value::Map(vec![]),
            None,
        );
        let mut message = WireMessage::new([7u8; DESTINATION_LENGTH], source_hash, payload);
        message.sign(&source).expect("signed");
        (message, source)
    }

    #[test]
    fn pack_unpack_round_trip() {
        let (message, source) = sample_message();

        let packed = message.pack().expect("packed");
        assert_eq!(
            packed.len(),
            DESTINATION_LENGTH * 2
                + SIGNATURE_LENGTH
                + message.payload.to_msgpack().expect("payload").len()
        );

        let unpacked = WireMessage::unpack(&packed).expect("unpacked");
        assert_eq!(unpacked.destination, message.destination);
        assert_eq!(unpacked.source, message.source);
        assert_eq!(unpacked.payload, message.payload);
        assert!(unpacked.verify(source.as_identity()).expect("verified"));
    }

    #[test]
    fn tampered_content_fails_verification() {
        let (message, source) = sample_message();
        let mut packed = message.pack().expect("packed");
        let last = packed.len() - 1;
        packed[last] ^= 0x01;

        let unpacked = WireMessage::unpack(&packed).expect("unpacked");
        assert!(!unpacked.verify(source.as_identity()).expect("verification ran"));
    }

    #[test]
    fn message_id_is_stable_across_stamping() {
        let (mut message, _) = sample_message();
        let before = message.message_id();
        message.payload.stamp = Some(vec![1u8; 32]);
        assert_eq!(message.message_id(), before);
    }

    #[test]
    fn stripped_form_rebuilds_with_destination() {
        let (message, source) = sample_message();
        let stripped = message.pack_without_destination().expect("stripped");

        let rebuilt = WireMessage::unpack_with_destination(message.destination, &stripped)
            .expect("rebuilt");
        assert_eq!(rebuilt.message_id(), message.message_id());
        assert!(rebuilt.verify(source.as_identity()).expect("verified"));
    }

    #[test]
    fn lxm_uri_round_trip() {
        let (message, _) = sample_message();
        let destination_identity = PrivateIdentity::new_from_rand(OsRng);
        let paper = message
            .pack_paper_with_rng(destination_identity.as_identity(), OsRng)
            .expect("paper");

        let uri = WireMessage::encode_lxm_uri(&paper);
        assert!(uri.starts_with(LXM_URI_PREFIX));
        assert_eq!(WireMessage::decode_lxm_uri(&uri).expect("decoded"), paper);
    }
}
