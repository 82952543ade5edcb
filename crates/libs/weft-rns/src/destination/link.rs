use std::cmp::min;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, SigningKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use rand_core::OsRng;
use sha2::Digest;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::buffer::OutputBuffer;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::identity::{DecryptIdentity, DerivedKey, EncryptIdentity, Identity, PrivateIdentity};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType, PACKET_MDU,
};

use super::DestinationDesc;

/// Keep-alive cadence and staleness windows on ACTIVE links.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(360);
pub const STALE_TIME: Duration = Duration::from_secs(720);
pub const STALE_GRACE: Duration = Duration::from_secs(2);

/// Previous ratchet key stays accepted this long after a rotation, so
/// packets in flight across the switch still decrypt.
pub const RATCHET_WINDOW: Duration = Duration::from_secs(300);

const RTT_ALPHA: f64 = 0.25;
const MIN_TIMEOUT: Duration = Duration::from_millis(5000);

pub const KEEP_ALIVE_REQUEST: u8 = 0xFF;
pub const KEEP_ALIVE_RESPONSE: u8 = 0xFE;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        *self == LinkStatus::Pending || *self == LinkStatus::Handshake
    }
}

pub type LinkId = AddressHash;

/// Decrypted payload surfaced from a link, tagged with the wire context
/// so resources and channels can be routed above.
#[derive(Clone)]
pub struct LinkPayload {
    buffer: [u8; PACKET_MDU],
    len: usize,
    context: PacketContext,
}

impl LinkPayload {
    pub fn new_from_slice_with_context(data: &[u8], context: PacketContext) -> Self {
        let mut buffer = [0u8; PACKET_MDU];
        let len = min(data.len(), buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Self { buffer, len, context }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn context(&self) -> PacketContext {
        self.context
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

impl From<&Packet> for LinkId {
    fn from(packet: &Packet) -> Self {
        // The link id hashes the request without trailing signalling
        // bytes, so both ends agree on it before the proof arrives.
        let data = packet.data.as_slice();
        let hashable_len = min(data.len(), PUBLIC_KEY_LENGTH * 2);
        let hashable_data = &data[..hashable_len];

        AddressHash::new_from_hash(&Hash::new(
            Hash::generator()
                .chain_update([packet.header.to_meta() & 0b0000_1111])
                .chain_update(packet.destination.as_slice())
                .chain_update([packet.context as u8])
                .chain_update(hashable_data)
                .finalize()
                .into(),
        ))
    }
}

#[allow(clippy::large_enum_variant)]
pub enum LinkHandleResult {
    None,
    Activated,
    Proof(Packet),
    KeepAlive,
    Closed,
}

#[derive(Clone)]
pub enum LinkEvent {
    Activated,
    Data(Box<LinkPayload>),
    Closed,
}

#[derive(Clone)]
pub struct LinkEventData {
    pub id: LinkId,
    pub address_hash: AddressHash,
    pub event: LinkEvent,
}

pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    priv_identity: PrivateIdentity,
    peer_identity: Identity,
    derived_key: DerivedKey,
    prev_derived_key: Option<(DerivedKey, Instant)>,
    status: LinkStatus,
    request_time: Instant,
    last_inbound: Instant,
    keep_alive_sent: Option<Instant>,
    rtt: Option<Duration>,
    event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
}

impl Link {
    /// Initiator-side link; `request()` produces the LINKREQUEST.
    pub fn new(
        destination: DestinationDesc,
        event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
    ) -> Self {
        Self {
            id: AddressHash::new_empty(),
            destination,
            priv_identity: PrivateIdentity::new_from_rand(OsRng),
            peer_identity: Identity::default(),
            derived_key: DerivedKey::new_empty(),
            prev_derived_key: None,
            status: LinkStatus::Pending,
            request_time: Instant::now(),
            last_inbound: Instant::now(),
            keep_alive_sent: None,
            rtt: None,
            event_tx,
        }
    }

    /// Responder-side link built from an inbound LINKREQUEST.
    pub fn new_from_request(
        packet: &Packet,
        signing_key: SigningKey,
        destination: DestinationDesc,
        event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
    ) -> Result<Self, RnsError> {
        if packet.data.len() < PUBLIC_KEY_LENGTH * 2 {
            return Err(RnsError::PacketError);
        }

        let data = packet.data.as_slice();
        let peer_identity = Identity::new_from_slices(
            &data[..PUBLIC_KEY_LENGTH],
            &data[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH * 2],
        );

        let link_id = LinkId::from(packet);
        log::debug!("link: create from request {}", link_id);

        let mut link = Self {
            id: link_id,
            destination,
            priv_identity: PrivateIdentity::new(StaticSecret::random_from_rng(OsRng), signing_key),
            peer_identity,
            derived_key: DerivedKey::new_empty(),
            prev_derived_key: None,
            status: LinkStatus::Pending,
            request_time: Instant::now(),
            last_inbound: Instant::now(),
            keep_alive_sent: None,
            rtt: None,
            event_tx,
        };

        link.handshake(peer_identity);

        Ok(link)
    }

    pub fn request(&mut self) -> Packet {
        let mut packet_data = PacketDataBuffer::new();

        packet_data.safe_write(self.priv_identity.as_identity().public_key.as_bytes());
        packet_data.safe_write(self.priv_identity.as_identity().verifying_key.as_bytes());

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            destination: self.destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.status = LinkStatus::Pending;
        self.id = LinkId::from(&packet);
        self.request_time = Instant::now();

        packet
    }

    /// Responder proof over the link id and its own public keys.
    pub fn prove(&mut self) -> Packet {
        log::debug!("link({}): prove", self.id);

        if self.status != LinkStatus::Active {
            self.status = LinkStatus::Active;
            self.post_event(LinkEvent::Activated);
        }

        let mut packet_data = PacketDataBuffer::new();

        packet_data.safe_write(self.id.as_slice());
        packet_data.safe_write(self.priv_identity.as_identity().public_key.as_bytes());
        packet_data.safe_write(self.priv_identity.as_identity().verifying_key.as_bytes());

        let signature = self.priv_identity.sign(packet_data.as_slice());

        packet_data.reset();
        packet_data.safe_write(&signature.to_bytes()[..]);
        packet_data.safe_write(self.priv_identity.as_identity().public_key.as_bytes());

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: packet_data,
        }
    }

    /// Explicit proof for a received packet: hash plus signature.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.hash().to_bytes();
        let signature = self.priv_identity.sign(&hash).to_bytes();

        let mut packet_data = PacketDataBuffer::new();
        packet_data.safe_write(&hash);
        packet_data.safe_write(&signature);

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkProof,
            data: packet_data,
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        match packet.context {
            PacketContext::None
            | PacketContext::Request
            | PacketContext::Response
            | PacketContext::Channel
            | PacketContext::Resource
            | PacketContext::ResourceAdvertisement
            | PacketContext::ResourceRequest
            | PacketContext::ResourceHashUpdate
            | PacketContext::ResourceProof
            | PacketContext::ResourceInitiatorCancel
            | PacketContext::ResourceReceiverCancel => {
                if packet.context == PacketContext::Resource {
                    // Resource parts stay ciphertext until reassembly.
                    self.mark_inbound();
                    self.post_event(LinkEvent::Data(Box::new(
                        LinkPayload::new_from_slice_with_context(
                            packet.data.as_slice(),
                            packet.context,
                        ),
                    )));
                    return LinkHandleResult::None;
                }

                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plain_text) = self.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    log::trace!("link({}): data {}B", self.id, plain_text.len());
                    self.mark_inbound();
                    let payload =
                        LinkPayload::new_from_slice_with_context(plain_text, packet.context);
                    self.post_event(LinkEvent::Data(Box::new(payload)));
                    if packet.context == PacketContext::None
                        || packet.context == PacketContext::Request
                        || packet.context == PacketContext::Channel
                    {
                        return LinkHandleResult::Proof(self.prove_packet(packet));
                    }
                } else {
                    log::error!("link({}): can't decrypt packet", self.id);
                }
            }
            PacketContext::KeepAlive => {
                if !packet.data.is_empty() && packet.data.as_slice()[0] == KEEP_ALIVE_REQUEST {
                    self.mark_inbound();
                    log::trace!("link({}): keep-alive request", self.id);
                    return LinkHandleResult::KeepAlive;
                }
                if !packet.data.is_empty() && packet.data.as_slice()[0] == KEEP_ALIVE_RESPONSE {
                    log::trace!("link({}): keep-alive response", self.id);
                    self.mark_inbound();
                    if let Some(sent) = self.keep_alive_sent.take() {
                        self.update_rtt(sent.elapsed());
                    }
                }
            }
            PacketContext::LinkRtt => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plain_text) = self.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    let mut cursor = plain_text;
                    if let Ok(rtt) = rmp::decode::read_f32(&mut cursor) {
                        if rtt.is_finite() && rtt >= 0.0 {
                            self.update_rtt(Duration::from_secs_f32(rtt));
                            self.mark_inbound();
                        }
                    }
                }
            }
            PacketContext::LinkRatchet => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plain_text) = self.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    if plain_text.len() >= PUBLIC_KEY_LENGTH {
                        let mut key_bytes = [0u8; PUBLIC_KEY_LENGTH];
                        key_bytes.copy_from_slice(&plain_text[..PUBLIC_KEY_LENGTH]);
                        self.install_peer_ratchet(PublicKey::from(key_bytes));
                        self.mark_inbound();
                    }
                }
            }
            PacketContext::LinkClose => {
                let mut buffer = [0u8; PACKET_MDU];
                let matches_id = match self.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    Ok(plain_text) => plain_text.starts_with(self.id.as_slice()),
                    Err(_) => false,
                };
                if matches_id {
                    self.close();
                    return LinkHandleResult::Closed;
                }
            }
            _ => {}
        }

        LinkHandleResult::None
    }

    pub fn handle_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if packet.destination != self.id {
            return LinkHandleResult::None;
        }

        match packet.header.packet_type {
            PacketType::Data => return self.handle_data_packet(packet),
            PacketType::Proof => {
                if self.status == LinkStatus::Pending
                    && packet.context == PacketContext::LinkRequestProof
                {
                    if let Ok(identity) = validate_proof_packet(&self.destination, &self.id, packet)
                    {
                        self.handshake(identity);

                        self.status = LinkStatus::Active;
                        self.update_rtt(self.request_time.elapsed());
                        self.mark_inbound();

                        log::debug!("link({}): activated", self.id);
                        self.post_event(LinkEvent::Activated);

                        return LinkHandleResult::Activated;
                    } else {
                        log::warn!("link({}): proof is not valid", self.id);
                    }
                }
            }
            _ => {}
        }

        LinkHandleResult::None
    }

    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, RnsError> {
        self.data_packet_with_context(data, PacketContext::None)
    }

    pub fn data_packet_with_context(
        &self,
        data: &[u8],
        context: PacketContext,
    ) -> Result<Packet, RnsError> {
        if self.status != LinkStatus::Active && self.status != LinkStatus::Stale {
            return Err(RnsError::NotReady);
        }

        if data.len() > self.mdu() {
            return Err(RnsError::Overflow);
        }

        let mut packet_data = PacketDataBuffer::new();

        let cipher_text_len = {
            let cipher_text = self.encrypt(data, packet_data.acquire_buf_max())?;
            cipher_text.len()
        };
        packet_data.resize(cipher_text_len);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        })
    }

    pub fn keep_alive_packet(&mut self, data: u8) -> Packet {
        log::trace!("link({}): create keep alive {:02x}", self.id, data);

        if data == KEEP_ALIVE_REQUEST {
            self.keep_alive_sent = Some(Instant::now());
        }

        let mut packet_data = PacketDataBuffer::new();
        packet_data.safe_write(&[data]);

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::KeepAlive,
            data: packet_data,
        }
    }

    /// Best-effort teardown notice carrying the link id under the
    /// current key. The link is closed locally regardless of delivery.
    pub fn teardown_packet(&mut self) -> Option<Packet> {
        let id = self.id;
        let packet =
            self.data_packet_with_context(id.as_slice(), PacketContext::LinkClose).ok();
        self.close();
        packet
    }

    /// Shares this side's round-trip measurement with the peer, so both
    /// ends time out against the same estimate.
    pub fn rtt_packet(&self) -> Result<Packet, RnsError> {
        let rtt = self.rtt.unwrap_or(MIN_TIMEOUT).as_secs_f32();
        let mut encoded = Vec::with_capacity(5);
        rmp::encode::write_f32(&mut encoded, rtt).map_err(|_| RnsError::PacketError)?;
        self.data_packet_with_context(&encoded, PacketContext::LinkRtt)
    }

    /// Rotates this side's link key: fresh X25519 secret, new derived
    /// key against the peer, previous key retained for the acceptance
    /// window. Returns the rotation packet, built under the old key.
    pub fn rotate_ratchet(&mut self) -> Result<Packet, RnsError> {
        if self.status != LinkStatus::Active {
            return Err(RnsError::NotReady);
        }

        let new_secret = StaticSecret::random_from_rng(OsRng);
        let new_public = PublicKey::from(&new_secret);

        let packet =
            self.data_packet_with_context(new_public.as_bytes(), PacketContext::LinkRatchet)?;

        let new_identity =
            PrivateIdentity::new(new_secret, self.priv_identity.sign_key().clone());
        let new_key =
            new_identity.derive_key(&self.peer_identity.public_key, Some(self.id.as_slice()));

        self.prev_derived_key =
            Some((std::mem::replace(&mut self.derived_key, new_key), Instant::now()));
        self.priv_identity = new_identity;

        log::debug!("link({}): ratchet rotated", self.id);

        Ok(packet)
    }

    fn install_peer_ratchet(&mut self, new_peer_public: PublicKey) {
        let new_key = self.priv_identity.derive_key(&new_peer_public, Some(self.id.as_slice()));
        self.prev_derived_key =
            Some((std::mem::replace(&mut self.derived_key, new_key), Instant::now()));
        self.peer_identity =
            Identity::new(new_peer_public, self.peer_identity.verifying_key);
        log::debug!("link({}): peer ratchet installed", self.id);
    }

    pub fn encrypt<'a>(&self, text: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        self.priv_identity.encrypt(OsRng, text, &self.derived_key, out_buf)
    }

    pub fn decrypt<'a>(&self, text: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        let primary_result = match self.priv_identity.decrypt(OsRng, text, &self.derived_key, out_buf) {
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        match primary_result {
            Ok(()) => self.priv_identity.decrypt(OsRng, text, &self.derived_key, out_buf),
            Err(err) => {
                if let Some((prev_key, rotated_at)) = &self.prev_derived_key {
                    if rotated_at.elapsed() <= RATCHET_WINDOW {
                        return self.priv_identity.decrypt(OsRng, text, prev_key, out_buf);
                    }
                }
                Err(err)
            }
        }
    }

    /// Checks staleness against the keep-alive schedule. `Stale` asks
    /// the caller to fire a keep-alive; `Closed` means the peer is gone.
    pub fn check_keep_alive(&mut self) -> LinkHandleResult {
        if self.status != LinkStatus::Active && self.status != LinkStatus::Stale {
            return LinkHandleResult::None;
        }

        let silence = self.last_inbound.elapsed();

        if silence > STALE_TIME + self.timeout() + STALE_GRACE {
            self.close();
            return LinkHandleResult::Closed;
        }

        if silence > STALE_TIME && self.status == LinkStatus::Active {
            self.status = LinkStatus::Stale;
            log::debug!("link({}): stale", self.id);
        }

        if silence > KEEPALIVE_INTERVAL {
            return LinkHandleResult::KeepAlive;
        }

        LinkHandleResult::None
    }

    pub fn update_rtt(&mut self, sample: Duration) {
        let smoothed = match self.rtt {
            Some(current) => Duration::from_secs_f64(
                RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * current.as_secs_f64(),
            ),
            None => sample,
        };
        self.rtt = Some(smoothed);
        log::trace!("link({}): rtt {:?}", self.id, smoothed);
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Proof deadline derived from the smoothed RTT.
    pub fn timeout(&self) -> Duration {
        match self.rtt {
            Some(rtt) => std::cmp::max(rtt * 3, MIN_TIMEOUT),
            None => MIN_TIMEOUT,
        }
    }

    pub fn mdu(&self) -> usize {
        crate::packet::ENCRYPTED_MDU
    }

    fn handshake(&mut self, peer_identity: Identity) {
        log::debug!("link({}): handshake", self.id);

        self.status = LinkStatus::Handshake;
        self.peer_identity = peer_identity;
        self.derived_key =
            self.priv_identity.derive_key(&self.peer_identity.public_key, Some(self.id.as_slice()));
    }

    pub(crate) fn mark_inbound(&mut self) {
        self.last_inbound = Instant::now();
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
            log::debug!("link({}): recovered from stale", self.id);
        }
    }

    fn post_event(&self, event: LinkEvent) {
        let _ = self.event_tx.send(LinkEventData {
            id: self.id,
            address_hash: self.destination.address_hash,
            event,
        });
    }

    pub fn close(&mut self) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.post_event(LinkEvent::Closed);
        log::debug!("link({}): closed", self.id);
    }

    pub fn restart(&mut self) {
        log::warn!("link({}): restart after {}s", self.id, self.request_time.elapsed().as_secs());
        self.status = LinkStatus::Pending;
    }

    pub fn elapsed(&self) -> Duration {
        self.request_time.elapsed()
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> &Identity {
        &self.peer_identity
    }
}

fn validate_proof_packet(
    destination: &DestinationDesc,
    id: &LinkId,
    packet: &Packet,
) -> Result<Identity, RnsError> {
    const MIN_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
    const SIGN_DATA_LEN: usize = ADDRESS_HASH_SIZE + PUBLIC_KEY_LENGTH * 2;

    if packet.data.len() < MIN_PROOF_LEN {
        return Err(RnsError::PacketError);
    }

    let verifying_key = destination.identity.verifying_key.as_bytes();

    let mut proof_data = [0u8; SIGN_DATA_LEN];
    let sign_data_len = {
        let mut output = OutputBuffer::new(&mut proof_data[..]);
        output.write(id.as_slice())?;
        output.write(
            &packet.data.as_slice()[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH],
        )?;
        output.write(verifying_key)?;
        output.offset()
    };

    let identity = Identity::new_from_slices(
        &proof_data[ADDRESS_HASH_SIZE..ADDRESS_HASH_SIZE + PUBLIC_KEY_LENGTH],
        verifying_key,
    );

    let signature = Signature::from_slice(&packet.data.as_slice()[..SIGNATURE_LENGTH])
        .map_err(|_| RnsError::CryptoError)?;

    identity
        .verify(&proof_data[..sign_data_len], &signature)
        .map_err(|_| RnsError::IncorrectSignature)?;

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{Link, LinkHandleResult, LinkStatus};
    use crate::destination::{DestinationDesc, DestinationName};
    use crate::identity::PrivateIdentity;

    fn desc_for(identity: &PrivateIdentity) -> DestinationDesc {
        let name = DestinationName::new("weft", "link.test");
        let public = *identity.as_identity();
        DestinationDesc {
            identity: public,
            address_hash: public.address_hash,
            name,
        }
    }

    fn establish() -> (Link, Link) {
        let responder_identity = PrivateIdentity::new_from_rand(OsRng);
        let desc = desc_for(&responder_identity);

        let (tx_out, _rx_out) = tokio::sync::broadcast::channel(16);
        let (tx_in, _rx_in) = tokio::sync::broadcast::channel(16);

        let mut initiator = Link::new(desc, tx_out);
        let request = initiator.request();

        let mut responder = Link::new_from_request(
            &request,
            responder_identity.sign_key().clone(),
            desc,
            tx_in,
        )
        .expect("responder link");

        let proof = responder.prove();
        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));

        (initiator, responder)
    }

    #[test]
    fn handshake_activates_both_sides() {
        let (initiator, responder) = establish();
        assert_eq!(initiator.status(), LinkStatus::Active);
        assert_eq!(responder.status(), LinkStatus::Active);
        assert_eq!(initiator.id(), responder.id());
        assert!(initiator.rtt().is_some());
    }

    #[test]
    fn data_round_trip_after_handshake() {
        let (initiator, mut responder) = establish();

        let packet = initiator.data_packet(b"across the link").expect("data packet");
        match responder.handle_packet(&packet) {
            LinkHandleResult::Proof(_) => {}
            _ => panic!("data packet should be proved"),
        }
    }

    #[test]
    fn data_packet_requires_active_link() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let link = Link::new(desc_for(&identity), tx);

        assert!(matches!(link.data_packet(b"nope"), Err(crate::error::RnsError::NotReady)));
    }

    #[test]
    fn ratchet_rotation_keeps_old_key_usable() {
        let (mut initiator, mut responder) = establish();

        // Build a packet under the old key, rotate, then deliver both.
        let stale_packet = initiator.data_packet(b"pre-rotation").expect("data packet");

        let rotation = initiator.rotate_ratchet().expect("rotation packet");
        responder.handle_packet(&rotation);

        let fresh_packet = initiator.data_packet(b"post-rotation").expect("data packet");

        assert!(matches!(responder.handle_packet(&stale_packet), LinkHandleResult::Proof(_)));
        assert!(matches!(responder.handle_packet(&fresh_packet), LinkHandleResult::Proof(_)));
    }

    #[test]
    fn teardown_closes_both_sides() {
        let (mut initiator, mut responder) = establish();

        let teardown = initiator.teardown_packet().expect("teardown packet");
        assert_eq!(initiator.status(), LinkStatus::Closed);

        assert!(matches!(responder.handle_packet(&teardown), LinkHandleResult::Closed));
        assert_eq!(responder.status(), LinkStatus::Closed);
    }

    #[test]
    fn rtt_ewma_smooths_samples() {
        let (mut initiator, _responder) = establish();
        let initial = initiator.rtt().expect("rtt after handshake");

        initiator.update_rtt(initial + std::time::Duration::from_millis(400));
        let updated = initiator.rtt().expect("updated rtt");
        assert!(updated > initial);
        assert!(updated < initial + std::time::Duration::from_millis(400));
    }
}
