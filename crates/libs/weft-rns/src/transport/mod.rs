pub mod link_table;
pub mod packet_cache;
pub mod path_requests;
pub mod path_table;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelOutlet};
use crate::destination::link::{
    Link, LinkEventData, LinkHandleResult, LinkStatus, KEEP_ALIVE_REQUEST, KEEP_ALIVE_RESPONSE,
};
use crate::destination::{
    DestinationAnnounce, DestinationDesc, SingleInputDestination, SingleOutputDestination,
};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};
use crate::identity::PrivateIdentity;
use crate::iface::{
    InterfaceManager, InterfaceRxReceiver, RxMessage, TxMessage, TxMessageType,
};
use crate::packet::{
    DestinationType, Packet, PacketContext, PacketDataBuffer, PacketType, MAX_HOPS, PACKET_MDU,
};
use crate::ratchets::{encrypt_for_public_key, now_secs, RatchetStore};
use crate::resource::{
    build_resource_request_packet, ResourceEvent, ResourceManager, ResourceStrategy,
};

use link_table::LinkTable;
use packet_cache::PacketCache;
use path_requests::{PathRequests, TagBytes};
use path_table::PathTable;
use x25519_dalek::PublicKey;

pub const DEFAULT_JOB_INTERVAL: Duration = Duration::from_millis(250);

// Sub-cadences of the job loop, in ticks of the base interval.
const TICKS_LINKS_CHECK: u64 = 4;
const TICKS_CHANNEL_SWEEP: u64 = 4;
const TICKS_RESOURCE_RETRY: u64 = 8;
const TICKS_CACHE_RELEASE: u64 = 240;

const INTERVAL_KEEP_PACKET_CACHED: Duration = Duration::from_secs(30);
const INTERVAL_OUTPUT_LINK_REPEAT: Duration = Duration::from_secs(6);
const TRACKED_PACKET_EXPIRY: Duration = Duration::from_secs(30);

/// Host-supplied slowdown for the tick loop: 1.0 nominal, larger when
/// the host wants conservation. Clamped so the loop never speeds up.
#[derive(Clone)]
pub struct ThrottleHandle(Arc<std::sync::Mutex<f64>>);

impl ThrottleHandle {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::Mutex::new(1.0)))
    }

    pub fn set(&self, multiplier: f64) {
        if let Ok(mut value) = self.0.lock() {
            *value = multiplier.max(1.0);
        }
    }

    pub fn get(&self) -> f64 {
        self.0.lock().map(|value| *value).unwrap_or(1.0)
    }
}

impl Default for ThrottleHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TransportConfig {
    pub name: String,
    pub identity: PrivateIdentity,
    /// Re-broadcast inbound packets on the other interfaces.
    pub broadcast: bool,
    /// Act as a forwarding transport node.
    pub retransmit: bool,
    pub job_interval: Duration,
    pub throttle: ThrottleHandle,
    pub path_expiry: Duration,
    pub link_proof_timeout: Duration,
    pub link_idle_timeout: Duration,
    pub resource_retry_interval: Duration,
    pub resource_retry_limit: u8,
    pub path_request_min_interval: Duration,
    pub announce_min_interval: Duration,
    pub ratchet_store_path: Option<PathBuf>,
}

impl TransportConfig {
    pub fn new(name: &str, identity: PrivateIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
            broadcast: false,
            retransmit: false,
            job_interval: DEFAULT_JOB_INTERVAL,
            throttle: ThrottleHandle::new(),
            path_expiry: Duration::from_secs(3600),
            link_proof_timeout: Duration::from_secs(10),
            link_idle_timeout: Duration::from_secs(900),
            resource_retry_interval: Duration::from_secs(2),
            resource_retry_limit: crate::resource::MAX_RETRIES,
            path_request_min_interval: Duration::from_secs(5),
            announce_min_interval: Duration::from_secs(1),
            ratchet_store_path: None,
        }
    }
}

#[derive(Clone)]
pub struct AnnounceEvent {
    pub destination: Arc<Mutex<SingleOutputDestination>>,
    pub destination_hash: AddressHash,
    pub app_data: PacketDataBuffer,
    pub ratchet: Option<[u8; 32]>,
    pub hops: u8,
    pub iface: AddressHash,
}

#[derive(Clone)]
pub struct ReceivedData {
    pub destination: AddressHash,
    pub data: Vec<u8>,
    pub context: Option<PacketContext>,
    pub ratchet_used: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryReceipt {
    pub packet_hash: Hash,
    pub link_id: Option<AddressHash>,
    pub rtt: Duration,
}

pub trait ReceiptHandler: Send + Sync {
    fn on_receipt(&self, receipt: &DeliveryReceipt);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPacketOutcome {
    SentDirect,
    SentBroadcast,
    DroppedNoRoute,
    DroppedMissingDestinationIdentity,
    DroppedCiphertextTooLarge,
    DroppedEncryptFailed,
}

struct TrackedPacket {
    link_id: Option<AddressHash>,
    sent_at: Instant,
}

type DeliveryMap = Arc<std::sync::Mutex<HashMap<Hash, u16>>>;

/// Channel transmission seam bound to one link. Outbound envelopes are
/// encrypted by the link and queued on the transport egress; the
/// envelope sequence is remembered by packet hash so delivery proofs
/// can slide the channel window.
pub struct LinkOutlet {
    link: Arc<Mutex<Link>>,
    egress: mpsc::UnboundedSender<Packet>,
    delivery_map: DeliveryMap,
}

impl LinkOutlet {
    fn dispatch(&mut self, raw: &[u8]) -> Result<(), RnsError> {
        let link = self.link.try_lock().map_err(|_| RnsError::ConnectionError)?;
        let packet = link.data_packet_with_context(raw, PacketContext::Channel)?;
        drop(link);

        if raw.len() >= 4 {
            let sequence = u16::from_be_bytes([raw[2], raw[3]]);
            if let Ok(mut map) = self.delivery_map.lock() {
                map.insert(packet.hash(), sequence);
            }
        }

        self.egress.send(packet).map_err(|_| RnsError::ConnectionError)
    }
}

impl ChannelOutlet for LinkOutlet {
    fn send(&mut self, raw: &[u8]) -> Result<(), RnsError> {
        self.dispatch(raw)
    }

    fn resend(&mut self, raw: &[u8]) -> Result<(), RnsError> {
        self.dispatch(raw)
    }

    fn mdu(&self) -> usize {
        self.link.try_lock().map(|link| link.mdu()).unwrap_or(crate::packet::ENCRYPTED_MDU)
    }

    fn rtt(&self) -> Duration {
        self.link
            .try_lock()
            .ok()
            .and_then(|link| link.rtt())
            .unwrap_or(Duration::from_millis(5000))
    }

    fn is_usable(&self) -> bool {
        self.link
            .try_lock()
            .map(|link| link.status() == LinkStatus::Active)
            .unwrap_or(false)
    }
}

struct ChannelBinding {
    channel: Arc<std::sync::Mutex<Channel<LinkOutlet>>>,
    delivery_map: DeliveryMap,
}

struct TransportHandler {
    config: TransportConfig,
    iface_manager: Arc<Mutex<InterfaceManager>>,
    path_table: PathTable,
    link_table: LinkTable,
    packet_cache: PacketCache,
    path_requests: PathRequests,
    single_in_destinations: HashMap<AddressHash, Arc<Mutex<SingleInputDestination>>>,
    single_out_destinations: HashMap<AddressHash, Arc<Mutex<SingleOutputDestination>>>,
    in_links: HashMap<AddressHash, Arc<Mutex<Link>>>,
    out_links: HashMap<AddressHash, Arc<Mutex<Link>>>,
    channels: HashMap<AddressHash, ChannelBinding>,
    ratchet_store: Option<RatchetStore>,
    resource_manager: ResourceManager,
    tracked_packets: HashMap<Hash, TrackedPacket>,
    receipt_handler: Option<Arc<dyn ReceiptHandler>>,
    announce_limits: HashMap<AddressHash, Instant>,
    announce_tx: broadcast::Sender<AnnounceEvent>,
    link_event_tx: broadcast::Sender<LinkEventData>,
    received_data_tx: broadcast::Sender<ReceivedData>,
    resource_events_tx: broadcast::Sender<ResourceEvent>,
}

impl TransportHandler {
    async fn send(&self, message: TxMessage) {
        self.iface_manager.lock().await.send(message).await;
    }

    async fn send_packet(&mut self, packet: Packet) -> SendPacketOutcome {
        self.packet_cache.update(&packet);

        // Known paths go out directly; everything else floods the
        // attached interfaces, which is how pathless reception works on
        // broadcast media.
        let (packet, maybe_iface) = self.path_table.handle_packet(&packet);
        if let Some(iface) = maybe_iface {
            self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet }).await;
            SendPacketOutcome::SentDirect
        } else {
            self.send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet }).await;
            SendPacketOutcome::SentBroadcast
        }
    }

    async fn send_packet_tracked(&mut self, packet: Packet, link_id: Option<AddressHash>) -> Hash {
        let hash = packet.hash();
        self.tracked_packets.insert(hash, TrackedPacket { link_id, sent_at: Instant::now() });
        self.send_packet(packet).await;
        hash
    }

    /// Opportunistic single-packet send: encrypt for the destination
    /// identity (or its freshest announced ratchet) and route.
    async fn send_opportunistic(
        &mut self,
        destination: &AddressHash,
        payload: &[u8],
        context: PacketContext,
    ) -> SendPacketOutcome {
        let Some(out_destination) = self.single_out_destinations.get(destination).cloned() else {
            log::warn!(
                "tp({}): missing destination identity for {}",
                self.config.name,
                destination
            );
            return SendPacketOutcome::DroppedMissingDestinationIdentity;
        };

        let identity = out_destination.lock().await.identity;
        let salt = identity.address_hash;
        let ratchet = self.ratchet_store.as_mut().and_then(|store| store.get(destination));
        let public_key = ratchet.map(PublicKey::from).unwrap_or(identity.public_key);

        let ciphertext =
            match encrypt_for_public_key(&public_key, salt.as_slice(), payload, OsRng) {
                Ok(ciphertext) => ciphertext,
                Err(err) => {
                    log::warn!(
                        "tp({}): encrypt failed for {}: {:?}",
                        self.config.name,
                        destination,
                        err
                    );
                    return SendPacketOutcome::DroppedEncryptFailed;
                }
            };

        let mut data = PacketDataBuffer::new();
        if data.write(&ciphertext).is_err() {
            log::warn!(
                "tp({}): ciphertext too large for packet to {}",
                self.config.name,
                destination
            );
            return SendPacketOutcome::DroppedCiphertextTooLarge;
        }

        let packet = Packet {
            destination: *destination,
            context,
            data,
            ..Default::default()
        };

        self.send_packet(packet).await
    }

    fn has_destination(&self, address: &AddressHash) -> bool {
        self.single_in_destinations.contains_key(address)
    }

    fn find_link(&self, link_id: &AddressHash) -> Option<Arc<Mutex<Link>>> {
        self.in_links.get(link_id).cloned().or_else(|| self.out_links.get(link_id).cloned())
    }

    /// Announces and keep-alives may legitimately repeat; everything
    /// else is deduplicated by packet hash.
    fn filter_duplicate_packets(&mut self, packet: &Packet) -> bool {
        let allow_duplicate = match packet.header.packet_type {
            PacketType::Announce => return true,
            PacketType::LinkRequest => true,
            PacketType::Data => packet.context == PacketContext::KeepAlive,
            PacketType::Proof => packet.context == PacketContext::LinkRequestProof,
        };

        let is_new = self.packet_cache.update(packet);
        is_new || allow_duplicate
    }

    async fn request_path(&mut self, address: &AddressHash, tag: Option<TagBytes>) {
        if let Some(packet) = self.path_requests.generate(address, tag) {
            self.send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet }).await;
        }
    }

    async fn handle_inbound(&mut self, message: RxMessage) {
        let packet = message.packet;

        if packet.header.hops > MAX_HOPS {
            return;
        }

        if self.handle_fixed_destinations(&packet).await {
            return;
        }

        if !self.filter_duplicate_packets(&packet) {
            log::debug!(
                "tp({}): dropping duplicate packet: dst={}, ctx={:?}",
                self.config.name,
                packet.destination,
                packet.context
            );
            return;
        }

        if self.config.broadcast && packet.header.packet_type != PacketType::Announce {
            self.send(TxMessage {
                tx_type: TxMessageType::Broadcast(Some(message.address)),
                packet,
            })
            .await;
        }

        match packet.header.packet_type {
            PacketType::Announce => self.handle_announce(&packet, message.address).await,
            PacketType::LinkRequest => self.handle_link_request(&packet, message.address).await,
            PacketType::Proof => self.handle_proof(&packet).await,
            PacketType::Data => self.handle_data(&packet, message.address).await,
        }
    }

    /// Path requests addressed at the shared PLAIN destination.
    async fn handle_fixed_destinations(&mut self, packet: &Packet) -> bool {
        if packet.destination != *self.path_requests.destination()
            || packet.header.packet_type != PacketType::Data
        {
            return false;
        }

        let Some(info) = PathRequests::parse(packet.data.as_slice()) else {
            return true;
        };

        if let Some(destination) = self.single_in_destinations.get(&info.target).cloned() {
            log::debug!("tp({}): answering path request for {}", self.config.name, info.target);
            let response = destination.lock().await.path_response(OsRng, None);
            if let Ok(response) = response {
                self.send_packet(response).await;
            }
        }

        true
    }

    async fn handle_announce(&mut self, packet: &Packet, iface: AddressHash) {
        let now = Instant::now();
        if let Some(last) = self.announce_limits.get(&packet.destination) {
            if now.duration_since(*last) < self.config.announce_min_interval {
                return;
            }
        }

        let announce = match DestinationAnnounce::validate(packet) {
            Ok(result) => result,
            Err(err) => {
                log::debug!(
                    "tp({}): announce validation failed for {}: {:?}",
                    self.config.name,
                    packet.destination,
                    err
                );
                return;
            }
        };

        self.announce_limits.insert(packet.destination, now);

        let ratchet = announce.ratchet;
        if let Some(ratchet_bytes) = ratchet {
            if let Some(store) = self.ratchet_store.as_mut() {
                if let Err(err) = store.remember(&packet.destination, ratchet_bytes) {
                    log::warn!(
                        "tp({}): failed to remember ratchet for {}: {:?}",
                        self.config.name,
                        packet.destination,
                        err
                    );
                }
            }
        }

        let app_data = PacketDataBuffer::new_from_slice(announce.app_data);
        let destination = Arc::new(Mutex::new(announce.destination));

        if !self.has_destination(&packet.destination) {
            self.single_out_destinations
                .entry(packet.destination)
                .or_insert_with(|| destination.clone());
            self.path_table.handle_announce(packet, packet.transport, iface);
        }

        if self.config.retransmit && packet.header.hops < MAX_HOPS {
            let mut retransmitted = *packet;
            retransmitted.header.hops += 1;
            retransmitted.header.header_type = crate::packet::HeaderType::Type2;
            retransmitted.transport = Some(*self.config.identity.address_hash());
            self.send(TxMessage {
                tx_type: TxMessageType::Broadcast(Some(iface)),
                packet: retransmitted,
            })
            .await;
        }

        let _ = self.announce_tx.send(AnnounceEvent {
            destination,
            destination_hash: packet.destination,
            app_data,
            ratchet,
            hops: packet.header.hops,
            iface,
        });
    }

    async fn handle_link_request(&mut self, packet: &Packet, iface: AddressHash) {
        if let Some(destination) = self.single_in_destinations.get(&packet.destination).cloned() {
            let (desc, sign_key) = {
                let guard = destination.lock().await;
                (guard.desc, guard.identity.sign_key().clone())
            };

            let link =
                match Link::new_from_request(packet, sign_key, desc, self.link_event_tx.clone()) {
                    Ok(link) => link,
                    Err(_) => return,
                };

            let link_id = *link.id();
            let link = Arc::new(Mutex::new(link));
            self.in_links.insert(link_id, link.clone());

            let proof = link.lock().await.prove();
            self.send_packet(proof).await;
            return;
        }

        // Not ours: transport nodes remember the path the request took
        // and push it along toward the destination.
        if self.config.retransmit {
            if let Some(entry_iface) = self.path_table.next_hop_iface(&packet.destination) {
                self.link_table.add(
                    packet,
                    packet.destination,
                    iface,
                    self.path_table
                        .get(&packet.destination)
                        .map(|entry| entry.received_from)
                        .unwrap_or(packet.destination),
                    entry_iface,
                );
                let mut forwarded = *packet;
                forwarded.header.hops += 1;
                if forwarded.header.hops <= MAX_HOPS {
                    self.send(TxMessage {
                        tx_type: TxMessageType::Direct(entry_iface),
                        packet: forwarded,
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_proof(&mut self, packet: &Packet) {
        match packet.context {
            PacketContext::LinkRequestProof => {
                if let Some(link) = self.out_links.get(&packet.destination).cloned() {
                    let (result, rtt_packet) = {
                        let mut link = link.lock().await;
                        let result = link.handle_packet(packet);
                        let rtt_packet = if matches!(result, LinkHandleResult::Activated) {
                            link.rtt_packet().ok()
                        } else {
                            None
                        };
                        (result, rtt_packet)
                    };
                    if matches!(result, LinkHandleResult::Activated) {
                        log::debug!(
                            "tp({}): out link {} active",
                            self.config.name,
                            packet.destination
                        );
                        // The responder learns the measured round trip.
                        if let Some(rtt_packet) = rtt_packet {
                            self.send_packet(rtt_packet).await;
                        }
                    }
                    return;
                }
                if self.config.retransmit {
                    if let Some((bounced, toward)) = self.link_table.handle_proof(packet) {
                        let iface = self.path_table.next_hop_iface(&toward);
                        match iface {
                            Some(iface) => {
                                self.send(TxMessage {
                                    tx_type: TxMessageType::Direct(iface),
                                    packet: bounced,
                                })
                                .await
                            }
                            None => {
                                self.send(TxMessage {
                                    tx_type: TxMessageType::Broadcast(None),
                                    packet: bounced,
                                })
                                .await
                            }
                        };
                    }
                }
            }
            PacketContext::ResourceProof => {
                if let Some(link) = self.find_link(&packet.destination) {
                    let mut link_guard = link.lock().await;
                    let responses = self.resource_manager.handle_packet(packet, &mut link_guard);
                    drop(link_guard);
                    for response in responses {
                        self.send_packet(response).await;
                    }
                    self.flush_resource_events();
                }
            }
            PacketContext::LinkProof => {
                self.handle_explicit_proof(packet).await;
            }
            _ => {}
        }
    }

    /// Explicit 96-byte proof: packet hash plus signature by the link
    /// peer. Resolves delivery receipts and channel windows.
    async fn handle_explicit_proof(&mut self, packet: &Packet) {
        let data = packet.data.as_slice();
        if data.len() < crate::packet::EXPLICIT_PROOF_LENGTH {
            return;
        }

        let Some(link) = self.find_link(&packet.destination) else {
            return;
        };

        let proved_hash = Hash::new(match data[..32].try_into() {
            Ok(bytes) => bytes,
            Err(_) => return,
        });

        let signature = match ed25519_dalek::Signature::from_slice(&data[32..96]) {
            Ok(signature) => signature,
            Err(_) => return,
        };

        let mut link_guard = link.lock().await;
        if link_guard.peer_identity().verify(proved_hash.as_slice(), &signature).is_err() {
            log::debug!("tp({}): invalid packet proof on {}", self.config.name, packet.destination);
            return;
        }
        link_guard.mark_inbound();

        let tracked = self.tracked_packets.remove(&proved_hash);
        if let Some(tracked) = tracked {
            let rtt = tracked.sent_at.elapsed();
            link_guard.update_rtt(rtt);
            drop(link_guard);

            if let Some(handler) = self.receipt_handler.clone() {
                handler.on_receipt(&DeliveryReceipt {
                    packet_hash: proved_hash,
                    link_id: tracked.link_id,
                    rtt,
                });
            }
        } else {
            drop(link_guard);
        }

        if let Some(binding) = self.channels.get(&packet.destination) {
            let sequence = binding
                .delivery_map
                .lock()
                .ok()
                .and_then(|mut map| map.remove(&proved_hash));
            if let Some(sequence) = sequence {
                if let Ok(mut channel) = binding.channel.lock() {
                    channel.mark_delivered(sequence);
                }
            }
        }
    }

    async fn handle_data(&mut self, packet: &Packet, iface: AddressHash) {
        // Link traffic first: the destination is a link id.
        if let Some(link) = self.find_link(&packet.destination) {
            self.handle_link_data(packet, link).await;
            return;
        }

        // Opportunistic data straight at one of our destinations.
        if let Some(destination) = self.single_in_destinations.get(&packet.destination).cloned() {
            let guard = destination.lock().await;
            match guard.decrypt_with_ratchets(packet.data.as_slice()) {
                Ok((plaintext, ratchet_used)) => {
                    drop(guard);
                    let _ = self.received_data_tx.send(ReceivedData {
                        destination: packet.destination,
                        data: plaintext,
                        context: Some(packet.context),
                        ratchet_used,
                    });
                }
                Err(_) => {
                    log::debug!(
                        "tp({}): undecryptable packet for {}",
                        self.config.name,
                        packet.destination
                    );
                }
            }
            return;
        }

        if packet.header.destination_type == DestinationType::Plain {
            let _ = self.received_data_tx.send(ReceivedData {
                destination: packet.destination,
                data: packet.data.as_slice().to_vec(),
                context: Some(packet.context),
                ratchet_used: false,
            });
            return;
        }

        // Somebody else's traffic: forward when we carry paths.
        if self.config.retransmit {
            if packet.context == PacketContext::KeepAlive {
                if let Some((bounced, toward)) = self.link_table.handle_keepalive(packet) {
                    if let Some(iface) = self.path_table.next_hop_iface(&toward) {
                        self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: bounced })
                            .await;
                    }
                    return;
                }
            }

            let (forwarded, maybe_iface) = self.path_table.handle_packet(packet);
            if let Some(next_iface) = maybe_iface {
                if next_iface != iface && forwarded.header.hops < MAX_HOPS {
                    let mut forwarded = forwarded;
                    forwarded.header.hops += 1;
                    self.send(TxMessage {
                        tx_type: TxMessageType::Direct(next_iface),
                        packet: forwarded,
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_link_data(&mut self, packet: &Packet, link: Arc<Mutex<Link>>) {
        match packet.context {
            PacketContext::Resource
            | PacketContext::ResourceAdvertisement
            | PacketContext::ResourceRequest
            | PacketContext::ResourceHashUpdate
            | PacketContext::ResourceInitiatorCancel
            | PacketContext::ResourceReceiverCancel => {
                let mut link_guard = link.lock().await;
                link_guard.mark_inbound();
                let responses = self.resource_manager.handle_packet(packet, &mut link_guard);
                drop(link_guard);
                for response in responses {
                    self.send_packet(response).await;
                }
                self.flush_resource_events();
            }
            PacketContext::Channel => {
                let mut buffer = [0u8; PACKET_MDU];
                let mut link_guard = link.lock().await;
                let plain = match link_guard.decrypt(packet.data.as_slice(), &mut buffer[..]) {
                    Ok(plain) => plain.to_vec(),
                    Err(_) => {
                        log::debug!(
                            "tp({}): undecryptable channel envelope on {}",
                            self.config.name,
                            packet.destination
                        );
                        return;
                    }
                };
                link_guard.mark_inbound();
                let proof = link_guard.prove_packet(packet);
                drop(link_guard);

                if let Some(binding) = self.channels.get(&packet.destination) {
                    if let Ok(mut channel) = binding.channel.lock() {
                        let _ = channel.receive(&plain);
                    }
                }

                self.send_packet(proof).await;
            }
            _ => {
                let result = link.lock().await.handle_packet(packet);
                match result {
                    LinkHandleResult::Proof(proof) => {
                        self.send_packet(proof).await;
                    }
                    LinkHandleResult::KeepAlive => {
                        let response =
                            link.lock().await.keep_alive_packet(KEEP_ALIVE_RESPONSE);
                        self.send_packet(response).await;
                    }
                    LinkHandleResult::Closed => {
                        self.drop_link(&packet.destination);
                    }
                    _ => {}
                }
            }
        }
    }

    fn drop_link(&mut self, link_id: &AddressHash) {
        self.in_links.remove(link_id);
        self.out_links.remove(link_id);
        self.channels.remove(link_id);
        self.resource_manager.cancel_all(link_id);
        self.flush_resource_events();
    }

    fn flush_resource_events(&mut self) {
        for event in self.resource_manager.drain_events() {
            let _ = self.resource_events_tx.send(event);
        }
    }

    async fn tick(&mut self, tick: u64) {
        if tick % TICKS_LINKS_CHECK == 0 {
            self.check_links().await;
        }

        if tick % TICKS_CHANNEL_SWEEP == 0 {
            for binding in self.channels.values() {
                if let Ok(mut channel) = binding.channel.lock() {
                    let _ = channel.sweep();
                }
            }
        }

        if tick % TICKS_RESOURCE_RETRY == 0 {
            let requests = self.resource_manager.retry_requests(tokio::time::Instant::now());
            for (link_id, request) in requests {
                if let Some(link) = self.find_link(&link_id) {
                    let packet = {
                        let link_guard = link.lock().await;
                        build_resource_request_packet(&link_guard, &request).ok()
                    };
                    if let Some(packet) = packet {
                        self.send_packet(packet).await;
                    }
                }
            }
            self.flush_resource_events();
        }

        if tick % TICKS_CACHE_RELEASE == 0 {
            self.packet_cache.release(INTERVAL_KEEP_PACKET_CACHED);
            self.link_table.remove_stale();
            let expired = self.path_table.sweep(self.config.path_expiry);
            if expired > 0 {
                log::debug!("tp({}): expired {} paths", self.config.name, expired);
            }
            self.path_requests.sweep();
            let now = Instant::now();
            self.tracked_packets
                .retain(|_, tracked| now.duration_since(tracked.sent_at) <= TRACKED_PACKET_EXPIRY);
        }
    }

    async fn check_links(&mut self) {
        let mut packets = Vec::new();
        let mut closed = Vec::new();

        for (link_id, link) in &self.out_links {
            let mut link = link.lock().await;
            match link.status() {
                LinkStatus::Closed => closed.push(*link_id),
                LinkStatus::Pending => {
                    if link.elapsed() > INTERVAL_OUTPUT_LINK_REPEAT {
                        log::warn!("tp({}): repeat link request {}", self.config.name, link_id);
                        packets.push(link.request());
                    }
                }
                _ => match link.check_keep_alive() {
                    LinkHandleResult::KeepAlive => {
                        packets.push(link.keep_alive_packet(KEEP_ALIVE_REQUEST));
                    }
                    LinkHandleResult::Closed => closed.push(*link_id),
                    _ => {}
                },
            }
        }

        for (link_id, link) in &self.in_links {
            let mut link = link.lock().await;
            match link.status() {
                LinkStatus::Closed => closed.push(*link_id),
                _ => {
                    if let LinkHandleResult::Closed = link.check_keep_alive() {
                        closed.push(*link_id);
                    }
                }
            }
        }

        for link_id in closed {
            self.drop_link(&link_id);
        }

        for packet in packets {
            self.send_packet(packet).await;
        }
    }
}

/// The stack's dispatch core: owns the interface registry, the path and
/// link tables, registered destinations, live links, and the job loop.
pub struct Transport {
    name: String,
    iface_manager: Arc<Mutex<InterfaceManager>>,
    handler: Arc<Mutex<TransportHandler>>,
    throttle: ThrottleHandle,
    announce_tx: broadcast::Sender<AnnounceEvent>,
    link_event_tx: broadcast::Sender<LinkEventData>,
    received_data_tx: broadcast::Sender<ReceivedData>,
    resource_events_tx: broadcast::Sender<ResourceEvent>,
    egress_tx: mpsc::UnboundedSender<Packet>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (announce_tx, _) = broadcast::channel(64);
        let (link_event_tx, _) = broadcast::channel(64);
        let (received_data_tx, _) = broadcast::channel(64);
        let (resource_events_tx, _) = broadcast::channel(64);
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();

        let iface_manager = InterfaceManager::new(128);
        let rx_receiver = iface_manager.receiver();
        let iface_manager = Arc::new(Mutex::new(iface_manager));

        let throttle = config.throttle.clone();
        let cancel = CancellationToken::new();
        let name = config.name.clone();

        let transport_id = if config.retransmit {
            Some(*config.identity.address_hash())
        } else {
            None
        };

        let ratchet_store = config.ratchet_store_path.as_ref().map(|path| {
            let mut store = RatchetStore::new(path.clone());
            store.clean_expired(now_secs());
            store
        });

        let path_requests = PathRequests::new(transport_id, config.path_request_min_interval);
        let link_table =
            LinkTable::new(config.link_proof_timeout, config.link_idle_timeout);
        let resource_manager = ResourceManager::new_with_config(
            config.resource_retry_interval,
            config.resource_retry_limit,
        );

        let handler = Arc::new(Mutex::new(TransportHandler {
            config,
            iface_manager: iface_manager.clone(),
            path_table: PathTable::new(),
            link_table,
            packet_cache: PacketCache::new(),
            path_requests,
            single_in_destinations: HashMap::new(),
            single_out_destinations: HashMap::new(),
            in_links: HashMap::new(),
            out_links: HashMap::new(),
            channels: HashMap::new(),
            ratchet_store,
            resource_manager,
            tracked_packets: HashMap::new(),
            receipt_handler: None,
            announce_limits: HashMap::new(),
            announce_tx: announce_tx.clone(),
            link_event_tx: link_event_tx.clone(),
            received_data_tx: received_data_tx.clone(),
            resource_events_tx: resource_events_tx.clone(),
        }));

        tokio::spawn(run_rx_task(handler.clone(), rx_receiver, cancel.clone()));
        tokio::spawn(run_job_loop(handler.clone(), throttle.clone(), cancel.clone()));
        tokio::spawn(run_egress_task(handler.clone(), egress_rx, cancel.clone()));

        Self {
            name,
            iface_manager,
            handler,
            throttle,
            announce_tx,
            link_event_tx,
            received_data_tx,
            resource_events_tx,
            egress_tx,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iface_manager(&self) -> Arc<Mutex<InterfaceManager>> {
        self.iface_manager.clone()
    }

    pub fn throttle(&self) -> ThrottleHandle {
        self.throttle.clone()
    }

    pub fn recv_announces(&self) -> broadcast::Receiver<AnnounceEvent> {
        self.announce_tx.subscribe()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEventData> {
        self.link_event_tx.subscribe()
    }

    pub fn received_data(&self) -> broadcast::Receiver<ReceivedData> {
        self.received_data_tx.subscribe()
    }

    pub fn resource_events(&self) -> broadcast::Receiver<ResourceEvent> {
        self.resource_events_tx.subscribe()
    }

    pub async fn set_receipt_handler(&self, handler: Box<dyn ReceiptHandler>) {
        self.handler.lock().await.receipt_handler = Some(Arc::from(handler));
    }

    pub async fn set_resource_strategy(&self, strategy: ResourceStrategy) {
        self.handler.lock().await.resource_manager.set_strategy(strategy);
    }

    pub async fn register_destination(
        &self,
        destination: SingleInputDestination,
    ) -> Arc<Mutex<SingleInputDestination>> {
        let address = destination.desc.address_hash;
        let destination = Arc::new(Mutex::new(destination));
        self.handler
            .lock()
            .await
            .single_in_destinations
            .insert(address, destination.clone());
        destination
    }

    /// Registers a remote identity learned out of band, so
    /// opportunistic sends can encrypt to it immediately.
    pub async fn remember_destination(&self, destination: SingleOutputDestination) {
        let address = destination.desc.address_hash;
        self.handler
            .lock()
            .await
            .single_out_destinations
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(destination)));
    }

    pub async fn knows_destination(&self, address: &AddressHash) -> bool {
        self.handler.lock().await.single_out_destinations.contains_key(address)
    }

    /// Cached descriptor for a remote destination learned from
    /// announces or `remember_destination`.
    pub async fn destination_desc(&self, address: &AddressHash) -> Option<DestinationDesc> {
        let destination = {
            let handler = self.handler.lock().await;
            handler.single_out_destinations.get(address)?.clone()
        };
        let desc = destination.lock().await.desc;
        Some(desc)
    }

    pub async fn has_path(&self, address: &AddressHash) -> bool {
        self.handler.lock().await.path_table.has_path(address)
    }

    pub async fn expire_path(&self, address: &AddressHash) {
        self.handler.lock().await.path_table.expire(address);
    }

    pub async fn request_path(&self, address: &AddressHash) {
        self.handler.lock().await.request_path(address, None).await;
    }

    pub async fn send_announce(
        &self,
        destination: &Arc<Mutex<SingleInputDestination>>,
        app_data: Option<&[u8]>,
    ) {
        let packet = {
            let mut destination = destination.lock().await;
            match destination.announce(OsRng, app_data) {
                Ok(packet) => packet,
                Err(err) => {
                    log::warn!("tp({}): failed to build announce: {:?}", self.name, err);
                    return;
                }
            }
        };
        self.handler.lock().await.send_packet(packet).await;
    }

    pub async fn send_packet(&self, packet: Packet) -> SendPacketOutcome {
        self.handler.lock().await.send_packet(packet).await
    }

    pub async fn send_packet_tracked(
        &self,
        packet: Packet,
        link_id: Option<AddressHash>,
    ) -> Hash {
        self.handler.lock().await.send_packet_tracked(packet, link_id).await
    }

    pub async fn send_opportunistic(
        &self,
        destination: &AddressHash,
        payload: &[u8],
    ) -> SendPacketOutcome {
        self.handler
            .lock()
            .await
            .send_opportunistic(destination, payload, PacketContext::None)
            .await
    }

    /// Starts link establishment toward a destination; the returned
    /// link is PENDING until the proof arrives.
    pub async fn link(&self, destination: DestinationDesc) -> Arc<Mutex<Link>> {
        let mut handler = self.handler.lock().await;

        let mut link = Link::new(destination, self.link_event_tx.clone());
        let request = link.request();
        let link_id = *link.id();

        let link = Arc::new(Mutex::new(link));
        handler.out_links.insert(link_id, link.clone());
        handler.send_packet(request).await;

        link
    }

    /// Establishes a link and waits until it is ACTIVE, or fails with
    /// `Timeout`.
    pub async fn establish_link(
        &self,
        destination: DestinationDesc,
        timeout: Duration,
    ) -> Result<Arc<Mutex<Link>>, RnsError> {
        let mut events = self.link_event_tx.subscribe();
        let link = self.link(destination).await;
        let link_id = *link.lock().await.id();

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.id == link_id => match event.event {
                        crate::destination::link::LinkEvent::Activated => return Ok(()),
                        crate::destination::link::LinkEvent::Closed => {
                            return Err(RnsError::Cancelled)
                        }
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(RnsError::Cancelled),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(link),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.handler.lock().await.out_links.remove(&link_id);
                Err(RnsError::Timeout)
            }
        }
    }

    pub async fn find_link(&self, link_id: &AddressHash) -> Option<Arc<Mutex<Link>>> {
        self.handler.lock().await.find_link(link_id)
    }

    /// Sends one payload over an ACTIVE link as a tracked link packet;
    /// the returned hash resolves through the receipt handler.
    pub async fn send_on_link(
        &self,
        link_id: &AddressHash,
        payload: &[u8],
    ) -> Result<Hash, RnsError> {
        let link = self.find_link(link_id).await.ok_or(RnsError::ConnectionError)?;
        let packet = link.lock().await.data_packet(payload)?;
        Ok(self.send_packet_tracked(packet, Some(*link_id)).await)
    }

    /// Starts a resource transfer on a link.
    pub async fn send_resource(
        &self,
        link_id: &AddressHash,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<Hash, RnsError> {
        let mut handler = self.handler.lock().await;
        let link = handler.find_link(link_id).ok_or(RnsError::ConnectionError)?;
        let (hash, packet) = {
            let link_guard = link.lock().await;
            if link_guard.status() != LinkStatus::Active {
                return Err(RnsError::NotReady);
            }
            handler.resource_manager.start_send(&link_guard, data, metadata)?
        };
        handler.send_packet(packet).await;
        Ok(hash)
    }

    /// Binds a reliable channel to an ACTIVE link. One channel per
    /// link; repeat calls return the existing binding.
    pub async fn attach_channel(
        &self,
        link_id: &AddressHash,
    ) -> Result<Arc<std::sync::Mutex<Channel<LinkOutlet>>>, RnsError> {
        let mut handler = self.handler.lock().await;

        if let Some(binding) = handler.channels.get(link_id) {
            return Ok(binding.channel.clone());
        }

        let link = handler.find_link(link_id).ok_or(RnsError::ConnectionError)?;
        let delivery_map: DeliveryMap = Arc::new(std::sync::Mutex::new(HashMap::new()));

        let outlet = LinkOutlet {
            link,
            egress: self.egress_tx.clone(),
            delivery_map: delivery_map.clone(),
        };

        let channel = Arc::new(std::sync::Mutex::new(Channel::new(outlet)));
        handler
            .channels
            .insert(*link_id, ChannelBinding { channel: channel.clone(), delivery_map });

        Ok(channel)
    }

    /// Tears the link down: best-effort close packet to the peer, then
    /// local cleanup cancelling channels and resources on it.
    pub async fn teardown_link(&self, link_id: &AddressHash) {
        let mut handler = self.handler.lock().await;
        if let Some(link) = handler.find_link(link_id) {
            let teardown = link.lock().await.teardown_packet();
            if let Some(packet) = teardown {
                handler.send_packet(packet).await;
            }
            handler.drop_link(link_id);
        }
    }

    pub async fn shutdown(&self) {
        let link_ids: Vec<AddressHash> = {
            let handler = self.handler.lock().await;
            handler.out_links.keys().chain(handler.in_links.keys()).copied().collect()
        };
        for link_id in link_ids {
            self.teardown_link(&link_id).await;
        }
        self.cancel.cancel();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_rx_task(
    handler: Arc<Mutex<TransportHandler>>,
    rx_receiver: Arc<Mutex<InterfaceRxReceiver>>,
    cancel: CancellationToken,
) {
    loop {
        let mut rx_receiver = rx_receiver.lock().await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx_receiver.recv() => {
                let Some(message) = message else { break };
                drop(rx_receiver);
                handler.lock().await.handle_inbound(message).await;
            }
        }
    }
}

async fn run_job_loop(
    handler: Arc<Mutex<TransportHandler>>,
    throttle: ThrottleHandle,
    cancel: CancellationToken,
) {
    let base_interval = handler.lock().await.config.job_interval;
    let mut tick: u64 = 0;

    loop {
        // The throttle multiplier is re-read every tick, so runtime
        // changes take effect within one interval.
        let interval = base_interval.mul_f64(throttle.get());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                tick = tick.wrapping_add(1);
                handler.lock().await.tick(tick).await;
            }
        }
    }
}

async fn run_egress_task(
    handler: Arc<Mutex<TransportHandler>>,
    mut egress_rx: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = egress_rx.recv() => {
                let Some(packet) = packet else { break };
                let link_id = packet.destination;
                handler.lock().await.send_packet_tracked(packet, Some(link_id)).await;
            }
        }
    }
}
