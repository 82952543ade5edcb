use std::collections::HashMap;
use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::Digest;
use tokio::time::{Duration, Instant};

use crate::destination::link::Link;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, HASH_SIZE};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType,
};

/// Per-part payload size for resource transfers.
pub const SDU: usize = 325;
pub const MAPHASH_LEN: usize = 4;
pub const RANDOM_HASH_SIZE: usize = 4;

/// An advertisement carries at most this many hashmap entries; larger
/// resources ship the rest through hashmap updates.
pub const HASHMAP_MAX_LEN: usize = 56;

/// Resources beyond this size transfer as a chain of segments, each an
/// independent advertise/transfer/prove cycle.
pub const MAX_EFFICIENT_SIZE: usize = 16 * 1024 * 1024 - 1;

/// Initial request window and the caps it grows toward on sustained
/// progress. Halves on a retry.
pub const WINDOW: usize = 4;
pub const WINDOW_MAX_SLOW: usize = 5;
pub const WINDOW_MAX_MEDIUM: usize = 16;
pub const WINDOW_MAX_FAST: usize = 48;
const WINDOW_FAST_THRESHOLD: usize = 10;
const WINDOW_MEDIUM_THRESHOLD: usize = 5;

pub const MAX_RETRIES: u8 = 5;

const FLAG_ENCRYPTED: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;
const FLAG_SPLIT: u8 = 0x04;
const FLAG_REQUEST: u8 = 0x08;
const FLAG_RESPONSE: u8 = 0x10;
const FLAG_METADATA: u8 = 0x20;

const METADATA_MAX_SIZE: usize = 16 * 1024 * 1024 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    None,
    Advertised,
    Transferring,
    AwaitingProof,
    Complete,
    Failed,
}

/// Gate applied to inbound advertisements before a transfer starts.
#[derive(Clone)]
pub enum ResourceStrategy {
    AcceptNone,
    AcceptAll,
    AcceptApp(std::sync::Arc<dyn Fn(&ResourceAdvertisement) -> bool + Send + Sync>),
}

impl ResourceStrategy {
    fn accepts(&self, advertisement: &ResourceAdvertisement) -> bool {
        match self {
            ResourceStrategy::AcceptNone => false,
            ResourceStrategy::AcceptAll => true,
            ResourceStrategy::AcceptApp(gate) => gate(advertisement),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Hash,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub original_hash: Hash,
    pub segment_index: u32,
    pub total_segments: u32,
    pub request_id: Option<ByteBuf>,
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceAdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    original_hash: Vec<u8>,
    #[serde(rename = "i")]
    segment_index: u32,
    #[serde(rename = "l")]
    total_segments: u32,
    #[serde(rename = "q")]
    request_id: Option<ByteBuf>,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, RnsError> {
        let frame = ResourceAdvertisementFrame {
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            original_hash: self.original_hash.as_slice().to_vec(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: self.request_id.clone(),
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| RnsError::PacketError)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, RnsError> {
        let frame: ResourceAdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| RnsError::PacketError)?;
        Ok(Self {
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Hash::new(copy_hash(&frame.hash)?),
            random_hash: copy_fixed::<RANDOM_HASH_SIZE>(&frame.random_hash)?,
            original_hash: Hash::new(copy_hash(&frame.original_hash)?),
            segment_index: frame.segment_index,
            total_segments: frame.total_segments,
            request_id: frame.request_id,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn encrypted(&self) -> bool {
        (self.flags & FLAG_ENCRYPTED) == FLAG_ENCRYPTED
    }

    pub fn compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) == FLAG_COMPRESSED
    }

    pub fn split(&self) -> bool {
        (self.flags & FLAG_SPLIT) == FLAG_SPLIT
    }

    pub fn is_request(&self) -> bool {
        (self.flags & FLAG_REQUEST) == FLAG_REQUEST && self.request_id.is_some()
    }

    pub fn is_response(&self) -> bool {
        (self.flags & FLAG_RESPONSE) == FLAG_RESPONSE && self.request_id.is_some()
    }
}

/// Receiver-driven part request: wanted map hashes, plus a marker when
/// the known hashmap ran out and an update is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAPHASH_LEN]>,
    pub resource_hash: Hash,
    pub requested_hashes: Vec<[u8; MAPHASH_LEN]>,
}

impl ResourceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAPHASH_LEN + HASH_SIZE + self.requested_hashes.len() * MAPHASH_LEN,
        );
        if self.hashmap_exhausted {
            out.push(0xFF);
            out.extend_from_slice(&self.last_map_hash.unwrap_or([0u8; MAPHASH_LEN]));
        } else {
            out.push(0x00);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.requested_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < 1 + HASH_SIZE {
            return Err(RnsError::PacketError);
        }
        let hashmap_exhausted = data[0] == 0xFF;
        let mut offset = 1;
        let last_map_hash = if hashmap_exhausted {
            if data.len() < 1 + MAPHASH_LEN + HASH_SIZE {
                return Err(RnsError::PacketError);
            }
            let last = copy_fixed::<MAPHASH_LEN>(&data[offset..])?;
            offset += MAPHASH_LEN;
            Some(last)
        } else {
            None
        };
        let resource_hash = Hash::new(copy_hash(&data[offset..])?);
        offset += HASH_SIZE;
        let mut requested_hashes = Vec::new();
        while offset + MAPHASH_LEN <= data.len() {
            requested_hashes.push(copy_fixed::<MAPHASH_LEN>(&data[offset..])?);
            offset += MAPHASH_LEN;
        }
        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, requested_hashes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHashUpdate {
    pub resource_hash: Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceHashUpdateFrame(u32, #[serde(with = "serde_bytes")] Vec<u8>);

impl ResourceHashUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, RnsError> {
        let mut out = Vec::with_capacity(HASH_SIZE + self.hashmap.len() + 8);
        out.extend_from_slice(self.resource_hash.as_slice());
        let payload =
            rmp_serde::to_vec(&ResourceHashUpdateFrame(self.segment, self.hashmap.clone()))
                .map_err(|_| RnsError::PacketError)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE + 1 {
            return Err(RnsError::PacketError);
        }
        let resource_hash = Hash::new(copy_hash(&data[..HASH_SIZE])?);
        let frame: ResourceHashUpdateFrame =
            rmp_serde::from_slice(&data[HASH_SIZE..]).map_err(|_| RnsError::PacketError)?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1 })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProof {
    pub resource_hash: Hash,
    pub proof: Hash,
}

impl ResourceProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE * 2 {
            return Err(RnsError::PacketError);
        }
        Ok(Self {
            resource_hash: Hash::new(copy_hash(&data[..HASH_SIZE])?),
            proof: Hash::new(copy_hash(&data[HASH_SIZE..])?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub hash: Hash,
    pub link_id: AddressHash,
    pub kind: ResourceEventKind,
}

#[derive(Debug, Clone)]
pub enum ResourceEventKind {
    Progress(ResourceProgress),
    Complete(ResourceComplete),
    OutboundComplete,
    Failed(RnsError),
}

#[derive(Debug, Clone)]
pub struct ResourceProgress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub received_parts: usize,
    pub total_parts: usize,
}

#[derive(Debug, Clone)]
pub struct ResourceComplete {
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

struct ResourceSender {
    resource_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    original_hash: Hash,
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAPHASH_LEN]>,
    expected_proof: Hash,
    data_size: u64,
    compressed: bool,
    has_metadata: bool,
    segment_index: u32,
    total_segments: u32,
    status: ResourceStatus,
}

impl ResourceSender {
    fn new(
        link: &Link,
        data: &[u8],
        metadata: Option<&[u8]>,
        original_hash: Option<Hash>,
        segment_index: u32,
        total_segments: u32,
        try_compression: bool,
    ) -> Result<Self, RnsError> {
        let has_metadata = metadata.is_some();
        let mut combined = match metadata {
            Some(payload) => {
                if payload.len() > METADATA_MAX_SIZE {
                    return Err(RnsError::InvalidArgument);
                }
                let size_bytes = (payload.len() as u32).to_be_bytes();
                let mut prefix = Vec::with_capacity(3 + payload.len() + data.len());
                prefix.extend_from_slice(&size_bytes[1..]);
                prefix.extend_from_slice(payload);
                prefix
            }
            None => Vec::with_capacity(data.len()),
        };
        combined.extend_from_slice(data);

        // Compression only rides along when it actually shrinks the
        // payload; otherwise the raw bytes ship with the flag unset.
        let compressed = if try_compression {
            match bz2_compress(&combined) {
                Some(packed) if packed.len() < combined.len() => {
                    combined = packed;
                    true
                }
                _ => false,
            }
        } else {
            false
        };

        let random_hash = random_bytes::<RANDOM_HASH_SIZE>();
        let data_size = combined.len() as u64;

        let resource_hash = Hash::new(
            Hash::generator().chain_update(&combined).chain_update(random_hash).finalize().into(),
        );
        let expected_proof = Hash::new(
            Hash::generator()
                .chain_update(&combined)
                .chain_update(resource_hash.as_slice())
                .finalize()
                .into(),
        );

        let mut stream = random_bytes::<RANDOM_HASH_SIZE>().to_vec();
        stream.extend_from_slice(&combined);

        let mut cipher_buf = vec![0u8; stream.len() + 128];
        let cipher = link.encrypt(&stream, &mut cipher_buf).map_err(|_| RnsError::CryptoError)?;

        let parts: Vec<Vec<u8>> = cipher.chunks(SDU).map(|chunk| chunk.to_vec()).collect();
        let map_hashes = parts.iter().map(|part| map_hash(part, &random_hash)).collect();

        Ok(Self {
            resource_hash,
            random_hash,
            original_hash: original_hash.unwrap_or(resource_hash),
            parts,
            map_hashes,
            expected_proof,
            data_size,
            compressed,
            has_metadata,
            segment_index,
            total_segments,
            status: ResourceStatus::Advertised,
        })
    }

    fn advertisement(&self) -> ResourceAdvertisement {
        let mut flags = FLAG_ENCRYPTED;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.has_metadata {
            flags |= FLAG_METADATA;
        }
        if self.total_segments > 1 {
            flags |= FLAG_SPLIT;
        }
        ResourceAdvertisement {
            transfer_size: self.parts.iter().map(|part| part.len() as u64).sum(),
            data_size: self.data_size,
            parts: self.parts.len() as u32,
            hash: self.resource_hash,
            random_hash: self.random_hash,
            original_hash: self.original_hash,
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: None,
            flags,
            hashmap: slice_hashmap_segment(&self.map_hashes, 0),
        }
    }

    fn handle_request(&mut self, request: &ResourceRequest, link: &Link) -> Vec<Packet> {
        if request.resource_hash != self.resource_hash {
            return Vec::new();
        }

        let mut packets = Vec::new();
        for hash in &request.requested_hashes {
            if let Some(index) = self.map_hashes.iter().position(|entry| entry == hash) {
                if let Some(part) = self.parts.get(index) {
                    if let Ok(packet) =
                        build_link_packet(link, PacketType::Data, PacketContext::Resource, part)
                    {
                        packets.push(packet);
                    } else {
                        log::warn!("resource: failed to build part packet");
                    }
                }
            }
        }

        if request.hashmap_exhausted {
            if let Some(last_hash) = request.last_map_hash {
                if let Some(last_index) =
                    self.map_hashes.iter().position(|entry| *entry == last_hash)
                {
                    let next_segment = (last_index / HASHMAP_MAX_LEN) + 1;
                    if next_segment * HASHMAP_MAX_LEN < self.map_hashes.len() {
                        let update = ResourceHashUpdate {
                            resource_hash: self.resource_hash,
                            segment: next_segment as u32,
                            hashmap: slice_hashmap_segment(&self.map_hashes, next_segment),
                        };
                        if let Ok(payload) = update.encode() {
                            if let Ok(packet) = build_link_packet(
                                link,
                                PacketType::Data,
                                PacketContext::ResourceHashUpdate,
                                &payload,
                            ) {
                                packets.push(packet);
                            }
                        }
                    }
                }
            }
        }

        self.status = ResourceStatus::Transferring;

        packets
    }

    fn handle_proof(&mut self, proof: &ResourceProof) -> bool {
        if proof.resource_hash != self.resource_hash || proof.proof != self.expected_proof {
            return false;
        }
        self.status = ResourceStatus::Complete;
        true
    }
}

/// Outbound transfer: the data split into ≤ MAX_EFFICIENT_SIZE segments,
/// advertised and proved one segment at a time.
struct OutboundTransfer {
    link_id: AddressHash,
    segments: Vec<Vec<u8>>,
    next_segment: usize,
    original_hash: Hash,
    try_compression: bool,
    sender: ResourceSender,
}

struct ResourceReceiver {
    resource_hash: Hash,
    link_id: AddressHash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    original_hash: Hash,
    segment_index: u32,
    total_segments: u32,
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAPHASH_LEN]>>,
    received: usize,
    received_bytes: u64,
    total_bytes: u64,
    encrypted: bool,
    compressed: bool,
    has_metadata: bool,
    window: usize,
    window_max: usize,
    progress_streak: usize,
    last_progress: Instant,
    last_request: Instant,
    retry_count: u8,
    status: ResourceStatus,
}

struct ResourcePayload {
    data: Vec<u8>,
    metadata: Option<Vec<u8>>,
}

#[allow(clippy::large_enum_variant)]
enum PartOutcome {
    NoMatch,
    Incomplete,
    Complete(Packet, ResourcePayload),
}

impl ResourceReceiver {
    fn new(adv: &ResourceAdvertisement, link_id: AddressHash) -> Self {
        let now = Instant::now();
        let total_parts = adv.parts as usize;
        let mut receiver = Self {
            resource_hash: adv.hash,
            link_id,
            random_hash: adv.random_hash,
            original_hash: adv.original_hash,
            segment_index: adv.segment_index,
            total_segments: adv.total_segments,
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            received: 0,
            received_bytes: 0,
            total_bytes: adv.transfer_size,
            encrypted: adv.encrypted(),
            compressed: adv.compressed(),
            has_metadata: (adv.flags & FLAG_METADATA) == FLAG_METADATA,
            window: WINDOW,
            window_max: WINDOW_MAX_SLOW,
            progress_streak: 0,
            last_progress: now,
            last_request: now,
            retry_count: 0,
            status: ResourceStatus::Advertised,
        };
        receiver.apply_hashmap_segment(0, &adv.hashmap);
        receiver
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks_exact(MAPHASH_LEN).enumerate() {
            let idx = segment * HASHMAP_MAX_LEN + i;
            if idx < self.hashmap.len() {
                let mut entry = [0u8; MAPHASH_LEN];
                entry.copy_from_slice(chunk);
                self.hashmap[idx] = Some(entry);
            }
        }
    }

    fn build_request(&self) -> ResourceRequest {
        let mut requested = Vec::new();
        let mut last_known: Option<[u8; MAPHASH_LEN]> = None;
        let mut hashmap_exhausted = false;

        for (idx, entry) in self.hashmap.iter().enumerate() {
            if let Some(hash) = entry {
                last_known = Some(*hash);
                if self.parts[idx].is_none() {
                    requested.push(*hash);
                    if requested.len() >= self.window {
                        break;
                    }
                }
            } else {
                hashmap_exhausted = true;
                break;
            }
        }

        ResourceRequest {
            hashmap_exhausted,
            last_map_hash: if hashmap_exhausted { last_known } else { None },
            resource_hash: self.resource_hash,
            requested_hashes: requested,
        }
    }

    /// Sustained progress widens the request window; the cap itself
    /// steps up once enough rounds complete without a retry.
    fn note_progress(&mut self) {
        self.progress_streak += 1;
        if self.progress_streak >= WINDOW_FAST_THRESHOLD {
            self.window_max = WINDOW_MAX_FAST;
        } else if self.progress_streak >= WINDOW_MEDIUM_THRESHOLD {
            self.window_max = WINDOW_MAX_MEDIUM;
        }
        if self.window < self.window_max {
            self.window += 1;
        }
        self.last_progress = Instant::now();
        self.retry_count = 0;
    }

    fn note_loss(&mut self) {
        self.progress_streak = 0;
        self.window = std::cmp::max(WINDOW / 2, self.window / 2);
    }

    fn handle_hash_update(&mut self, update: &ResourceHashUpdate) {
        if update.resource_hash != self.resource_hash {
            return;
        }
        self.apply_hashmap_segment(update.segment as usize, &update.hashmap);
    }

    fn handle_part(&mut self, part: &[u8], link: &Link) -> PartOutcome {
        let hash = map_hash(part, &self.random_hash);
        let Some(index) = self.hashmap.iter().position(|entry| entry.as_ref() == Some(&hash))
        else {
            return PartOutcome::NoMatch;
        };

        if self.parts[index].is_none() {
            self.parts[index] = Some(part.to_vec());
            self.received += 1;
            self.received_bytes = self.received_bytes.saturating_add(part.len() as u64);
            self.note_progress();
            self.status = ResourceStatus::Transferring;
        }

        if self.received < self.parts.len() || self.parts.is_empty() {
            return PartOutcome::Incomplete;
        }

        let mut stream = Vec::with_capacity(self.total_bytes as usize);
        for part in self.parts.iter().flatten() {
            stream.extend_from_slice(part);
        }

        let plain = if self.encrypted {
            let mut out = vec![0u8; stream.len() + 64];
            match link.decrypt(&stream, &mut out) {
                Ok(value) => value.to_vec(),
                Err(_) => {
                    self.status = ResourceStatus::Failed;
                    return PartOutcome::Incomplete;
                }
            }
        } else {
            stream
        };

        // Leading salt bytes are discarded; they only randomize the
        // ciphertext stream.
        let payload = if plain.len() > RANDOM_HASH_SIZE {
            plain[RANDOM_HASH_SIZE..].to_vec()
        } else {
            Vec::new()
        };

        let computed = Hash::new(
            Hash::generator().chain_update(&payload).chain_update(self.random_hash).finalize().into(),
        );

        if computed != self.resource_hash {
            self.status = ResourceStatus::Failed;
            return PartOutcome::Incomplete;
        }

        let proof = Hash::new(
            Hash::generator()
                .chain_update(&payload)
                .chain_update(self.resource_hash.as_slice())
                .finalize()
                .into(),
        );
        let proof_payload = ResourceProof { resource_hash: self.resource_hash, proof };

        let expanded = if self.compressed {
            let mut decoder = BzDecoder::new(payload.as_slice());
            let mut decompressed = Vec::new();
            if decoder.read_to_end(&mut decompressed).is_err() {
                self.status = ResourceStatus::Failed;
                return PartOutcome::Incomplete;
            }
            decompressed
        } else {
            payload
        };

        let (metadata, data_payload) = if self.has_metadata && expanded.len() >= 3 {
            let size = ((expanded[0] as usize) << 16)
                | ((expanded[1] as usize) << 8)
                | expanded[2] as usize;
            if size > METADATA_MAX_SIZE || expanded.len() < 3 + size {
                self.status = ResourceStatus::Failed;
                return PartOutcome::Incomplete;
            }
            (Some(expanded[3..3 + size].to_vec()), expanded[3 + size..].to_vec())
        } else {
            (None, expanded)
        };

        self.status = ResourceStatus::Complete;
        match build_link_packet(
            link,
            PacketType::Proof,
            PacketContext::ResourceProof,
            &proof_payload.encode(),
        ) {
            Ok(packet) => {
                PartOutcome::Complete(packet, ResourcePayload { data: data_payload, metadata })
            }
            Err(_) => {
                log::warn!("resource: failed to build proof packet");
                self.status = ResourceStatus::Failed;
                PartOutcome::Incomplete
            }
        }
    }

    fn mark_request(&mut self) {
        self.last_request = Instant::now();
    }

    fn mark_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.note_loss();
    }

    fn retry_due(&self, now: Instant, retry_interval: Duration, max_retries: u8) -> bool {
        if self.status == ResourceStatus::Complete || self.status == ResourceStatus::Failed {
            return false;
        }
        if self.retry_count >= max_retries {
            return false;
        }
        now.duration_since(self.last_progress) >= retry_interval
            && now.duration_since(self.last_request) >= retry_interval
    }

    fn progress(&self) -> ResourceProgress {
        ResourceProgress {
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            received_parts: self.received,
            total_parts: self.parts.len(),
        }
    }
}

/// Reassembly buffer joining completed segments of a split resource in
/// `segment_index` order.
struct SegmentAssembly {
    total_segments: u32,
    next_index: u32,
    data: Vec<u8>,
    metadata: Option<Vec<u8>>,
}

pub struct ResourceManager {
    outgoing: HashMap<Hash, OutboundTransfer>,
    incoming: HashMap<Hash, ResourceReceiver>,
    assemblies: HashMap<Hash, SegmentAssembly>,
    events: Vec<ResourceEvent>,
    strategy: ResourceStrategy,
    retry_interval: Duration,
    retry_limit: u8,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::new_with_config(Duration::from_secs(2), MAX_RETRIES)
    }

    pub fn new_with_config(retry_interval: Duration, retry_limit: u8) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            assemblies: HashMap::new(),
            events: Vec::new(),
            strategy: ResourceStrategy::AcceptNone,
            retry_interval,
            retry_limit,
        }
    }

    pub fn set_strategy(&mut self, strategy: ResourceStrategy) {
        self.strategy = strategy;
    }

    /// Starts an outbound transfer; returns the resource hash of the
    /// first segment and its advertisement packet.
    pub fn start_send(
        &mut self,
        link: &Link,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<(Hash, Packet), RnsError> {
        self.start_send_with_segment_size(link, data, metadata, MAX_EFFICIENT_SIZE)
    }

    pub(crate) fn start_send_with_segment_size(
        &mut self,
        link: &Link,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
        segment_size: usize,
    ) -> Result<(Hash, Packet), RnsError> {
        if data.is_empty() {
            return Err(RnsError::InvalidArgument);
        }

        let segments: Vec<Vec<u8>> =
            data.chunks(segment_size.max(1)).map(|chunk| chunk.to_vec()).collect();
        let total_segments = segments.len() as u32;

        let original_hash = Hash::new(
            Hash::generator().chain_update(&data).finalize().into(),
        );

        // Metadata rides on the first segment only.
        let sender = ResourceSender::new(
            link,
            &segments[0],
            metadata.as_deref(),
            Some(original_hash),
            1,
            total_segments,
            true,
        )?;

        let resource_hash = sender.resource_hash;
        let advertisement = sender.advertisement();
        let packet = build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceAdvertisement,
            &advertisement.pack()?,
        )?;

        self.outgoing.insert(
            resource_hash,
            OutboundTransfer {
                link_id: *link.id(),
                segments,
                next_segment: 1,
                original_hash,
                try_compression: true,
                sender,
            },
        );

        Ok((resource_hash, packet))
    }

    pub fn drain_events(&mut self) -> Vec<ResourceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_active_transfers(&self) -> bool {
        !self.outgoing.is_empty() || !self.incoming.is_empty()
    }

    /// Fails every in-flight transfer; used on link teardown so callers
    /// observe a cancelled cause rather than silence.
    pub fn cancel_all(&mut self, link_id: &AddressHash) {
        let inbound: Vec<Hash> = self
            .incoming
            .iter()
            .filter(|(_, receiver)| receiver.link_id == *link_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in inbound {
            self.incoming.remove(&hash);
            self.events.push(ResourceEvent {
                hash,
                link_id: *link_id,
                kind: ResourceEventKind::Failed(RnsError::Cancelled),
            });
        }

        let outbound: Vec<Hash> = self
            .outgoing
            .iter()
            .filter(|(_, transfer)| transfer.link_id == *link_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in outbound {
            self.outgoing.remove(&hash);
            self.events.push(ResourceEvent {
                hash,
                link_id: *link_id,
                kind: ResourceEventKind::Failed(RnsError::Cancelled),
            });
        }
    }

    /// Periodic retry sweep; emits fresh requests for stalled inbound
    /// transfers and fails the ones that ran out of retries.
    pub fn retry_requests(&mut self, now: Instant) -> Vec<(AddressHash, ResourceRequest)> {
        let mut requests = Vec::new();
        let mut failed = Vec::new();
        for (hash, receiver) in self.incoming.iter_mut() {
            if receiver.retry_due(now, self.retry_interval, self.retry_limit) {
                let request = receiver.build_request();
                receiver.mark_request();
                receiver.mark_retry();
                requests.push((receiver.link_id, request));
            }
            if receiver.retry_count >= self.retry_limit {
                failed.push(*hash);
            }
        }
        for hash in failed {
            if let Some(receiver) = self.incoming.remove(&hash) {
                self.events.push(ResourceEvent {
                    hash,
                    link_id: receiver.link_id,
                    kind: ResourceEventKind::Failed(RnsError::Timeout),
                });
            }
        }
        requests
    }

    pub fn handle_packet(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        match packet.context {
            PacketContext::ResourceAdvertisement => self.handle_advertisement(packet, link),
            PacketContext::ResourceRequest => self.handle_request(packet, link),
            PacketContext::ResourceHashUpdate => self.handle_hash_update(packet, link),
            PacketContext::Resource => self.handle_resource_part(packet, link),
            PacketContext::ResourceProof => self.handle_proof(packet, link),
            PacketContext::ResourceInitiatorCancel | PacketContext::ResourceReceiverCancel => {
                self.cancel(packet)
            }
            _ => Vec::new(),
        }
    }

    /// Advertisement and hash-update payloads arrive encrypted on the
    /// link; decrypt before dispatching to the matching transfer.
    pub fn handle_link_payload(
        &mut self,
        context: PacketContext,
        payload: &[u8],
        link: &mut Link,
    ) -> Vec<Packet> {
        match context {
            PacketContext::ResourceAdvertisement => self.accept_advertisement(payload, link),
            PacketContext::ResourceRequest => self.accept_request(payload, link),
            PacketContext::ResourceHashUpdate => self.accept_hash_update(payload, link),
            PacketContext::Resource => self.accept_part(payload, link),
            _ => Vec::new(),
        }
    }

    fn handle_advertisement(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut buffer = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.decrypt(packet.data.as_slice(), &mut buffer[..]) else {
            return Vec::new();
        };
        let plain = plain.to_vec();
        self.accept_advertisement(&plain, link)
    }

    fn accept_advertisement(&mut self, payload: &[u8], link: &mut Link) -> Vec<Packet> {
        let Ok(advertisement) = ResourceAdvertisement::unpack(payload) else {
            return Vec::new();
        };

        let later_segment = advertisement.split() && advertisement.segment_index > 1;
        let expected = later_segment
            && self
                .assemblies
                .get(&advertisement.original_hash)
                .map(|assembly| assembly.next_index == advertisement.segment_index)
                .unwrap_or(false);

        if !expected && !self.strategy.accepts(&advertisement) {
            log::debug!("resource: advertisement refused by strategy");
            return Vec::new();
        }

        if advertisement.split() && advertisement.segment_index == 1 {
            self.assemblies.insert(
                advertisement.original_hash,
                SegmentAssembly {
                    total_segments: advertisement.total_segments,
                    next_index: 1,
                    data: Vec::new(),
                    metadata: None,
                },
            );
        }

        let resource_hash = advertisement.hash;
        let mut receiver = ResourceReceiver::new(&advertisement, *link.id());
        let request = receiver.build_request();
        receiver.mark_request();
        self.incoming.insert(resource_hash, receiver);

        match build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceRequest,
            &request.encode(),
        ) {
            Ok(packet) => vec![packet],
            Err(_) => {
                log::warn!("resource: failed to build request packet");
                Vec::new()
            }
        }
    }

    fn handle_request(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut buffer = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.decrypt(packet.data.as_slice(), &mut buffer[..]) else {
            return Vec::new();
        };
        let plain = plain.to_vec();
        self.accept_request(&plain, link)
    }

    fn accept_request(&mut self, payload: &[u8], link: &mut Link) -> Vec<Packet> {
        let Ok(request) = ResourceRequest::decode(payload) else {
            return Vec::new();
        };
        if let Some(transfer) = self.outgoing.get_mut(&request.resource_hash) {
            transfer.sender.handle_request(&request, link)
        } else {
            Vec::new()
        }
    }

    fn handle_hash_update(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut buffer = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.decrypt(packet.data.as_slice(), &mut buffer[..]) else {
            return Vec::new();
        };
        let plain = plain.to_vec();
        self.accept_hash_update(&plain, link)
    }

    fn accept_hash_update(&mut self, payload: &[u8], link: &mut Link) -> Vec<Packet> {
        let Ok(update) = ResourceHashUpdate::decode(payload) else {
            return Vec::new();
        };
        if let Some(receiver) = self.incoming.get_mut(&update.resource_hash) {
            receiver.handle_hash_update(&update);
            let request = receiver.build_request();
            receiver.mark_request();
            return match build_link_packet(
                link,
                PacketType::Data,
                PacketContext::ResourceRequest,
                &request.encode(),
            ) {
                Ok(packet) => vec![packet],
                Err(_) => Vec::new(),
            };
        }
        Vec::new()
    }

    fn handle_resource_part(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        self.accept_part(packet.data.as_slice(), link)
    }

    fn accept_part(&mut self, part: &[u8], link: &mut Link) -> Vec<Packet> {
        let mut completed: Option<Hash> = None;
        let mut proof_packet: Option<Packet> = None;
        let mut request_packet: Option<Packet> = None;
        let mut payload: Option<ResourcePayload> = None;

        for (hash, receiver) in self.incoming.iter_mut() {
            let before_received = receiver.received;
            match receiver.handle_part(part, link) {
                PartOutcome::NoMatch => continue,
                PartOutcome::Complete(packet, data_payload) => {
                    completed = Some(*hash);
                    proof_packet = Some(packet);
                    payload = Some(data_payload);
                    break;
                }
                PartOutcome::Incomplete => {
                    let request = receiver.build_request();
                    receiver.mark_request();
                    request_packet = build_link_packet(
                        link,
                        PacketType::Data,
                        PacketContext::ResourceRequest,
                        &request.encode(),
                    )
                    .ok();
                    if receiver.received > before_received {
                        self.events.push(ResourceEvent {
                            hash: *hash,
                            link_id: receiver.link_id,
                            kind: ResourceEventKind::Progress(receiver.progress()),
                        });
                    }
                    break;
                }
            }
        }

        if let Some(hash) = completed {
            let receiver = self.incoming.remove(&hash);
            if let (Some(receiver), Some(payload)) = (receiver, payload) {
                self.finish_segment(receiver, payload);
            }
        }

        if let Some(packet) = proof_packet {
            return vec![packet];
        }
        if let Some(packet) = request_packet {
            return vec![packet];
        }
        Vec::new()
    }

    fn finish_segment(&mut self, receiver: ResourceReceiver, payload: ResourcePayload) {
        if receiver.total_segments <= 1 {
            self.events.push(ResourceEvent {
                hash: receiver.resource_hash,
                link_id: receiver.link_id,
                kind: ResourceEventKind::Complete(ResourceComplete {
                    data: payload.data,
                    metadata: payload.metadata,
                }),
            });
            return;
        }

        let Some(assembly) = self.assemblies.get_mut(&receiver.original_hash) else {
            log::warn!("resource: segment without assembly state");
            return;
        };

        if assembly.next_index != receiver.segment_index {
            log::warn!(
                "resource: out-of-order segment {} (expected {})",
                receiver.segment_index,
                assembly.next_index
            );
            return;
        }

        assembly.data.extend_from_slice(&payload.data);
        if payload.metadata.is_some() {
            assembly.metadata = payload.metadata;
        }
        assembly.next_index += 1;

        if assembly.next_index > assembly.total_segments {
            let assembly = self
                .assemblies
                .remove(&receiver.original_hash)
                .expect("assembly present");
            self.events.push(ResourceEvent {
                hash: receiver.original_hash,
                link_id: receiver.link_id,
                kind: ResourceEventKind::Complete(ResourceComplete {
                    data: assembly.data,
                    metadata: assembly.metadata,
                }),
            });
        }
    }

    fn handle_proof(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let Ok(proof) = ResourceProof::decode(packet.data.as_slice()) else {
            return Vec::new();
        };

        let Some(transfer) = self.outgoing.get_mut(&proof.resource_hash) else {
            return Vec::new();
        };

        if !transfer.sender.handle_proof(&proof) {
            return Vec::new();
        }

        let mut transfer = self.outgoing.remove(&proof.resource_hash).expect("transfer present");

        if transfer.next_segment < transfer.segments.len() {
            // Advance to the next segment of a split transfer.
            let segment_data = transfer.segments[transfer.next_segment].clone();
            let segment_index = transfer.next_segment as u32 + 1;
            let total_segments = transfer.segments.len() as u32;
            match ResourceSender::new(
                link,
                &segment_data,
                None,
                Some(transfer.original_hash),
                segment_index,
                total_segments,
                transfer.try_compression,
            ) {
                Ok(sender) => {
                    let next_hash = sender.resource_hash;
                    let advertisement = sender.advertisement();
                    transfer.next_segment += 1;
                    transfer.sender = sender;
                    self.outgoing.insert(next_hash, transfer);
                    if let Ok(payload) = advertisement.pack() {
                        if let Ok(packet) = build_link_packet(
                            link,
                            PacketType::Data,
                            PacketContext::ResourceAdvertisement,
                            &payload,
                        ) {
                            return vec![packet];
                        }
                    }
                }
                Err(err) => {
                    self.events.push(ResourceEvent {
                        hash: proof.resource_hash,
                        link_id: *link.id(),
                        kind: ResourceEventKind::Failed(err),
                    });
                }
            }
            return Vec::new();
        }

        self.events.push(ResourceEvent {
            hash: proof.resource_hash,
            link_id: packet.destination,
            kind: ResourceEventKind::OutboundComplete,
        });
        Vec::new()
    }

    fn cancel(&mut self, packet: &Packet) -> Vec<Packet> {
        if let Ok(hash_bytes) = copy_hash(packet.data.as_slice()) {
            let hash = Hash::new(hash_bytes);
            self.incoming.remove(&hash);
            self.outgoing.remove(&hash);
        }
        Vec::new()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_link_packet(
    link: &Link,
    packet_type: PacketType,
    context: PacketContext,
    payload: &[u8],
) -> Result<Packet, RnsError> {
    // Parts are already ciphertext and proofs must stay readable before
    // link activation bookkeeping; everything else is encrypted.
    let should_encrypt = context != PacketContext::Resource
        && !(packet_type == PacketType::Proof && context == PacketContext::ResourceProof);

    let mut packet_data = PacketDataBuffer::new();
    if should_encrypt {
        let cipher_text_len = {
            let cipher_text = link.encrypt(payload, packet_data.acquire_buf_max())?;
            cipher_text.len()
        };
        packet_data.resize(cipher_text_len);
    } else {
        packet_data.write(payload)?;
    }

    Ok(Packet {
        header: Header {
            destination_type: DestinationType::Link,
            packet_type,
            ..Default::default()
        },
        destination: *link.id(),
        transport: None,
        context,
        data: packet_data,
    })
}

pub(crate) fn build_resource_request_packet(
    link: &Link,
    request: &ResourceRequest,
) -> Result<Packet, RnsError> {
    build_link_packet(link, PacketType::Data, PacketContext::ResourceRequest, &request.encode())
}

fn slice_hashmap_segment(hashes: &[[u8; MAPHASH_LEN]], segment: usize) -> Vec<u8> {
    let start = segment * HASHMAP_MAX_LEN;
    let end = usize::min((segment + 1) * HASHMAP_MAX_LEN, hashes.len());
    let mut out = Vec::with_capacity((end - start) * MAPHASH_LEN);
    for hash in &hashes[start..end] {
        out.extend_from_slice(hash);
    }
    out
}

fn map_hash(part: &[u8], random_hash: &[u8; RANDOM_HASH_SIZE]) -> [u8; MAPHASH_LEN] {
    let digest =
        Hash::generator().chain_update(part).chain_update(random_hash).finalize();
    let mut out = [0u8; MAPHASH_LEN];
    out.copy_from_slice(&digest[..MAPHASH_LEN]);
    out
}

fn bz2_compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

fn copy_hash(bytes: &[u8]) -> Result<[u8; HASH_SIZE], RnsError> {
    copy_fixed::<HASH_SIZE>(bytes)
}

fn copy_fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RnsError> {
    if bytes.len() < N {
        return Err(RnsError::PacketError);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::link::{Link, LinkHandleResult};
    use crate::destination::{DestinationDesc, DestinationName};
    use crate::identity::PrivateIdentity;
    use rand_core::OsRng;

    fn linked_pair() -> (Link, Link) {
        let responder_identity = PrivateIdentity::new_from_rand(OsRng);
        let public = *responder_identity.as_identity();
        let desc = DestinationDesc {
            identity: public,
            address_hash: public.address_hash,
            name: DestinationName::new("weft", "resource.test"),
        };

        let (tx_a, _) = tokio::sync::broadcast::channel(64);
        let (tx_b, _) = tokio::sync::broadcast::channel(64);

        let mut initiator = Link::new(desc, tx_a);
        let request = initiator.request();
        let mut responder =
            Link::new_from_request(&request, responder_identity.sign_key().clone(), desc, tx_b)
                .expect("responder");
        let proof = responder.prove();
        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));

        (initiator, responder)
    }

    fn pump_transfer(
        sender_mgr: &mut ResourceManager,
        receiver_mgr: &mut ResourceManager,
        sender_link: &mut Link,
        receiver_link: &mut Link,
        first: Vec<Packet>,
    ) {
        // Alternate between the two managers until traffic settles.
        let mut to_receiver = first;
        for _ in 0..512 {
            if to_receiver.is_empty() {
                break;
            }
            let mut to_sender = Vec::new();
            for packet in to_receiver.drain(..) {
                to_sender.extend(receiver_mgr.handle_packet(&packet, receiver_link));
            }
            for packet in to_sender.drain(..) {
                to_receiver.extend(sender_mgr.handle_packet(&packet, sender_link));
            }
        }
    }

    #[tokio::test]
    async fn transfer_round_trip() {
        let (mut sender_link, mut receiver_link) = linked_pair();
        let mut sender_mgr = ResourceManager::new();
        let mut receiver_mgr = ResourceManager::new();
        receiver_mgr.set_strategy(ResourceStrategy::AcceptAll);

        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let (_hash, advert) =
            sender_mgr.start_send(&sender_link, data.clone(), None).expect("advertised");

        pump_transfer(
            &mut sender_mgr,
            &mut receiver_mgr,
            &mut sender_link,
            &mut receiver_link,
            vec![advert],
        );

        let received = receiver_mgr
            .drain_events()
            .into_iter()
            .find_map(|event| match event.kind {
                ResourceEventKind::Complete(complete) => Some(complete.data),
                _ => None,
            })
            .expect("complete event");
        assert_eq!(received, data);

        let outbound_done = sender_mgr
            .drain_events()
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::OutboundComplete));
        assert!(outbound_done);
    }

    #[tokio::test]
    async fn default_strategy_refuses_transfers() {
        let (mut sender_link, mut receiver_link) = linked_pair();
        let mut sender_mgr = ResourceManager::new();
        let mut receiver_mgr = ResourceManager::new();

        let (_hash, advert) =
            sender_mgr.start_send(&sender_link, vec![1, 2, 3, 4], None).expect("advertised");

        let responses = receiver_mgr.handle_packet(&advert, &mut receiver_link);
        assert!(responses.is_empty());
        let _ = &mut sender_link;
    }

    #[tokio::test]
    async fn split_transfer_reassembles_in_order() {
        let (mut sender_link, mut receiver_link) = linked_pair();
        let mut sender_mgr = ResourceManager::new();
        let mut receiver_mgr = ResourceManager::new();
        receiver_mgr.set_strategy(ResourceStrategy::AcceptAll);

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();
        let (_hash, advert) = sender_mgr
            .start_send_with_segment_size(&sender_link, data.clone(), None, 1500)
            .expect("advertised");

        pump_transfer(
            &mut sender_mgr,
            &mut receiver_mgr,
            &mut sender_link,
            &mut receiver_link,
            vec![advert],
        );

        let received = receiver_mgr
            .drain_events()
            .into_iter()
            .find_map(|event| match event.kind {
                ResourceEventKind::Complete(complete) => Some(complete.data),
                _ => None,
            })
            .expect("assembled data");
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn compressible_data_sets_compressed_flag() {
        let (sender_link, _receiver_link) = linked_pair();

        let data = vec![0u8; 4000];
        let sender = ResourceSender::new(&sender_link, &data, None, None, 1, 1, true)
            .expect("sender");
        let advert = sender.advertisement();
        assert!(advert.compressed());
        assert!(advert.data_size < 4000);
    }

    #[tokio::test]
    async fn incompressible_data_ships_raw() {
        let (sender_link, _receiver_link) = linked_pair();

        let mut data = vec![0u8; 600];
        OsRng.fill_bytes(&mut data);
        let sender = ResourceSender::new(&sender_link, &data, None, None, 1, 1, true)
            .expect("sender");
        let advert = sender.advertisement();
        assert!(!advert.compressed());
        assert_eq!(advert.data_size, 600);
    }

    #[tokio::test]
    async fn oversized_metadata_is_rejected() {
        let (sender_link, _receiver_link) = linked_pair();

        let metadata = vec![0u8; METADATA_MAX_SIZE + 1];
        let result = ResourceSender::new(
            &sender_link,
            &[0u8; 4],
            Some(metadata.as_slice()),
            None,
            1,
            1,
            false,
        );
        assert!(matches!(result, Err(RnsError::InvalidArgument)));
    }

    #[test]
    fn advertisement_pack_round_trip() {
        let advert = ResourceAdvertisement {
            transfer_size: 2048,
            data_size: 2000,
            parts: 7,
            hash: Hash::new_from_slice(b"resource"),
            random_hash: [1, 2, 3, 4],
            original_hash: Hash::new_from_slice(b"original"),
            segment_index: 1,
            total_segments: 1,
            request_id: None,
            flags: FLAG_ENCRYPTED,
            hashmap: vec![0u8; 7 * MAPHASH_LEN],
        };

        let packed = advert.pack().expect("packed");
        let unpacked = ResourceAdvertisement::unpack(&packed).expect("unpacked");
        assert_eq!(unpacked, advert);
    }

    #[test]
    fn part_sizing_matches_sdu() {
        // 2000 bytes of incompressible-ish payload: salt prefix pushes the
        // ciphertext over 6 parts, hashmap carries one entry per part.
        let count = (2000 + SDU - 1) / SDU;
        assert_eq!(count, 7);
    }

    #[test]
    fn request_encode_round_trip() {
        let request = ResourceRequest {
            hashmap_exhausted: true,
            last_map_hash: Some([9, 9, 9, 9]),
            resource_hash: Hash::new_from_slice(b"resource"),
            requested_hashes: vec![[1, 1, 1, 1], [2, 2, 2, 2]],
        };

        let decoded = ResourceRequest::decode(&request.encode()).expect("decoded");
        assert_eq!(decoded, request);
    }

    #[test]
    fn window_grows_and_halves() {
        let advert = ResourceAdvertisement {
            transfer_size: 64,
            data_size: 64,
            parts: 64,
            hash: Hash::new_from_slice(b"resource"),
            random_hash: [0; 4],
            original_hash: Hash::new_from_slice(b"resource"),
            segment_index: 1,
            total_segments: 1,
            request_id: None,
            flags: 0,
            hashmap: vec![0u8; 64 * MAPHASH_LEN],
        };
        let mut receiver = ResourceReceiver::new(&advert, AddressHash::new_empty());

        assert_eq!(receiver.window, WINDOW);
        for _ in 0..WINDOW_FAST_THRESHOLD + WINDOW_MAX_FAST {
            receiver.note_progress();
        }
        assert_eq!(receiver.window_max, WINDOW_MAX_FAST);
        assert!(receiver.window > WINDOW_MAX_MEDIUM);

        let before = receiver.window;
        receiver.note_loss();
        assert_eq!(receiver.window, before / 2);
    }
}
