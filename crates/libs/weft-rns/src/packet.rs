use core::fmt;

use sha2::Digest;

use crate::buffer::StaticBuffer;
use crate::crypt::token::{TOKEN_BLOCK, TOKEN_OVERHEAD};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};

// Default Reticulum MTU (500) minus the largest header and one IFAC byte.
// 500 - (2 + 1 + 16*2) - 1 = 464
pub const PACKET_MDU: usize = 464;
pub const HEADER_MIN_SIZE: usize = 2 + ADDRESS_HASH_SIZE + 1;
pub const HEADER_2_MIN_SIZE: usize = HEADER_MIN_SIZE + ADDRESS_HASH_SIZE;
pub const MAX_HOPS: u8 = 128;
pub const ENCRYPTED_MDU: usize = PACKET_MDU - TOKEN_OVERHEAD - TOKEN_BLOCK;

/// Explicit proof payload: 32-byte packet hash followed by a 64-byte
/// Ed25519 signature over it.
pub const EXPLICIT_PROOF_LENGTH: usize = 32 + 64;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

impl From<u8> for IfacFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            1 => IfacFlag::Authenticated,
            _ => IfacFlag::Open,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    Type1 = 0b0,
    Type2 = 0b1,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            1 => HeaderType::Type2,
            _ => HeaderType::Type1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContextFlag {
    Unset = 0b0,
    Set = 0b1,
}

impl From<u8> for ContextFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            1 => ContextFlag::Set,
            _ => ContextFlag::Unset,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PropagationType {
    Broadcast = 0b0,
    Transport = 0b1,
}

impl From<u8> for PropagationType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            1 => PropagationType::Transport,
            _ => PropagationType::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            0b11 => DestinationType::Link,
            _ => DestinationType::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            0b11 => PacketType::Proof,
            _ => PacketType::Data,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,
    ResourceAdvertisement = 0x02,
    ResourceRequest = 0x03,
    ResourceHashUpdate = 0x04,
    ResourceProof = 0x05,
    ResourceInitiatorCancel = 0x06,
    ResourceReceiverCancel = 0x07,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    Command = 0x0C,
    CommandStatus = 0x0D,
    Channel = 0x0E,
    LinkRatchet = 0xF9,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceRequest,
            0x04 => PacketContext::ResourceHashUpdate,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceInitiatorCancel,
            0x07 => PacketContext::ResourceReceiverCancel,
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0x0C => PacketContext::Command,
            0x0D => PacketContext::CommandStatus,
            0x0E => PacketContext::Channel,
            0xF9 => PacketContext::LinkRatchet,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

/// Flags byte, MSB to LSB: ifac flag, header type, context flag,
/// propagation type, destination type (2b), packet type (2b). Hops ride
/// in the second header byte and are excluded from the packet hash.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub context_flag: ContextFlag,
    pub propagation_type: PropagationType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            context_flag: ContextFlag::Unset,
            propagation_type: PropagationType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn to_meta(&self) -> u8 {
        (self.ifac_flag as u8) << 7
            | (self.header_type as u8) << 6
            | (self.context_flag as u8) << 5
            | (self.propagation_type as u8) << 4
            | (self.destination_type as u8) << 2
            | (self.packet_type as u8)
    }

    pub fn from_meta(meta: u8) -> Self {
        Self {
            ifac_flag: IfacFlag::from(meta >> 7),
            header_type: HeaderType::from(meta >> 6),
            context_flag: ContextFlag::from(meta >> 5),
            propagation_type: PropagationType::from(meta >> 4),
            destination_type: DestinationType::from(meta >> 2),
            packet_type: PacketType::from(meta),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:b}{:b}{:b}{:b}{:0>2b}{:0>2b}.{}",
            self.ifac_flag as u8,
            self.header_type as u8,
            self.context_flag as u8,
            self.propagation_type as u8,
            self.destination_type as u8,
            self.packet_type as u8,
            self.hops,
        )
    }
}

pub type PacketDataBuffer = StaticBuffer<PACKET_MDU>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub destination: AddressHash,
    pub transport: Option<AddressHash>,
    pub context: PacketContext,
    pub data: PacketDataBuffer,
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() < HEADER_MIN_SIZE {
            return Err(RnsError::PacketError);
        }

        let mut header = Header::from_meta(bytes[0]);
        header.hops = bytes[1];

        let mut idx = 2;

        let transport = if header.header_type == HeaderType::Type2 {
            if bytes.len() < HEADER_2_MIN_SIZE {
                return Err(RnsError::PacketError);
            }
            let hash = AddressHash::try_from_slice(&bytes[idx..idx + ADDRESS_HASH_SIZE])?;
            idx += ADDRESS_HASH_SIZE;
            Some(hash)
        } else {
            None
        };

        if bytes.len() < idx + ADDRESS_HASH_SIZE + 1 {
            return Err(RnsError::PacketError);
        }

        let destination = AddressHash::try_from_slice(&bytes[idx..idx + ADDRESS_HASH_SIZE])?;
        idx += ADDRESS_HASH_SIZE;

        let context = PacketContext::from(bytes[idx]);
        idx += 1;

        if bytes.len() - idx > PACKET_MDU {
            return Err(RnsError::PacketError);
        }

        let data = PacketDataBuffer::new_from_slice(&bytes[idx..]);

        Ok(Self { header, destination, transport, context, data })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RnsError> {
        let mut out = Vec::with_capacity(HEADER_2_MIN_SIZE + self.data.len());

        out.push(self.header.to_meta());
        out.push(self.header.hops);

        if self.header.header_type == HeaderType::Type2 {
            let transport = self.transport.ok_or(RnsError::InvalidArgument)?;
            out.extend_from_slice(transport.as_slice());
        }

        out.extend_from_slice(self.destination.as_slice());
        out.push(self.context as u8);
        out.extend_from_slice(self.data.as_slice());

        Ok(out)
    }

    /// Hash over the hashable part: flags with the addressing bits only,
    /// destination, context, and data. Hop count and transport id never
    /// contribute, so the hash is stable across forwarding.
    pub fn hash(&self) -> Hash {
        Hash::new(
            Hash::generator()
                .chain_update([self.header.to_meta() & 0b0000_1111])
                .chain_update(self.destination.as_slice())
                .chain_update([self.context as u8])
                .chain_update(self.data.as_slice())
                .finalize()
                .into(),
        )
    }

    pub fn truncated_hash(&self) -> AddressHash {
        AddressHash::new_from_hash(&self.hash())
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Default::default(),
            destination: AddressHash::new_empty(),
            transport: None,
            context: PacketContext::None,
            data: Default::default(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport) = self.transport {
            write!(f, " {}", transport)?;
        }
        write!(f, " {} 0x[{}]]", self.destination, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_meta_round_trip() {
        let header = Header {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            context_flag: ContextFlag::Set,
            propagation_type: PropagationType::Transport,
            destination_type: DestinationType::Link,
            packet_type: PacketType::Announce,
            hops: 0,
        };

        let decoded = Header::from_meta(header.to_meta());
        assert_eq!(decoded.context_flag, ContextFlag::Set);
        assert_eq!(decoded.propagation_type, PropagationType::Transport);
        assert_eq!(decoded.destination_type, DestinationType::Link);
        assert_eq!(decoded.packet_type, PacketType::Announce);
    }

    #[test]
    fn pack_unpack_round_trip_modulo_hops() {
        let mut packet = Packet {
            destination: AddressHash::new_from_slice(b"destination"),
            data: PacketDataBuffer::new_from_slice(b"Hello"),
            ..Default::default()
        };
        packet.header.hops = 3;

        let bytes = packet.to_bytes().expect("packed");
        assert_eq!(bytes.len(), 2 + 16 + 1 + 5);

        let unpacked = Packet::from_bytes(&bytes).expect("unpacked");
        assert_eq!(unpacked.header.hops, 3);
        assert_eq!(unpacked.data.as_slice(), b"Hello");
        // Hash ignores hops entirely.
        assert_eq!(unpacked.hash(), packet.hash());
    }

    #[test]
    fn header_2_requires_transport_id() {
        let packet = Packet {
            header: Header { header_type: HeaderType::Type2, ..Default::default() },
            destination: AddressHash::new_from_slice(b"destination"),
            ..Default::default()
        };
        assert!(packet.to_bytes().is_err());

        let bytes = [0b0100_0000, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 0];
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(Packet::from_bytes(&[0u8; HEADER_MIN_SIZE - 1]).is_err());
    }

    #[test]
    fn spec_scenario_header_1_data_packet() {
        let mut dest = [0u8; 16];
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let packet = Packet {
            destination: AddressHash::new(dest),
            data: PacketDataBuffer::new_from_slice(b"Hello"),
            ..Default::default()
        };

        let bytes = packet.to_bytes().expect("packed");
        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes[0], 0x00);
    }
}
