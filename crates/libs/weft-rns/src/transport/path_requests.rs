use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};

use crate::destination::{DestinationName, PlainInputDestination};
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};
use crate::identity::EmptyIdentity;
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType,
};

pub const PATH_REQUEST_APP: &str = "rnstransport";
pub const PATH_REQUEST_ASPECT: &str = "path.request";

pub const TAG_LENGTH: usize = 8;
pub type TagBytes = [u8; TAG_LENGTH];

pub fn create_path_request_destination() -> PlainInputDestination {
    PlainInputDestination::new(
        EmptyIdentity,
        DestinationName::new(PATH_REQUEST_APP, PATH_REQUEST_ASPECT),
    )
}

#[derive(Debug, PartialEq, Eq)]
pub struct PathRequestInfo {
    pub target: AddressHash,
    pub requesting_transport: Option<AddressHash>,
    pub tag: Option<TagBytes>,
}

/// Generates and parses path requests on the shared
/// `rnstransport.path.request` PLAIN destination. Requests for the same
/// target are rate limited to one per window.
pub struct PathRequests {
    destination: AddressHash,
    transport_id: Option<AddressHash>,
    recent: HashMap<AddressHash, Instant>,
    min_interval: Duration,
}

impl PathRequests {
    pub fn new(transport_id: Option<AddressHash>, min_interval: Duration) -> Self {
        Self {
            destination: create_path_request_destination().desc.address_hash,
            transport_id,
            recent: HashMap::new(),
            min_interval,
        }
    }

    pub fn destination(&self) -> &AddressHash {
        &self.destination
    }

    /// Builds a broadcast path request, or None while the target is
    /// still inside its rate-limit window.
    pub fn generate(&mut self, target: &AddressHash, tag: Option<TagBytes>) -> Option<Packet> {
        let now = Instant::now();
        if let Some(last) = self.recent.get(target) {
            if now.duration_since(*last) < self.min_interval {
                return None;
            }
        }
        self.recent.insert(*target, now);

        let mut data = PacketDataBuffer::new();
        data.chain_safe_write(target.as_slice());
        if let Some(transport_id) = self.transport_id {
            data.chain_safe_write(transport_id.as_slice());
        }
        let tag = tag.unwrap_or_else(|| {
            let mut bytes = [0u8; TAG_LENGTH];
            OsRng.fill_bytes(&mut bytes);
            bytes
        });
        data.chain_safe_write(&tag);

        Some(Packet {
            header: Header {
                destination_type: DestinationType::Plain,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.destination,
            transport: None,
            context: PacketContext::None,
            data,
        })
    }

    /// Parses an inbound request payload. Layout is target hash, then
    /// optionally the requesting transport id, then an optional tag.
    pub fn parse(data: &[u8]) -> Option<PathRequestInfo> {
        if data.len() < ADDRESS_HASH_SIZE {
            return None;
        }
        let target = AddressHash::try_from_slice(data).ok()?;
        let rest = &data[ADDRESS_HASH_SIZE..];

        let (requesting_transport, rest) = if rest.len() >= ADDRESS_HASH_SIZE {
            (
                AddressHash::try_from_slice(rest).ok(),
                &rest[ADDRESS_HASH_SIZE..],
            )
        } else {
            (None, rest)
        };

        let tag = if rest.len() >= TAG_LENGTH {
            let mut bytes = [0u8; TAG_LENGTH];
            bytes.copy_from_slice(&rest[..TAG_LENGTH]);
            Some(bytes)
        } else {
            None
        };

        Some(PathRequestInfo { target, requesting_transport, tag })
    }

    pub fn sweep(&mut self) {
        let now = Instant::now();
        let min_interval = self.min_interval;
        self.recent.retain(|_, last| now.duration_since(*last) <= min_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_parse() {
        let transport_id = AddressHash::new_from_slice(b"transport");
        let mut requests = PathRequests::new(Some(transport_id), Duration::from_secs(5));

        let target = AddressHash::new_from_slice(b"target");
        let packet = requests.generate(&target, Some([7u8; TAG_LENGTH])).expect("request");
        assert_eq!(packet.header.destination_type, DestinationType::Plain);

        let info = PathRequests::parse(packet.data.as_slice()).expect("parsed");
        assert_eq!(info.target, target);
        assert_eq!(info.requesting_transport, Some(transport_id));
        assert_eq!(info.tag, Some([7u8; TAG_LENGTH]));
    }

    #[test]
    fn rate_limit_suppresses_repeats() {
        let mut requests = PathRequests::new(None, Duration::from_secs(60));
        let target = AddressHash::new_from_slice(b"target");

        assert!(requests.generate(&target, None).is_some());
        assert!(requests.generate(&target, None).is_none());
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(PathRequests::parse(&[0u8; ADDRESS_HASH_SIZE - 1]).is_none());
    }
}
