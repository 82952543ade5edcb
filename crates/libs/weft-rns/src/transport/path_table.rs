use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::{AddressHash, Hash};
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketType, PropagationType,
};

pub struct PathEntry {
    pub timestamp: Instant,
    pub received_from: AddressHash,
    pub hops: u8,
    pub iface: AddressHash,
    pub packet_hash: Hash,
}

/// Destination hash → next hop. O(1) lookup; entries age out on the
/// expiry sweep unless refreshed by a newer announce.
pub struct PathTable {
    map: HashMap<AddressHash, PathEntry>,
}

impl PathTable {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.map.get(destination)
    }

    pub fn has_path(&self, destination: &AddressHash) -> bool {
        self.map.contains_key(destination)
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.map.get(destination).map(|entry| entry.hops)
    }

    pub fn next_hop_iface(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.map.get(destination).map(|entry| entry.iface)
    }

    pub fn expire(&mut self, destination: &AddressHash) {
        self.map.remove(destination);
    }

    /// Drops entries older than `max_age`; returns how many went away.
    pub fn sweep(&mut self, max_age: Duration) -> usize {
        let before = self.map.len();
        let now = Instant::now();
        self.map.retain(|_, entry| now.duration_since(entry.timestamp) <= max_age);
        before - self.map.len()
    }

    pub fn handle_announce(
        &mut self,
        announce: &Packet,
        transport_id: Option<AddressHash>,
        iface: AddressHash,
    ) {
        let hops = announce.header.hops + 1;

        if let Some(existing_entry) = self.map.get(&announce.destination) {
            if hops >= existing_entry.hops {
                // Still refresh the timestamp so a live path does not
                // age out underneath an active conversation.
                if announce.hash() == existing_entry.packet_hash {
                    self.refresh(&announce.destination);
                }
                return;
            }
        }

        let received_from = transport_id.unwrap_or(announce.destination);
        self.map.insert(
            announce.destination,
            PathEntry {
                timestamp: Instant::now(),
                received_from,
                hops,
                iface,
                packet_hash: announce.hash(),
            },
        );

        log::info!(
            "{} is now reachable over {} hops through {} on iface {}",
            announce.destination,
            hops,
            received_from,
            iface,
        );
    }

    pub fn refresh(&mut self, destination: &AddressHash) {
        if let Some(entry) = self.map.get_mut(destination) {
            entry.timestamp = Instant::now();
        }
    }

    /// Routes an outbound packet: direct neighbors keep the short
    /// header, multi-hop paths are promoted to HEADER_2 addressed at
    /// the next transport node.
    pub fn handle_packet(&self, original_packet: &Packet) -> (Packet, Option<AddressHash>) {
        if original_packet.header.header_type == HeaderType::Type2 {
            return (*original_packet, None);
        }

        if original_packet.header.packet_type == PacketType::Announce {
            return (*original_packet, None);
        }

        if original_packet.header.destination_type == DestinationType::Plain
            || original_packet.header.destination_type == DestinationType::Group
        {
            return (*original_packet, None);
        }

        let entry = match self.map.get(&original_packet.destination) {
            Some(entry) => entry,
            None => return (*original_packet, None),
        };

        if entry.hops <= 1 {
            return (*original_packet, Some(entry.iface));
        }

        (
            Packet {
                header: Header {
                    ifac_flag: original_packet.header.ifac_flag,
                    header_type: HeaderType::Type2,
                    context_flag: original_packet.header.context_flag,
                    propagation_type: PropagationType::Transport,
                    destination_type: original_packet.header.destination_type,
                    packet_type: original_packet.header.packet_type,
                    hops: original_packet.header.hops,
                },
                destination: original_packet.destination,
                transport: Some(entry.received_from),
                context: original_packet.context,
                data: original_packet.data,
            },
            Some(entry.iface),
        )
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}
