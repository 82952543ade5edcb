use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::destination::link::LinkId;
use crate::hash::AddressHash;
use crate::packet::{Header, HeaderType, IfacFlag, Packet};

/// Forwarding bookkeeping for links this node carries as a transport
/// hop. Entries start unvalidated and are confirmed by the link proof
/// travelling back toward the initiator.
#[allow(dead_code)]
pub struct LinkEntry {
    pub timestamp: Instant,
    pub proof_timeout: Instant,
    pub next_hop: AddressHash,
    pub next_hop_iface: AddressHash,
    pub received_from: AddressHash,
    pub original_destination: AddressHash,
    pub taken_hops: u8,
    pub remaining_hops: u8,
    pub validated: bool,
}

fn send_backwards(packet: &Packet, entry: &LinkEntry) -> (Packet, AddressHash) {
    let propagated = Packet {
        header: Header {
            ifac_flag: IfacFlag::Authenticated,
            header_type: HeaderType::Type2,
            context_flag: packet.header.context_flag,
            propagation_type: packet.header.propagation_type,
            destination_type: packet.header.destination_type,
            packet_type: packet.header.packet_type,
            hops: packet.header.hops + 1,
        },
        destination: packet.destination,
        transport: Some(entry.next_hop),
        context: packet.context,
        data: packet.data,
    };

    (propagated, entry.received_from)
}

pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    proof_timeout: Duration,
    idle_timeout: Duration,
}

impl LinkTable {
    pub fn new(proof_timeout: Duration, idle_timeout: Duration) -> Self {
        Self { entries: HashMap::new(), proof_timeout, idle_timeout }
    }

    pub fn add(
        &mut self,
        link_request: &Packet,
        destination: AddressHash,
        received_from: AddressHash,
        next_hop: AddressHash,
        iface: AddressHash,
    ) {
        let link_id = LinkId::from(link_request);

        if self.entries.contains_key(&link_id) {
            return;
        }

        let now = Instant::now();
        self.entries.insert(
            link_id,
            LinkEntry {
                timestamp: now,
                proof_timeout: now + self.proof_timeout,
                next_hop,
                next_hop_iface: iface,
                received_from,
                original_destination: destination,
                taken_hops: link_request.header.hops + 1,
                remaining_hops: 0,
                validated: false,
            },
        );
    }

    pub fn contains(&self, link_id: &LinkId) -> bool {
        self.entries.contains_key(link_id)
    }

    pub fn original_destination(&self, link_id: &LinkId) -> Option<AddressHash> {
        self.entries.get(link_id).filter(|entry| entry.validated).map(|e| e.original_destination)
    }

    /// Keep-alives travelling through refresh the entry and bounce back
    /// toward the initiator.
    pub fn handle_keepalive(&mut self, packet: &Packet) -> Option<(Packet, AddressHash)> {
        let entry = self.entries.get_mut(&packet.destination)?;
        entry.timestamp = Instant::now();
        Some(send_backwards(packet, entry))
    }

    pub fn handle_proof(&mut self, proof: &Packet) -> Option<(Packet, AddressHash)> {
        let entry = self.entries.get_mut(&proof.destination)?;
        entry.remaining_hops = proof.header.hops;
        entry.validated = true;
        entry.timestamp = Instant::now();
        Some(send_backwards(proof, entry))
    }

    pub fn remove_stale(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| {
            if entry.validated {
                entry.timestamp + self.idle_timeout > now
            } else {
                entry.proof_timeout > now
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::AddressHash;
    use crate::packet::{PacketContext, PacketDataBuffer, PacketType};

    fn link_request() -> Packet {
        Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            destination: AddressHash::new_from_slice(b"destination"),
            transport: None,
            context: PacketContext::None,
            data: PacketDataBuffer::new_from_slice(&[1u8; 64]),
        }
    }

    #[test]
    fn proof_validates_entry_and_bounces_backwards() {
        let request = link_request();
        let mut table = LinkTable::new(Duration::from_secs(10), Duration::from_secs(60));
        table.add(
            &request,
            request.destination,
            AddressHash::new_from_slice(b"previous"),
            AddressHash::new_from_slice(b"next"),
            AddressHash::new_from_slice(b"iface"),
        );

        let link_id = LinkId::from(&request);
        let proof = Packet {
            header: Header { packet_type: PacketType::Proof, ..Default::default() },
            destination: link_id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: PacketDataBuffer::new(),
        };

        let (bounced, toward) = table.handle_proof(&proof).expect("forwarded proof");
        assert_eq!(toward, AddressHash::new_from_slice(b"previous"));
        assert_eq!(bounced.header.header_type, HeaderType::Type2);
        assert_eq!(bounced.header.hops, 1);
        assert_eq!(table.original_destination(&link_id), Some(request.destination));
    }

    #[test]
    fn unvalidated_entries_expire_on_proof_timeout() {
        let request = link_request();
        let mut table = LinkTable::new(Duration::from_secs(0), Duration::from_secs(60));
        table.add(
            &request,
            request.destination,
            AddressHash::new_from_slice(b"previous"),
            AddressHash::new_from_slice(b"next"),
            AddressHash::new_from_slice(b"iface"),
        );

        table.remove_stale();
        assert!(!table.contains(&LinkId::from(&request)));
    }
}
