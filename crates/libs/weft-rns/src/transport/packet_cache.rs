use std::cmp::min;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::Hash;
use crate::packet::Packet;

struct PacketTrack {
    time: Instant,
    min_hops: u8,
}

/// Deduplication cache keyed by packet hash. Forwarders use the
/// min-hops record to recognize better paths; everyone uses it to shed
/// duplicates.
pub struct PacketCache {
    map: HashMap<Hash, PacketTrack>,
}

impl PacketCache {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn release(&mut self, keep_for: Duration) {
        let now = Instant::now();
        self.map.retain(|_, track| now.duration_since(track.time) <= keep_for);
    }

    /// Records the packet; true when it has not been seen before.
    pub fn update(&mut self, packet: &Packet) -> bool {
        let hash = packet.hash();

        match self.map.get_mut(&hash) {
            Some(track) => {
                track.time = Instant::now();
                track.min_hops = min(packet.header.hops, track.min_hops);
                false
            }
            None => {
                self.map
                    .insert(hash, PacketTrack { time: Instant::now(), min_hops: packet.header.hops });
                true
            }
        }
    }
}

impl Default for PacketCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::AddressHash;
    use crate::packet::PacketDataBuffer;

    #[test]
    fn duplicate_detection_ignores_hops() {
        let mut cache = PacketCache::new();
        let mut packet = Packet {
            destination: AddressHash::new_from_slice(b"destination"),
            data: PacketDataBuffer::new_from_slice(b"payload"),
            ..Default::default()
        };

        assert!(cache.update(&packet));
        packet.header.hops = 3;
        assert!(!cache.update(&packet));
    }

    #[test]
    fn release_drops_old_entries() {
        let mut cache = PacketCache::new();
        let packet = Packet::default();
        cache.update(&packet);

        cache.release(Duration::from_secs(0));
        assert!(cache.update(&packet));
    }
}
