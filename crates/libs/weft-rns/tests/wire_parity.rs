use rns::buffer::OutputBuffer;
use rns::hash::AddressHash;
use rns::iface::framing::{Hdlc, HdlcDeframer, Kiss, KissDeframer};
use rns::packet::{Packet, PacketDataBuffer};

#[test]
fn header_1_data_packet_layout() {
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

    // flags + hops + destination + context + payload
    assert_eq!(bytes.len(), 1 + 1 + 16 + 1 + 5);
    assert_eq!(bytes[0], 0x00);
    assert_eq!(&bytes[2..18], &dest);
    assert_eq!(&bytes[19..], b"Hello");

    let unpacked = Packet::from_bytes(&bytes).expect("unpacked");
    assert_eq!(unpacked, packet);
    assert_eq!(unpacked.truncated_hash().as_slice(), &packet.hash().as_slice()[..16]);
}

#[test]
fn hops_are_excluded_from_the_packet_hash() {
    let mut packet = Packet {
        destination: AddressHash::new_from_slice(b"destination"),
        data: PacketDataBuffer::new_from_slice(b"payload"),
        ..Default::default()
    };
    let hash_at_origin = packet.hash();

    packet.header.hops = 7;
    assert_eq!(packet.hash(), hash_at_origin);
}

#[test]
fn hdlc_escaping_matches_reference_bytes() {
    let framed = Hdlc::frame(&[0x7E, 0x01, 0x7D]);
    assert_eq!(framed, vec![0x7E, 0x7D, 0x5E, 0x01, 0x7D, 0x5D, 0x7E]);
}

#[test]
fn hdlc_frame_survives_packet_round_trip() {
    let packet = Packet {
        destination: AddressHash::new_from_slice(b"destination"),
        data: PacketDataBuffer::new_from_slice(&[0x7E, 0x7D, 0x20, 0x00, 0xFF]),
        ..Default::default()
    };
    let raw = packet.to_bytes().expect("packed");

    let mut backing = vec![0u8; raw.len() * 2 + 2];
    let framed_len = {
        let mut buffer = OutputBuffer::new(&mut backing);
        Hdlc::encode(&raw, &mut buffer).expect("framed")
    };

    let mut deframer = HdlcDeframer::new();
    let mut recovered = Vec::new();
    deframer.push(&backing[..framed_len], |frame| recovered.push(frame.to_vec()));

    assert_eq!(recovered.len(), 1);
    let unpacked = Packet::from_bytes(&recovered[0]).expect("unpacked");
    assert_eq!(unpacked, packet);
}

#[test]
fn kiss_frame_survives_byte_at_a_time_delivery() {
    let payload: Vec<u8> = (0..=255u16).map(|value| value as u8).collect();
    let framed = Kiss::frame(&payload);

    let mut deframer = KissDeframer::new();
    let mut recovered = Vec::new();
    for byte in framed {
        deframer.push(&[byte], |cmd, frame| recovered.push((cmd, frame.to_vec())));
    }

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].0, 0x00);
    assert_eq!(recovered[0].1, payload);
}
