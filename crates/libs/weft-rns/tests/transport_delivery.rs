use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand_core::OsRng;
use tokio::time::timeout;

use rns::destination::link::LinkEvent;
use rns::destination::{DestinationName, SingleInputDestination};
use rns::hash::AddressHash;
use rns::identity::PrivateIdentity;
use rns::iface::{InterfaceProperties, RxMessage};
use rns::packet::Packet;
use rns::transport::{DeliveryReceipt, ReceiptHandler, Transport, TransportConfig};

/// Wires two transports back to back with an in-memory interface pair.
/// Packets are serialized and reparsed in the middle, so the wire
/// format is exercised on every hop.
async fn connect(a: &Transport, b: &Transport) {
    let chan_a =
        a.iface_manager().lock().await.new_channel(64, InterfaceProperties::default());
    let chan_b =
        b.iface_manager().lock().await.new_channel(64, InterfaceProperties::default());

    let a_address = chan_a.address;
    let b_address = chan_b.address;

    let (a_rx_send, mut a_tx_recv) = chan_a.split();
    let (b_rx_send, mut b_tx_recv) = chan_b.split();

    tokio::spawn(async move {
        while let Some(message) = a_tx_recv.recv().await {
            let Ok(bytes) = message.packet.to_bytes() else { continue };
            let Ok(packet) = Packet::from_bytes(&bytes) else { continue };
            if b_rx_send.send(RxMessage { address: b_address, packet }).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(message) = b_tx_recv.recv().await {
            let Ok(bytes) = message.packet.to_bytes() else { continue };
            let Ok(packet) = Packet::from_bytes(&bytes) else { continue };
            if a_rx_send.send(RxMessage { address: a_address, packet }).await.is_err() {
                break;
            }
        }
    });
}

struct CollectingReceipts(Arc<Mutex<Vec<DeliveryReceipt>>>);

impl ReceiptHandler for CollectingReceipts {
    fn on_receipt(&self, receipt: &DeliveryReceipt) {
        self.0.lock().expect("lock").push(*receipt);
    }
}

#[tokio::test]
async fn announce_reaches_the_peer_and_builds_a_path() {
    let transport_a = Transport::new(TransportConfig::new(
        "announce-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "announce-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("weft", "announce.test"),
    );
    let destination_hash = destination.desc.address_hash;
    let registered = transport_b.register_destination(destination).await;

    let mut announces = transport_a.recv_announces();
    transport_b.send_announce(&registered, Some(b"hello mesh")).await;

    let event = timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce within deadline")
        .expect("announce event");

    assert_eq!(event.destination_hash, destination_hash);
    assert_eq!(event.app_data.as_slice(), b"hello mesh");
    assert!(transport_a.knows_destination(&destination_hash).await);
    assert!(transport_a.has_path(&destination_hash).await);
}

#[tokio::test]
async fn link_data_round_trip_with_delivery_receipt() {
    let transport_a = Transport::new(TransportConfig::new(
        "link-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "link-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    let receipts = Arc::new(Mutex::new(Vec::new()));
    transport_a
        .set_receipt_handler(Box::new(CollectingReceipts(receipts.clone())))
        .await;

    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("weft", "link.test"),
    );
    let registered = transport_b.register_destination(destination).await;

    let mut announces = transport_a.recv_announces();
    transport_b.send_announce(&registered, None).await;
    let event = timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce within deadline")
        .expect("announce event");

    let desc = event.destination.lock().await.desc;
    let mut b_link_events = transport_b.link_events();

    let link = transport_a
        .establish_link(desc, Duration::from_secs(5))
        .await
        .expect("link active");
    let link_id = *link.lock().await.id();

    let payload_received = timeout(Duration::from_secs(5), async {
        transport_a.send_on_link(&link_id, b"across the mesh").await.expect("sent");
        loop {
            let event = b_link_events.recv().await.expect("link event");
            if let LinkEvent::Data(payload) = event.event {
                return payload.as_slice().to_vec();
            }
        }
    })
    .await
    .expect("payload within deadline");

    assert_eq!(payload_received, b"across the mesh");

    // The peer proves the packet; the receipt surfaces the round trip.
    timeout(Duration::from_secs(5), async {
        loop {
            if !receipts.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("receipt within deadline");
}

#[tokio::test]
async fn channel_messages_flow_in_order_over_a_link() {
    let transport_a = Transport::new(TransportConfig::new(
        "channel-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "channel-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("weft", "channel.test"),
    );
    let registered = transport_b.register_destination(destination).await;

    let mut announces = transport_a.recv_announces();
    let mut b_link_events = transport_b.link_events();
    transport_b.send_announce(&registered, None).await;
    let event = timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce within deadline")
        .expect("announce event");
    let desc = event.destination.lock().await.desc;

    let link = transport_a
        .establish_link(desc, Duration::from_secs(5))
        .await
        .expect("link active");
    let link_id = *link.lock().await.id();

    // The responder learns the link id from its own Activated event.
    let b_link_id = timeout(Duration::from_secs(5), async {
        loop {
            let event = b_link_events.recv().await.expect("link event");
            if matches!(event.event, LinkEvent::Activated) {
                return event.id;
            }
        }
    })
    .await
    .expect("responder link id");
    assert_eq!(b_link_id, link_id);

    let channel_a = transport_a.attach_channel(&link_id).await.expect("channel a");
    let channel_b = transport_b.attach_channel(&link_id).await.expect("channel b");

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        let mut channel_b = channel_b.lock().expect("lock");
        channel_b.register_type(0x0001).expect("registered");
        channel_b.add_handler(move |envelope| {
            if envelope.msg_type == 0x0001 {
                received.lock().expect("lock").push(envelope.payload.clone());
                true
            } else {
                false
            }
        });
    }

    {
        let mut channel_a = channel_a.lock().expect("lock");
        channel_a.register_type(0x0001).expect("registered");
        channel_a.send(0x0001, b"first".to_vec()).expect("sent");
        channel_a.send(0x0001, b"second".to_vec()).expect("sent");
    }

    timeout(Duration::from_secs(5), async {
        loop {
            if received.lock().expect("lock").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("channel messages within deadline");

    assert_eq!(*received.lock().expect("lock"), vec![b"first".to_vec(), b"second".to_vec()]);

    // Delivery proofs slide the sender's window back open.
    timeout(Duration::from_secs(5), async {
        loop {
            if channel_a.lock().expect("lock").outstanding() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("window drained within deadline");
}

#[tokio::test]
async fn resource_transfer_over_linked_transports() {
    let transport_a = Transport::new(TransportConfig::new(
        "resource-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "resource-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    transport_b
        .set_resource_strategy(rns::resource::ResourceStrategy::AcceptAll)
        .await;

    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("weft", "resource.test"),
    );
    let registered = transport_b.register_destination(destination).await;

    let mut announces = transport_a.recv_announces();
    transport_b.send_announce(&registered, None).await;
    let event = timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce within deadline")
        .expect("announce event");
    let desc = event.destination.lock().await.desc;

    let link = transport_a
        .establish_link(desc, Duration::from_secs(5))
        .await
        .expect("link active");
    let link_id = *link.lock().await.id();

    let mut a_resource_events = transport_a.resource_events();
    let mut b_resource_events = transport_b.resource_events();

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    transport_a
        .send_resource(&link_id, data.clone(), None)
        .await
        .expect("resource started");

    let received = timeout(Duration::from_secs(10), async {
        loop {
            let event = b_resource_events.recv().await.expect("resource event");
            if let rns::resource::ResourceEventKind::Complete(complete) = event.kind {
                return complete.data;
            }
        }
    })
    .await
    .expect("resource within deadline");

    assert_eq!(received, data);

    timeout(Duration::from_secs(10), async {
        loop {
            let event = a_resource_events.recv().await.expect("resource event");
            if matches!(event.kind, rns::resource::ResourceEventKind::OutboundComplete) {
                return;
            }
        }
    })
    .await
    .expect("outbound completion within deadline");
}

#[tokio::test]
async fn teardown_is_observed_by_the_peer() {
    let transport_a = Transport::new(TransportConfig::new(
        "teardown-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "teardown-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("weft", "teardown.test"),
    );
    let registered = transport_b.register_destination(destination).await;

    let mut announces = transport_a.recv_announces();
    transport_b.send_announce(&registered, None).await;
    let event = timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce within deadline")
        .expect("announce event");
    let desc = event.destination.lock().await.desc;

    let link = transport_a
        .establish_link(desc, Duration::from_secs(5))
        .await
        .expect("link active");
    let link_id = *link.lock().await.id();

    let mut b_link_events = transport_b.link_events();
    transport_a.teardown_link(&link_id).await;

    timeout(Duration::from_secs(5), async {
        loop {
            let event = b_link_events.recv().await.expect("link event");
            if matches!(event.event, LinkEvent::Closed) && event.id == link_id {
                return;
            }
        }
    })
    .await
    .expect("peer observed teardown");

    assert!(transport_b.find_link(&link_id).await.is_none() || {
        // The handler prunes on its next tick; the closed status is
        // what matters.
        let link = transport_b.find_link(&link_id).await.expect("link");
        let status = link.lock().await.status();
        status == rns::destination::link::LinkStatus::Closed
    });
}

#[tokio::test]
async fn path_request_triggers_a_path_response() {
    let transport_a = Transport::new(TransportConfig::new(
        "pathreq-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "pathreq-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("weft", "pathreq.test"),
    );
    let destination_hash = destination.desc.address_hash;
    let _registered = transport_b.register_destination(destination).await;

    // No announce has happened; request the path explicitly.
    let mut announces = transport_a.recv_announces();
    transport_a.request_path(&destination_hash).await;

    let event = timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("path response within deadline")
        .expect("announce event");

    assert_eq!(event.destination_hash, destination_hash);
    assert!(transport_a.has_path(&destination_hash).await);
}

#[tokio::test]
async fn unknown_destination_is_ignored() {
    let transport_a = Transport::new(TransportConfig::new(
        "ignore-a",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    let transport_b = Transport::new(TransportConfig::new(
        "ignore-b",
        PrivateIdentity::new_from_rand(OsRng),
    ));
    connect(&transport_a, &transport_b).await;

    let stranger = AddressHash::new_from_slice(b"nobody home");
    let outcome = transport_a.send_opportunistic(&stranger, b"anyone?").await;

    assert_eq!(
        outcome,
        rns::transport::SendPacketOutcome::DroppedMissingDestinationIdentity
    );
}
