use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tokio::time::timeout;

use lxmf::message::{DeliveryMethod, Message};
use lxmf::router::{InboundMessage, LxmRouter, RouterConfig};
use rns::hash::AddressHash;
use rns::identity::PrivateIdentity;
use rns::iface::{InterfaceProperties, RxMessage};
use rns::packet::Packet;
use rns::transport::{Transport, TransportConfig};

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

fn fast_config() -> RouterConfig {
    RouterConfig {
        processing_interval: Duration::from_millis(100),
        delivery_retry_wait: Duration::from_millis(600),
        path_request_wait: Duration::from_millis(400),
        stale_path_wait: Duration::from_millis(50),
        link_establishment_timeout: Duration::from_secs(5),
        ..RouterConfig::default()
    }
}

struct Peer {
    transport: Arc<Transport>,
    router: LxmRouter,
    identity: PrivateIdentity,
    delivery_hash: AddressHash,
    destination: Arc<tokio::sync::Mutex<rns::destination::SingleInputDestination>>,
}

async fn peer(name: &str, config: RouterConfig) -> Peer {
    let identity = PrivateIdentity::new_from_rand(OsRng);
    let transport = Arc::new(Transport::new(TransportConfig::new(
        name,
        PrivateIdentity::new_from_rand(OsRng),
    )));
    let router = LxmRouter::new(transport.clone(), config).await;
    let destination = router.register_delivery_identity(identity.clone()).await;
    let delivery_hash = destination.lock().await.desc.address_hash;

    Peer { transport, router, identity, delivery_hash, destination }
}

#[tokio::test]
async fn direct_delivery_round_trip() {
    let sender = peer("direct-sender", fast_config()).await;
    let receiver = peer("direct-receiver", fast_config()).await;
    connect(&sender.transport, &receiver.transport).await;

    let inbound: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let inbound = inbound.clone();
        receiver.router.set_inbound_callback(move |message| {
            inbound.lock().expect("lock").push(message);
        });
    }

    let delivered = Arc::new(Mutex::new(0usize));
    {
        let delivered = delivered.clone();
        sender.router.set_delivery_callback(move |_| {
            *delivered.lock().expect("lock") += 1;
        });
    }

    // Both sides announce so identities and paths are known and the
    // receiver can verify the sender's signature.
    receiver.router.announce(&receiver.destination).await;
    sender.router.announce(&sender.destination).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut message =
        Message::new(receiver.delivery_hash, sender.delivery_hash, DeliveryMethod::Direct);
    message.set_content_from_string("hi");
    sender
        .router
        .handle_outbound(&message, &sender.identity)
        .await
        .expect("queued");

    timeout(Duration::from_secs(15), async {
        loop {
            if *delivered.lock().expect("lock") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("delivery callback within deadline");

    let received = inbound.lock().expect("lock");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].wire.payload.content, b"hi");
    assert!(received[0].signature_verified);
    assert_eq!(sender.router.pending_count().await, 0);
}

#[tokio::test]
async fn opportunistic_delivery_waits_for_announce() {
    let sender = peer("opp-sender", fast_config()).await;
    let receiver = peer("opp-receiver", fast_config()).await;
    connect(&sender.transport, &receiver.transport).await;

    let inbound: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let inbound = inbound.clone();
        receiver.router.set_inbound_callback(move |message| {
            inbound.lock().expect("lock").push(message);
        });
    }

    // The receiver has not announced: the sender cannot know the
    // destination identity yet.
    let mut message = Message::new(
        receiver.delivery_hash,
        sender.delivery_hash,
        DeliveryMethod::Opportunistic,
    );
    message.set_content_from_string("eventually");
    let message_id = sender
        .router
        .handle_outbound(&message, &sender.identity)
        .await
        .expect("queued");

    // After the first pathless attempt the message backs off.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let next_attempt = sender
        .router
        .next_delivery_attempt(&message_id)
        .await
        .expect("still pending");
    assert!(next_attempt > Instant::now());

    // The announce wakes the message for immediate reprocessing.
    receiver.router.announce(&receiver.destination).await;

    timeout(Duration::from_secs(10), async {
        loop {
            if !inbound.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("opportunistic delivery within deadline");

    let received = inbound.lock().expect("lock");
    assert_eq!(received[0].wire.payload.content, b"eventually");
    assert_eq!(sender.router.pending_count().await, 0);
}

#[tokio::test]
async fn duplicate_inbound_messages_are_suppressed() {
    let sender = peer("dup-sender", fast_config()).await;
    let receiver = peer("dup-receiver", fast_config()).await;
    connect(&sender.transport, &receiver.transport).await;

    let inbound_count = Arc::new(Mutex::new(0usize));
    {
        let inbound_count = inbound_count.clone();
        receiver.router.set_inbound_callback(move |_| {
            *inbound_count.lock().expect("lock") += 1;
        });
    }

    receiver.router.announce(&receiver.destination).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut message = Message::new(
        receiver.delivery_hash,
        sender.delivery_hash,
        DeliveryMethod::Opportunistic,
    );
    message.timestamp = Some(1_700_000_000.0);
    message.set_content_from_string("once only");

    // Queue the identical message twice; the ids collide and the
    // receiver must deliver exactly once.
    sender
        .router
        .handle_outbound(&message, &sender.identity)
        .await
        .expect("queued");

    timeout(Duration::from_secs(10), async {
        loop {
            if *inbound_count.lock().expect("lock") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("first delivery within deadline");

    sender
        .router
        .handle_outbound(&message, &sender.identity)
        .await
        .expect("queued again");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*inbound_count.lock().expect("lock"), 1);
}

#[tokio::test]
async fn failed_callback_fires_when_attempts_exhaust() {
    let config = RouterConfig {
        processing_interval: Duration::from_millis(50),
        delivery_retry_wait: Duration::from_millis(60),
        path_request_wait: Duration::from_millis(60),
        stale_path_wait: Duration::from_millis(10),
        max_delivery_attempts: 3,
        ..RouterConfig::default()
    };
    let sender = peer("fail-sender", config).await;

    let failed = Arc::new(Mutex::new(0usize));
    {
        let failed = failed.clone();
        sender.router.set_failed_callback(move |_| {
            *failed.lock().expect("lock") += 1;
        });
    }

    // Nobody out there: the destination never announces.
    let ghost = AddressHash::new_from_slice(b"ghost destination");
    let mut message = Message::new(ghost, sender.delivery_hash, DeliveryMethod::Opportunistic);
    message.set_content_from_string("into the void");
    sender
        .router
        .handle_outbound(&message, &sender.identity)
        .await
        .expect("queued");

    timeout(Duration::from_secs(10), async {
        loop {
            if *failed.lock().expect("lock") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("failed callback within deadline");

    assert_eq!(sender.router.pending_count().await, 0);
}
