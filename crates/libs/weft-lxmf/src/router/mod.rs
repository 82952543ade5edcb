use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use rns::destination::link::{LinkEvent, LinkStatus};
use rns::destination::{DestinationName, SingleInputDestination};
use rns::hash::{AddressHash, Hash};
use rns::identity::PrivateIdentity;
use rns::packet::PacketContext;
use rns::resource::{ResourceEventKind, ResourceStrategy};
use rns::transport::{DeliveryReceipt, ReceiptHandler, SendPacketOutcome, Transport};

use crate::constants::{
    APP_NAME, DEDUP_TTL_SECS, DELIVERY_ASPECT, DELIVERY_RETRY_WAIT_SECS, DESTINATION_LENGTH,
    MAX_DELIVERY_ATTEMPTS, MAX_PATHLESS_TRIES, PATH_REQUEST_WAIT_SECS, PROCESSING_INTERVAL_SECS,
    STALE_PATH_WAIT_MILLIS, STAMP_COST_TARGET_DEFAULT,
};
use crate::error::LxmfError;
use crate::message::{DeliveryMethod, Message, MessageId, MessageState, WireMessage};
use crate::stamper;

pub struct RouterConfig {
    pub processing_interval: Duration,
    pub delivery_retry_wait: Duration,
    pub path_request_wait: Duration,
    pub stale_path_wait: Duration,
    pub max_delivery_attempts: u32,
    pub max_pathless_tries: u32,
    pub link_establishment_timeout: Duration,
    pub stamp_cost_target: u8,
    pub stamp_search_rounds: usize,
    pub require_stamps: bool,
    pub dedup_ttl: Duration,
    /// Destination hash of the propagation node accepting custody of
    /// PROPAGATED messages.
    pub propagation_node: Option<AddressHash>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(PROCESSING_INTERVAL_SECS),
            delivery_retry_wait: Duration::from_secs(DELIVERY_RETRY_WAIT_SECS),
            path_request_wait: Duration::from_secs(PATH_REQUEST_WAIT_SECS),
            stale_path_wait: Duration::from_millis(STALE_PATH_WAIT_MILLIS),
            max_delivery_attempts: MAX_DELIVERY_ATTEMPTS,
            max_pathless_tries: MAX_PATHLESS_TRIES,
            link_establishment_timeout: Duration::from_secs(15),
            stamp_cost_target: STAMP_COST_TARGET_DEFAULT,
            stamp_search_rounds: 4_000_000,
            require_stamps: false,
            dedup_ttl: Duration::from_secs(DEDUP_TTL_SECS),
            propagation_node: None,
        }
    }
}

/// A verified (or verifiably-unverifiable) inbound message handed to
/// the registered delivery callback.
#[derive(Clone)]
pub struct InboundMessage {
    pub wire: WireMessage,
    pub message_id: MessageId,
    pub destination: AddressHash,
    pub source: AddressHash,
    /// False when the source identity has not been seen on the network
    /// yet, so the signature could not be checked.
    pub signature_verified: bool,
    pub stamp_value: Option<u32>,
}

pub type DeliveryCallback = Arc<dyn Fn(&WireMessage) + Send + Sync>;
pub type FailedCallback = Arc<dyn Fn(&WireMessage) + Send + Sync>;
pub type InboundCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct OutboundEntry {
    wire: WireMessage,
    method: DeliveryMethod,
    state: MessageState,
    attempts: u32,
    next_attempt: Instant,
    establishing: bool,
    tracked_packet: Option<Hash>,
    tracked_resource: Option<Hash>,
}

struct RouterState {
    delivery_destinations: HashMap<AddressHash, Arc<Mutex<SingleInputDestination>>>,
    pending: HashMap<MessageId, OutboundEntry>,
    links: HashMap<AddressHash, AddressHash>,
    recent: HashMap<MessageId, Instant>,
}

struct Shared {
    transport: Arc<Transport>,
    config: RouterConfig,
    state: Mutex<RouterState>,
    delivery_callback: std::sync::Mutex<Option<DeliveryCallback>>,
    failed_callback: std::sync::Mutex<Option<FailedCallback>>,
    inbound_callback: std::sync::Mutex<Option<InboundCallback>>,
}

struct ReceiptBridge(mpsc::UnboundedSender<DeliveryReceipt>);

impl ReceiptHandler for ReceiptBridge {
    fn on_receipt(&self, receipt: &DeliveryReceipt) {
        let _ = self.0.send(*receipt);
    }
}

/// The delivery engine: owns registered delivery identities, the
/// pending outbound queue, and the processing tick that drives the
/// three delivery methods.
pub struct LxmRouter {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl LxmRouter {
    pub async fn new(transport: Arc<Transport>, config: RouterConfig) -> Self {
        // Messages larger than the link MDU arrive as resources; the
        // router accepts those transfers on its links.
        transport.set_resource_strategy(ResourceStrategy::AcceptAll).await;

        let shared = Arc::new(Shared {
            transport: transport.clone(),
            config,
            state: Mutex::new(RouterState {
                delivery_destinations: HashMap::new(),
                pending: HashMap::new(),
                links: HashMap::new(),
                recent: HashMap::new(),
            }),
            delivery_callback: std::sync::Mutex::new(None),
            failed_callback: std::sync::Mutex::new(None),
            inbound_callback: std::sync::Mutex::new(None),
        });

        let cancel = CancellationToken::new();

        let (receipt_tx, receipt_rx) = mpsc::unbounded_channel();
        transport.set_receipt_handler(Box::new(ReceiptBridge(receipt_tx))).await;

        tokio::spawn(run_processing_loop(shared.clone(), cancel.clone()));
        tokio::spawn(run_announce_task(shared.clone(), cancel.clone()));
        tokio::spawn(run_receipt_task(shared.clone(), receipt_rx, cancel.clone()));
        tokio::spawn(run_received_data_task(shared.clone(), cancel.clone()));
        tokio::spawn(run_resource_events_task(shared.clone(), cancel.clone()));
        tokio::spawn(run_link_events_task(shared.clone(), cancel.clone()));

        Self { shared, cancel }
    }

    pub fn set_delivery_callback<F>(&self, callback: F)
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.delivery_callback.lock() {
            *slot = Some(Arc::new(callback));
        }
    }

    pub fn set_failed_callback<F>(&self, callback: F)
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.failed_callback.lock() {
            *slot = Some(Arc::new(callback));
        }
    }

    pub fn set_inbound_callback<F>(&self, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.inbound_callback.lock() {
            *slot = Some(Arc::new(callback));
        }
    }

    /// Creates and registers an `lxmf.delivery` destination for the
    /// identity. Inbound messages addressed to it reach the inbound
    /// callback after verification.
    pub async fn register_delivery_identity(
        &self,
        identity: PrivateIdentity,
    ) -> Arc<Mutex<SingleInputDestination>> {
        let mut destination = SingleInputDestination::new(
            identity,
            DestinationName::new(APP_NAME, DELIVERY_ASPECT),
        );
        destination.enable_ratchets();
        let address = destination.desc.address_hash;

        let registered = self.shared.transport.register_destination(destination).await;
        self.shared
            .state
            .lock()
            .await
            .delivery_destinations
            .insert(address, registered.clone());
        registered
    }

    pub async fn announce(&self, destination: &Arc<Mutex<SingleInputDestination>>) {
        self.shared.transport.send_announce(destination, None).await;
    }

    /// Queues a message for delivery and returns its id. PROPAGATED
    /// messages get a stamp generated against the configured cost
    /// before they enter the queue.
    pub async fn handle_outbound(
        &self,
        message: &Message,
        signer: &PrivateIdentity,
    ) -> Result<MessageId, LxmfError> {
        let mut wire = message.to_wire(signer)?;

        if message.method == DeliveryMethod::Propagated && wire.payload.stamp.is_none() {
            let workblock = stamper::message_workblock(&wire.message_id());
            if let Some((stamp, value)) = stamper::generate_stamp(
                &workblock,
                self.shared.config.stamp_cost_target as u32,
                self.shared.config.stamp_search_rounds,
            ) {
                log::debug!("lxmf: stamp generated with value {}", value);
                wire.payload.stamp = Some(stamp);
            } else {
                return Err(LxmfError::InvalidStamp);
            }
        }

        // The stamp rides outside the signed part, so packing stays
        // valid after attachment.
        wire.pack()?;

        let message_id = wire.message_id();
        let entry = OutboundEntry {
            wire,
            method: message.method,
            state: MessageState::Outbound,
            attempts: 0,
            next_attempt: Instant::now(),
            establishing: false,
            tracked_packet: None,
            tracked_resource: None,
        };

        self.shared.state.lock().await.pending.insert(message_id, entry);
        Ok(message_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    pub async fn message_state(&self, message_id: &MessageId) -> Option<MessageState> {
        self.shared.state.lock().await.pending.get(message_id).map(|entry| entry.state)
    }

    pub async fn next_delivery_attempt(&self, message_id: &MessageId) -> Option<Instant> {
        self.shared.state.lock().await.pending.get(message_id).map(|entry| entry.next_attempt)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LxmRouter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn destination_bytes(wire: &WireMessage) -> AddressHash {
    AddressHash::try_from_slice(&wire.destination).unwrap_or_default()
}

fn now_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

async fn run_processing_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let interval = shared
            .config
            .processing_interval
            .mul_f64(shared.transport.throttle().get());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                process_pending(&shared).await;
                prune_recent(&shared).await;
            }
        }
    }
}

async fn process_pending(shared: &Arc<Shared>) {
    let now = Instant::now();
    let due: Vec<MessageId> = {
        let state = shared.state.lock().await;
        state
            .pending
            .iter()
            .filter(|(_, entry)| entry.next_attempt <= now && !entry.establishing)
            .map(|(id, _)| *id)
            .collect()
    };

    for message_id in due {
        process_message(shared, message_id).await;
    }
}

async fn process_message(shared: &Arc<Shared>, message_id: MessageId) {
    let (method, state, destination) = {
        let state = shared.state.lock().await;
        let Some(entry) = state.pending.get(&message_id) else { return };
        (entry.method, entry.state, destination_bytes(&entry.wire))
    };

    // A message still in Sent when its deadline lapses never got its
    // proof; it goes back through the normal attempt path.
    if state == MessageState::Sent {
        let mut guard = shared.state.lock().await;
        if let Some(entry) = guard.pending.get_mut(&message_id) {
            entry.state = MessageState::Outbound;
            entry.tracked_packet = None;
            entry.tracked_resource = None;
        }
    }

    match method {
        DeliveryMethod::Direct => process_direct(shared, message_id, destination).await,
        DeliveryMethod::Opportunistic => {
            process_opportunistic(shared, message_id, destination).await
        }
        DeliveryMethod::Propagated => process_propagated(shared, message_id).await,
    }
}

async fn process_direct(shared: &Arc<Shared>, message_id: MessageId, destination: AddressHash) {
    let link_id = {
        let state = shared.state.lock().await;
        state.links.get(&destination).copied()
    };

    // An established link may have died since we cached it.
    let active_link = match link_id {
        Some(link_id) => match shared.transport.find_link(&link_id).await {
            Some(link) if link.lock().await.status() == LinkStatus::Active => Some((link_id, link)),
            _ => {
                shared.state.lock().await.links.remove(&destination);
                None
            }
        },
        None => None,
    };

    if let Some((link_id, link)) = active_link {
        let (stripped, mdu) = {
            let state = shared.state.lock().await;
            let Some(entry) = state.pending.get(&message_id) else { return };
            let Ok(stripped) = entry.wire.pack_without_destination() else {
                drop(state);
                fail_message(shared, message_id).await;
                return;
            };
            (stripped, link.lock().await.mdu())
        };

        if stripped.len() <= mdu {
            match shared.transport.send_on_link(&link_id, &stripped).await {
                Ok(packet_hash) => {
                    bump_attempt(shared, message_id, MessageState::Sent, |entry| {
                        entry.tracked_packet = Some(packet_hash);
                    })
                    .await;
                }
                Err(_) => {
                    bump_attempt(shared, message_id, MessageState::Outbound, |_| {}).await;
                }
            }
        } else {
            match shared.transport.send_resource(&link_id, stripped, None).await {
                Ok(resource_hash) => {
                    bump_attempt(shared, message_id, MessageState::Sent, |entry| {
                        entry.tracked_resource = Some(resource_hash);
                    })
                    .await;
                }
                Err(_) => {
                    bump_attempt(shared, message_id, MessageState::Outbound, |_| {}).await;
                }
            }
        }
        return;
    }

    if shared.transport.knows_destination(&destination).await {
        establish_link_for(shared, message_id, destination).await;
    } else {
        pathless_attempt(shared, message_id, destination).await;
    }
}

async fn process_opportunistic(
    shared: &Arc<Shared>,
    message_id: MessageId,
    destination: AddressHash,
) {
    if shared.transport.knows_destination(&destination).await {
        let stripped = {
            let state = shared.state.lock().await;
            let Some(entry) = state.pending.get(&message_id) else { return };
            entry.wire.pack_without_destination().ok()
        };
        let Some(stripped) = stripped else {
            fail_message(shared, message_id).await;
            return;
        };

        let outcome = shared.transport.send_opportunistic(&destination, &stripped).await;
        match outcome {
            SendPacketOutcome::SentDirect | SendPacketOutcome::SentBroadcast => {
                shared.state.lock().await.pending.remove(&message_id);
                log::debug!("lxmf: opportunistic message sent to {}", destination);
            }
            _ => {
                bump_attempt(shared, message_id, MessageState::Outbound, |_| {}).await;
            }
        }
        return;
    }

    pathless_attempt(shared, message_id, destination).await;
}

async fn process_propagated(shared: &Arc<Shared>, message_id: MessageId) {
    let Some(node) = shared.config.propagation_node else {
        log::warn!("lxmf: propagated message queued without a propagation node");
        fail_message(shared, message_id).await;
        return;
    };

    let link_id = {
        let state = shared.state.lock().await;
        state.links.get(&node).copied()
    };

    let active_link = match link_id {
        Some(link_id) => match shared.transport.find_link(&link_id).await {
            Some(link) if link.lock().await.status() == LinkStatus::Active => Some(link_id),
            _ => {
                shared.state.lock().await.links.remove(&node);
                None
            }
        },
        None => None,
    };

    if let Some(link_id) = active_link {
        let Some(desc) = shared.transport.destination_desc(&node).await else {
            fail_message(shared, message_id).await;
            return;
        };

        let envelope = {
            let state = shared.state.lock().await;
            let Some(entry) = state.pending.get(&message_id) else { return };
            entry
                .wire
                .pack_propagation_with_rng(&desc.identity, now_timestamp(), rand_core::OsRng)
                .ok()
        };
        let Some(envelope) = envelope else {
            fail_message(shared, message_id).await;
            return;
        };

        match shared.transport.send_resource(&link_id, envelope, None).await {
            Ok(resource_hash) => {
                bump_attempt(shared, message_id, MessageState::Sent, |entry| {
                    entry.tracked_resource = Some(resource_hash);
                })
                .await;
            }
            Err(_) => {
                bump_attempt(shared, message_id, MessageState::Outbound, |_| {}).await;
            }
        }
        return;
    }

    if shared.transport.knows_destination(&node).await {
        establish_link_for(shared, message_id, node).await;
    } else {
        pathless_attempt(shared, message_id, node).await;
    }
}

/// Spawns link establishment toward `destination` so the processing
/// loop is never blocked on a handshake. Pending messages for the
/// destination wake up as soon as the link activates.
async fn establish_link_for(
    shared: &Arc<Shared>,
    message_id: MessageId,
    destination: AddressHash,
) {
    let exhausted = {
        let mut state = shared.state.lock().await;
        let Some(entry) = state.pending.get_mut(&message_id) else { return };
        entry.attempts += 1;
        if entry.attempts > shared.config.max_delivery_attempts {
            true
        } else {
            entry.establishing = true;
            entry.next_attempt = Instant::now() + shared.config.delivery_retry_wait;
            false
        }
    };

    if exhausted {
        fail_message(shared, message_id).await;
        return;
    }

    let Some(desc) = shared.transport.destination_desc(&destination).await else {
        finish_establishment(shared, message_id, destination, None).await;
        return;
    };

    let shared = shared.clone();
    tokio::spawn(async move {
        let result = shared
            .transport
            .establish_link(desc, shared.config.link_establishment_timeout)
            .await;

        let link_id = match result {
            Ok(link) => Some(*link.lock().await.id()),
            Err(err) => {
                log::debug!("lxmf: link establishment to {} failed: {:?}", destination, err);
                None
            }
        };

        finish_establishment(&shared, message_id, destination, link_id).await;
    });
}

async fn finish_establishment(
    shared: &Arc<Shared>,
    message_id: MessageId,
    destination: AddressHash,
    link_id: Option<AddressHash>,
) {
    let mut state = shared.state.lock().await;

    if let Some(link_id) = link_id {
        state.links.insert(destination, link_id);
        // Wake every message waiting on this destination.
        for entry in state.pending.values_mut() {
            if destination_bytes(&entry.wire) == destination {
                entry.establishing = false;
                entry.next_attempt = Instant::now();
            }
        }
    } else if let Some(entry) = state.pending.get_mut(&message_id) {
        entry.establishing = false;
    }
}

/// The pathless retry ladder: plain retries first, then an explicit
/// path request, then expiry of a stale path and a fresh request.
async fn pathless_attempt(shared: &Arc<Shared>, message_id: MessageId, destination: AddressHash) {
    let attempts = {
        let mut state = shared.state.lock().await;
        let Some(entry) = state.pending.get_mut(&message_id) else { return };
        entry.attempts += 1;
        entry.attempts
    };

    let config = &shared.config;

    if attempts >= config.max_delivery_attempts {
        fail_message(shared, message_id).await;
        return;
    }

    if attempts <= config.max_pathless_tries {
        set_next_attempt(shared, message_id, config.delivery_retry_wait).await;
        return;
    }

    if attempts == config.max_pathless_tries + 1 && shared.transport.has_path(&destination).await {
        // The path we hold predates this conversation and went
        // unanswered; replace it outright.
        shared.transport.expire_path(&destination).await;
        tokio::time::sleep(config.stale_path_wait).await;
    }

    shared.transport.request_path(&destination).await;
    set_next_attempt(shared, message_id, config.path_request_wait).await;
}

async fn set_next_attempt(shared: &Arc<Shared>, message_id: MessageId, wait: Duration) {
    let mut state = shared.state.lock().await;
    if let Some(entry) = state.pending.get_mut(&message_id) {
        entry.next_attempt = Instant::now() + wait;
    }
}

async fn bump_attempt<F>(
    shared: &Arc<Shared>,
    message_id: MessageId,
    new_state: MessageState,
    apply: F,
) where
    F: FnOnce(&mut OutboundEntry),
{
    let should_fail = {
        let mut state = shared.state.lock().await;
        let Some(entry) = state.pending.get_mut(&message_id) else { return };
        entry.attempts += 1;
        if entry.attempts > shared.config.max_delivery_attempts {
            true
        } else {
            entry.state = new_state;
            entry.next_attempt = Instant::now() + shared.config.delivery_retry_wait;
            apply(entry);
            false
        }
    };

    if should_fail {
        fail_message(shared, message_id).await;
    }
}

async fn fail_message(shared: &Arc<Shared>, message_id: MessageId) {
    let entry = shared.state.lock().await.pending.remove(&message_id);
    let Some(mut entry) = entry else { return };
    entry.state = MessageState::Failed;

    log::debug!("lxmf: message {} failed", hex::encode(message_id));

    let callback = shared.failed_callback.lock().ok().and_then(|slot| slot.clone());
    if let Some(callback) = callback {
        let wire = entry.wire.clone();
        tokio::spawn(async move { callback(&wire) });
    }
}

async fn deliver_message(shared: &Arc<Shared>, message_id: MessageId) {
    let entry = shared.state.lock().await.pending.remove(&message_id);
    let Some(mut entry) = entry else { return };
    entry.state = MessageState::Delivered;

    log::debug!("lxmf: message {} delivered", hex::encode(message_id));

    let callback = shared.delivery_callback.lock().ok().and_then(|slot| slot.clone());
    if let Some(callback) = callback {
        let wire = entry.wire.clone();
        tokio::spawn(async move { callback(&wire) });
    }
}

async fn prune_recent(shared: &Arc<Shared>) {
    let ttl = shared.config.dedup_ttl;
    let now = Instant::now();
    shared.state.lock().await.recent.retain(|_, seen| now.duration_since(*seen) <= ttl);
}

/// An announce for a destination with queued messages makes those
/// messages immediately due, per the announce-driven path acquisition
/// flow.
async fn run_announce_task(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut announces = shared.transport.recv_announces();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = announces.recv() => {
                let Ok(event) = event else { continue };
                let mut state = shared.state.lock().await;
                for entry in state.pending.values_mut() {
                    if destination_bytes(&entry.wire) == event.destination_hash {
                        entry.next_attempt = Instant::now();
                    }
                }
            }
        }
    }
}

async fn run_receipt_task(
    shared: Arc<Shared>,
    mut receipts: mpsc::UnboundedReceiver<DeliveryReceipt>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            receipt = receipts.recv() => {
                let Some(receipt) = receipt else { break };
                let matched = {
                    let state = shared.state.lock().await;
                    state
                        .pending
                        .iter()
                        .find(|(_, entry)| entry.tracked_packet == Some(receipt.packet_hash))
                        .map(|(id, _)| *id)
                };
                if let Some(message_id) = matched {
                    deliver_message(&shared, message_id).await;
                }
            }
        }
    }
}

async fn run_received_data_task(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut received = shared.transport.received_data();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            data = received.recv() => {
                let Ok(data) = data else { continue };
                let is_delivery = {
                    let state = shared.state.lock().await;
                    state.delivery_destinations.contains_key(&data.destination)
                };
                if is_delivery {
                    process_inbound(&shared, data.destination, &data.data).await;
                }
            }
        }
    }
}

async fn run_resource_events_task(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut events = shared.transport.resource_events();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Ok(event) = event else { continue };
                match event.kind {
                    ResourceEventKind::OutboundComplete => {
                        let matched = {
                            let state = shared.state.lock().await;
                            state
                                .pending
                                .iter()
                                .find(|(_, entry)| entry.tracked_resource == Some(event.hash))
                                .map(|(id, entry)| (*id, entry.method))
                        };
                        if let Some((message_id, method)) = matched {
                            if method == DeliveryMethod::Propagated {
                                // The node only accepted custody.
                                shared.state.lock().await.pending.remove(&message_id);
                                log::debug!(
                                    "lxmf: message {} accepted by propagation node",
                                    hex::encode(message_id)
                                );
                            } else {
                                deliver_message(&shared, message_id).await;
                            }
                        }
                    }
                    ResourceEventKind::Failed(_) => {
                        let matched = {
                            let state = shared.state.lock().await;
                            state
                                .pending
                                .iter()
                                .find(|(_, entry)| entry.tracked_resource == Some(event.hash))
                                .map(|(id, _)| *id)
                        };
                        if let Some(message_id) = matched {
                            bump_attempt(&shared, message_id, MessageState::Outbound, |entry| {
                                entry.tracked_resource = None;
                            })
                            .await;
                        }
                    }
                    ResourceEventKind::Complete(complete) => {
                        // Large inbound message delivered as a resource
                        // on one of our delivery links.
                        let destination = match shared.transport.find_link(&event.link_id).await {
                            Some(link) => link.lock().await.destination().address_hash,
                            None => continue,
                        };
                        let is_delivery = {
                            let state = shared.state.lock().await;
                            state.delivery_destinations.contains_key(&destination)
                        };
                        if is_delivery {
                            process_inbound(&shared, destination, &complete.data).await;
                        }
                    }
                    ResourceEventKind::Progress(_) => {}
                }
            }
        }
    }
}

async fn run_link_events_task(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut events = shared.transport.link_events();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Ok(event) = event else { continue };
                let LinkEvent::Data(payload) = event.event else { continue };
                if payload.context() != PacketContext::None {
                    continue;
                }
                let is_delivery = {
                    let state = shared.state.lock().await;
                    state.delivery_destinations.contains_key(&event.address_hash)
                };
                if is_delivery {
                    process_inbound(&shared, event.address_hash, payload.as_slice()).await;
                }
            }
        }
    }
}

/// Verifies, deduplicates, and dispatches one inbound message whose
/// destination hash was implied by the addressing layer.
async fn process_inbound(shared: &Arc<Shared>, destination: AddressHash, stripped: &[u8]) {
    let mut destination_bytes = [0u8; DESTINATION_LENGTH];
    destination_bytes.copy_from_slice(destination.as_slice());

    let wire = match WireMessage::unpack_with_destination(destination_bytes, stripped) {
        Ok(wire) => wire,
        Err(err) => {
            log::debug!("lxmf: dropping undecodable inbound message: {}", err);
            return;
        }
    };

    let message_id = wire.message_id();

    // Exactly-once delivery per message id inside the dedup window.
    {
        let mut state = shared.state.lock().await;
        if state.recent.contains_key(&message_id) {
            log::debug!("lxmf: suppressing duplicate message {}", hex::encode(message_id));
            return;
        }
        state.recent.insert(message_id, Instant::now());
    }

    let source = AddressHash::try_from_slice(&wire.source).unwrap_or_default();

    // The source identity may not have been observed yet; such
    // messages are delivered unverified rather than dropped. A known
    // identity with a bad signature is rejected outright.
    let signature_verified = match shared.transport.destination_desc(&source).await {
        Some(desc) => match wire.verify(&desc.identity) {
            Ok(true) => true,
            _ => {
                log::debug!(
                    "lxmf: rejecting message {} with invalid signature",
                    hex::encode(message_id)
                );
                return;
            }
        },
        None => false,
    };

    let stamp_value = wire.payload.stamp.as_ref().map(|stamp| {
        let workblock = stamper::message_workblock(&message_id);
        stamper::stamp_value(&workblock, stamp)
    });

    if shared.config.require_stamps {
        let valid = stamp_value
            .map(|value| value >= shared.config.stamp_cost_target as u32)
            .unwrap_or(false);
        if !valid {
            log::debug!(
                "lxmf: rejecting message {} without a sufficient stamp",
                hex::encode(message_id)
            );
            return;
        }
    }

    let callback = shared.inbound_callback.lock().ok().and_then(|slot| slot.clone());
    if let Some(callback) = callback {
        let inbound = InboundMessage {
            wire,
            message_id,
            destination,
            source,
            signature_verified,
            stamp_value,
        };
        // Callbacks run off the router's tasks so a slow consumer
        // cannot stall processing.
        tokio::spawn(async move { callback(inbound) });
    }
}
