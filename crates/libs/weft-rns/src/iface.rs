pub mod framing;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::hash::{AddressHash, Hash};
use crate::packet::Packet;

pub type InterfaceTxSender = mpsc::Sender<TxMessage>;
pub type InterfaceTxReceiver = mpsc::Receiver<TxMessage>;

pub type InterfaceRxSender = mpsc::Sender<RxMessage>;
pub type InterfaceRxReceiver = mpsc::Receiver<RxMessage>;

const DEFAULT_IFACE_TX_QUEUE_CAPACITY: usize = 128;
const IFACE_TX_ENQUEUE_TIMEOUT_MS: u64 = 200;
pub const HW_MTU_MAX: usize = 262_144;

/// Capabilities a link-layer driver reports to the stack. The core only
/// ever frames and hands octet buffers to drivers; everything else about
/// the medium lives behind this description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceProperties {
    pub bitrate: u64,
    pub hw_mtu: usize,
    pub can_send: bool,
    pub can_receive: bool,
    pub online: bool,
}

impl Default for InterfaceProperties {
    fn default() -> Self {
        Self { bitrate: 0, hw_mtu: HW_MTU_MAX, can_send: true, can_receive: true, online: true }
    }
}

pub trait Interface {
    fn mtu() -> usize;

    fn properties() -> InterfaceProperties {
        InterfaceProperties::default()
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TxMessageType {
    /// Send on every interface, optionally excluding the originating one.
    Broadcast(Option<AddressHash>),
    /// Send on exactly one interface.
    Direct(AddressHash),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct TxMessage {
    pub tx_type: TxMessageType,
    pub packet: Packet,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct RxMessage {
    /// Address of the source interface.
    pub address: AddressHash,
    pub packet: Packet,
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct TxDispatchTrace {
    pub matched_ifaces: usize,
    pub sent_ifaces: usize,
    pub failed_ifaces: usize,
}

/// Channel pair handed to a spawned interface worker.
pub struct InterfaceChannel {
    pub address: AddressHash,
    pub rx_channel: InterfaceRxSender,
    pub tx_channel: InterfaceTxReceiver,
    pub stop: CancellationToken,
}

impl InterfaceChannel {
    pub fn make_rx_channel(cap: usize) -> (InterfaceRxSender, InterfaceRxReceiver) {
        mpsc::channel(cap)
    }

    pub fn address(&self) -> &AddressHash {
        &self.address
    }

    pub fn split(self) -> (InterfaceRxSender, InterfaceTxReceiver) {
        (self.rx_channel, self.tx_channel)
    }
}

struct LocalInterface {
    address: AddressHash,
    tx_send: InterfaceTxSender,
    properties: InterfaceProperties,
    stop: CancellationToken,
}

pub struct InterfaceContext<T: Interface> {
    pub inner: Arc<Mutex<T>>,
    pub channel: InterfaceChannel,
    pub cancel: CancellationToken,
}

/// Registry of attached interfaces. Outbound packets fan out here;
/// inbound packets funnel into one shared rx queue consumed by the
/// transport.
pub struct InterfaceManager {
    counter: usize,
    rx_recv: Arc<tokio::sync::Mutex<InterfaceRxReceiver>>,
    rx_send: InterfaceRxSender,
    cancel: CancellationToken,
    ifaces: Vec<LocalInterface>,
}

impl InterfaceManager {
    pub fn new(rx_cap: usize) -> Self {
        let (rx_send, rx_recv) = InterfaceChannel::make_rx_channel(rx_cap);
        let rx_recv = Arc::new(tokio::sync::Mutex::new(rx_recv));

        Self { counter: 0, rx_recv, rx_send, cancel: CancellationToken::new(), ifaces: Vec::new() }
    }

    pub fn new_channel(
        &mut self,
        tx_cap: usize,
        properties: InterfaceProperties,
    ) -> InterfaceChannel {
        self.counter += 1;

        let counter_bytes = self.counter.to_le_bytes();
        let address = AddressHash::new_from_hash(&Hash::new_from_slice(&counter_bytes[..]));

        let (tx_send, tx_recv) = mpsc::channel(tx_cap);

        log::debug!("iface: create channel {}", address);

        let stop = CancellationToken::new();

        self.ifaces.push(LocalInterface { address, tx_send, properties, stop: stop.clone() });

        InterfaceChannel { rx_channel: self.rx_send.clone(), tx_channel: tx_recv, address, stop }
    }

    pub fn new_context<T: Interface>(&mut self, inner: T) -> InterfaceContext<T> {
        let channel = self.new_channel(DEFAULT_IFACE_TX_QUEUE_CAPACITY, T::properties());

        InterfaceContext::<T> {
            inner: Arc::new(Mutex::new(inner)),
            channel,
            cancel: self.cancel.clone(),
        }
    }

    pub fn spawn<T: Interface, F, R>(&mut self, inner: T, worker: F) -> AddressHash
    where
        F: FnOnce(InterfaceContext<T>) -> R,
        R: std::future::Future<Output = ()> + Send + 'static,
    {
        let context = self.new_context(inner);
        let address = *context.channel.address();

        task::spawn(worker(context));

        address
    }

    pub fn receiver(&self) -> Arc<tokio::sync::Mutex<InterfaceRxReceiver>> {
        self.rx_recv.clone()
    }

    pub fn properties(&self, address: &AddressHash) -> Option<InterfaceProperties> {
        self.ifaces.iter().find(|iface| iface.address == *address).map(|iface| iface.properties)
    }

    pub fn cleanup(&mut self) {
        self.ifaces.retain(|iface| !iface.stop.is_cancelled());
    }

    pub async fn send(&self, message: TxMessage) -> TxDispatchTrace {
        let mut trace = TxDispatchTrace::default();

        for iface in &self.ifaces {
            let should_send = match message.tx_type {
                TxMessageType::Broadcast(exclude) => exclude != Some(iface.address),
                TxMessageType::Direct(address) => address == iface.address,
            };

            if !should_send
                || iface.stop.is_cancelled()
                || !iface.properties.can_send
                || !iface.properties.online
            {
                continue;
            }

            trace.matched_ifaces += 1;
            match iface.tx_send.try_send(message) {
                Ok(()) => trace.sent_ifaces += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Short async wait before dropping, so bursts do not
                    // shed link proofs and receipts.
                    match tokio::time::timeout(
                        Duration::from_millis(IFACE_TX_ENQUEUE_TIMEOUT_MS),
                        iface.tx_send.send(message),
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            trace.sent_ifaces += 1;
                            log::warn!(
                                "iface: recovered from full tx queue on {} for {:?}",
                                iface.address,
                                message.tx_type
                            );
                        }
                        _ => {
                            trace.failed_ifaces += 1;
                            log::warn!(
                                "iface: tx queue unavailable on {} for {:?}",
                                iface.address,
                                message.tx_type
                            );
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace.failed_ifaces += 1;
                    log::warn!(
                        "iface: tx queue closed on {} for {:?}",
                        iface.address,
                        message.tx_type
                    );
                }
            }
        }

        trace
    }
}

impl Drop for InterfaceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
