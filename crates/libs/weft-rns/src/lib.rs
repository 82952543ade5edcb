pub mod buffer;
pub mod channel;
pub mod crypt;
pub mod destination;
pub mod error;
pub mod hash;
pub mod identity;
pub mod iface;
pub mod packet;
pub mod ratchets;
pub mod resource;
pub mod transport;

pub use crate::destination::{group_decrypt, group_encrypt};
pub use crate::error::RnsError;
pub use crate::packet::Packet;
pub use crate::transport::{DeliveryReceipt, ReceiptHandler, Transport, TransportConfig};
