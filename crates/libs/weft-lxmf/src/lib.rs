pub mod constants;
pub mod error;
pub mod fields;
pub mod message;
pub mod router;
pub mod stamper;

pub use crate::error::LxmfError;
pub use crate::fields::WireFields;
pub use crate::message::{DeliveryMethod, Message, MessageId, MessageState, Payload, WireMessage};
pub use crate::router::{InboundMessage, LxmRouter, RouterConfig};
