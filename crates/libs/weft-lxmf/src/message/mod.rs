mod payload;
mod wire;

pub use payload::Payload;
pub use wire::{MessageId, WireMessage, LXM_URI_PREFIX};

use std::time::{SystemTime, UNIX_EPOCH};

use rns::hash::AddressHash;
use rns::identity::PrivateIdentity;

use crate::constants::DESTINATION_LENGTH;
use crate::error::LxmfError;
use crate::fields::WireFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Generating,
    Outbound,
    Sent,
    Delivered,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Direct,
    Opportunistic,
    Propagated,
}

/// A message under construction or in flight. `to_wire` produces the
/// signed packed form handed to the router.
#[derive(Clone)]
pub struct Message {
    pub destination_hash: AddressHash,
    pub source_hash: AddressHash,
    pub timestamp: Option<f64>,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: WireFields,
    pub stamp: Option<Vec<u8>>,
    pub method: DeliveryMethod,
    state: MessageState,
}

impl Message {
    pub fn new(
        destination_hash: AddressHash,
        source_hash: AddressHash,
        method: DeliveryMethod,
    ) -> Self {
        Self {
            destination_hash,
            source_hash,
            timestamp: None,
            title: Vec::new(),
            content: Vec::new(),
            fields: WireFields::new(),
            stamp: None,
            method,
            state: MessageState::Generating,
        }
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn set_state(&mut self, state: MessageState) {
        self.state = state;
    }

    pub fn set_title_from_string(&mut self, title: &str) {
        self.title = title.as_bytes().to_vec();
    }

    pub fn set_content_from_string(&mut self, content: &str) {
        self.content = content.as_bytes().to_vec();
    }

    pub fn title_as_string(&self) -> Option<String> {
        String::from_utf8(self.title.clone()).ok()
    }

    pub fn content_as_string(&self) -> Option<String> {
        String::from_utf8(self.content.clone()).ok()
    }

    pub fn to_wire(&self, signer: &PrivateIdentity) -> Result<WireMessage, LxmfError> {
        let timestamp = self.timestamp.unwrap_or_else(|| {
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
        });

        let payload = Payload::new(
            timestamp,
            self.title.clone(),
            self.content.clone(),
            self.fields.to_rmpv(),
            self.stamp.clone(),
        );

        let mut destination = [0u8; DESTINATION_LENGTH];
        destination.copy_from_slice(self.destination_hash.as_slice());
        let mut source = [0u8; DESTINATION_LENGTH];
        source.copy_from_slice(self.source_hash.as_slice());

        let mut wire = WireMessage::new(destination, source, payload);
        wire.sign(signer)?;
        Ok(wire)
    }
}
