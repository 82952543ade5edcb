use std::collections::BTreeMap;

use crate::constants::{
    FIELD_AUDIO, FIELD_FILE_ATTACHMENTS, FIELD_IMAGE, FIELD_RENDERER, FIELD_THREAD,
};
use crate::error::LxmfError;

/// Integer-keyed field map carried in a message payload. Values keep
/// msgpack semantics; byte strings encode as msgpack *binary* so
/// reference peers parse them unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireFields {
    entries: BTreeMap<u8, rmpv::Value>,
}

impl WireFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, field_id: u8, value: rmpv::Value) -> &mut Self {
        self.entries.insert(field_id, value);
        self
    }

    pub fn get(&self, field_id: u8) -> Option<&rmpv::Value> {
        self.entries.get(&field_id)
    }

    /// `[filename, data]` pairs under FIELD_FILE_ATTACHMENTS.
    pub fn set_file_attachments<I>(&mut self, attachments: I) -> &mut Self
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let entries: Vec<rmpv::Value> = attachments
            .into_iter()
            .map(|(name, data)| {
                rmpv::Value::Array(vec![rmpv::Value::Binary(name), rmpv::Value::Binary(data)])
            })
            .collect();
        self.entries.insert(FIELD_FILE_ATTACHMENTS, rmpv::Value::Array(entries));
        self
    }

    pub fn set_image(&mut self, extension: Vec<u8>, data: Vec<u8>) -> &mut Self {
        self.entries.insert(
            FIELD_IMAGE,
            rmpv::Value::Array(vec![rmpv::Value::Binary(extension), rmpv::Value::Binary(data)]),
        );
        self
    }

    pub fn set_audio(&mut self, mode: u8, data: Vec<u8>) -> &mut Self {
        self.entries.insert(
            FIELD_AUDIO,
            rmpv::Value::Array(vec![
                rmpv::Value::Integer(mode.into()),
                rmpv::Value::Binary(data),
            ]),
        );
        self
    }

    pub fn set_thread(&mut self, thread_id: Vec<u8>) -> &mut Self {
        self.entries.insert(FIELD_THREAD, rmpv::Value::Binary(thread_id));
        self
    }

    pub fn set_renderer(&mut self, renderer: u8) -> &mut Self {
        self.entries.insert(FIELD_RENDERER, rmpv::Value::Integer(renderer.into()));
        self
    }

    pub fn to_rmpv(&self) -> rmpv::Value {
        let entries = self
            .entries
            .iter()
            .map(|(field_id, value)| {
                (rmpv::Value::Integer((*field_id as i64).into()), value.clone())
            })
            .collect();
        rmpv::Value::Map(entries)
    }

    pub fn from_rmpv(value: &rmpv::Value) -> Result<Self, LxmfError> {
        let rmpv::Value::Map(entries) = value else {
            return Err(LxmfError::Decode("fields must be a map".into()));
        };

        let mut fields = Self::new();
        for (key, value) in entries {
            let field_id = key
                .as_i64()
                .and_then(|id| u8::try_from(id).ok())
                .ok_or_else(|| LxmfError::Decode("field keys must be small integers".into()))?;
            fields.entries.insert(field_id, value.clone());
        }
        Ok(fields)
    }
}
