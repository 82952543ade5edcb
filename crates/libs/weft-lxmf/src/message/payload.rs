use crate::error::LxmfError;

/// The msgpack payload of a message: a list of timestamp, title,
/// content, and the field map, with the stamp appended as a fifth
/// element when present. Title and content are msgpack binary.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub timestamp: f64,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: rmpv::Value,
    pub stamp: Option<Vec<u8>>,
}

impl Payload {
    pub fn new(
        timestamp: f64,
        title: Vec<u8>,
        content: Vec<u8>,
        fields: rmpv::Value,
        stamp: Option<Vec<u8>>,
    ) -> Self {
        Self { timestamp, title, content, fields, stamp }
    }

    fn elements(&self, with_stamp: bool) -> Vec<rmpv::Value> {
        let mut elements = vec![
            rmpv::Value::F64(self.timestamp),
            rmpv::Value::Binary(self.title.clone()),
            rmpv::Value::Binary(self.content.clone()),
            self.fields.clone(),
        ];
        if with_stamp {
            if let Some(stamp) = &self.stamp {
                elements.push(rmpv::Value::Binary(stamp.clone()));
            }
        }
        elements
    }

    fn encode(elements: Vec<rmpv::Value>) -> Result<Vec<u8>, LxmfError> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &rmpv::Value::Array(elements))
            .map_err(|err| LxmfError::Encode(err.to_string()))?;
        Ok(out)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, LxmfError> {
        Self::encode(self.elements(true))
    }

    /// The signed and hashed form never includes the stamp, so a stamp
    /// can be attached or stripped without re-signing.
    pub fn to_msgpack_without_stamp(&self) -> Result<Vec<u8>, LxmfError> {
        Self::encode(self.elements(false))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| LxmfError::Decode(err.to_string()))?;

        let rmpv::Value::Array(elements) = value else {
            return Err(LxmfError::Decode("payload must be a list".into()));
        };
        if elements.len() < 4 {
            return Err(LxmfError::Decode("payload list too short".into()));
        }

        let timestamp = elements[0]
            .as_f64()
            .ok_or_else(|| LxmfError::Decode("timestamp must be a float".into()))?;
        let title = decode_bytes(&elements[1])?;
        let content = decode_bytes(&elements[2])?;
        let fields = elements[3].clone();
        let stamp = match elements.get(4) {
            Some(value) => Some(decode_bytes(value)?),
            None => None,
        };

        Ok(Self { timestamp, title, content, fields, stamp })
    }
}

/// Reference peers encode strings as binary; tolerate str on inbound.
fn decode_bytes(value: &rmpv::Value) -> Result<Vec<u8>, LxmfError> {
    match value {
        rmpv::Value::Binary(bytes) => Ok(bytes.clone()),
        rmpv::Value::String(text) => {
            Ok(text.as_str().map(|s| s.as_bytes().to_vec()).unwrap_or_default())
        }
        rmpv::Value::Nil => Ok(Vec::new()),
        _ => Err(LxmfError::Decode("expected a byte string".into())),
    }
}
