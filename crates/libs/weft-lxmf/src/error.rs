use thiserror::Error;

#[derive(Debug, Error)]
pub enum LxmfError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("invalid or missing stamp")]
    InvalidStamp,
    #[error("message exceeds the configured size limit")]
    TooLarge,
    #[error("no path to destination")]
    NoPath,
    #[error("destination identity is not known")]
    NoIdentity,
    #[error("delivery attempts exhausted")]
    Exhausted,
    #[error("transport error: {0}")]
    Transport(rns::RnsError),
}

impl From<rns::RnsError> for LxmfError {
    fn from(err: rns::RnsError) -> Self {
        LxmfError::Transport(err)
    }
}
