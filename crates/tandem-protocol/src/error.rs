use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("signal too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
