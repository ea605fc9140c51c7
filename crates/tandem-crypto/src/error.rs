use thiserror::Error;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The peer has no usable key in the directory yet.
    #[error("peer {peer_id} has no published public key")]
    PeerNotReady { peer_id: String },

    /// Ciphertext did not open, even after refreshing the peer's key.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("secure storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("key directory unreachable: {0}")]
    Directory(String),

    #[error("failed to publish public key: {0}")]
    PublishFailed(String),

    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    /// A payload could not be converted to or from JSON. Never a crypto failure.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("system RNG failed")]
    Rng,
}

impl CryptoError {
    pub fn is_peer_not_ready(&self) -> bool {
        matches!(self, CryptoError::PeerNotReady { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_not_ready_display() {
        let e = CryptoError::PeerNotReady {
            peer_id: "bob".into(),
        };
        assert!(e.to_string().contains("bob"));
        assert!(e.is_peer_not_ready());
        assert!(!CryptoError::DecryptionFailed.is_peer_not_ready());
    }

    #[test]
    fn serialization_is_distinct_from_decryption() {
        let json_err = serde_json::from_str::<u32>("{").unwrap_err();
        let e: CryptoError = json_err.into();
        assert!(matches!(e, CryptoError::Serialization(_)));
        assert!(e.to_string().starts_with("payload serialization error"));
    }
}
