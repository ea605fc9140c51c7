use tandem_crypto::CryptoError;
use thiserror::Error;

/// Device capture failures (camera/microphone).
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),

    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the peer-connection primitive.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} not supported by this transport")]
    Unsupported(&'static str),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
#[error("signaling send failed: {0}")]
pub struct SignalingError(pub String);

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("media capture failed: {0}")]
    Media(#[from] MediaError),

    #[error("peer connection error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Connectivity did not come back within the reconnect window. The
    /// session has been torn down and is in `failed`.
    #[error("connection did not recover within the reconnect window")]
    ReconnectTimeout,

    #[error("video can only be toggled on video calls")]
    NotVideoCall,

    #[error("call session is closed")]
    SessionClosed,

    #[error("another call is already in progress")]
    CallInProgress,

    #[error("unexpected signal: expected {0}")]
    UnexpectedSignal(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_errors_stay_distinguishable() {
        let e: CallError = CryptoError::PeerNotReady {
            peer_id: "bob".into(),
        }
        .into();
        assert!(matches!(e, CallError::Crypto(ref c) if c.is_peer_not_ready()));
        assert!(e.to_string().contains("bob"));
    }

    #[test]
    fn display_messages() {
        assert!(CallError::from(TransportError::Unsupported("ice restart"))
            .to_string()
            .contains("ice restart not supported"));
        assert!(CallError::from(SignalingError("socket closed".into()))
            .to_string()
            .contains("socket closed"));
        assert!(CallError::from(MediaError::PermissionDenied("camera"))
            .to_string()
            .contains("camera"));
    }
}
