use crate::error::ProtocolError;
use crate::signal::Signal;

/// Maximum encoded signal size: 64 KiB.
pub const MAX_SIGNAL_SIZE: usize = 65_536;

/// Encode a `Signal` as the JSON text handed to the relay.
pub fn encode_signal(signal: &Signal) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(signal)?;
    if text.len() > MAX_SIGNAL_SIZE {
        return Err(ProtocolError::MessageTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a `Signal` received from the relay.
pub fn decode_signal(text: &str) -> Result<Signal, ProtocolError> {
    if text.len() > MAX_SIGNAL_SIZE {
        return Err(ProtocolError::MessageTooLarge(text.len()));
    }
    let signal: Signal = serde_json::from_str(text)?;
    tracing::trace!(kind = signal.event_name(), "decoded signal");
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallMode;

    #[test]
    fn roundtrip_signal() {
        let signal = Signal::CallOffer {
            conversation_id: "conv".into(),
            sender_id: "alice".into(),
            offer: "sealed".into(),
            mode: Some(CallMode::Audio),
        };
        let text = encode_signal(&signal).unwrap();
        assert_eq!(decode_signal(&text).unwrap(), signal);
    }

    #[test]
    fn oversized_signal_rejected() {
        let signal = Signal::CallIce {
            conversation_id: "conv".into(),
            sender_id: "alice".into(),
            candidate: "a".repeat(MAX_SIGNAL_SIZE),
        };
        match encode_signal(&signal) {
            Err(ProtocolError::MessageTooLarge(n)) => assert!(n > MAX_SIGNAL_SIZE),
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
        let huge = "x".repeat(MAX_SIGNAL_SIZE + 1);
        assert!(matches!(
            decode_signal(&huge),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn garbage_is_serialization_error() {
        assert!(matches!(
            decode_signal("{not json"),
            Err(ProtocolError::Serialization(_))
        ));
    }
}
