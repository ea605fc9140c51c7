//! Direct-message bodies: seal before sending, open for display.

use tandem_crypto::{is_envelope, CryptoError, E2eeService, KeyOptions};
use tracing::warn;

pub const UNAVAILABLE_PLACEHOLDER: &str = "encrypted message unavailable";

/// What goes on the wire for an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealedBody {
    Encrypted(String),
    /// The peer has no published key yet; sent as-is.
    PlaintextFallback(String),
}

impl SealedBody {
    pub fn body(&self) -> &str {
        match self {
            SealedBody::Encrypted(b) | SealedBody::PlaintextFallback(b) => b,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, SealedBody::Encrypted(_))
    }
}

/// A received message body, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedBody {
    /// Never was encrypted.
    Plaintext(String),
    Decrypted(String),
    /// An envelope that could not be opened, even with a refreshed peer key.
    Unavailable,
}

impl OpenedBody {
    pub fn display_text(&self) -> &str {
        match self {
            OpenedBody::Plaintext(t) | OpenedBody::Decrypted(t) => t,
            OpenedBody::Unavailable => UNAVAILABLE_PLACEHOLDER,
        }
    }
}

/// Seal `text` for `peer_id`. With `allow_plaintext`, a peer that has not
/// published a key yet gets the text unencrypted instead of an error.
pub async fn seal_direct_message(
    crypto: &E2eeService,
    conversation_id: &str,
    user_id: &str,
    peer_id: &str,
    text: &str,
    allow_plaintext: bool,
) -> Result<SealedBody, CryptoError> {
    match crypto
        .encrypt(conversation_id, user_id, peer_id, text, KeyOptions::default())
        .await
    {
        Ok(sealed) => Ok(SealedBody::Encrypted(sealed)),
        Err(e) if e.is_peer_not_ready() && allow_plaintext => {
            warn!(conversation_id, peer_id, "peer has no published key, sending in plaintext");
            Ok(SealedBody::PlaintextFallback(text.to_owned()))
        }
        Err(e) => Err(e),
    }
}

/// Open a received body. Never fails: unreadable envelopes become
/// [`OpenedBody::Unavailable`].
pub async fn open_direct_message(
    crypto: &E2eeService,
    conversation_id: &str,
    user_id: &str,
    sender_id: &str,
    body: &str,
) -> OpenedBody {
    if !is_envelope(body) {
        return OpenedBody::Plaintext(body.to_owned());
    }
    match crypto.decrypt(conversation_id, user_id, sender_id, body).await {
        Ok(text) => OpenedBody::Decrypted(text),
        Err(e) => {
            warn!(conversation_id, sender_id, "showing placeholder for unreadable message: {e}");
            OpenedBody::Unavailable
        }
    }
}
