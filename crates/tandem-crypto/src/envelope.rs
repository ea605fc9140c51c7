//! The `e2ee:v1` envelope: AES-256-GCM sealed payloads as ASCII text.
//!
//! Wire format: `e2ee:v1:<nonce hex>:<ciphertext+tag hex>`. Anything that
//! does not have exactly that four-field shape is plaintext.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{CryptoError, Result};
use crate::keys::ConversationKey;

pub const ENVELOPE_TAG: &str = "e2ee";
pub const ENVELOPE_VERSION: &str = "v1";

/// AES-256-GCM nonce size.
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Binds the ciphertext to the envelope version.
const AAD: &[u8] = b"e2ee:v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Whether `body` has the envelope shape.
pub fn is_envelope(body: &str) -> bool {
    Envelope::parse(body).is_some()
}

/// The wire form is lowercase hex only; anything else reads as plaintext.
fn decode_lower_hex(field: &str) -> Option<Vec<u8>> {
    if field.bytes().any(|b| b.is_ascii_uppercase()) {
        return None;
    }
    hex::decode(field).ok()
}

fn aead_key(key: &ConversationKey) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("conversation key length"))?;
    Ok(LessSafeKey::new(unbound))
}

impl Envelope {
    /// Parse the wire form. Returns `None` for anything that is not
    /// `e2ee:v1:<hex>:<hex>` with both hex fields non-empty.
    pub fn parse(body: &str) -> Option<Self> {
        let mut parts = body.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ENVELOPE_TAG), Some(ENVELOPE_VERSION), Some(nonce), Some(ciphertext), None)
                if !nonce.is_empty() && !ciphertext.is_empty() =>
            {
                Some(Self {
                    nonce: decode_lower_hex(nonce)?,
                    ciphertext: decode_lower_hex(ciphertext)?,
                })
            }
            _ => None,
        }
    }

    /// Seal `plaintext` under `key` with a fresh random nonce.
    ///
    /// Every call draws a new nonce; reusing one under the same key would
    /// break confidentiality.
    pub fn seal(key: &ConversationKey, plaintext: &[u8]) -> Result<Self> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Rng)?;

        let mut in_out = plaintext.to_vec();
        aead_key(key)?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(AAD),
                &mut in_out,
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(Self {
            nonce: nonce_bytes.to_vec(),
            ciphertext: in_out,
        })
    }

    /// Open with `key`. Wrong key, tampering, or a malformed nonce all
    /// surface as `DecryptionFailed`.
    pub fn open(&self, key: &ConversationKey) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = self
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        if self.ciphertext.len() < GCM_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let mut in_out = self.ciphertext.clone();
        let plaintext = aead_key(key)?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(AAD),
                &mut in_out,
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(plaintext.to_vec())
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{ENVELOPE_TAG}:{ENVELOPE_VERSION}:{}:{}",
            hex::encode(&self.nonce),
            hex::encode(&self.ciphertext)
        )
    }
}
