//! Identity keys and conversation key derivation.
//!
//! Each Tandem user has one long-term X25519 key pair per device. The
//! secret half is derived from 32 random bytes and persisted as hex JSON;
//! the public half is published to the key directory.

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, Result};

/// Size of X25519 public and secret keys in bytes.
pub const KEY_LEN: usize = 32;

/// Size of the AES-256-GCM conversation key.
pub const CONVERSATION_KEY_LEN: usize = 32;

/// Domain-separation tag placed between the shared secret and the conversation id.
const CONVERSATION_CONTEXT: &[u8] = b"tandem-conversation-v1:";

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex, as stored in the directory.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKey("public key is not hex"))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..8])
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        Self(*X25519PublicKey::from(secret).as_bytes())
    }
}

/// Symmetric key for one (user pair, conversation). Never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; CONVERSATION_KEY_LEN]);

impl ConversationKey {
    pub(crate) fn as_bytes(&self) -> &[u8; CONVERSATION_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey([REDACTED])")
    }
}

/// The local user's long-term identity key pair.
#[derive(Clone)]
pub struct LocalKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl LocalKeyPair {
    /// Derive a key pair deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Generate a fresh key pair from 32 bytes of system randomness.
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; KEY_LEN]);
        SystemRandom::new()
            .fill(seed.as_mut_slice())
            .map_err(|_| CryptoError::Rng)?;
        Ok(Self::from_seed(*seed))
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            secret_key: hex::encode(&self.secret_bytes()[..]),
            public_key: self.public.to_hex(),
        }
    }

    /// Rebuild from the persisted form. Both halves must decode to exactly
    /// 32 bytes and the public half must belong to the secret half.
    pub fn from_stored(stored: &StoredKeyPair) -> Result<Self> {
        let secret = Zeroizing::new(
            hex::decode(&stored.secret_key)
                .map_err(|_| CryptoError::InvalidKey("secret key is not hex"))?,
        );
        let seed: [u8; KEY_LEN] = secret
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("secret key must be 32 bytes"))?;
        let public = PublicKey::from_hex(&stored.public_key)?;

        let pair = Self::from_seed(seed);
        if pair.public != public {
            return Err(CryptoError::InvalidKey("public key does not match secret key"));
        }
        Ok(pair)
    }

    /// `SHA-512(X25519(me, peer) ‖ context ‖ conversation_id)[..32]`.
    ///
    /// Symmetric in the two parties, distinct per conversation.
    pub fn conversation_key(&self, peer: &PublicKey, conversation_id: &str) -> Result<ConversationKey> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer.as_bytes()));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("peer public key is low-order"));
        }

        let mut hasher = Sha512::new();
        hasher.update(shared.as_bytes());
        hasher.update(CONVERSATION_CONTEXT);
        hasher.update(conversation_id.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; CONVERSATION_KEY_LEN];
        key.copy_from_slice(&digest[..CONVERSATION_KEY_LEN]);
        Ok(ConversationKey(key))
    }
}

impl std::fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Secure-storage form of a key pair: `{"secretKey": hex, "publicKey": hex}`.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyPair {
    pub secret_key: String,
    pub public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_derivation_is_deterministic() {
        let a = LocalKeyPair::from_seed([7u8; 32]);
        let b = LocalKeyPair::from_seed([7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(*a.secret_bytes(), *b.secret_bytes());
    }

    #[test]
    fn stored_roundtrip() {
        let pair = LocalKeyPair::generate().unwrap();
        let json = serde_json::to_string(&pair.to_stored()).unwrap();
        assert!(json.contains("\"secretKey\""));
        assert!(json.contains("\"publicKey\""));

        let stored: StoredKeyPair = serde_json::from_str(&json).unwrap();
        let restored = LocalKeyPair::from_stored(&stored).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
        assert_eq!(*restored.secret_bytes(), *pair.secret_bytes());
    }

    #[test]
    fn stored_with_wrong_lengths_rejected() {
        let pair = LocalKeyPair::generate().unwrap();
        let mut stored = pair.to_stored();
        stored.secret_key.truncate(62);
        assert!(LocalKeyPair::from_stored(&stored).is_err());

        let mut stored = pair.to_stored();
        stored.public_key.push_str("00");
        assert!(LocalKeyPair::from_stored(&stored).is_err());
    }

    #[test]
    fn stored_with_mismatched_public_rejected() {
        let a = LocalKeyPair::generate().unwrap();
        let b = LocalKeyPair::generate().unwrap();
        let mut stored = a.to_stored();
        stored.public_key = b.public_key().to_hex();
        assert!(LocalKeyPair::from_stored(&stored).is_err());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let pair = LocalKeyPair::generate().unwrap();
        let hex = pair.public_key().to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), pair.public_key());
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let alice = LocalKeyPair::generate().unwrap();
        let bob = LocalKeyPair::generate().unwrap();
        let k1 = alice.conversation_key(&bob.public_key(), "conv-1").unwrap();
        let k2 = bob.conversation_key(&alice.public_key(), "conv-1").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn conversation_key_depends_on_conversation() {
        let alice = LocalKeyPair::generate().unwrap();
        let bob = LocalKeyPair::generate().unwrap();
        let k1 = alice.conversation_key(&bob.public_key(), "dm").unwrap();
        let k2 = alice.conversation_key(&bob.public_key(), "match-42").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn low_order_peer_key_rejected() {
        let alice = LocalKeyPair::generate().unwrap();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            alice.conversation_key(&zero, "c"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let pair = LocalKeyPair::generate().unwrap();
        let dbg = format!("{pair:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains(&hex::encode(&pair.secret_bytes()[..])));
    }
}
