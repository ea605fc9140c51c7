//! Tandem end-to-end encryption layer.
//!
//! This crate provides:
//! - Long-term X25519 identity keys, persisted in a secure store and
//!   published to a shared key directory
//! - Per-conversation symmetric keys derived from X25519 agreement
//! - AES-256-GCM sealing of message bodies and call-signaling payloads into
//!   the versioned `e2ee:v1` envelope
//! - Plaintext passthrough for bodies that are not envelopes

pub mod envelope;
pub mod error;
pub mod keys;
pub mod service;
pub mod store;

pub use envelope::{is_envelope, Envelope, NONCE_LEN};
pub use error::{CryptoError, Result};
pub use keys::{ConversationKey, LocalKeyPair, PublicKey, StoredKeyPair, KEY_LEN};
pub use service::{E2eeService, KeyOptions, DECRYPT_REFRESH_RETRIES};
pub use store::{storage_key, KeyDirectory, MemoryDirectory, MemorySecureStore, SecureStore};
