//! Wire types for Tandem peer-to-peer calls.
//!
//! Signaling events travel between two peers over an external relay as
//! JSON objects tagged by `event`. Session descriptions and ICE candidates
//! inside those events are sealed by `tandem-crypto` before they leave the
//! device, so the relay only ever sees opaque strings for them.

pub mod codec;
pub mod error;
pub mod signal;
pub mod types;

pub use codec::{decode_signal, encode_signal, MAX_SIGNAL_SIZE};
pub use error::ProtocolError;
pub use signal::Signal;
pub use types::{CallMode, CallStatus, ConversationId, IceCandidate, SdpKind, SessionDescription, UserId};
