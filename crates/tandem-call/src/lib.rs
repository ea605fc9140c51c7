//! Tandem call negotiation.
//!
//! A [`CallSession`] drives one audio/video call between two peers:
//! offer/answer and ICE exchange over an external signaling relay (all
//! payloads sealed with the conversation key), connectivity tracking with a
//! bounded reconnect window, mute/video toggles, and a single idempotent
//! teardown that always releases camera, microphone and the peer connection.
//!
//! The media stack is abstracted behind [`PeerConnection`],
//! [`PeerConnectionFactory`], [`MediaSource`] and [`MediaTrack`]; the relay
//! behind [`SignalingTransport`].

pub mod error;
pub mod media;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{CallError, MediaError, SignalingError, TransportError};
pub use media::{LocalMedia, MediaConstraints, MediaSource, MediaTrack, TrackKind, TrackRef};
pub use session::{CallConfig, CallDeps, CallRole, CallSession, CallTarget, CallUpdate, RECONNECT_WINDOW};
pub use transport::{
    ConnectionState, PeerConnection, PeerConnectionFactory, SessionEvent, SignalingTransport,
    TransportEvents,
};
