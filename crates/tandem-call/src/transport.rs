//! Peer-connection and signaling seams.
//!
//! The native transport reports ICE candidates, connection-state changes
//! and remote tracks through a [`TransportEvents`] handle instead of
//! callbacks. Events land on the owning session's queue; once the session
//! closes, the queue is dropped and further reports are discarded.

use async_trait::async_trait;
use tandem_protocol::{IceCandidate, SessionDescription, Signal};
use tokio::sync::mpsc;

use crate::error::{SignalingError, TransportError};
use crate::media::TrackRef;

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Inputs a session processes besides inbound signals.
pub enum SessionEvent {
    /// The local transport discovered a candidate; it must reach the peer.
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack(TrackRef),
    /// The reconnect window armed as `generation` ran out.
    ReconnectTimeout { generation: u64 },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            SessionEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            SessionEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.id()).finish(),
            SessionEvent::ReconnectTimeout { generation } => f
                .debug_struct("ReconnectTimeout")
                .field("generation", generation)
                .finish(),
        }
    }
}

/// Handle given to the transport for reporting events to its session.
#[derive(Clone)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        let _ = self.tx.send(SessionEvent::LocalCandidate(candidate));
    }

    pub fn connection_state(&self, state: ConnectionState) {
        let _ = self.tx.send(SessionEvent::ConnectionState(state));
    }

    pub fn remote_track(&self, track: TrackRef) {
        let _ = self.tx.send(SessionEvent::RemoteTrack(track));
    }

    /// True once the session has closed and stopped listening.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One native peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&mut self, track: TrackRef) -> Result<(), TransportError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), TransportError>;

    /// May legitimately fail when the candidate arrives before the remote
    /// description.
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn restart_ice(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("ICE restart"))
    }

    /// Release native resources. Must tolerate being called on an
    /// already-failed connection.
    async fn close(&mut self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// The relay that carries signals between the two peers.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, peer_id: &str, signal: Signal) -> Result<(), SignalingError>;
}
