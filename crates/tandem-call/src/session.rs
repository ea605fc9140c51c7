//! The call session state machine.
//!
//! ```text
//! off ──start/accept──▶ connecting ──connected──▶ live ◀──connected── reconnecting
//!                            │                      │                     │
//!                            └──────disconnected────┴────disconnected────▶┘
//!                                                                         │ window expires
//! any ──close()──▶ off                                                    ▼
//!                                                                       failed
//! ```
//!
//! `off` and `failed` are terminal; a session is never reused.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tandem_crypto::{CryptoError, E2eeService};
use tandem_protocol::{CallMode, CallStatus, IceCandidate, SessionDescription, Signal};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::media::{LocalMedia, MediaConstraints, MediaSource, TrackKind, TrackRef};
use crate::transport::{
    ConnectionState, PeerConnection, PeerConnectionFactory, SessionEvent, SignalingTransport,
    TransportEvents,
};

/// How long connectivity may stay lost before the call fails.
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(15);

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallConfig {
    pub reconnect_window: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            reconnect_window: RECONNECT_WINDOW,
        }
    }
}

/// Collaborators a session needs.
#[derive(Clone)]
pub struct CallDeps {
    pub crypto: Arc<E2eeService>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSource>,
    pub config: CallConfig,
}

/// Who the call is with, and in which conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub conversation_id: String,
    pub local_user_id: String,
    pub peer_id: String,
}

impl CallTarget {
    pub fn new(
        conversation_id: impl Into<String>,
        local_user_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            local_user_id: local_user_id.into(),
            peer_id: peer_id.into(),
        }
    }

    /// The target implied by an inbound signal: the sender is the peer.
    pub fn from_signal(local_user_id: &str, signal: &Signal) -> Self {
        Self::new(signal.conversation_id(), local_user_id, signal.sender_id())
    }

    fn matches(&self, signal: &Signal) -> bool {
        signal.conversation_id() == self.conversation_id && signal.sender_id() == self.peer_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Notifications for the UI layer.
#[derive(Clone)]
pub enum CallUpdate {
    State(CallStatus),
    LocalMediaAdded(Vec<TrackRef>),
    LocalMediaRemoved,
    RemoteTrackAdded(TrackRef),
    RemoteMediaRemoved,
    Muted(bool),
    VideoEnabled(bool),
    /// Status the peer reported through `call-state`.
    PeerState(CallStatus),
    PeerMuted(bool),
}

pub struct CallSession {
    deps: CallDeps,
    target: CallTarget,
    role: CallRole,
    mode: CallMode,
    state: CallStatus,
    peer: Option<Box<dyn PeerConnection>>,
    local_media: Option<LocalMedia>,
    remote_tracks: Vec<TrackRef>,
    muted: bool,
    video_enabled: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    updates: broadcast::Sender<CallUpdate>,
    closed: bool,
}

impl CallSession {
    fn new(deps: CallDeps, target: CallTarget, role: CallRole, mode: CallMode) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            deps,
            target,
            role,
            mode,
            state: CallStatus::Off,
            peer: None,
            local_media: None,
            remote_tracks: Vec::new(),
            muted: false,
            video_enabled: mode.has_video(),
            reconnect_timer: None,
            timer_generation: 0,
            events_tx,
            events_rx: Some(events_rx),
            updates,
            closed: false,
        }
    }

    // ── Setup ───────────────────────────────────────────────────────────

    /// Place a call: capture media, create and send the sealed offer.
    ///
    /// On failure everything acquired so far is released before the error
    /// is returned.
    pub async fn start_outgoing(deps: CallDeps, target: CallTarget, mode: CallMode) -> Result<Self, CallError> {
        let mut session = Self::new(deps, target, CallRole::Caller, mode);
        info!(
            conversation_id = %session.target.conversation_id,
            peer_id = %session.target.peer_id,
            ?mode,
            "starting outgoing call"
        );
        match session.open_as_caller().await {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!(conversation_id = %session.target.conversation_id, "outgoing call setup failed: {e}");
                session.close(false, CallStatus::Off).await;
                Err(e)
            }
        }
    }

    /// Answer a `call-offer`: open it, capture media, send the sealed answer.
    pub async fn accept_incoming(deps: CallDeps, local_user_id: &str, offer: &Signal) -> Result<Self, CallError> {
        let Signal::CallOffer { offer: sealed, mode, .. } = offer else {
            return Err(CallError::UnexpectedSignal("call-offer"));
        };
        let target = CallTarget::from_signal(local_user_id, offer);
        let mode = mode.unwrap_or_default();

        // Opening first: nothing to release if the offer is unreadable.
        let remote: SessionDescription = deps
            .crypto
            .decrypt_json(&target.conversation_id, &target.local_user_id, &target.peer_id, sealed)
            .await?;

        let mut session = Self::new(deps, target, CallRole::Callee, mode);
        info!(
            conversation_id = %session.target.conversation_id,
            peer_id = %session.target.peer_id,
            ?mode,
            "accepting incoming call"
        );
        match session.open_as_callee(remote).await {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!(conversation_id = %session.target.conversation_id, "incoming call setup failed: {e}");
                session.close(false, CallStatus::Off).await;
                Err(e)
            }
        }
    }

    /// Refuse a `call-offer` without creating a session.
    pub async fn decline_incoming(deps: &CallDeps, local_user_id: &str, offer: &Signal) -> Result<(), CallError> {
        let target = CallTarget::from_signal(local_user_id, offer);
        info!(conversation_id = %target.conversation_id, peer_id = %target.peer_id, "declining call");
        deps.signaling
            .send(
                &target.peer_id,
                Signal::CallDeclined {
                    conversation_id: target.conversation_id.clone(),
                    sender_id: target.local_user_id.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn open_as_caller(&mut self) -> Result<(), CallError> {
        self.acquire_media().await?;
        self.create_peer_connection().await?;

        let pc = self.peer_mut()?;
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        self.set_state(CallStatus::Connecting);

        let sealed = self.seal(&offer).await?;
        self.send(Signal::CallOffer {
            conversation_id: self.target.conversation_id.clone(),
            sender_id: self.target.local_user_id.clone(),
            offer: sealed,
            mode: Some(self.mode),
        })
        .await
    }

    async fn open_as_callee(&mut self, remote: SessionDescription) -> Result<(), CallError> {
        self.acquire_media().await?;
        self.create_peer_connection().await?;

        let pc = self.peer_mut()?;
        pc.set_remote_description(remote).await?;
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.set_state(CallStatus::Connecting);

        let sealed = self.seal(&answer).await?;
        self.send(Signal::CallAnswer {
            conversation_id: self.target.conversation_id.clone(),
            sender_id: self.target.local_user_id.clone(),
            answer: sealed,
        })
        .await
    }

    async fn acquire_media(&mut self) -> Result<(), CallError> {
        let tracks = self
            .deps
            .media
            .capture(MediaConstraints::for_mode(self.mode))
            .await?;
        debug!(count = tracks.len(), "captured local tracks");
        self.emit(CallUpdate::LocalMediaAdded(tracks.clone()));
        self.local_media = Some(LocalMedia::new(tracks));
        Ok(())
    }

    async fn create_peer_connection(&mut self) -> Result<(), CallError> {
        let events = TransportEvents::new(self.events_tx.clone());
        let mut pc = self.deps.peers.create(events).await?;
        // Stored before attaching tracks so a failure below still closes it.
        let tracks: Vec<TrackRef> = self
            .local_media
            .as_ref()
            .map(|m| m.tracks().to_vec())
            .unwrap_or_default();
        let attach = async {
            for track in tracks {
                pc.add_track(track).await?;
            }
            Ok::<(), CallError>(())
        }
        .await;
        self.peer = Some(pc);
        attach
    }

    // ── Inputs ──────────────────────────────────────────────────────────

    /// Apply a signal from the relay. Signals for another conversation or
    /// from anyone but the peer are ignored; unreadable or inapplicable
    /// payloads are logged and dropped.
    pub async fn handle_signal(&mut self, signal: Signal) {
        if self.closed {
            debug!(kind = signal.event_name(), "session closed, ignoring signal");
            return;
        }
        if !self.target.matches(&signal) {
            debug!(kind = signal.event_name(), "signal for another call, ignoring");
            return;
        }

        match signal {
            Signal::CallOffer { .. } => {
                debug!("offer for an active call, ignoring");
            }
            Signal::CallAnswer { answer, .. } => {
                if self.role != CallRole::Caller {
                    debug!("answer received by callee, ignoring");
                    return;
                }
                match self.open::<SessionDescription>(&answer).await {
                    Ok(desc) => {
                        if let Some(pc) = self.peer.as_mut() {
                            if let Err(e) = pc.set_remote_description(desc).await {
                                warn!(conversation_id = %self.target.conversation_id, "could not apply answer: {e}");
                            }
                        }
                    }
                    Err(e) => warn!(conversation_id = %self.target.conversation_id, "could not open answer: {e}"),
                }
            }
            Signal::CallIce { candidate, .. } => match self.open::<IceCandidate>(&candidate).await {
                Ok(candidate) => {
                    if let Some(pc) = self.peer.as_mut() {
                        if let Err(e) = pc.add_ice_candidate(candidate).await {
                            // Often just early; later candidates or reconnection cover it.
                            debug!("remote candidate not applied: {e}");
                        }
                    }
                }
                Err(e) => debug!("could not open remote candidate: {e}"),
            },
            Signal::CallState { state, .. } => self.emit(CallUpdate::PeerState(state)),
            Signal::CallMute { muted, .. } => self.emit(CallUpdate::PeerMuted(muted)),
            Signal::CallEnded { .. } | Signal::CallDeclined { .. } => {
                info!(conversation_id = %self.target.conversation_id, "peer ended the call");
                // No call-ended echo back to the peer.
                self.close(false, CallStatus::Off).await;
            }
        }
    }

    /// Wait for the next transport event or timer expiry. `None` once the
    /// session is closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        match self.events_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Apply a transport event. Returns `ReconnectTimeout` when the
    /// reconnect window ran out; the session is already torn down then.
    pub async fn handle_event(&mut self, event: SessionEvent) -> Result<(), CallError> {
        if self.closed {
            return Ok(());
        }
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                match self.seal(&candidate).await {
                    Ok(sealed) => {
                        let signal = Signal::CallIce {
                            conversation_id: self.target.conversation_id.clone(),
                            sender_id: self.target.local_user_id.clone(),
                            candidate: sealed,
                        };
                        if let Err(e) = self.send(signal).await {
                            warn!("failed to send local candidate: {e}");
                        }
                    }
                    Err(e) => warn!("failed to seal local candidate: {e}"),
                }
                Ok(())
            }
            SessionEvent::ConnectionState(state) => {
                self.on_connection_state(state).await;
                Ok(())
            }
            SessionEvent::RemoteTrack(track) => {
                debug!(track_id = track.id(), "remote track added");
                self.remote_tracks.push(track.clone());
                self.emit(CallUpdate::RemoteTrackAdded(track));
                Ok(())
            }
            SessionEvent::ReconnectTimeout { generation } => {
                if generation != self.timer_generation || self.state != CallStatus::Reconnecting {
                    return Ok(());
                }
                warn!(
                    conversation_id = %self.target.conversation_id,
                    window = ?self.deps.config.reconnect_window,
                    "connection did not recover, ending call"
                );
                self.reconnect_timer = None;
                self.close(true, CallStatus::Failed).await;
                Err(CallError::ReconnectTimeout)
            }
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        debug!(?state, "transport connection state");
        match state {
            ConnectionState::Connected => {
                self.clear_reconnect_timer();
                let recovered = self.state == CallStatus::Reconnecting;
                self.set_state(CallStatus::Live);
                if recovered {
                    self.send_status(CallStatus::Live).await;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if !matches!(self.state, CallStatus::Connecting | CallStatus::Live) {
                    return;
                }
                self.set_state(CallStatus::Reconnecting);
                self.arm_reconnect_timer();
                if let Some(pc) = self.peer.as_mut() {
                    if let Err(e) = pc.restart_ice().await {
                        debug!("ICE restart not attempted: {e}");
                    }
                }
                self.send_status(CallStatus::Reconnecting).await;
            }
            ConnectionState::Closed => self.close(false, CallStatus::Off).await,
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    // ── Controls ────────────────────────────────────────────────────────

    /// Enable/disable local audio tracks. No renegotiation; a `call-mute`
    /// status signal is sent best-effort.
    pub async fn set_muted(&mut self, muted: bool) -> bool {
        if let Some(media) = &self.local_media {
            media.set_enabled(TrackKind::Audio, !muted);
        }
        self.muted = muted;
        self.emit(CallUpdate::Muted(muted));

        if !self.closed {
            let signal = Signal::CallMute {
                conversation_id: self.target.conversation_id.clone(),
                sender_id: self.target.local_user_id.clone(),
                muted,
            };
            if let Err(e) = self.send(signal).await {
                debug!("mute status not delivered: {e}");
            }
        }
        self.muted
    }

    pub async fn toggle_mute(&mut self) -> bool {
        self.set_muted(!self.muted).await
    }

    /// Enable/disable local video tracks. Video calls only.
    pub fn toggle_video(&mut self) -> Result<bool, CallError> {
        if !self.mode.has_video() {
            return Err(CallError::NotVideoCall);
        }
        if self.closed {
            return Err(CallError::SessionClosed);
        }
        self.video_enabled = !self.video_enabled;
        if let Some(media) = &self.local_media {
            media.set_enabled(TrackKind::Video, self.video_enabled);
        }
        self.emit(CallUpdate::VideoEnabled(self.video_enabled));
        Ok(self.video_enabled)
    }

    /// Hang up: tear down and tell the peer.
    pub async fn end(&mut self) {
        self.close(true, CallStatus::Off).await;
    }

    /// Tear the session down. Idempotent.
    ///
    /// Detaches transport events, closes the peer connection, stops every
    /// local track, clears the reconnect timer and notifies subscribers.
    /// `send_ended` must be false when the close was caused by the peer's
    /// own `call-ended`/`call-declined`.
    pub async fn close(&mut self, send_ended: bool, final_state: CallStatus) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.events_rx = None;
        if let Some(mut pc) = self.peer.take() {
            pc.close().await;
        }
        if let Some(media) = self.local_media.take() {
            media.stop_all();
            self.emit(CallUpdate::LocalMediaRemoved);
        }
        self.clear_reconnect_timer();
        self.remote_tracks.clear();
        self.emit(CallUpdate::RemoteMediaRemoved);

        let final_state = if final_state.is_terminal() {
            final_state
        } else {
            CallStatus::Off
        };
        self.set_state(final_state);

        if send_ended {
            let signal = Signal::CallEnded {
                conversation_id: self.target.conversation_id.clone(),
                sender_id: self.target.local_user_id.clone(),
            };
            if let Err(e) = self.send(signal).await {
                warn!("failed to notify peer of call end: {e}");
            }
        }
        info!(conversation_id = %self.target.conversation_id, state = %final_state, "call closed");
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> CallStatus {
        self.state
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn reconnect_timer_armed(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn remote_tracks(&self) -> &[TrackRef] {
        &self.remote_tracks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallUpdate> {
        self.updates.subscribe()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn peer_mut(&mut self) -> Result<&mut Box<dyn PeerConnection>, CallError> {
        self.peer.as_mut().ok_or(CallError::SessionClosed)
    }

    fn set_state(&mut self, state: CallStatus) {
        if self.state == state {
            return;
        }
        info!(
            conversation_id = %self.target.conversation_id,
            from = %self.state,
            to = %state,
            "call state"
        );
        self.state = state;
        self.emit(CallUpdate::State(state));
    }

    fn emit(&self, update: CallUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn arm_reconnect_timer(&mut self) {
        self.clear_reconnect_timer();
        let generation = self.timer_generation;
        let window = self.deps.config.reconnect_window;
        let tx = self.events_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(SessionEvent::ReconnectTimeout { generation });
        }));
    }

    fn clear_reconnect_timer(&mut self) {
        // Bumping the generation invalidates an expiry that was already queued.
        self.timer_generation += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    async fn seal<T: Serialize>(&self, payload: &T) -> Result<String, CryptoError> {
        let t = &self.target;
        self.deps
            .crypto
            .encrypt_json(&t.conversation_id, &t.local_user_id, &t.peer_id, payload)
            .await
    }

    async fn open<T: DeserializeOwned>(&self, sealed: &str) -> Result<T, CryptoError> {
        let t = &self.target;
        self.deps
            .crypto
            .decrypt_json(&t.conversation_id, &t.local_user_id, &t.peer_id, sealed)
            .await
    }

    async fn send(&self, signal: Signal) -> Result<(), CallError> {
        self.deps.signaling.send(&self.target.peer_id, signal).await?;
        Ok(())
    }

    async fn send_status(&self, state: CallStatus) {
        let signal = Signal::CallState {
            conversation_id: self.target.conversation_id.clone(),
            sender_id: self.target.local_user_id.clone(),
            state,
        };
        if let Err(e) = self.send(signal).await {
            debug!(%state, "status not delivered: {e}");
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // Dropped without close(): still release devices, the timer and the
        // peer connection. No signal is sent to the peer.
        if !self.closed {
            if let Some(media) = self.local_media.take() {
                media.stop_all();
            }
            if let Some(timer) = self.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(mut pc) = self.peer.take() {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move { pc.close().await });
                    }
                    Err(_) => warn!("session dropped outside a runtime, peer connection not closed"),
                }
            }
        }
    }
}
