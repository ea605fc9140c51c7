//! In-memory fakes for the media, transport and signaling seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tandem_crypto::{E2eeService, MemoryDirectory, MemorySecureStore};
use tandem_protocol::{IceCandidate, SdpKind, SessionDescription, Signal};

use crate::error::{MediaError, SignalingError, TransportError};
use crate::media::{MediaConstraints, MediaSource, MediaTrack, TrackKind, TrackRef};
use crate::session::{CallConfig, CallDeps};
use crate::transport::{PeerConnection, PeerConnectionFactory, SignalingTransport, TransportEvents};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Media ───────────────────────────────────────────────────────────────

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out fresh [`FakeTrack`]s and remembers every one of them.
#[derive(Default)]
pub struct FakeMediaSource {
    captured: Mutex<Vec<Arc<FakeTrack>>>,
    deny: AtomicBool,
}

impl FakeMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent captures fail as if permission was refused.
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn captured(&self) -> Vec<Arc<FakeTrack>> {
        lock(&self.captured).clone()
    }

    pub fn track(&self, kind: TrackKind) -> Option<Arc<FakeTrack>> {
        lock(&self.captured).iter().find(|t| t.kind == kind).cloned()
    }

    pub fn all_stopped(&self) -> bool {
        lock(&self.captured).iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn capture(&self, constraints: MediaConstraints) -> Result<Vec<TrackRef>, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone"));
        }
        let mut captured = lock(&self.captured);
        let mut out: Vec<TrackRef> = Vec::new();
        let n = captured.len();
        if constraints.audio {
            let track = FakeTrack::new(&format!("audio-{n}"), TrackKind::Audio);
            captured.push(track.clone());
            out.push(track);
        }
        if constraints.video {
            let track = FakeTrack::new(&format!("video-{n}"), TrackKind::Video);
            captured.push(track.clone());
            out.push(track);
        }
        Ok(out)
    }
}

// ── Peer connection ─────────────────────────────────────────────────────

/// What the fake peer connections were asked to do.
#[derive(Default)]
pub struct PeerLog {
    pub created: usize,
    pub tracks_added: Vec<String>,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub rejected_candidates: usize,
    pub ice_restarts: usize,
    pub closed: usize,
}

#[derive(Default)]
pub struct FakePeerFactory {
    log: Arc<Mutex<PeerLog>>,
    events: Mutex<Option<TransportEvents>>,
    fail_create: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> MutexGuard<'_, PeerLog> {
        lock(&self.log)
    }

    /// The event handle given to the most recently created connection.
    pub fn events(&self) -> Option<TransportEvents> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerConnection>, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("no peer connection available".into()));
        }
        lock(&self.log).created += 1;
        *lock(&self.events) = Some(events);
        Ok(Box::new(FakePeerConnection {
            log: self.log.clone(),
            has_remote: false,
        }))
    }
}

pub struct FakePeerConnection {
    log: Arc<Mutex<PeerLog>>,
    has_remote: bool,
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&mut self, track: TrackRef) -> Result<(), TransportError> {
        lock(&self.log).tracks_added.push(track.id().to_owned());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        if !self.has_remote {
            return Err(TransportError::Failed("answer without remote offer".into()));
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), TransportError> {
        lock(&self.log).local_descriptions.push(desc);
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), TransportError> {
        if desc.kind == SdpKind::Answer && lock(&self.log).local_descriptions.is_empty() {
            return Err(TransportError::Failed("answer before offer".into()));
        }
        self.has_remote = true;
        lock(&self.log).remote_descriptions.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut log = lock(&self.log);
        if !self.has_remote {
            log.rejected_candidates += 1;
            return Err(TransportError::Failed("no remote description".into()));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn restart_ice(&mut self) -> Result<(), TransportError> {
        lock(&self.log).ice_restarts += 1;
        Ok(())
    }

    async fn close(&mut self) {
        lock(&self.log).closed += 1;
    }
}

// ── Signaling ───────────────────────────────────────────────────────────

/// Records every outbound signal instead of delivering it.
#[derive(Default)]
pub struct FakeSignaling {
    sent: Mutex<Vec<(String, Signal)>>,
    offline: AtomicBool,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Signal)> {
        lock(&self.sent).clone()
    }

    /// Remove and return everything sent so far.
    pub fn drain(&self) -> Vec<Signal> {
        lock(&self.sent).drain(..).map(|(_, s)| s).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        lock(&self.sent)
            .iter()
            .filter(|(_, s)| s.event_name() == event)
            .count()
    }

    pub fn last(&self, event: &str) -> Option<Signal> {
        lock(&self.sent)
            .iter()
            .rev()
            .find(|(_, s)| s.event_name() == event)
            .map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl SignalingTransport for FakeSignaling {
    async fn send(&self, peer_id: &str, signal: Signal) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError("relay offline".into()));
        }
        lock(&self.sent).push((peer_id.to_owned(), signal));
        Ok(())
    }
}

// ── Wiring ──────────────────────────────────────────────────────────────

/// One side of a call with every seam faked.
pub struct Endpoint {
    pub user_id: String,
    pub crypto: Arc<E2eeService>,
    pub signaling: Arc<FakeSignaling>,
    pub peers: Arc<FakePeerFactory>,
    pub media: Arc<FakeMediaSource>,
    pub config: CallConfig,
}

impl Endpoint {
    /// A fresh endpoint whose identity lives in `directory`.
    pub fn new(user_id: &str, directory: Arc<MemoryDirectory>) -> Self {
        Self {
            user_id: user_id.to_owned(),
            crypto: Arc::new(E2eeService::new(Arc::new(MemorySecureStore::new()), directory)),
            signaling: FakeSignaling::new(),
            peers: FakePeerFactory::new(),
            media: FakeMediaSource::new(),
            config: CallConfig::default(),
        }
    }

    pub fn deps(&self) -> CallDeps {
        CallDeps {
            crypto: self.crypto.clone(),
            signaling: self.signaling.clone(),
            peers: self.peers.clone(),
            media: self.media.clone(),
            config: self.config,
        }
    }
}

/// Caller and callee sharing one key directory, both keys published.
pub async fn endpoint_pair(caller: &str, callee: &str) -> (Endpoint, Endpoint) {
    let directory = Arc::new(MemoryDirectory::new());
    let a = Endpoint::new(caller, directory.clone());
    let b = Endpoint::new(callee, directory);
    for end in [&a, &b] {
        if let Err(e) = end.crypto.ensure_local_key_pair(&end.user_id).await {
            panic!("publishing test identity failed: {e}");
        }
    }
    (a, b)
}
