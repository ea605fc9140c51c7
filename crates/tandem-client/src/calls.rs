//! Routes inbound call signals to the single active session.

use tandem_call::{CallDeps, CallError, CallSession, CallTarget};
use tandem_protocol::{CallMode, Signal};
use tracing::{debug, info, warn};

/// What the UI should do after a signal was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterNotice {
    /// Ring: an offer is waiting for `accept` or `decline`.
    IncomingCall {
        conversation_id: String,
        peer_id: String,
        mode: CallMode,
    },
    /// Applied to the active session or the pending offer.
    Handled,
    Ignored,
    /// An offer arrived during another call and was declined.
    Busy,
}

pub struct CallRouter {
    deps: CallDeps,
    local_user_id: String,
    active: Option<CallSession>,
    pending: Option<Signal>,
}

fn same_call(a: &Signal, b: &Signal) -> bool {
    a.conversation_id() == b.conversation_id() && a.sender_id() == b.sender_id()
}

fn is_for(session: &CallSession, signal: &Signal) -> bool {
    let target = session.target();
    signal.conversation_id() == target.conversation_id && signal.sender_id() == target.peer_id
}

impl CallRouter {
    pub fn new(deps: CallDeps, local_user_id: impl Into<String>) -> Self {
        Self {
            deps,
            local_user_id: local_user_id.into(),
            active: None,
            pending: None,
        }
    }

    pub async fn on_signal(&mut self, signal: Signal) -> RouterNotice {
        if signal.sender_id() == self.local_user_id {
            return RouterNotice::Ignored;
        }

        if let Signal::CallOffer { mode, .. } = &signal {
            if self.active.as_ref().is_some_and(|s| is_for(s, &signal)) {
                debug!(peer_id = signal.sender_id(), "repeated offer for the active call, ignoring");
                return RouterNotice::Ignored;
            }
            let ringing_other = self.pending.as_ref().is_some_and(|p| !same_call(p, &signal));
            if self.active.is_some() || ringing_other {
                info!(peer_id = signal.sender_id(), "busy, declining incoming call");
                if let Err(e) =
                    CallSession::decline_incoming(&self.deps, &self.local_user_id, &signal).await
                {
                    warn!("failed to send busy decline: {e}");
                }
                return RouterNotice::Busy;
            }
            let notice = RouterNotice::IncomingCall {
                conversation_id: signal.conversation_id().to_owned(),
                peer_id: signal.sender_id().to_owned(),
                mode: mode.unwrap_or_default(),
            };
            self.pending = Some(signal);
            return notice;
        }

        if signal.is_terminal() && self.pending.as_ref().is_some_and(|p| same_call(p, &signal)) {
            debug!(peer_id = signal.sender_id(), "caller gave up before we answered");
            self.pending = None;
            return RouterNotice::Handled;
        }

        let Some(session) = self.active.as_mut() else {
            return RouterNotice::Ignored;
        };
        if !is_for(session, &signal) {
            return RouterNotice::Ignored;
        }
        session.handle_signal(signal).await;
        if session.is_closed() {
            self.active = None;
        }
        RouterNotice::Handled
    }

    /// Answer the pending offer.
    pub async fn accept(&mut self) -> Result<(), CallError> {
        if self.active.is_some() {
            return Err(CallError::CallInProgress);
        }
        let offer = self
            .pending
            .take()
            .ok_or(CallError::UnexpectedSignal("call-offer"))?;
        let session = CallSession::accept_incoming(self.deps.clone(), &self.local_user_id, &offer).await?;
        self.active = Some(session);
        Ok(())
    }

    pub async fn decline(&mut self) -> Result<(), CallError> {
        let offer = self
            .pending
            .take()
            .ok_or(CallError::UnexpectedSignal("call-offer"))?;
        CallSession::decline_incoming(&self.deps, &self.local_user_id, &offer).await
    }

    /// Place a call. Fails while another call is active.
    pub async fn start(&mut self, conversation_id: &str, peer_id: &str, mode: CallMode) -> Result<(), CallError> {
        if self.active.is_some() {
            return Err(CallError::CallInProgress);
        }
        let target = CallTarget::new(conversation_id, self.local_user_id.as_str(), peer_id);
        let session = CallSession::start_outgoing(self.deps.clone(), target, mode).await?;
        self.active = Some(session);
        Ok(())
    }

    pub async fn hang_up(&mut self) {
        if let Some(mut session) = self.active.take() {
            session.end().await;
        }
    }

    /// Wait for the active session's next transport event and apply it.
    /// `None` when there is no active call.
    pub async fn pump(&mut self) -> Option<Result<(), CallError>> {
        let session = self.active.as_mut()?;
        let Some(event) = session.next_event().await else {
            self.active = None;
            return None;
        };
        let result = session.handle_event(event).await;
        if session.is_closed() {
            self.active = None;
        }
        Some(result)
    }

    pub fn active(&self) -> Option<&CallSession> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut CallSession> {
        self.active.as_mut()
    }

    pub fn pending_offer(&self) -> Option<&Signal> {
        self.pending.as_ref()
    }
}
