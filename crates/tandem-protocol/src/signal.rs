use serde::{Deserialize, Serialize};

use crate::types::*;

/// Signaling events exchanged between the two peers of a call.
///
/// `offer`, `answer` and `candidate` hold sealed payloads (an `e2ee:v1`
/// envelope, or plain JSON when the sender had no key for us). They decode
/// to [`SessionDescription`] and [`IceCandidate`] respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Signal {
    /// Caller → callee. Starts a call.
    CallOffer {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
        offer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<CallMode>,
    },

    /// Callee → caller.
    CallAnswer {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
        answer: String,
    },

    /// Either direction, any number of times.
    CallIce {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
        candidate: String,
    },

    /// Status only, lets the peer's UI mirror ours.
    CallState {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
        state: CallStatus,
    },

    /// Terminal. Either side hung up.
    CallEnded {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
    },

    /// Terminal. Callee refused the offer (or was busy).
    CallDeclined {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
    },

    /// Status only.
    CallMute {
        #[serde(rename = "conversationOrMatchId")]
        conversation_id: ConversationId,
        sender_id: UserId,
        muted: bool,
    },
}

impl Signal {
    /// The event name used on the relay.
    pub fn event_name(&self) -> &'static str {
        match self {
            Signal::CallOffer { .. } => "call-offer",
            Signal::CallAnswer { .. } => "call-answer",
            Signal::CallIce { .. } => "call-ice",
            Signal::CallState { .. } => "call-state",
            Signal::CallEnded { .. } => "call-ended",
            Signal::CallDeclined { .. } => "call-declined",
            Signal::CallMute { .. } => "call-mute",
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Signal::CallOffer { conversation_id, .. }
            | Signal::CallAnswer { conversation_id, .. }
            | Signal::CallIce { conversation_id, .. }
            | Signal::CallState { conversation_id, .. }
            | Signal::CallEnded { conversation_id, .. }
            | Signal::CallDeclined { conversation_id, .. }
            | Signal::CallMute { conversation_id, .. } => conversation_id,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Signal::CallOffer { sender_id, .. }
            | Signal::CallAnswer { sender_id, .. }
            | Signal::CallIce { sender_id, .. }
            | Signal::CallState { sender_id, .. }
            | Signal::CallEnded { sender_id, .. }
            | Signal::CallDeclined { sender_id, .. }
            | Signal::CallMute { sender_id, .. } => sender_id,
        }
    }

    /// Whether receiving this signal ends the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Signal::CallEnded { .. } | Signal::CallDeclined { .. })
    }
}
