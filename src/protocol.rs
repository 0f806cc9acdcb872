// src/protocol.rs
//
// Signaling wire format.  Every message travels as the payload of a single
// Socket.IO event named `message` and carries an `id` discriminator, the
// format the browser client speaks.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::media::IceCandidate;

/// Socket.IO event name for both directions.
pub const MESSAGE_EVENT: &str = "message";

// ─── Inbound ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "id")]
pub enum InboundMessage {
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        room_name: String,
        #[serde(default)]
        user_name: Option<String>,
    },

    #[serde(rename = "sdpOffer", rename_all = "camelCase")]
    SdpOffer {
        room_name: String,
        sdp_offer: String,
        #[serde(default)]
        user_name: Option<String>,
    },

    #[serde(rename = "onIceCandidate", rename_all = "camelCase")]
    IceCandidate {
        room_name: String,
        candidate: IceCandidate,
        #[serde(default)]
        user_name: Option<String>,
    },

    #[serde(rename = "leaveRoom", rename_all = "camelCase")]
    LeaveRoom {
        room_name: String,
        #[serde(default)]
        user_name: Option<String>,
    },
}

impl InboundMessage {
    pub fn room_name(&self) -> &str {
        match self {
            Self::JoinRoom { room_name, .. }
            | Self::SdpOffer { room_name, .. }
            | Self::IceCandidate { room_name, .. }
            | Self::LeaveRoom { room_name, .. } => room_name,
        }
    }

    pub fn user_name(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { user_name, .. }
            | Self::SdpOffer { user_name, .. }
            | Self::IceCandidate { user_name, .. }
            | Self::LeaveRoom { user_name, .. } => user_name.as_deref(),
        }
    }

    /// Wire `id`, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::SdpOffer { .. } => "sdpOffer",
            Self::IceCandidate { .. } => "onIceCandidate",
            Self::LeaveRoom { .. } => "leaveRoom",
        }
    }
}

// ─── Outbound ───────────────────────────────────────────────────────────────

/// Messages pushed to one participant; the server never broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "id")]
pub enum OutboundMessage {
    #[serde(rename = "joinRoomSuccess", rename_all = "camelCase")]
    JoinRoomSuccess {
        room_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    #[serde(rename = "joinRoomFailure", rename_all = "camelCase")]
    JoinRoomFailure {
        room_name: String,
        #[serde(flatten)]
        error: ErrorPayload,
    },

    #[serde(rename = "sdpAnswer", rename_all = "camelCase")]
    SdpAnswer { user_id: String, sdp_answer: String },

    /// A candidate the media server discovered for this participant.
    #[serde(rename = "iceCandidate", rename_all = "camelCase")]
    IceCandidate {
        user_id: String,
        candidate: IceCandidate,
    },

    #[serde(rename = "error")]
    Error(ErrorPayload),
}

// ─── SignalSink ─────────────────────────────────────────────────────────────

/// Transport callback used by the core to reach a single participant.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, participant_id: &str, message: OutboundMessage);
}

/// Captures outbound traffic for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    sent: std::sync::Mutex<Vec<(String, OutboundMessage)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, participant_id: &str) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == participant_id)
            .map(|(_, m)| m)
            .collect()
    }
}

#[cfg(test)]
impl SignalSink for RecordingSink {
    fn deliver(&self, participant_id: &str, message: OutboundMessage) {
        self.sent
            .lock()
            .unwrap()
            .push((participant_id.to_string(), message));
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
