use serde::Serialize;

// ─── MediaError ─────────────────────────────────────────────────────────────

/// Failure reported by (or while talking to) the media server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    /// The media server could not be reached, or the control channel dropped.
    #[error("media server unavailable: {0}")]
    Unavailable(String),

    /// The bounded wait on a media server call elapsed.
    #[error("media server did not answer '{operation}' in time")]
    Timeout { operation: &'static str },

    /// The media server answered with an error.
    #[error("media server rejected '{operation}': {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    /// The media server answered with something we cannot interpret.
    #[error("unexpected media server response: {0}")]
    Protocol(String),
}

// ─── SignalingError ─────────────────────────────────────────────────────────

/// Errors surfaced to the participant whose message caused them.
///
/// A failure never affects the other participants of the room: every path
/// that returns one of these has already released whatever it allocated.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// Stale message for a room that has been torn down.
    #[error("room '{room_id}' does not exist")]
    RoomNotFound { room_id: String },

    /// Message arrived before `join` completed (or after `leave`).
    #[error("no media session for participant '{participant_id}'")]
    NoSuchSession { participant_id: String },

    #[error(transparent)]
    MediaEngineUnavailable(#[from] MediaError),

    /// The media server refused the SDP/ICE exchange.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl SignalingError {
    pub fn room_not_found(room_id: &str) -> Self {
        Self::RoomNotFound {
            room_id: room_id.to_string(),
        }
    }

    pub fn no_such_session(participant_id: &str) -> Self {
        Self::NoSuchSession {
            participant_id: participant_id.to_string(),
        }
    }

    /// Map an engine failure that happened during the offer/answer or ICE
    /// exchange: a rejection is a negotiation problem, anything else is
    /// infrastructure.
    pub fn from_negotiation(err: MediaError) -> Self {
        match err {
            MediaError::Rejected { reason, .. } => Self::Negotiation(reason),
            other => Self::MediaEngineUnavailable(other),
        }
    }

    /// Stable wire code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound { .. } => "room_not_found",
            Self::NoSuchSession { .. } => "no_such_session",
            Self::MediaEngineUnavailable(_) => "media_engine_unavailable",
            Self::Negotiation(_) => "negotiation_failed",
        }
    }

    /// True for failures caused by infrastructure rather than by the client.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::MediaEngineUnavailable(_))
    }

    /// Log at a severity that matches the cause and build the wire payload.
    pub fn to_payload(&self) -> ErrorPayload {
        if self.is_infrastructure() {
            tracing::error!(code = self.code(), "{self}");
        } else {
            tracing::warn!(code = self.code(), "{self}");
        }

        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

// ─── Wire envelope ──────────────────────────────────────────────────────────

/// `{ "code": "...", "message": "..." }` carried by negative acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn invalid_payload(detail: impl std::fmt::Display) -> Self {
        Self {
            code: "invalid_payload".to_string(),
            message: format!("Invalid message payload: {detail}"),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
