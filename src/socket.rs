use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use socketioxide::extract::{Data, SocketRef};
use socketioxide::SocketIo;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ErrorPayload, SignalingError};
use crate::media::IceCandidate;
use crate::protocol::{InboundMessage, OutboundMessage, SignalSink, MESSAGE_EVENT};
use crate::registry::RoomRegistry;

// ---------------------------------------------------------------------------
// SocketSink — delivers core output to one socket
// ---------------------------------------------------------------------------

/// Every socket joins a Socket.IO room named after its own id, so a
/// participant id is enough to address it.
#[derive(Clone)]
pub struct SocketSink {
    io: SocketIo,
}

impl SocketSink {
    pub fn new(io: SocketIo) -> Self {
        Self { io }
    }
}

impl SignalSink for SocketSink {
    fn deliver(&self, participant_id: &str, message: OutboundMessage) {
        if let Err(e) = self
            .io
            .to(participant_id.to_string())
            .emit(MESSAGE_EVENT, &message)
        {
            warn!(participant_id = %participant_id, error = %e, "failed to emit to socket");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// Most candidates one connection holds for rooms it has not joined yet.
const MAX_EARLY_CANDIDATES: usize = 64;

enum Command {
    Message(InboundMessage),
    Disconnect,
}

/// Messages of one socket are handled one at a time, in arrival order, by a
/// task owned by the connection.  The event handlers only queue, and they are
/// synchronous so that queueing happens in the order events are dispatched.
pub async fn on_connect(socket: SocketRef, registry: Arc<RoomRegistry>, sink: Arc<dyn SignalSink>) {
    let participant_id = socket.id.to_string();
    socket.join(participant_id.clone()).ok();

    let (commands, inbox) = mpsc::unbounded_channel();

    socket.on(MESSAGE_EVENT, {
        let commands = commands.clone();
        move |socket: SocketRef, Data::<Value>(raw)| {
            if let Err(e) = enqueue(&commands, raw) {
                warn!(sid = %socket.id, error = %e, "invalid signaling payload");
                let _ = socket.emit(
                    MESSAGE_EVENT,
                    &OutboundMessage::Error(ErrorPayload::invalid_payload(e)),
                );
            }
        }
    });

    socket.on_disconnect(move |socket: SocketRef| {
        info!(sid = %socket.id, "socket disconnected");
        let _ = commands.send(Command::Disconnect);
    });

    info!(sid = %socket.id, "socket connected");
    tokio::spawn(serve_participant(participant_id, inbox, registry, sink));
}

fn enqueue(commands: &mpsc::UnboundedSender<Command>, raw: Value) -> Result<(), serde_json::Error> {
    let message = serde_json::from_value::<InboundMessage>(raw)?;
    let _ = commands.send(Command::Message(message));
    Ok(())
}

async fn serve_participant(
    participant_id: String,
    mut inbox: mpsc::UnboundedReceiver<Command>,
    registry: Arc<RoomRegistry>,
    sink: Arc<dyn SignalSink>,
) {
    let mut membership = Membership::default();
    while let Some(command) = inbox.recv().await {
        match command {
            Command::Message(message) => {
                handle_message(&registry, sink.as_ref(), &participant_id, &mut membership, message)
                    .await
            }
            Command::Disconnect => break,
        }
    }

    for room_id in membership.joined {
        registry.leave(&room_id, &participant_id).await;
    }
    debug!(participant_id = %participant_id, "participant cleaned up");
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// The rooms of one connection, as seen from its own message stream.
///
/// Candidates for a room the participant has not joined are held here, up to
/// [`MAX_EARLY_CANDIDATES`] in total, and handed to the join.  Candidates for
/// a room it has left are stale and dropped.
#[derive(Debug, Default)]
pub struct Membership {
    joined: HashSet<String>,
    departed: HashSet<String>,
    early: HashMap<String, Vec<IceCandidate>>,
}

impl Membership {
    fn held(&self) -> usize {
        self.early.values().map(Vec::len).sum()
    }

    /// Returns false when the candidate was dropped.
    fn hold(&mut self, room_id: &str, candidate: IceCandidate) -> bool {
        if self.departed.contains(room_id) || self.held() >= MAX_EARLY_CANDIDATES {
            return false;
        }
        self.early.entry(room_id.to_string()).or_default().push(candidate);
        true
    }
}

// ---------------------------------------------------------------------------
// Message dispatch
// ---------------------------------------------------------------------------

/// Route one message into the registry and answer the sender.
pub async fn handle_message(
    registry: &RoomRegistry,
    sink: &dyn SignalSink,
    participant_id: &str,
    membership: &mut Membership,
    message: InboundMessage,
) {
    debug!(
        participant_id = %participant_id,
        room_id = %message.room_name(),
        user_name = message.user_name().unwrap_or("-"),
        kind = message.kind(),
        "signaling message"
    );

    match message {
        InboundMessage::JoinRoom { room_name, user_name } => {
            membership.departed.remove(&room_name);
            let early = membership.early.remove(&room_name).unwrap_or_default();
            let reply = match registry.join(&room_name, participant_id, early).await {
                Ok(()) => {
                    membership.joined.insert(room_name.clone());
                    OutboundMessage::JoinRoomSuccess { room_name, user_name }
                }
                Err(e) => OutboundMessage::JoinRoomFailure {
                    room_name,
                    error: e.to_payload(),
                },
            };
            sink.deliver(participant_id, reply);
        }

        InboundMessage::SdpOffer { room_name, sdp_offer, .. } => {
            match registry.receive_offer(&room_name, participant_id, &sdp_offer).await {
                Ok(sdp_answer) => {
                    info!(room_id = %room_name, participant_id = %participant_id, "answer sent");
                    sink.deliver(
                        participant_id,
                        OutboundMessage::SdpAnswer {
                            user_id: participant_id.to_string(),
                            sdp_answer,
                        },
                    );
                }
                Err(e) => sink.deliver(participant_id, OutboundMessage::Error(e.to_payload())),
            }
        }

        InboundMessage::IceCandidate { room_name, candidate, .. } => {
            if !membership.joined.contains(&room_name) {
                if !membership.hold(&room_name, candidate) {
                    debug!(room_id = %room_name, participant_id = %participant_id, "candidate dropped");
                }
                return;
            }
            match registry
                .receive_candidate(&room_name, participant_id, candidate)
                .await
            {
                Ok(()) => {}
                Err(e @ (SignalingError::RoomNotFound { .. } | SignalingError::NoSuchSession { .. })) => {
                    debug!(room_id = %room_name, participant_id = %participant_id, "stale candidate dropped: {e}");
                }
                Err(e) => sink.deliver(participant_id, OutboundMessage::Error(e.to_payload())),
            }
        }

        InboundMessage::LeaveRoom { room_name, .. } => {
            registry.leave(&room_name, participant_id).await;
            membership.joined.remove(&room_name);
            membership.early.remove(&room_name);
            membership.departed.insert(room_name);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
