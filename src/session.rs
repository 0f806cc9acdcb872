// src/session.rs
//
// One participant's media session inside a room: its WebRTC endpoint, its
// mixer port, the offer/answer state and the remote candidates waiting for
// the endpoint.
//
// Lifecycle:
//
//   Joined ──offer──▶ OfferReceived ──gathering started──▶ Negotiated
//      │                   │                                   │
//      └───────────────────┴──────────── close ────────────────┴──▶ Left
//
// The room owns the session and its handles; the session never releases
// anything itself.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::candidate::{Admission, CandidateBuffer};
use crate::error::SignalingError;
use crate::media::{bounded, CandidateListener, EndpointHandle, IceCandidate, PortHandle};
use crate::protocol::OutboundMessage;
use crate::room::RoomServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Joined,
    OfferReceived,
    Negotiated,
    Left,
}

pub struct ParticipantSession {
    participant_id: String,
    endpoint: EndpointHandle,
    port: PortHandle,
    state: Mutex<NegotiationState>,
    /// Held while queued candidates are applied so that later arrivals wait
    /// behind them.
    candidates: AsyncMutex<CandidateBuffer>,
    /// Serializes offers from the same participant.
    negotiation: AsyncMutex<()>,
    listening: AtomicBool,
}

impl ParticipantSession {
    pub(crate) fn new(
        participant_id: &str,
        endpoint: EndpointHandle,
        port: PortHandle,
        pending: Vec<IceCandidate>,
    ) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            endpoint,
            port,
            state: Mutex::new(NegotiationState::Joined),
            candidates: AsyncMutex::new(CandidateBuffer::with_pending(pending)),
            negotiation: AsyncMutex::new(()),
            listening: AtomicBool::new(false),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn endpoint(&self) -> &EndpointHandle {
        &self.endpoint
    }

    pub fn port(&self) -> &PortHandle {
        &self.port
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Left
    }

    /// Mark the session as gone.  Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let was_open = *state != NegotiationState::Left;
        *state = NegotiationState::Left;
        if let Ok(mut buffer) = self.candidates.try_lock() {
            buffer.discard();
        }
        was_open
    }

    /// Move forward unless the session has been closed meanwhile.
    fn advance(&self, to: NegotiationState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == NegotiationState::Left {
            return false;
        }
        *state = to;
        true
    }

    // ─── Offer / answer ─────────────────────────────────────────────────────

    /// Run the offer through the endpoint and return the SDP answer.
    ///
    /// Order on the endpoint: candidate subscription (first offer only),
    /// queued remote candidates, `processOffer`, `gatherCandidates`.
    pub async fn receive_offer(
        self: &Arc<Self>,
        services: &RoomServices,
        offer: &str,
    ) -> Result<String, SignalingError> {
        let _turn = self.negotiation.lock().await;

        match self.state() {
            NegotiationState::Left => {
                return Err(SignalingError::no_such_session(&self.participant_id))
            }
            NegotiationState::Negotiated => {
                return Err(SignalingError::Negotiation(
                    "session already negotiated; renegotiation is not supported".into(),
                ))
            }
            NegotiationState::Joined | NegotiationState::OfferReceived => {}
        }

        self.subscribe(services).await?;
        self.flush_candidates(services).await;

        let answer = bounded(
            services.engine_timeout,
            "processOffer",
            services.engine.process_offer(&self.endpoint, offer),
        )
        .await
        .map_err(SignalingError::from_negotiation)?;

        if !self.advance(NegotiationState::OfferReceived) {
            return Err(SignalingError::no_such_session(&self.participant_id));
        }

        // The endpoint already holds the remote description, so the answer
        // stands even if gathering could not be started.
        if let Err(e) = bounded(
            services.engine_timeout,
            "gatherCandidates",
            services.engine.gather_candidates(&self.endpoint),
        )
        .await
        {
            warn!(participant_id = %self.participant_id, endpoint = %self.endpoint.id(), "candidate gathering not started: {e}");
        }

        if !self.advance(NegotiationState::Negotiated) {
            return Err(SignalingError::no_such_session(&self.participant_id));
        }
        info!(participant_id = %self.participant_id, endpoint = %self.endpoint.id(), "negotiated");
        Ok(answer)
    }

    /// Forward server-side candidates to the participant.  Registered once;
    /// the listener stops delivering as soon as the session is closed.
    async fn subscribe(self: &Arc<Self>, services: &RoomServices) -> Result<(), SignalingError> {
        if self.listening.load(Ordering::Acquire) {
            return Ok(());
        }

        let session = Arc::downgrade(self);
        let sink = services.sink.clone();
        let listener: CandidateListener = Arc::new(move |candidate: IceCandidate| {
            let Some(session) = session.upgrade() else { return };
            if session.is_closed() {
                debug!(participant_id = %session.participant_id, "dropping candidate for closed session");
                return;
            }
            sink.deliver(
                &session.participant_id,
                OutboundMessage::IceCandidate {
                    user_id: session.participant_id.clone(),
                    candidate,
                },
            );
        });

        bounded(
            services.engine_timeout,
            "subscribe",
            services.engine.on_candidate_discovered(&self.endpoint, listener),
        )
        .await?;
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    /// Apply everything queued so far and switch the buffer to pass-through.
    /// A candidate the endpoint refuses is logged and skipped.
    async fn flush_candidates(&self, services: &RoomServices) {
        let mut buffer = self.candidates.lock().await;
        if buffer.is_drained() {
            return;
        }
        let queued = buffer.drain();
        if !queued.is_empty() {
            debug!(participant_id = %self.participant_id, count = queued.len(), "applying queued candidates");
        }
        for candidate in &queued {
            if let Err(e) = bounded(
                services.engine_timeout,
                "addIceCandidate",
                services.engine.add_candidate(&self.endpoint, candidate),
            )
            .await
            {
                warn!(participant_id = %self.participant_id, "queued candidate not applied: {e}");
            }
        }
    }

    // ─── Trickle ICE ────────────────────────────────────────────────────────

    /// Queue the candidate until the first offer, apply it directly after.
    pub async fn receive_candidate(
        &self,
        services: &RoomServices,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        if self.is_closed() {
            debug!(participant_id = %self.participant_id, "candidate for closed session dropped");
            return Ok(());
        }

        let mut buffer = self.candidates.lock().await;
        match buffer.admit(candidate) {
            Admission::Queued => {
                debug!(participant_id = %self.participant_id, queued = buffer.len(), "candidate queued");
                Ok(())
            }
            Admission::Apply(candidate) => bounded(
                services.engine_timeout,
                "addIceCandidate",
                services.engine.add_candidate(&self.endpoint, &candidate),
            )
            .await
            .map_err(SignalingError::from_negotiation),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
