use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MediaError, SignalingError};
use crate::media::{
    bounded, release_quietly, EndpointHandle, IceCandidate, MediaResourceClient, MixerHandle,
    PipelineHandle, PortHandle, Rollback,
};
use crate::protocol::SignalSink;
use crate::session::ParticipantSession;

// ---------------------------------------------------------------------------
// RoomServices
// ---------------------------------------------------------------------------

/// Collaborators shared by every room: the media server client, the way back
/// to participants and the bounded wait applied to each media server call.
#[derive(Clone)]
pub struct RoomServices {
    pub engine: Arc<dyn MediaResourceClient>,
    pub sink: Arc<dyn SignalSink>,
    pub engine_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// The room's media pipeline and the mixer every participant is attached to.
struct MixerGraph {
    pipeline: PipelineHandle,
    mixer: MixerHandle,
}

#[derive(Default)]
struct RoomState {
    graph: Option<MixerGraph>,
    participants: HashMap<String, Arc<ParticipantSession>>,
}

/// A named call.
///
/// All membership changes happen under one async lock, which is held across
/// the media server calls of a join or leave.  That makes "first join builds
/// the mixer" and "last leave releases it" mutually exclusive.
///
/// Once a room has emptied it is *retired*: it accepts nothing more and the
/// registry replaces it with a fresh room on the next join.
pub struct Room {
    room_id: String,
    services: RoomServices,
    state: Mutex<RoomState>,
    retired: AtomicBool,
    participants: AtomicUsize,
}

/// Point-in-time view of a room, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub participants: Vec<String>,
    pub has_media: bool,
}

impl Room {
    pub fn new(room_id: &str, services: RoomServices) -> Self {
        Self {
            room_id: room_id.to_string(),
            services,
            state: Mutex::new(RoomState::default()),
            retired: AtomicBool::new(false),
            participants: AtomicUsize::new(0),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Joined participants, read without taking the room lock.
    pub fn participant_count(&self) -> usize {
        self.participants.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        let mut participants: Vec<String> = state.participants.keys().cloned().collect();
        participants.sort();
        RoomSnapshot {
            participants,
            has_media: state.graph.is_some(),
        }
    }

    pub async fn session(&self, participant_id: &str) -> Option<Arc<ParticipantSession>> {
        self.state.lock().await.participants.get(participant_id).cloned()
    }

    fn engine(&self) -> &dyn MediaResourceClient {
        self.services.engine.as_ref()
    }

    fn limit(&self) -> Duration {
        self.services.engine_timeout
    }

    fn sync_count(&self, state: &RoomState) {
        self.participants
            .store(state.participants.len(), Ordering::Relaxed);
    }

    /// Called with the room lock held.
    fn retire_if_idle(&self, state: &RoomState) {
        if state.participants.is_empty() && state.graph.is_none() {
            self.retired.store(true, Ordering::Release);
            debug!(room_id = %self.room_id, "room retired");
        }
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    /// Give the participant an endpoint and a mixer port, wired both ways.
    /// The first join also creates the pipeline and mixer.
    ///
    /// `early` seeds the session's candidate buffer with candidates the
    /// participant trickled before joining.
    ///
    /// Joining twice is a no-op.  On failure nothing allocated for this call
    /// survives, `early` is dropped and the other participants are untouched.
    pub async fn join(
        &self,
        participant_id: &str,
        early: Vec<IceCandidate>,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock().await;
        if self.is_retired() {
            return Err(SignalingError::room_not_found(&self.room_id));
        }
        if state.participants.contains_key(participant_id) {
            debug!(room_id = %self.room_id, participant_id = %participant_id, "already joined");
            return Ok(());
        }

        let graph = match state.graph.take() {
            Some(graph) => graph,
            None => match self.build_graph().await {
                Ok(graph) => graph,
                Err(e) => {
                    self.retire_if_idle(&state);
                    return Err(e.into());
                }
            },
        };

        match self.attach(&graph, participant_id).await {
            Ok((endpoint, port)) => {
                state.graph = Some(graph);
                let session = ParticipantSession::new(participant_id, endpoint, port, early);
                state
                    .participants
                    .insert(participant_id.to_string(), Arc::new(session));
                self.sync_count(&state);
                info!(
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    participants = state.participants.len(),
                    "participant joined"
                );
                Ok(())
            }
            Err(e) => {
                if state.participants.is_empty() {
                    self.release_graph(graph).await;
                } else {
                    state.graph = Some(graph);
                }
                self.retire_if_idle(&state);
                Err(e.into())
            }
        }
    }

    async fn build_graph(&self) -> Result<MixerGraph, MediaError> {
        let pipeline = bounded(self.limit(), "create", self.engine().create_pipeline()).await?;

        let mut rollback = Rollback::new(self.engine(), self.limit());
        rollback.track(pipeline.id());
        match bounded(self.limit(), "create", self.engine().create_mixer(&pipeline)).await {
            Ok(mixer) => {
                rollback.commit();
                info!(
                    room_id = %self.room_id,
                    pipeline = %pipeline.id(),
                    mixer = %mixer.id(),
                    "media pipeline created"
                );
                Ok(MixerGraph { pipeline, mixer })
            }
            Err(e) => {
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    /// Endpoint + port, connected port→endpoint (mix out) and
    /// endpoint→port (participant in).
    async fn attach(
        &self,
        graph: &MixerGraph,
        participant_id: &str,
    ) -> Result<(EndpointHandle, PortHandle), MediaError> {
        let engine = self.engine();
        let limit = self.limit();
        let mut rollback = Rollback::new(engine, limit);

        let attached: Result<(EndpointHandle, PortHandle), MediaError> = async {
            let endpoint = bounded(limit, "create", engine.create_endpoint(&graph.pipeline)).await?;
            rollback.track(endpoint.id());
            let port = bounded(limit, "create", engine.create_port(&graph.mixer)).await?;
            rollback.track(port.id());
            bounded(limit, "connect", engine.connect(port.id(), endpoint.id())).await?;
            bounded(limit, "connect", engine.connect(endpoint.id(), port.id())).await?;
            Ok((endpoint, port))
        }
        .await;

        match attached {
            Ok(handles) => {
                rollback.commit();
                Ok(handles)
            }
            Err(e) => {
                warn!(room_id = %self.room_id, participant_id = %participant_id, "attach failed: {e}");
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    async fn release_graph(&self, graph: MixerGraph) {
        release_quietly(self.engine(), self.limit(), graph.mixer.id()).await;
        release_quietly(self.engine(), self.limit(), graph.pipeline.id()).await;
        info!(room_id = %self.room_id, pipeline = %graph.pipeline.id(), "media pipeline released");
    }

    // -----------------------------------------------------------------------
    // Leave
    // -----------------------------------------------------------------------

    /// Remove the participant and release its endpoint and port; the last one
    /// out releases the mixer and pipeline.  Unknown participants are a
    /// no-op.
    ///
    /// Returns true when the room is now retired.
    pub async fn leave(&self, participant_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if self.is_retired() {
            return true;
        }

        if let Some(session) = state.participants.remove(participant_id) {
            session.close();
            self.sync_count(&state);
            release_quietly(self.engine(), self.limit(), session.port().id()).await;
            release_quietly(self.engine(), self.limit(), session.endpoint().id()).await;
            info!(
                room_id = %self.room_id,
                participant_id = %session.participant_id(),
                participants = state.participants.len(),
                "participant left"
            );
        }

        if state.participants.is_empty() {
            if let Some(graph) = state.graph.take() {
                self.release_graph(graph).await;
            }
            self.retire_if_idle(&state);
        }
        self.is_retired()
    }

    // -----------------------------------------------------------------------
    // Negotiation
    // -----------------------------------------------------------------------

    pub async fn receive_offer(
        &self,
        participant_id: &str,
        offer: &str,
    ) -> Result<String, SignalingError> {
        let session = self
            .session(participant_id)
            .await
            .ok_or_else(|| SignalingError::no_such_session(participant_id))?;

        let answer = session.receive_offer(&self.services, offer).await?;

        // The participant may have left while the media server was busy.
        let current = self
            .session(participant_id)
            .await
            .is_some_and(|s| Arc::ptr_eq(&s, &session));
        if !current {
            warn!(room_id = %self.room_id, participant_id = %participant_id, "answer ready after participant left; dropped");
            return Err(SignalingError::no_such_session(participant_id));
        }
        Ok(answer)
    }

    /// Route a remote candidate to the participant's session.  The room keeps
    /// nothing for participants that are not in it: a candidate from someone
    /// who left, or who never joined, is `NoSuchSession`.
    pub async fn receive_candidate(
        &self,
        participant_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let session = {
            let state = self.state.lock().await;
            if self.is_retired() {
                return Err(SignalingError::room_not_found(&self.room_id));
            }
            state.participants.get(participant_id).cloned()
        };
        match session {
            Some(session) => session.receive_candidate(&self.services, candidate).await,
            None => {
                debug!(room_id = %self.room_id, participant_id = %participant_id, "candidate for absent participant");
                Err(SignalingError::no_such_session(participant_id))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{FakeEngine, FaultKind, Op};
    use crate::protocol::RecordingSink;

    fn c(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    fn room(timeout: Duration) -> (Arc<FakeEngine>, Arc<Room>) {
        let engine = Arc::new(FakeEngine::new());
        let services = RoomServices {
            engine: engine.clone(),
            sink: Arc::new(RecordingSink::new()),
            engine_timeout: timeout,
        };
        (engine, Arc::new(Room::new("r1", services)))
    }

    #[tokio::test]
    async fn first_join_builds_the_mixer_once() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        room.join("b", Vec::new()).await.unwrap();

        assert_eq!(engine.live_of("pipeline"), 1);
        assert_eq!(engine.live_of("mixer"), 1);
        assert_eq!(engine.live_of("endpoint"), 2);
        assert_eq!(engine.live_of("port"), 2);
        assert_eq!(room.participant_count(), 2);
        assert_eq!(room.snapshot().await.participants, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn join_wires_both_directions() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        let session = room.session("a").await.unwrap();
        let ep = session.endpoint().id();
        let port = session.port().id();

        assert_eq!(
            engine.calls("connect"),
            vec![format!("connect {port} -> {ep}"), format!("connect {ep} -> {port}")]
        );
    }

    #[tokio::test]
    async fn duplicate_join_is_a_no_op() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        room.join("a", Vec::new()).await.unwrap();
        assert_eq!(engine.live_of("endpoint"), 1);
        assert_eq!(room.participant_count(), 1);
    }

    #[tokio::test]
    async fn last_leave_releases_everything_and_retires() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        room.join("b", Vec::new()).await.unwrap();

        assert!(!room.leave("a").await);
        assert_eq!(engine.live_count(), 4);

        assert!(room.leave("b").await);
        assert_eq!(engine.live_count(), 0);
        assert!(room.is_retired());

        let err = room.join("c", Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "room_not_found");
    }

    #[tokio::test]
    async fn leave_of_stranger_is_harmless() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        assert!(!room.leave("nobody").await);
        assert_eq!(room.participant_count(), 1);
        assert!(engine.calls("release").is_empty());
    }

    #[tokio::test]
    async fn failed_first_join_leaves_nothing_behind() {
        let (engine, room) = room(Duration::from_secs(5));
        engine.fail_nth(Op::Connect, 2, FaultKind::Unavailable);

        let err = room.join("a", Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "media_engine_unavailable");
        assert_eq!(engine.live_count(), 0);
        assert!(room.is_retired());

        // Endpoint and port are released newest first, then mixer and pipeline.
        let releases = engine.calls("release");
        assert_eq!(releases.len(), 4);
        assert!(releases[0].contains("port"));
        assert!(releases[1].contains("endpoint"));
        assert!(releases[2].contains("mixer"));
        assert!(releases[3].contains("pipeline"));
    }

    #[tokio::test]
    async fn failed_join_does_not_disturb_others() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        engine.fail_nth(Op::CreatePort, 2, FaultKind::Reject);

        assert!(room.join("b", Vec::new()).await.is_err());
        assert_eq!(room.snapshot().await.participants, vec!["a"]);
        assert_eq!(engine.live_of("pipeline"), 1);
        assert_eq!(engine.live_of("endpoint"), 1);
        assert!(!room.is_retired());
    }

    #[tokio::test]
    async fn mixer_failure_releases_the_pipeline() {
        let (engine, room) = room(Duration::from_secs(5));
        engine.fail_nth(Op::CreateMixer, 1, FaultKind::Reject);

        assert!(room.join("a", Vec::new()).await.is_err());
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_media_server_times_out_cleanly() {
        let (engine, room) = room(Duration::from_millis(200));
        engine.fail_always(Op::CreatePort, FaultKind::Hang);

        let err = room.join("a", Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::MediaEngineUnavailable(MediaError::Timeout { .. })
        ));
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn candidates_before_join_seed_the_session() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", vec![c("early")]).await.unwrap();
        room.receive_candidate("a", c("later")).await.unwrap();
        assert!(engine.calls("add_candidate").is_empty());

        room.receive_offer("a", "o").await.unwrap();
        let applied: Vec<String> = engine
            .calls("add_candidate")
            .into_iter()
            .map(|l| l.rsplit(' ').next().unwrap().to_string())
            .collect();
        assert_eq!(applied, vec!["early", "later"]);
    }

    #[tokio::test]
    async fn candidates_of_a_failed_join_are_dropped() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        engine.fail_nth(Op::CreateEndpoint, 2, FaultKind::Unavailable);

        assert!(room.join("b", vec![c("early")]).await.is_err());
        assert_eq!(engine.live_count(), 4);
        assert!(engine.calls("add_candidate").is_empty());

        // A later successful join starts from an empty buffer.
        room.join("b", Vec::new()).await.unwrap();
        room.receive_offer("b", "o").await.unwrap();
        assert!(engine.calls("add_candidate").is_empty());
    }

    #[tokio::test]
    async fn candidates_from_departed_participant_leave_no_trace() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        room.join("b", Vec::new()).await.unwrap();
        room.leave("a").await;
        let live = engine.live_count();

        for i in 0..1000 {
            let err = room.receive_candidate("a", c(&format!("late-{i}"))).await.unwrap_err();
            assert_eq!(err.code(), "no_such_session");
        }
        assert!(engine.calls("add_candidate").is_empty());
        assert_eq!(engine.live_count(), live);
        assert_eq!(room.snapshot().await.participants, vec!["b"]);

        // Rejoining is a fresh session.
        room.join("a", Vec::new()).await.unwrap();
        assert_eq!(room.participant_count(), 2);
    }

    #[tokio::test]
    async fn candidate_for_retired_room_is_room_not_found() {
        let (_engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        assert!(room.leave("a").await);

        let err = room.receive_candidate("a", c("stale")).await.unwrap_err();
        assert_eq!(err.code(), "room_not_found");
    }

    /// A fault at every allocation step of a join, for the room's first
    /// participant and for a later one.  Whatever fails, the joiner holds no
    /// media objects afterwards, the membership is what it was before, and
    /// the pipeline exists exactly when someone is in the room.
    #[tokio::test]
    async fn failed_join_at_any_step_keeps_room_consistent() {
        let cases = [
            // (existing participants, faulted op, nth call of that op)
            (0, Op::CreatePipeline, 1),
            (0, Op::CreateMixer, 1),
            (0, Op::CreateEndpoint, 1),
            (0, Op::CreatePort, 1),
            (0, Op::Connect, 1),
            (0, Op::Connect, 2),
            (1, Op::CreateEndpoint, 2),
            (1, Op::CreatePort, 2),
            (1, Op::Connect, 3),
            (1, Op::Connect, 4),
            (2, Op::Connect, 5),
            (2, Op::Connect, 6),
        ];

        for (existing, op, nth) in cases {
            let (engine, room) = room(Duration::from_secs(5));
            let others: Vec<String> = (0..existing).map(|i| format!("p{i}")).collect();
            for p in &others {
                room.join(p, Vec::new()).await.unwrap();
            }
            let live_before = engine.live_count();
            let before = room.snapshot().await;

            engine.fail_nth(op, nth, FaultKind::Reject);
            let err = room.join("joiner", vec![c("early")]).await.unwrap_err();
            assert_eq!(err.code(), "media_engine_unavailable", "{op:?} #{nth}");

            let after = room.snapshot().await;
            assert_eq!(engine.live_count(), live_before, "{op:?} #{nth} with {existing} in the room");
            assert_eq!(after.participants, before.participants, "{op:?} #{nth}");
            assert_eq!(after.has_media, !after.participants.is_empty(), "{op:?} #{nth}");
            assert_eq!(room.is_retired(), others.is_empty(), "{op:?} #{nth}");
            assert!(engine.calls("add_candidate").is_empty());

            if !others.is_empty() {
                room.join("joiner", Vec::new()).await.unwrap();
                assert_eq!(room.participant_count(), existing + 1);
                for p in others.iter().map(String::as_str).chain(["joiner"]) {
                    room.leave(p).await;
                }
            }
            assert_eq!(engine.live_count(), 0, "{op:?} #{nth}");
            let after = room.snapshot().await;
            assert_eq!(after.has_media, !after.participants.is_empty());
        }
    }

    #[tokio::test]
    async fn offer_before_join_is_no_such_session() {
        let (_engine, room) = room(Duration::from_secs(5));
        let err = room.receive_offer("ghost", "o").await.unwrap_err();
        assert_eq!(err.code(), "no_such_session");
    }

    #[tokio::test(start_paused = true)]
    async fn answer_for_departed_participant_is_dropped() {
        let (engine, room) = room(Duration::from_secs(5));
        room.join("a", Vec::new()).await.unwrap();
        room.join("b", Vec::new()).await.unwrap();
        engine.fail_nth(Op::ProcessOffer, 1, FaultKind::Delay(Duration::from_secs(1)));

        let offer = {
            let room = room.clone();
            tokio::spawn(async move { room.receive_offer("a", "o").await })
        };
        // Let the offer reach the media server before the participant leaves.
        while engine.calls("subscribe").is_empty() {
            tokio::task::yield_now().await;
        }
        room.leave("a").await;

        let err = offer.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "no_such_session");
        assert!(engine.calls("gather").is_empty());
        assert_eq!(room.participant_count(), 1);
    }
}
