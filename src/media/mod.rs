// src/media/mod.rs
//
// Control-plane view of the external media server.
//
// The signaling core never touches RTP: it only creates, wires and releases
// opaque server-side objects (pipelines, mixers, endpoints, mixer ports) and
// relays SDP/ICE to them.  `MediaResourceClient` is the seam; the production
// implementation lives in `kurento`, the tests use `fake::FakeEngine`.
//
// ────────────────────────────────────────────────────────────────────────────

pub mod jsonrpc;
pub mod kurento;

#[cfg(test)]
pub mod fake;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MediaError;

// ─── Object handles ─────────────────────────────────────────────────────────

/// Identifier the media server assigned to one of its objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaObjectId(String);

impl MediaObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MediaObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declares an owning handle around a `MediaObjectId`.  Handles are not
/// `Clone`: whoever holds one is responsible for releasing it.
macro_rules! media_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq)]
        pub struct $name(MediaObjectId);

        impl $name {
            pub fn new(id: MediaObjectId) -> Self {
                Self(id)
            }

            pub fn id(&self) -> &MediaObjectId {
                &self.0
            }
        }
    };
}

media_handle!(
    /// A media pipeline: the container every other object of a room lives in.
    PipelineHandle
);
media_handle!(
    /// The mixer (Kurento `Composite`) combining every participant's media.
    MixerHandle
);
media_handle!(
    /// One participant's WebRTC endpoint.
    EndpointHandle
);
media_handle!(
    /// A mixer port (Kurento `HubPort`) attaching one endpoint to the mixer.
    PortHandle
);

// ─── ICE candidates ─────────────────────────────────────────────────────────

/// Connectivity candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Callback invoked for every local candidate the server discovers on an
/// endpoint.  Called from the engine client's event task; must not block.
pub type CandidateListener = Arc<dyn Fn(IceCandidate) + Send + Sync>;

// ─── MediaResourceClient ────────────────────────────────────────────────────

/// Operations the signaling core needs from the media server.
///
/// Every call may be slow and may fail.  `release` is idempotent: releasing
/// an object the server no longer knows is not an error.
#[async_trait]
pub trait MediaResourceClient: Send + Sync {
    async fn create_pipeline(&self) -> Result<PipelineHandle, MediaError>;

    async fn create_mixer(&self, pipeline: &PipelineHandle) -> Result<MixerHandle, MediaError>;

    async fn create_endpoint(&self, pipeline: &PipelineHandle)
        -> Result<EndpointHandle, MediaError>;

    async fn create_port(&self, mixer: &MixerHandle) -> Result<PortHandle, MediaError>;

    /// Route media flowing out of `source` into `sink` (one direction only).
    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId)
        -> Result<(), MediaError>;

    /// Submit a remote SDP offer; returns the SDP answer.
    async fn process_offer(&self, endpoint: &EndpointHandle, offer: &str)
        -> Result<String, MediaError>;

    /// Start gathering local candidates.  Results arrive through the listener
    /// registered with `on_candidate_discovered`.
    async fn gather_candidates(&self, endpoint: &EndpointHandle) -> Result<(), MediaError>;

    async fn add_candidate(
        &self,
        endpoint: &EndpointHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    async fn on_candidate_discovered(
        &self,
        endpoint: &EndpointHandle,
        listener: CandidateListener,
    ) -> Result<(), MediaError>;

    async fn release(&self, object: &MediaObjectId) -> Result<(), MediaError>;
}

// ─── Bounded calls ──────────────────────────────────────────────────────────

/// Await a media server call for at most `limit`.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, MediaError>
where
    F: Future<Output = Result<T, MediaError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MediaError::Timeout { operation }),
    }
}

/// Release an object, logging instead of failing.  Used on teardown paths
/// where there is nobody left to report the error to.
pub async fn release_quietly(engine: &dyn MediaResourceClient, limit: Duration, object: &MediaObjectId) {
    if let Err(e) = bounded(limit, "release", engine.release(object)).await {
        warn!(object = %object, "release failed: {e}");
    }
}

// ─── Rollback ───────────────────────────────────────────────────────────────

/// Tracks the objects created during a multi-step allocation so that a
/// failure part-way through releases exactly what was created.
pub struct Rollback<'a> {
    engine: &'a dyn MediaResourceClient,
    limit: Duration,
    created: Vec<MediaObjectId>,
}

impl<'a> Rollback<'a> {
    pub fn new(engine: &'a dyn MediaResourceClient, limit: Duration) -> Self {
        Self {
            engine,
            limit,
            created: Vec::new(),
        }
    }

    pub fn track(&mut self, object: &MediaObjectId) {
        self.created.push(object.clone());
    }

    /// The allocation succeeded; the caller now owns everything tracked.
    pub fn commit(mut self) {
        self.created.clear();
    }

    /// Release everything tracked, newest first.
    pub async fn unwind(mut self) {
        if !self.created.is_empty() {
            warn!(count = self.created.len(), "partial resource failure, releasing");
        }
        while let Some(object) = self.created.pop() {
            release_quietly(self.engine, self.limit, &object).await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
