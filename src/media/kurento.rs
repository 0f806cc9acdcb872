// src/media/kurento.rs
//
// `MediaResourceClient` backed by a Kurento Media Server.
//
// Object model used for a group call:
//
//   MediaPipeline ── Composite (the room mixer)
//        │               └── HubPort (one per participant)
//        └── WebRtcEndpoint (one per participant)
//
// The control channel is opened on first use and re-opened transparently if
// the server drops it.  Candidate listeners do not survive a reconnect: the
// objects they were attached to died with the old session anyway.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::jsonrpc::{CallError, NotificationHandler, RpcError, RpcSession};
use super::{
    CandidateListener, EndpointHandle, IceCandidate, MediaObjectId, MediaResourceClient,
    MixerHandle, PipelineHandle, PortHandle,
};
use crate::error::MediaError;

/// Kurento's error code for "object not found".
const OBJECT_NOT_FOUND: i64 = 40101;

type ListenerMap = Arc<Mutex<HashMap<String, CandidateListener>>>;

// ─── KurentoClient ──────────────────────────────────────────────────────────

pub struct KurentoClient {
    uri: String,
    keepalive: Duration,
    session: tokio::sync::Mutex<Option<Arc<KurentoSession>>>,
}

impl KurentoClient {
    /// Create a client; nothing is dialled until the first call.
    pub fn new(uri: impl Into<String>, keepalive: Duration) -> Self {
        Self {
            uri: uri.into(),
            keepalive,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a client and open the control channel immediately.
    pub async fn open(uri: impl Into<String>, keepalive: Duration) -> Result<Self, MediaError> {
        let client = Self::new(uri, keepalive);
        client.session().await?;
        Ok(client)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn session(&self) -> Result<Arc<KurentoSession>, MediaError> {
        let mut slot = self.session.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.rpc.is_closed() {
                return Ok(existing.clone());
            }
            warn!(uri = %self.uri, "media server connection lost, reconnecting");
        }

        let session = Arc::new(KurentoSession::open(&self.uri).await?);
        spawn_keepalive(&session, self.keepalive);
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn create(&self, kind: &'static str, constructor: Value) -> Result<MediaObjectId, MediaError> {
        let result = self
            .session()
            .await?
            .request("create", "create", create_params(kind, constructor))
            .await?;
        let id = object_value(&result)?;
        debug!(kind, object = %id, "media object created");
        Ok(id)
    }

    async fn invoke(
        &self,
        object: &MediaObjectId,
        operation: &'static str,
        operation_params: Value,
    ) -> Result<Value, MediaError> {
        let params = json!({
            "object": object.as_str(),
            "operation": operation,
            "operationParams": operation_params,
        });
        self.session()
            .await?
            .request("invoke", operation, params)
            .await
    }
}

#[async_trait]
impl MediaResourceClient for KurentoClient {
    async fn create_pipeline(&self) -> Result<PipelineHandle, MediaError> {
        let id = self.create("MediaPipeline", json!({})).await?;
        Ok(PipelineHandle::new(id))
    }

    async fn create_mixer(&self, pipeline: &PipelineHandle) -> Result<MixerHandle, MediaError> {
        let id = self
            .create("Composite", json!({ "mediaPipeline": pipeline.id().as_str() }))
            .await?;
        Ok(MixerHandle::new(id))
    }

    async fn create_endpoint(&self, pipeline: &PipelineHandle) -> Result<EndpointHandle, MediaError> {
        let id = self
            .create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline.id().as_str() }))
            .await?;
        Ok(EndpointHandle::new(id))
    }

    async fn create_port(&self, mixer: &MixerHandle) -> Result<PortHandle, MediaError> {
        let id = self
            .create("HubPort", json!({ "hub": mixer.id().as_str() }))
            .await?;
        Ok(PortHandle::new(id))
    }

    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(source, "connect", json!({ "sink": sink.as_str() }))
            .await
            .map(|_| ())
    }

    async fn process_offer(&self, endpoint: &EndpointHandle, offer: &str) -> Result<String, MediaError> {
        let result = self
            .invoke(endpoint.id(), "processOffer", json!({ "offer": offer }))
            .await?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MediaError::Protocol("processOffer returned no SDP answer".into()))
    }

    async fn gather_candidates(&self, endpoint: &EndpointHandle) -> Result<(), MediaError> {
        self.invoke(endpoint.id(), "gatherCandidates", json!({}))
            .await
            .map(|_| ())
    }

    async fn add_candidate(&self, endpoint: &EndpointHandle, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.invoke(
            endpoint.id(),
            "addIceCandidate",
            json!({ "candidate": candidate_param(candidate) }),
        )
        .await
        .map(|_| ())
    }

    async fn on_candidate_discovered(
        &self,
        endpoint: &EndpointHandle,
        listener: CandidateListener,
    ) -> Result<(), MediaError> {
        let session = self.session().await?;
        let key = endpoint.id().as_str().to_string();
        lock(&session.listeners).insert(key.clone(), listener);

        let params = json!({ "type": "IceCandidateFound", "object": key });
        if let Err(e) = session.request("subscribe", "subscribe", params).await {
            lock(&session.listeners).remove(&key);
            return Err(e);
        }
        Ok(())
    }

    async fn release(&self, object: &MediaObjectId) -> Result<(), MediaError> {
        let session = self.session().await?;
        lock(&session.listeners).remove(object.as_str());

        match session
            .call("release", json!({ "object": object.as_str() }))
            .await
        {
            Ok(_) => Ok(()),
            Err(CallError::Remote(e)) if is_not_found(&e) => {
                debug!(object = %object, "release of unknown object ignored");
                Ok(())
            }
            Err(e) => Err(map_call_error("release", e)),
        }
    }
}

// ─── KurentoSession ─────────────────────────────────────────────────────────

/// One live control channel plus the Kurento session id bound to it.
struct KurentoSession {
    rpc: RpcSession,
    session_id: Mutex<Option<String>>,
    listeners: ListenerMap,
}

impl KurentoSession {
    async fn open(uri: &str) -> Result<Self, MediaError> {
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let rpc = RpcSession::connect(uri, event_router(listeners.clone()))
            .await
            .map_err(|e| map_call_error("connect", e))?;
        Ok(Self {
            rpc,
            session_id: Mutex::new(None),
            listeners,
        })
    }

    /// Issue a request, echoing the session id once the server assigned one.
    async fn call(&self, method: &str, mut params: Value) -> Result<Value, CallError> {
        if let Some(id) = lock(&self.session_id).clone() {
            if let Some(obj) = params.as_object_mut() {
                obj.insert("sessionId".to_string(), Value::String(id));
            }
        }

        let result = self.rpc.call(method, params).await?;

        if let Some(id) = result.get("sessionId").and_then(Value::as_str) {
            let mut current = lock(&self.session_id);
            if current.as_deref() != Some(id) {
                info!(session_id = %id, "media server session established");
                *current = Some(id.to_string());
            }
        }
        Ok(result)
    }

    async fn request(&self, method: &str, operation: &'static str, params: Value) -> Result<Value, MediaError> {
        self.call(method, params)
            .await
            .map_err(|e| map_call_error(operation, e))
    }
}

fn spawn_keepalive(session: &Arc<KurentoSession>, every: Duration) {
    if every.is_zero() {
        return;
    }
    let weak: Weak<KurentoSession> = Arc::downgrade(session);
    let closed = session.rpc.closed_token();
    let interval_ms = u64::try_from(every.as_millis()).unwrap_or(u64::MAX);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(session) = weak.upgrade() else { break };
                    if let Err(e) = session.request("ping", "ping", json!({ "interval": interval_ms })).await {
                        warn!("media server keepalive failed: {e}");
                    }
                }
            }
        }
    });
}

// ─── Protocol helpers ───────────────────────────────────────────────────────

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn create_params(kind: &str, constructor: Value) -> Value {
    json!({
        "type": kind,
        "constructorParams": constructor,
        "properties": {},
    })
}

fn object_value(result: &Value) -> Result<MediaObjectId, MediaError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(MediaObjectId::new)
        .ok_or_else(|| MediaError::Protocol("create returned no object id".into()))
}

/// Kurento's `IceCandidate` complex type.
fn candidate_param(candidate: &IceCandidate) -> Value {
    json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
        "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
        "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or(0),
    })
}

fn is_not_found(err: &RpcError) -> bool {
    err.code == OBJECT_NOT_FOUND
}

fn map_call_error(operation: &'static str, err: CallError) -> MediaError {
    match err {
        CallError::Remote(e) => MediaError::Rejected {
            operation,
            reason: e.message,
        },
        CallError::Closed(reason) => MediaError::Unavailable(reason),
    }
}

/// Extract `(endpoint id, candidate)` from an `onEvent` notification.
fn parse_candidate_event(params: &Value) -> Option<(String, IceCandidate)> {
    let value = params.get("value")?;
    if value.get("type")?.as_str()? != "IceCandidateFound" {
        return None;
    }
    let data = value.get("data")?;
    let object = value
        .get("object")
        .or_else(|| data.get("source"))?
        .as_str()?
        .to_string();
    let candidate = serde_json::from_value(data.get("candidate")?.clone()).ok()?;
    Some((object, candidate))
}

fn event_router(listeners: ListenerMap) -> NotificationHandler {
    Arc::new(move |method, params| {
        if method != "onEvent" {
            debug!(method, "ignoring media server notification");
            return;
        }
        let Some((object, candidate)) = parse_candidate_event(&params) else {
            return;
        };
        let listener = lock(&listeners).get(&object).cloned();
        match listener {
            Some(listener) => listener(candidate),
            None => debug!(object = %object, "candidate for endpoint without listener"),
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
