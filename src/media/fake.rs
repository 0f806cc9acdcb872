// In-memory media server used by the unit tests.
//
// Records every call as a line of text (in call order), tracks which objects
// are alive, and can be told to fail or hang a given operation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CandidateListener, EndpointHandle, IceCandidate, MediaObjectId, MediaResourceClient,
    MixerHandle, PipelineHandle, PortHandle,
};
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreatePipeline,
    CreateMixer,
    CreateEndpoint,
    CreatePort,
    Connect,
    ProcessOffer,
    GatherCandidates,
    AddCandidate,
    Subscribe,
    Release,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::CreatePipeline | Op::CreateMixer | Op::CreateEndpoint | Op::CreatePort => "create",
            Op::Connect => "connect",
            Op::ProcessOffer => "processOffer",
            Op::GatherCandidates => "gatherCandidates",
            Op::AddCandidate => "addIceCandidate",
            Op::Subscribe => "subscribe",
            Op::Release => "release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Reject,
    Unavailable,
    Hang,
    /// Succeed, but only after the given (virtual) time.
    Delay(std::time::Duration),
}

struct Fault {
    op: Op,
    /// 1-based occurrence to fail; `None` fails every call.
    nth: Option<usize>,
    kind: FaultKind,
}

#[derive(Default)]
pub struct FakeEngine {
    next_id: AtomicU64,
    log: Mutex<Vec<String>>,
    live: Mutex<HashSet<MediaObjectId>>,
    counts: Mutex<HashMap<Op, usize>>,
    faults: Mutex<Vec<Fault>>,
    listeners: Mutex<HashMap<MediaObjectId, CandidateListener>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_nth(&self, op: Op, nth: usize, kind: FaultKind) {
        self.faults.lock().unwrap().push(Fault {
            op,
            nth: Some(nth),
            kind,
        });
    }

    pub fn fail_always(&self, op: Op, kind: FaultKind) {
        self.faults.lock().unwrap().push(Fault { op, nth: None, kind });
    }

    pub fn heal(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Log lines starting with `prefix`, in call order.
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Number of live objects whose id starts with `kind` (`pipeline`,
    /// `mixer`, `endpoint`, `port`).
    pub fn live_of(&self, kind: &str) -> usize {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str().starts_with(kind))
            .count()
    }

    pub fn has_listener(&self, endpoint: &MediaObjectId) -> bool {
        self.listeners.lock().unwrap().contains_key(endpoint)
    }

    /// Simulate the server discovering a local candidate on `endpoint`.
    pub fn discover(&self, endpoint: &MediaObjectId, candidate: IceCandidate) {
        let listener = self.listeners.lock().unwrap().get(endpoint).cloned();
        if let Some(listener) = listener {
            listener(candidate);
        }
    }

    async fn gate(&self, op: Op) -> Result<(), MediaError> {
        let count = {
            let mut counts = self.counts.lock().unwrap();
            let c = counts.entry(op).or_insert(0);
            *c += 1;
            *c
        };
        let kind = self
            .faults
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.op == op && f.nth.map_or(true, |n| n == count))
            .map(|f| f.kind);

        match kind {
            None => Ok(()),
            Some(FaultKind::Reject) => Err(MediaError::Rejected {
                operation: op.name(),
                reason: "injected rejection".into(),
            }),
            Some(FaultKind::Unavailable) => Err(MediaError::Unavailable("injected outage".into())),
            Some(FaultKind::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(FaultKind::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }

    fn record(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }

    fn spawn(&self, kind: &str) -> MediaObjectId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = MediaObjectId::new(format!("{kind}-{n}"));
        self.live.lock().unwrap().insert(id.clone());
        self.record(format!("create {id}"));
        id
    }
}

#[async_trait]
impl MediaResourceClient for FakeEngine {
    async fn create_pipeline(&self) -> Result<PipelineHandle, MediaError> {
        self.gate(Op::CreatePipeline).await?;
        Ok(PipelineHandle::new(self.spawn("pipeline")))
    }

    async fn create_mixer(&self, _pipeline: &PipelineHandle) -> Result<MixerHandle, MediaError> {
        self.gate(Op::CreateMixer).await?;
        Ok(MixerHandle::new(self.spawn("mixer")))
    }

    async fn create_endpoint(&self, _pipeline: &PipelineHandle) -> Result<EndpointHandle, MediaError> {
        self.gate(Op::CreateEndpoint).await?;
        Ok(EndpointHandle::new(self.spawn("endpoint")))
    }

    async fn create_port(&self, _mixer: &MixerHandle) -> Result<PortHandle, MediaError> {
        self.gate(Op::CreatePort).await?;
        Ok(PortHandle::new(self.spawn("port")))
    }

    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId) -> Result<(), MediaError> {
        self.gate(Op::Connect).await?;
        self.record(format!("connect {source} -> {sink}"));
        Ok(())
    }

    async fn process_offer(&self, endpoint: &EndpointHandle, offer: &str) -> Result<String, MediaError> {
        self.gate(Op::ProcessOffer).await?;
        self.record(format!("process_offer {} {offer}", endpoint.id()));
        Ok(format!("answer-to:{offer}"))
    }

    async fn gather_candidates(&self, endpoint: &EndpointHandle) -> Result<(), MediaError> {
        self.gate(Op::GatherCandidates).await?;
        self.record(format!("gather {}", endpoint.id()));
        Ok(())
    }

    async fn add_candidate(&self, endpoint: &EndpointHandle, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.gate(Op::AddCandidate).await?;
        self.record(format!("add_candidate {} {}", endpoint.id(), candidate.candidate));
        Ok(())
    }

    async fn on_candidate_discovered(
        &self,
        endpoint: &EndpointHandle,
        listener: CandidateListener,
    ) -> Result<(), MediaError> {
        self.gate(Op::Subscribe).await?;
        self.record(format!("subscribe {}", endpoint.id()));
        self.listeners
            .lock()
            .unwrap()
            .insert(endpoint.id().clone(), listener);
        Ok(())
    }

    async fn release(&self, object: &MediaObjectId) -> Result<(), MediaError> {
        self.gate(Op::Release).await?;
        self.record(format!("release {object}"));
        self.live.lock().unwrap().remove(object);
        self.listeners.lock().unwrap().remove(object);
        Ok(())
    }
}
