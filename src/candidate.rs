use std::collections::VecDeque;

use crate::media::IceCandidate;

/// What the caller must do with a candidate handed to [`CandidateBuffer::admit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Held until the next drain.
    Queued,
    /// The buffer has already been drained: apply it to the endpoint now.
    Apply(IceCandidate),
}

/// Remote ICE candidates that arrived before the endpoint could accept them.
///
/// Starts out collecting.  [`drain`](Self::drain) hands back everything held,
/// in arrival order, and switches the buffer to pass-through for good; from
/// then on `admit` returns every candidate for immediate application.
/// Callers keep the buffer behind the same lock they hold while applying
/// drained candidates, so nothing can slip in between.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: VecDeque<IceCandidate>,
    drained: bool,
}

impl CandidateBuffer {
    /// Seed a buffer with candidates collected before it existed.
    pub fn with_pending(pending: Vec<IceCandidate>) -> Self {
        Self {
            queued: pending.into(),
            drained: false,
        }
    }

    pub fn admit(&mut self, candidate: IceCandidate) -> Admission {
        if self.drained {
            Admission::Apply(candidate)
        } else {
            self.queued.push_back(candidate);
            Admission::Queued
        }
    }

    /// Take every queued candidate, oldest first.  Only the first call can
    /// return anything.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.drained = true;
        self.queued.drain(..).collect()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Drop everything and stop accepting (the owning session is gone).
    pub fn discard(&mut self) {
        self.queued.clear();
        self.drained = true;
    }
}
