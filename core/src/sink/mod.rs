pub mod batch;
pub mod channel;

use std::fmt;
use std::sync::Arc;

use crate::errors::SinkError;
use crate::tracker::PartitionProgress;

pub use batch::{BatchSink, BatchWriter};
pub use channel::{ChannelSink, Invocation};

/// A single decoded parameter of a downstream call.
pub type Param = serde_json::Value;

/// Outcome reported by the downstream executor for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeStatus {
    Success,
    /// Backpressure: the call may not have executed.
    TransientOverload,
    /// A definitive failure. The record will not be retried.
    OtherFailure,
}

/// The `Sink` trait is the contract for any downstream destination.
///
/// `invoke` hands over one decoded record together with its [`Completion`].
/// Returning `Err` is a synchronous refusal: the record is dropped and the
/// completion is never called. On `Ok` the sink must eventually call
/// [`Completion::complete`], from any thread. A completion dropped without
/// an answer withdraws its pending work and leaves the record unacknowledged.
pub trait Sink: Send + Sync + 'static {
    fn invoke(&self, params: Vec<Param>, completion: Completion) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn invoke(&self, params: Vec<Param>, completion: Completion) -> Result<(), SinkError> {
        (**self).invoke(params, completion)
    }
}

/// Acknowledgement handle for one submitted record.
pub struct Completion {
    offset: i64,
    next_offset: i64,
    progress: Arc<PartitionProgress>,
    answered: bool,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("offset", &self.offset)
            .field("next_offset", &self.next_offset)
            .finish()
    }
}

impl Completion {
    pub(crate) fn new(offset: i64, next_offset: i64, progress: Arc<PartitionProgress>) -> Self {
        Self {
            offset,
            next_offset,
            progress,
            answered: false,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Reports the downstream outcome. The gap tracker and pause offset are
    /// updated before the pending count drops, so a drained tracker always
    /// reflects every callback.
    pub fn complete(mut self, status: InvokeStatus) {
        match status {
            InvokeStatus::TransientOverload => self.progress.pause.record(self.offset),
            InvokeStatus::Success => {
                self.progress.gap.commit(self.next_offset);
            }
            InvokeStatus::OtherFailure => {
                self.progress.record_failure();
                self.progress.gap.commit(self.next_offset);
            }
        }
        self.answered = true;
        self.progress.pending.consume_work();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.answered {
            self.progress.pending.retract_work();
        }
    }
}
