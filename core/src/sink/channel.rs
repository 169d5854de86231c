use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::errors::SinkError;
use crate::sink::{Completion, Param, Sink};

/// One record handed to the executor side of a [`ChannelSink`].
#[derive(Debug)]
pub struct Invocation {
    pub params: Vec<Param>,
    pub completion: Completion,
}

/// Direct-call sink: every record becomes one [`Invocation`] delivered over a
/// bounded channel to whatever task executes the downstream call. A full or
/// closed channel refuses the record synchronously.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Invocation>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Invocation>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn invoke(&self, params: Vec<Param>, completion: Completion) -> Result<(), SinkError> {
        self.tx
            .try_send(Invocation { params, completion })
            .map_err(|e| match e {
                TrySendError::Full(_) => SinkError::Rejected {
                    reason: "executor queue is full".to_string(),
                },
                TrySendError::Closed(_) => SinkError::Closed,
            })
    }
}
