use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::errors::SinkError;
use crate::sink::{Completion, Invocation, InvokeStatus, Param, Sink};

/// Destination of a [`BatchSink`]: writes a batch of rows and reports one
/// status per row, in order.
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    async fn write_batch(&self, rows: &[Vec<Param>]) -> Result<Vec<InvokeStatus>, SinkError>;
}

/// Batched-loader sink. Buffers invocations and hands them to a
/// [`BatchWriter`] once `batch_size` rows are queued or `flush_interval`
/// passes, whichever comes first. Dropping every clone of the sink flushes what
/// is left and ends the writer task.
#[derive(Clone)]
pub struct BatchSink {
    tx: mpsc::Sender<Invocation>,
}

impl BatchSink {
    pub fn spawn<W: BatchWriter>(
        writer: W,
        batch_size: usize,
        flush_interval: Duration,
        queue_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(run_writer(writer, rx, batch_size.max(1), flush_interval));
        (Self { tx }, handle)
    }
}

impl Sink for BatchSink {
    fn invoke(&self, params: Vec<Param>, completion: Completion) -> Result<(), SinkError> {
        self.tx
            .try_send(Invocation { params, completion })
            .map_err(|e| match e {
                TrySendError::Full(_) => SinkError::Rejected {
                    reason: "batch queue is full".to_string(),
                },
                TrySendError::Closed(_) => SinkError::Closed,
            })
    }
}

async fn run_writer<W: BatchWriter>(
    writer: W,
    mut rx: mpsc::Receiver<Invocation>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<Invocation> = Vec::with_capacity(batch_size);
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(invocation) => {
                    buffer.push(invocation);
                    if buffer.len() >= batch_size {
                        flush(&writer, &mut buffer).await;
                    }
                }
                None => {
                    flush(&writer, &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(&writer, &mut buffer).await;
            }
        }
    }
    debug!("Batch writer stopped");
}

async fn flush<W: BatchWriter>(writer: &W, buffer: &mut Vec<Invocation>) {
    if buffer.is_empty() {
        return;
    }

    let (rows, completions): (Vec<_>, Vec<_>) = buffer
        .drain(..)
        .map(|invocation| (invocation.params, invocation.completion))
        .unzip();

    match writer.write_batch(&rows).await {
        Ok(statuses) => {
            if statuses.len() != completions.len() {
                warn!(
                    rows = completions.len(),
                    statuses = statuses.len(),
                    "Batch writer returned a mismatched status count"
                );
            }
            let mut statuses = statuses.into_iter();
            for completion in completions {
                completion.complete(statuses.next().unwrap_or(InvokeStatus::OtherFailure));
            }
        }
        Err(e) => {
            warn!(rows = completions.len(), error = %e, "Batch write failed");
            for completion in completions {
                completion.complete(InvokeStatus::OtherFailure);
            }
        }
    }
}
