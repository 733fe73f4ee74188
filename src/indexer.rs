use std::sync::Arc;

use tokio::sync::watch;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::{IndexerError, StreamAborted};
use crate::models::{AggregateState, Batch, RawLog, Subject};
use crate::normalizer::Normalizer;
use crate::parser::{DecodedLog, Decoder};
use crate::source::{BatchStream, EventSource, StreamQuery};

/// Requests that a running consumer stop fetching.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if every handle is gone.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

#[derive(Debug)]
pub struct RunOutcome {
    pub state: AggregateState,
    /// The stream was cut short; the state covers only the applied batches.
    pub cancelled: bool,
}

/// Pulls batches one at a time and commits them to the aggregate state in
/// arrival order.
#[derive(Debug, Clone)]
pub struct StreamConsumer {
    target: Subject,
    decoder: Arc<Decoder>,
    normalizer: Normalizer,
}

impl StreamConsumer {
    pub fn new(target: Subject, normalizer: Normalizer) -> Result<Self, IndexerError> {
        let decoder = Decoder::from_signatures(&normalizer.signatures())?;
        Ok(Self {
            target,
            decoder: Arc::new(decoder),
            normalizer,
        })
    }

    pub fn for_config(cfg: &Config) -> Result<Self, IndexerError> {
        Self::new(cfg.target, Normalizer::for_mode(cfg.mode, cfg.nft_layout))
    }

    /// Opens the stream and consumes it to the end (or until cancelled).
    pub async fn run<E: EventSource>(
        &self,
        source: &E,
        query: &StreamQuery,
        cancel: CancelSignal,
    ) -> Result<RunOutcome, StreamAborted> {
        info!("Opening stream from block {}", query.from_block);
        let mut stream = match source.open_stream(query).await {
            Ok(stream) => stream,
            Err(cause) => {
                error!("Failed to open stream: {}", cause);
                return Err(StreamAborted {
                    cause,
                    last_block: query.from_block,
                    partial: Box::new(AggregateState::new(self.target)),
                });
            }
        };
        self.consume(&mut stream, cancel).await
    }

    pub async fn consume<S: BatchStream>(
        &self,
        stream: &mut S,
        cancel: CancelSignal,
    ) -> Result<RunOutcome, StreamAborted> {
        self.resume(stream, AggregateState::new(self.target), cancel).await
    }

    /// Keeps building on a state an earlier run returned, such as the
    /// partial state of an aborted stream.
    pub async fn resume<S: BatchStream>(
        &self,
        stream: &mut S,
        state: AggregateState,
        mut cancel: CancelSignal,
    ) -> Result<RunOutcome, StreamAborted> {
        if state.target != self.target {
            let cause = IndexerError::Config(format!(
                "state belongs to {}, consumer targets {}",
                state.target, self.target
            ));
            return Err(abort(Aggregator::resume(state), cause));
        }

        let mut aggregator = Aggregator::resume(state);
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // The fetch is the only suspension point; cancel wins ties.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = stream.next_batch() => next,
            };

            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(cause) => return Err(abort(aggregator, cause)),
            };

            let (batch, decoded) = match self.decode(batch).await {
                Ok(pair) => pair,
                Err(cause) => return Err(abort(aggregator, cause)),
            };

            self.apply_batch(&mut aggregator, &batch, &decoded);

            let stats = &mut aggregator.state_mut().stats;
            stats.batches += 1;
            stats.last_block = batch.next_block;
            info!("scanned up to block: {}", batch.next_block);
        }

        let state = aggregator.into_state();
        if cancelled {
            info!("Stream cancelled after {} batches (block {})", state.stats.batches, state.stats.last_block);
        }
        if state.stats.malformed_skipped > 0 {
            warn!("Skipped {} malformed records", state.stats.malformed_skipped);
        }

        Ok(RunOutcome { state, cancelled })
    }

    /// Log decoding runs on a blocking worker; the batch comes back intact.
    async fn decode(&self, mut batch: Batch) -> Result<(Batch, Vec<Option<DecodedLog>>), IndexerError> {
        if batch.logs.is_empty() {
            return Ok((batch, Vec::new()));
        }

        let decoder = Arc::clone(&self.decoder);
        let logs: Vec<RawLog> = std::mem::take(&mut batch.logs);
        let (logs, decoded) = task::spawn_blocking(move || {
            let decoded = decoder.decode_logs(&logs);
            (logs, decoded)
        })
        .await
        .map_err(|e| IndexerError::Decode(format!("decoder task failed: {e}")))?;

        batch.logs = logs;
        Ok((batch, decoded))
    }

    /// Logs first, then transactions, then traces, each in arrival order.
    fn apply_batch(&self, aggregator: &mut Aggregator, batch: &Batch, decoded: &[Option<DecodedLog>]) {
        let logs = batch
            .logs
            .iter()
            .enumerate()
            .map(|(i, raw)| self.normalizer.log(decoded.get(i).and_then(Option::as_ref), raw));
        let transactions = batch.transactions.iter().map(|tx| self.normalizer.transaction(tx));
        let traces = batch.traces.iter().map(|trace| self.normalizer.trace(trace));

        for record in logs.chain(transactions).chain(traces) {
            match record.and_then(|r| aggregator.apply(&r)) {
                Ok(()) => {}
                Err(IndexerError::InvariantViolation(reason)) => {
                    warn!("Skipping record (block {}): {}", batch.next_block, reason);
                    aggregator.state_mut().stats.invariant_skips += 1;
                }
                Err(e) => {
                    debug!("Skipping malformed record (block {}): {}", batch.next_block, e);
                    aggregator.state_mut().stats.malformed_skipped += 1;
                }
            }
        }
    }
}

fn abort(aggregator: Aggregator, cause: IndexerError) -> StreamAborted {
    let partial = aggregator.into_state();
    error!("Stream aborted after block {}: {}", partial.stats.last_block, cause);
    StreamAborted {
        cause,
        last_block: partial.stats.last_block,
        partial: Box::new(partial),
    }
}
