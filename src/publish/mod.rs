use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::types::{
    AcceptedResponse, Connection, ConnectionsPayload, MetricsSnapshot,
};
use crate::backend::Client;
use crate::flow::Aggregator;
use crate::metrics::{Collector, Snapshot};

/// Starting back-off budget after a transport failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Back-off ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Destination for exported batches. Implemented by the collector HTTP
/// client and by in-process mocks in tests.
pub trait Sink: Send + Sync {
    /// Deliver a batch of flow records.
    fn post_connections(
        &self,
        batch: &[Connection],
    ) -> impl Future<Output = Result<AcceptedResponse>> + Send;

    /// Deliver a batch of metrics snapshots.
    fn post_metrics(
        &self,
        snapshots: &[MetricsSnapshot],
    ) -> impl Future<Output = Result<AcceptedResponse>> + Send;
}

impl Sink for Client {
    fn post_connections(
        &self,
        batch: &[Connection],
    ) -> impl Future<Output = Result<AcceptedResponse>> + Send {
        Client::post_connections(self, batch)
    }

    fn post_metrics(
        &self,
        snapshots: &[MetricsSnapshot],
    ) -> impl Future<Output = Result<AcceptedResponse>> + Send {
        Client::post_metrics(self, snapshots)
    }
}

/// Couples the aggregator to a sink: ticks on the flush interval, prunes,
/// extracts size-bounded batches, and applies the ack/nack back-pressure
/// protocol with exponential back-off on transport failure.
pub struct Publisher<S> {
    agg: Arc<Aggregator>,
    metrics: Arc<Collector>,
    sink: S,
    max_batch_conns: usize,
    max_batch_bytes: usize,
    cancel: CancellationToken,
    backoff: Duration,
    /// Snapshots taken but not yet accepted by the sink.
    unsent_snapshots: Vec<MetricsSnapshot>,
    /// Bound on `unsent_snapshots`, matching the collector ring default.
    max_unsent_snapshots: usize,
}

impl<S: Sink> Publisher<S> {
    pub fn new(
        agg: Arc<Aggregator>,
        metrics: Arc<Collector>,
        sink: S,
        max_batch_conns: usize,
        max_batch_bytes: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agg,
            metrics,
            sink,
            max_batch_conns,
            max_batch_bytes,
            cancel,
            backoff: INITIAL_BACKOFF,
            unsent_snapshots: Vec::new(),
            max_unsent_snapshots: 168,
        }
    }

    /// Runs the flush loop until cancelled. Cancellation preempts the
    /// back-off sleep immediately; an in-flight request resolves before
    /// the loop exits (bounded by the sink's own timeout).
    pub async fn run(mut self, flush_interval: Duration, metrics_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut metrics_ticker = tokio::time::interval(metrics_interval);
        metrics_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // interval() fires immediately; consume the initial ticks so the
        // first flush happens one full interval after startup.
        ticker.tick().await;
        metrics_ticker.tick().await;

        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("publisher stopping");
                    return;
                }

                _ = ticker.tick() => {
                    self.flush_connections().await;
                    if cancel.is_cancelled() {
                        return;
                    }
                }

                _ = metrics_ticker.tick() => {
                    self.flush_metrics().await;
                }
            }
        }
    }

    /// One flush tick: release last tick's reservations, prune idle flows,
    /// then drain exportable flows in size-bounded batches until the table
    /// is clean or a transport failure pushes work to the next tick.
    pub async fn flush_connections(&mut self) {
        self.agg.reset_pending();
        self.agg.prune(Utc::now());

        loop {
            let batch = self.agg.export_batch(self.max_batch_conns);
            if batch.is_empty() {
                return;
            }

            let (mut records, mut keys): (Vec<Connection>, Vec<_>) = batch.into_iter().unzip();

            let kept = enforce_max_bytes(&records, self.max_batch_bytes);
            if kept == 0 {
                // Not even a single record fits the payload bound. The flow
                // stays dirty and will never fit; the operator has to raise
                // --max-batch-bytes or reduce flow cardinality.
                warn!(
                    max_batch_bytes = self.max_batch_bytes,
                    "single record exceeds payload size bound, dropping batch",
                );
                return;
            }
            records.truncate(kept);
            keys.truncate(kept);

            let posted = self.sink.post_connections(&records).await;
            match posted {
                Ok(accepted) => {
                    self.backoff = INITIAL_BACKOFF;
                    self.agg.ack(&keys);

                    for record in &records {
                        self.metrics.record_connection(
                            &record.id,
                            record.bytes_in.unwrap_or(0),
                            record.bytes_out.unwrap_or(0),
                            false,
                            record.status == "inactive",
                        );
                    }

                    debug!(
                        posted = records.len(),
                        received = accepted.received,
                        "posted connections",
                    );
                }
                Err(e) => {
                    self.agg.nack(&keys);
                    let backoff = self.backoff;
                    warn!(error = %e, backoff = ?backoff, "posting connections failed, will retry");

                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(backoff) => false,
                        _ = self.cancel.cancelled() => true,
                    };
                    if !cancelled {
                        self.backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                    return;
                }
            }
        }
    }

    /// One metrics tick: snapshot the current window and post everything
    /// not yet delivered. Failed posts keep the snapshots queued (bounded)
    /// for the next tick.
    pub async fn flush_metrics(&mut self) {
        let snapshot = self.metrics.take_snapshot();
        self.unsent_snapshots.push(snapshot_record(&snapshot));

        if self.unsent_snapshots.len() > self.max_unsent_snapshots {
            let excess = self.unsent_snapshots.len() - self.max_unsent_snapshots;
            self.unsent_snapshots.drain(..excess);
        }

        let posted = self.sink.post_metrics(&self.unsent_snapshots).await;
        match posted {
            Ok(accepted) => {
                debug!(
                    posted = self.unsent_snapshots.len(),
                    received = accepted.received,
                    "posted metrics snapshots",
                );
                self.unsent_snapshots.clear();
            }
            Err(e) => {
                warn!(
                    error = %e,
                    queued = self.unsent_snapshots.len(),
                    "posting metrics failed, keeping snapshots for next tick",
                );
            }
        }
    }
}

/// Converts a collector snapshot to its wire shape.
fn snapshot_record(snapshot: &Snapshot) -> MetricsSnapshot {
    MetricsSnapshot {
        timestamp: snapshot
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        connections: snapshot.connections,
        bandwidth_in: snapshot.bandwidth_in,
        bandwidth_out: snapshot.bandwidth_out,
        blocked: snapshot.blocked,
        inactive: snapshot.inactive,
    }
}

/// Returns how many leading records fit within `max_bytes` once wrapped in
/// a connections payload. Zero `max_bytes` disables the bound. When the
/// full batch does not fit, binary-searches for the largest prefix that
/// does; zero means not even one record fits.
pub(crate) fn enforce_max_bytes(records: &[Connection], max_bytes: usize) -> usize {
    if max_bytes == 0 || records.is_empty() {
        return records.len();
    }

    if payload_len(records) <= max_bytes {
        return records.len();
    }

    let mut lo = 0usize;
    let mut hi = records.len();
    let mut best = 0usize;

    while lo <= hi {
        let mid = (lo + hi) / 2;
        if payload_len(&records[..mid]) <= max_bytes {
            best = mid;
            lo = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            hi = mid - 1;
        }
    }

    best
}

fn payload_len(records: &[Connection]) -> usize {
    serde_json::to_vec(&ConnectionsPayload {
        connections: records,
    })
    .map(|body| body.len())
    .unwrap_or(usize::MAX)
}
