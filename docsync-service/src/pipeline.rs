//! Pipeline Orchestrator
//!
//! Wires three kinds of stage through two bounded queues:
//!
//! ```text
//! bus ─▶ consume ─▶ [incoming] ─▶ reconcile × N ─▶ [outgoing] ─▶ produce ─▶ bus
//! ```
//!
//! and runs the cache synchronizer next to them. Every stage races its
//! blocking waits against a shared shutdown signal. The signal is raised by
//! the caller's external signal or by the first fatal stage error; queued
//! documents are abandoned at that point.
//!
//! When the inbound stream ends on its own, the stages drain instead: the
//! consume stage drops its sender, workers exit once `incoming` is empty,
//! and the producer exits once `outgoing` is empty.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docsync_core::{DocSyncError, DocSyncResult, Document};
use docsync_storage::{CacheStore, DurableStore};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};

use crate::bus::{EventConsumer, EventProducer};
use crate::constants::{DEFAULT_INCOMING_BUFFER, DEFAULT_OUTGOING_BUFFER, DEFAULT_RECONCILE_WORKERS};
use crate::engine::ReconciliationEngine;
use crate::jobs::{cache_sync_task, CacheSyncConfig, CacheSyncMetrics, CacheSyncSnapshot, CacheSynchronizer};
use crate::shutdown::{self, ShutdownSignal};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Queue sizes and reconcile concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the consume -> reconcile queue
    pub incoming_buffer: usize,
    /// Capacity of the reconcile -> produce queue
    pub outgoing_buffer: usize,
    /// Number of reconcile workers sharing the incoming queue
    pub reconcile_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            incoming_buffer: DEFAULT_INCOMING_BUFFER,
            outgoing_buffer: DEFAULT_OUTGOING_BUFFER,
            reconcile_workers: DEFAULT_RECONCILE_WORKERS,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters updated by the pipeline stages.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Payloads read from the bus
    pub received: AtomicU64,
    /// Payloads that failed to decode and were skipped
    pub decode_failures: AtomicU64,
    /// Documents reconciled successfully
    pub processed: AtomicU64,
    /// Documents dropped after a reconcile failure
    pub process_failures: AtomicU64,
    /// Documents written to the bus
    pub produced: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            process_failures: self.process_failures.load(Ordering::Relaxed),
            produced: self.produced.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub processed: u64,
    pub process_failures: u64,
    pub produced: u64,
}

/// Returned by a clean [`Pipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub pipeline: PipelineSnapshot,
    /// Present when a synchronizer was attached
    pub sync: Option<CacheSyncSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Consume,
    Reconcile(usize),
    Produce,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Consume => write!(f, "consume"),
            Stage::Reconcile(worker) => write!(f, "reconcile-{}", worker),
            Stage::Produce => write!(f, "produce"),
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Consume/reconcile/produce pipeline plus an optional cache synchronizer.
pub struct Pipeline<C: ?Sized, S: ?Sized> {
    engine: Arc<ReconciliationEngine<C, S>>,
    config: PipelineConfig,
    synchronizer: Option<(Arc<CacheSynchronizer<C, S>>, CacheSyncConfig)>,
    metrics: Arc<PipelineMetrics>,
}

impl<C, S> Pipeline<C, S>
where
    C: CacheStore + ?Sized + 'static,
    S: DurableStore + ?Sized + 'static,
{
    pub fn new(engine: Arc<ReconciliationEngine<C, S>>, config: PipelineConfig) -> Self {
        Self {
            engine,
            config,
            synchronizer: None,
            metrics: Arc::new(PipelineMetrics::default()),
        }
    }

    /// Run `synchronizer` on its own timer for the lifetime of the pipeline.
    pub fn with_synchronizer(
        mut self,
        synchronizer: Arc<CacheSynchronizer<C, S>>,
        config: CacheSyncConfig,
    ) -> Self {
        self.synchronizer = Some((synchronizer, config));
        self
    }

    /// Live counters, readable while the pipeline runs.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `external` fires, a stage fails fatally, or the inbound
    /// stream ends and every queue has drained.
    ///
    /// Every task is joined before this returns. The first fatal stage
    /// error is returned in place of the report.
    pub async fn run<Rx, Tx>(
        self,
        consumer: Rx,
        producer: Tx,
        mut external: ShutdownSignal,
    ) -> DocSyncResult<PipelineReport>
    where
        Rx: EventConsumer + 'static,
        Tx: EventProducer + 'static,
    {
        let workers = self.config.reconcile_workers.max(1);
        let (trigger, signal) = shutdown::channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(self.config.incoming_buffer.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.outgoing_buffer.max(1));
        let incoming_rx = Arc::new(Mutex::new(incoming_rx));

        let mut sync_task = JoinSet::new();
        if let Some((synchronizer, config)) = self.synchronizer {
            sync_task.spawn(cache_sync_task(synchronizer, config, trigger.subscribe()));
        }
        let synchronizer_attached = !sync_task.is_empty();

        let mut stages: JoinSet<(Stage, DocSyncResult<()>)> = JoinSet::new();

        {
            let metrics = Arc::clone(&self.metrics);
            let shutdown = signal.clone();
            stages.spawn(async move {
                let result = consume_stage(consumer, incoming_tx, shutdown, metrics).await;
                (Stage::Consume, result)
            });
        }

        for worker in 0..workers {
            let engine = Arc::clone(&self.engine);
            let incoming = Arc::clone(&incoming_rx);
            let outgoing = outgoing_tx.clone();
            let metrics = Arc::clone(&self.metrics);
            let shutdown = signal.clone();
            stages.spawn(async move {
                let result = reconcile_stage(engine, incoming, outgoing, shutdown, metrics).await;
                (Stage::Reconcile(worker), result)
            });
        }
        // The producer sees end-of-queue once every worker has exited.
        drop(outgoing_tx);

        {
            let metrics = Arc::clone(&self.metrics);
            let shutdown = signal.clone();
            stages.spawn(async move {
                let result = produce_stage(producer, outgoing_rx, shutdown, metrics).await;
                (Stage::Produce, result)
            });
        }
        drop(signal);

        tracing::info!(
            reconcile_workers = workers,
            incoming_buffer = self.config.incoming_buffer,
            outgoing_buffer = self.config.outgoing_buffer,
            synchronizer = synchronizer_attached,
            "Pipeline started"
        );

        let mut first_error: Option<DocSyncError> = None;
        let mut sync: Option<CacheSyncSnapshot> = None;
        let mut external_pending = true;

        loop {
            tokio::select! {
                biased;

                _ = external.recv(), if external_pending => {
                    external_pending = false;
                    tracing::info!("Shutdown requested, stopping pipeline");
                    trigger.trigger();
                }

                Some(joined) = sync_task.join_next(), if !sync_task.is_empty() => {
                    sync = settle_sync_task(joined, &mut first_error);
                    if first_error.is_some() {
                        trigger.trigger();
                    }
                }

                joined = stages.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((stage, Ok(()))) => {
                            tracing::debug!(stage = %stage, "Pipeline stage exited");
                        }
                        Ok((stage, Err(e))) => {
                            tracing::error!(stage = %stage, error = %e, "Pipeline stage failed, shutting down");
                            trigger.trigger();
                            first_error.get_or_insert(e);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Pipeline stage task aborted, shutting down");
                            trigger.trigger();
                            first_error.get_or_insert(DocSyncError::TaskAborted {
                                task: "pipeline stage".to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        trigger.trigger();

        while let Some(joined) = sync_task.join_next().await {
            sync = settle_sync_task(joined, &mut first_error);
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            received = snapshot.received,
            decode_failures = snapshot.decode_failures,
            processed = snapshot.processed,
            process_failures = snapshot.process_failures,
            produced = snapshot.produced,
            failed = first_error.is_some(),
            "Pipeline stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(PipelineReport {
                pipeline: snapshot,
                sync,
            }),
        }
    }
}

/// Snapshot a finished sync task, recording an abort as the run's error.
fn settle_sync_task(
    joined: Result<Arc<CacheSyncMetrics>, JoinError>,
    first_error: &mut Option<DocSyncError>,
) -> Option<CacheSyncSnapshot> {
    match joined {
        Ok(metrics) => Some(metrics.snapshot()),
        Err(e) => {
            tracing::error!(error = %e, "Cache sync task aborted, shutting down");
            first_error.get_or_insert(DocSyncError::TaskAborted {
                task: "cache sync".to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

// ============================================================================
// STAGES
// ============================================================================

async fn consume_stage<Rx: EventConsumer>(
    mut consumer: Rx,
    incoming: mpsc::Sender<Document>,
    mut shutdown: ShutdownSignal,
    metrics: Arc<PipelineMetrics>,
) -> DocSyncResult<()> {
    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            received = consumer.receive() => received,
        };

        let payload = match received {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::info!("Inbound stream ended");
                break;
            }
            Err(e) => return Err(e),
        };
        metrics.received.fetch_add(1, Ordering::Relaxed);

        let doc = match Document::from_wire(&payload) {
            Ok(doc) => doc,
            Err(e) => {
                metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, bytes = payload.len(), "Skipping undecodable payload");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            sent = incoming.send(doc) => {
                if sent.is_err() {
                    tracing::debug!("Reconcile workers gone, consume stage exiting");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn reconcile_stage<C, S>(
    engine: Arc<ReconciliationEngine<C, S>>,
    incoming: Arc<Mutex<mpsc::Receiver<Document>>>,
    outgoing: mpsc::Sender<Document>,
    mut shutdown: ShutdownSignal,
    metrics: Arc<PipelineMetrics>,
) -> DocSyncResult<()>
where
    C: CacheStore + ?Sized,
    S: DurableStore + ?Sized,
{
    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            next = recv_shared(&incoming) => next,
        };
        let Some(doc) = next else { break };
        let url = doc.url.clone();

        let processed = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            processed = engine.process(doc) => processed,
        };

        let merged = match processed {
            Ok(merged) => merged,
            Err(e) => {
                metrics.process_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(url = %url, error = %e, "Failed to reconcile document, dropping event");
                continue;
            }
        };
        metrics.processed.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            sent = outgoing.send(merged) => {
                if sent.is_err() {
                    tracing::debug!("Producer gone, reconcile worker exiting");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn recv_shared(incoming: &Mutex<mpsc::Receiver<Document>>) -> Option<Document> {
    incoming.lock().await.recv().await
}

async fn produce_stage<Tx: EventProducer>(
    mut producer: Tx,
    mut outgoing: mpsc::Receiver<Document>,
    mut shutdown: ShutdownSignal,
    metrics: Arc<PipelineMetrics>,
) -> DocSyncResult<()> {
    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            next = outgoing.recv() => next,
        };
        let Some(doc) = next else { break };

        let payload = doc.to_wire()?;
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            sent = producer.send(payload) => sent?,
        }
        metrics.produced.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}
