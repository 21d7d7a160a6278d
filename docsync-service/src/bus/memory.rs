//! In-process bus over bounded tokio channels.
//!
//! The [`MemoryBusHandle`] plays the part of the outside world: it publishes
//! inbound payloads, reads what the pipeline produced, and can inject bus
//! failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docsync_core::{BusError, CodecError, DocSyncResult, Document};
use tokio::sync::mpsc;

use super::{EventBus, EventConsumer, EventProducer};

const INBOUND_STREAM: &str = "memory:inbound";
const OUTBOUND_STREAM: &str = "memory:outbound";

#[derive(Debug, Default)]
struct Faults {
    receive: Mutex<Option<BusError>>,
    fail_sends: AtomicBool,
}

/// Bus whose two ends are connected to a [`MemoryBusHandle`].
#[derive(Debug)]
pub struct MemoryBus {
    consumer: MemoryConsumer,
    producer: MemoryProducer,
}

/// Test-side ends of a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryBusHandle {
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    outbound: mpsc::Receiver<Vec<u8>>,
    faults: Arc<Faults>,
}

#[derive(Debug)]
pub struct MemoryConsumer {
    inbound: mpsc::Receiver<Vec<u8>>,
    faults: Arc<Faults>,
}

#[derive(Debug)]
pub struct MemoryProducer {
    outbound: mpsc::Sender<Vec<u8>>,
    faults: Arc<Faults>,
}

impl MemoryBus {
    /// Create a bus whose inbound and outbound channels hold `capacity`
    /// payloads each.
    pub fn new(capacity: usize) -> (Self, MemoryBusHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let faults = Arc::new(Faults::default());

        let bus = Self {
            consumer: MemoryConsumer {
                inbound: in_rx,
                faults: Arc::clone(&faults),
            },
            producer: MemoryProducer {
                outbound: out_tx,
                faults: Arc::clone(&faults),
            },
        };
        let handle = MemoryBusHandle {
            inbound: Some(in_tx),
            outbound: out_rx,
            faults,
        };
        (bus, handle)
    }
}

impl EventBus for MemoryBus {
    type Consumer = MemoryConsumer;
    type Producer = MemoryProducer;

    fn split(self) -> (Self::Consumer, Self::Producer) {
        (self.consumer, self.producer)
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn receive(&mut self) -> DocSyncResult<Option<Vec<u8>>> {
        let injected = self.faults.receive.lock().ok().and_then(|mut f| f.take());
        if let Some(err) = injected {
            return Err(err.into());
        }
        Ok(self.inbound.recv().await)
    }
}

#[async_trait]
impl EventProducer for MemoryProducer {
    async fn send(&mut self, payload: Vec<u8>) -> DocSyncResult<()> {
        if self.faults.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::Send {
                stream: OUTBOUND_STREAM.to_string(),
                reason: "injected send failure".to_string(),
            }
            .into());
        }
        self.outbound
            .send(payload)
            .await
            .map_err(|_| BusError::Closed.into())
    }
}

impl MemoryBusHandle {
    /// Publish an encoded document.
    pub async fn publish(&self, doc: &Document) -> DocSyncResult<()> {
        let payload = doc.to_wire()?;
        self.publish_raw(payload).await
    }

    /// Publish arbitrary bytes, valid or not.
    pub async fn publish_raw(&self, payload: Vec<u8>) -> DocSyncResult<()> {
        let inbound = self.inbound.as_ref().ok_or(BusError::Closed)?;
        inbound.send(payload).await.map_err(|_| BusError::Send {
            stream: INBOUND_STREAM.to_string(),
            reason: "consumer dropped".to_string(),
        })?;
        Ok(())
    }

    /// End the inbound stream. The consumer sees `Ok(None)` once it has
    /// drained what was already published.
    pub fn close_input(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next produced document. `None` once the producer is gone.
    pub async fn next_output(&mut self) -> Option<DocSyncResult<Document>> {
        let payload = self.outbound.recv().await?;
        Some(Document::from_wire(&payload).map_err(|e: CodecError| e.into()))
    }

    /// Take every produced document that is already waiting.
    pub fn drain_outputs(&mut self) -> Vec<Document> {
        let mut docs = Vec::new();
        while let Ok(payload) = self.outbound.try_recv() {
            if let Ok(doc) = Document::from_wire(&payload) {
                docs.push(doc);
            }
        }
        docs
    }

    /// Make the next `receive` call fail with `err`.
    pub fn fail_next_receive(&self, err: BusError) {
        if let Ok(mut slot) = self.faults.receive.lock() {
            *slot = Some(err);
        }
    }

    /// Make every `send` fail until reset.
    pub fn fail_sends(&self, fail: bool) {
        self.faults.fail_sends.store(fail, Ordering::SeqCst);
    }
}
