//! Message bus abstraction.
//!
//! The bus is split into a consuming half and a producing half, each owned
//! by exactly one pipeline stage. Payloads are opaque bytes; decoding into
//! documents happens in the consume stage so that a malformed payload can be
//! skipped without treating the bus itself as broken.

pub mod memory;
pub mod redis_stream;

pub use memory::{MemoryBus, MemoryBusHandle};
pub use redis_stream::{RedisStreamBus, RedisStreamConsumer, RedisStreamProducer};

use async_trait::async_trait;
use docsync_core::DocSyncResult;

/// Receiving half of a bus.
#[async_trait]
pub trait EventConsumer: Send {
    /// Wait for the next payload.
    ///
    /// `Ok(None)` means the stream has ended and no further payloads will
    /// arrive. Errors mean the bus is unusable.
    async fn receive(&mut self) -> DocSyncResult<Option<Vec<u8>>>;
}

/// Sending half of a bus.
#[async_trait]
pub trait EventProducer: Send {
    /// Publish one payload.
    async fn send(&mut self, payload: Vec<u8>) -> DocSyncResult<()>;
}

/// A bus that can be split into its two halves.
pub trait EventBus {
    type Consumer: EventConsumer + 'static;
    type Producer: EventProducer + 'static;

    fn split(self) -> (Self::Consumer, Self::Producer);
}
