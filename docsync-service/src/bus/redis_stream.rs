//! Redis Streams bus.
//!
//! The consumer reads the inbound stream through a consumer group
//! (`XREADGROUP ... BLOCK`), acknowledging entries as soon as they are
//! buffered. Delivery is therefore at-most-once: entries buffered or queued
//! when the process stops are not redelivered. The producer appends each
//! encoded document to the outbound stream with `XADD` under the `payload`
//! field.

use std::collections::VecDeque;

use async_trait::async_trait;
use docsync_core::{BusError, DocSyncResult};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Deserialize;

use super::{EventBus, EventConsumer, EventProducer};
use crate::constants::{
    DEFAULT_CONSUMER_GROUP, DEFAULT_CONSUMER_NAME, DEFAULT_INCOMING_STREAM,
    DEFAULT_OUTGOING_STREAM, DEFAULT_READ_BATCH, DEFAULT_READ_BLOCK_MILLIS, DEFAULT_REDIS_URL,
    STREAM_PAYLOAD_FIELD,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Redis Streams bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisStreamConfig {
    /// Redis URL for the inbound stream
    pub url: String,
    /// Redis URL for the outbound stream (defaults to `url`)
    pub outgoing_url: Option<String>,
    pub incoming_stream: String,
    pub outgoing_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Maximum entries per read
    pub read_batch: usize,
    /// Block time per read in milliseconds
    pub block_millis: usize,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            outgoing_url: None,
            incoming_stream: DEFAULT_INCOMING_STREAM.to_string(),
            outgoing_stream: DEFAULT_OUTGOING_STREAM.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            read_batch: DEFAULT_READ_BATCH,
            block_millis: DEFAULT_READ_BLOCK_MILLIS,
        }
    }
}

impl RedisStreamConfig {
    /// URL the producer connects to.
    pub fn producer_url(&self) -> &str {
        self.outgoing_url.as_deref().unwrap_or(&self.url)
    }
}

// ============================================================================
// BUS
// ============================================================================

/// Redis Streams bus with independent consumer and producer connections.
pub struct RedisStreamBus {
    consumer: RedisStreamConsumer,
    producer: RedisStreamProducer,
}

impl RedisStreamBus {
    /// Connect both halves and make sure the consumer group exists.
    pub async fn connect(config: &RedisStreamConfig) -> DocSyncResult<Self> {
        let mut consumer_conn = open_connection(&config.url).await?;
        ensure_group(&mut consumer_conn, &config.incoming_stream, &config.consumer_group).await?;
        let producer_conn = open_connection(config.producer_url()).await?;

        tracing::info!(
            incoming_stream = %config.incoming_stream,
            outgoing_stream = %config.outgoing_stream,
            consumer_group = %config.consumer_group,
            consumer_name = %config.consumer_name,
            "Connected to Redis streams"
        );

        let read_options = StreamReadOptions::default()
            .group(&config.consumer_group, &config.consumer_name)
            .count(config.read_batch.max(1))
            .block(config.block_millis);

        Ok(Self {
            consumer: RedisStreamConsumer {
                conn: consumer_conn,
                stream: config.incoming_stream.clone(),
                group: config.consumer_group.clone(),
                read_options,
                pending: VecDeque::new(),
            },
            producer: RedisStreamProducer {
                conn: producer_conn,
                stream: config.outgoing_stream.clone(),
            },
        })
    }
}

impl EventBus for RedisStreamBus {
    type Consumer = RedisStreamConsumer;
    type Producer = RedisStreamProducer;

    fn split(self) -> (Self::Consumer, Self::Producer) {
        (self.consumer, self.producer)
    }
}

async fn open_connection(url: &str) -> DocSyncResult<MultiplexedConnection> {
    let client = redis::Client::open(url).map_err(|e| BusError::Connect {
        reason: format!("invalid redis url: {}", e),
    })?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| BusError::Connect {
            reason: e.to_string(),
        })?;
    Ok(conn)
}

async fn ensure_group(
    conn: &mut MultiplexedConnection,
    stream: &str,
    group: &str,
) -> DocSyncResult<()> {
    let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match created {
        Ok(()) => {
            tracing::info!(stream, group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(BusError::Connect {
            reason: format!("failed to create consumer group {} on {}: {}", group, stream, e),
        }
        .into()),
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

/// Consuming half of [`RedisStreamBus`].
pub struct RedisStreamConsumer {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    read_options: StreamReadOptions,
    pending: VecDeque<Vec<u8>>,
}

impl RedisStreamConsumer {
    fn receive_error(&self, e: redis::RedisError) -> BusError {
        BusError::Receive {
            stream: self.stream.clone(),
            reason: e.to_string(),
        }
    }

    /// Read one batch into `pending` and acknowledge it.
    async fn fill(&mut self) -> DocSyncResult<()> {
        let read: redis::RedisResult<Option<StreamReadReply>> = self
            .conn
            .xread_options(&[&self.stream], &[">"], &self.read_options)
            .await;
        let reply = match read {
            Ok(reply) => reply,
            Err(e) => return Err(self.receive_error(e).into()),
        };
        let Some(reply) = reply else {
            return Ok(());
        };

        let (payloads, ids) = split_entries(reply);
        self.pending.extend(payloads);

        if !ids.is_empty() {
            let acked: redis::RedisResult<usize> =
                self.conn.xack(&self.stream, &self.group, ids.as_slice()).await;
            if let Err(e) = acked {
                return Err(self.receive_error(e).into());
            }
        }
        Ok(())
    }
}

/// Pull payloads out of a read reply, returning them with every entry id
/// (including entries without a payload, which are acknowledged and dropped).
fn split_entries(reply: StreamReadReply) -> (Vec<Vec<u8>>, Vec<String>) {
    let mut payloads = Vec::new();
    let mut ids = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            match entry.get::<Vec<u8>>(STREAM_PAYLOAD_FIELD) {
                Some(payload) => payloads.push(payload),
                None => tracing::warn!(id = %entry.id, "Stream entry has no payload field"),
            }
            ids.push(entry.id);
        }
    }
    (payloads, ids)
}

#[async_trait]
impl EventConsumer for RedisStreamConsumer {
    async fn receive(&mut self) -> DocSyncResult<Option<Vec<u8>>> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                return Ok(Some(payload));
            }
            self.fill().await?;
        }
    }
}

// ============================================================================
// PRODUCER
// ============================================================================

/// Producing half of [`RedisStreamBus`].
pub struct RedisStreamProducer {
    conn: MultiplexedConnection,
    stream: String,
}

#[async_trait]
impl EventProducer for RedisStreamProducer {
    async fn send(&mut self, payload: Vec<u8>) -> DocSyncResult<()> {
        let added: redis::RedisResult<String> = self
            .conn
            .xadd(&self.stream, "*", &[(STREAM_PAYLOAD_FIELD, payload.as_slice())])
            .await;
        added.map(|_| ()).map_err(|e| {
            BusError::Send {
                stream: self.stream.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}
