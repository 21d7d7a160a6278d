//! End-to-end pipeline tests over the in-memory bus, cache and store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{BusError, CacheTtl, DocSyncError, DocSyncResult, Document};
use docsync_service::jobs::CacheSyncConfig;
use docsync_service::shutdown;
use docsync_service::{
    CacheSynchronizer, EventBus, KeyLocks, MemoryBus, Pipeline, PipelineConfig, PipelineReport,
    ReconciliationEngine, TtlPolicy,
};
use docsync_storage::{CacheStore, DocumentKey, DurableStore, InMemoryCache, InMemoryStore};
use docsync_test_utils::fixtures;
use docsync_test_utils::{FlakyStore, StoreOp};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);
const BUS_CAPACITY: usize = 512;

fn pipeline_over<C, S>(cache: C, store: S, workers: usize) -> Pipeline<C, S>
where
    C: CacheStore + 'static,
    S: DurableStore + 'static,
{
    pipeline_with_buffers(cache, store, workers, 4)
}

fn pipeline_with_buffers<C, S>(cache: C, store: S, workers: usize, buffer: usize) -> Pipeline<C, S>
where
    C: CacheStore + 'static,
    S: DurableStore + 'static,
{
    let engine = ReconciliationEngine::new(
        Arc::new(cache),
        Arc::new(store),
        Arc::new(KeyLocks::default()),
        TtlPolicy::default(),
    );
    Pipeline::new(
        Arc::new(engine),
        PipelineConfig {
            incoming_buffer: buffer,
            outgoing_buffer: buffer,
            reconcile_workers: workers,
        },
    )
}

/// Publish `docs`, end the input stream and wait for the pipeline to drain.
async fn run_to_end<C, S>(pipeline: Pipeline<C, S>, docs: &[Document]) -> (PipelineReport, Vec<Document>)
where
    C: CacheStore + 'static,
    S: DurableStore + 'static,
{
    let (bus, mut handle) = MemoryBus::new(BUS_CAPACITY);
    let (consumer, producer) = bus.split();
    let (_trigger, external) = shutdown::channel();

    let running = tokio::spawn(pipeline.run(consumer, producer, external));
    for doc in docs {
        handle.publish(doc).await.unwrap();
    }
    handle.close_input();

    let report = timeout(WAIT, running)
        .await
        .expect("pipeline did not drain")
        .unwrap()
        .unwrap();
    (report, handle.drain_outputs())
}

async fn cached(cache: &InMemoryCache, url: &str) -> Option<Document> {
    cache.get(&DocumentKey::for_url(url)).await.unwrap()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_newer_event_replaces_cached_content() {
    let (existing, incoming, expected) = fixtures::scenario_a();
    let cache = InMemoryCache::new();
    let store = InMemoryStore::new();
    cache
        .set(&DocumentKey::for_url(&existing.url), &existing, CacheTtl::Persistent)
        .await
        .unwrap();

    let (report, outputs) = run_to_end(pipeline_over(cache.clone(), store.clone(), 1), &[incoming]).await;

    assert_eq!(outputs, vec![expected.clone()]);
    assert_eq!(cached(&cache, &expected.url).await, Some(expected));
    // Cache hits leave the store to the synchronizer.
    assert!(store.is_empty());
    assert_eq!(report.pipeline.processed, 1);
}

#[tokio::test]
async fn test_older_event_backfills_stored_document() {
    let (existing, incoming, expected) = fixtures::scenario_b();
    let cache = InMemoryCache::new();
    let store = InMemoryStore::with_documents([existing]);

    let (_, outputs) = run_to_end(pipeline_over(cache.clone(), store.clone(), 1), &[incoming]).await;

    assert_eq!(outputs, vec![expected.clone()]);
    assert_eq!(store.get(&expected.url).await.unwrap(), Some(expected.clone()));
    assert_eq!(cached(&cache, &expected.url).await, Some(expected));
}

#[tokio::test]
async fn test_equal_fetch_time_keeps_existing() {
    let (existing, incoming) = fixtures::scenario_c();
    let cache = InMemoryCache::new();
    cache
        .set(&DocumentKey::for_url(&existing.url), &existing, CacheTtl::Persistent)
        .await
        .unwrap();

    let (_, outputs) = run_to_end(pipeline_over(cache.clone(), InMemoryStore::new(), 1), &[incoming]).await;

    assert_eq!(outputs, vec![existing.clone()]);
    assert_eq!(cached(&cache, &existing.url).await, Some(existing));
}

#[tokio::test]
async fn test_unknown_url_lands_in_both_backends() {
    let incoming = fixtures::scenario_d_incoming();
    let cache = InMemoryCache::new();
    let store = InMemoryStore::new();

    let (_, outputs) = run_to_end(pipeline_over(cache.clone(), store.clone(), 1), &[incoming.clone()]).await;

    assert_eq!(outputs, vec![incoming.clone()]);
    assert_eq!(store.snapshot(), vec![incoming.clone()]);
    assert_eq!(cached(&cache, &incoming.url).await, Some(incoming));
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[tokio::test]
async fn test_undecodable_payload_is_skipped() {
    let (bus, mut handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (_trigger, external) = shutdown::channel();
    let doc = fixtures::scenario_d_incoming();

    handle.publish_raw(b"{\"text\": \"no url\"}".to_vec()).await.unwrap();
    handle.publish_raw(b"\xff\xfe".to_vec()).await.unwrap();
    handle.publish(&doc).await.unwrap();
    handle.close_input();

    let pipeline = pipeline_over(InMemoryCache::new(), InMemoryStore::new(), 1);
    let report = timeout(WAIT, pipeline.run(consumer, producer, external))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.pipeline.received, 3);
    assert_eq!(report.pipeline.decode_failures, 2);
    assert_eq!(report.pipeline.produced, 1);
    assert_eq!(handle.drain_outputs(), vec![doc]);
}

#[tokio::test]
async fn test_reconcile_failure_drops_only_that_event() {
    let bad = fixtures::doc("https://example.com/bad", "b", 10, 0);
    let good = fixtures::doc("https://example.com/good", "g", 10, 0);
    let store = FlakyStore::new(InMemoryStore::new());
    store.fail(StoreOp::Get, &bad.url);

    let pipeline = pipeline_over(InMemoryCache::new(), store, 1);
    let (report, outputs) = run_to_end(pipeline, &[bad, good.clone()]).await;

    assert_eq!(outputs, vec![good]);
    assert_eq!(report.pipeline.process_failures, 1);
    assert_eq!(report.pipeline.processed, 1);
}

#[tokio::test]
async fn test_send_failure_is_fatal() {
    let (bus, handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (_trigger, external) = shutdown::channel();
    handle.fail_sends(true);
    handle.publish(&fixtures::scenario_d_incoming()).await.unwrap();

    let pipeline = pipeline_over(InMemoryCache::new(), InMemoryStore::new(), 2);
    let metrics = pipeline.metrics();
    let result = timeout(WAIT, pipeline.run(consumer, producer, external))
        .await
        .expect("fatal error must stop the pipeline");

    assert!(matches!(result, Err(DocSyncError::Bus(BusError::Send { .. }))));
    assert_eq!(metrics.snapshot().produced, 0);
}

#[tokio::test]
async fn test_receive_failure_is_fatal() {
    let (bus, handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (_trigger, external) = shutdown::channel();
    handle.fail_next_receive(BusError::Receive {
        stream: "documents.incoming".to_string(),
        reason: "connection reset".to_string(),
    });

    let pipeline = pipeline_over(InMemoryCache::new(), InMemoryStore::new(), 1);
    let result = timeout(WAIT, pipeline.run(consumer, producer, external))
        .await
        .expect("fatal error must stop the pipeline");

    assert!(matches!(result, Err(DocSyncError::Bus(BusError::Receive { .. }))));
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_external_shutdown_with_open_input() {
    let (bus, mut handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (trigger, external) = shutdown::channel();
    let doc = fixtures::scenario_d_incoming();

    let pipeline = pipeline_over(InMemoryCache::new(), InMemoryStore::new(), 2);
    let running = tokio::spawn(pipeline.run(consumer, producer, external));

    handle.publish(&doc).await.unwrap();
    let produced = timeout(WAIT, handle.next_output()).await.unwrap().unwrap().unwrap();
    assert_eq!(produced, doc);

    trigger.trigger();
    let report = timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(report.pipeline.produced, 1);
}

#[tokio::test]
async fn test_dropped_external_trigger_counts_as_shutdown() {
    let (bus, _handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (trigger, external) = shutdown::channel();
    drop(trigger);

    let pipeline = pipeline_over(InMemoryCache::new(), InMemoryStore::new(), 1);
    let report = timeout(WAIT, pipeline.run(consumer, producer, external))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.pipeline.received, 0);
}

#[tokio::test]
async fn test_full_queues_block_upstream_until_shutdown() {
    let (bus, mut handle) = MemoryBus::new(1);
    let (consumer, producer) = bus.split();
    let (trigger, external) = shutdown::channel();
    let events = fixtures::numbered_events("https://example.com/slow", 20);

    let pipeline = pipeline_with_buffers(InMemoryCache::new(), InMemoryStore::new(), 1, 1);
    let metrics = pipeline.metrics();
    let running = tokio::spawn(pipeline.run(consumer, producer, external));

    // Nobody reads the outbound side, so every queue fills and publishing
    // eventually blocks instead of events being dropped.
    let mut published = 0;
    for event in &events {
        match timeout(Duration::from_millis(200), handle.publish(event)).await {
            Ok(sent) => {
                sent.unwrap();
                published += 1;
            }
            Err(_) => break,
        }
    }
    assert!(published < events.len());

    let settled = metrics.snapshot();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.snapshot(), settled);
    assert!(settled.received <= published as u64);
    assert_eq!(settled.produced, 1);
    assert_eq!(settled.decode_failures, 0);
    assert_eq!(settled.process_failures, 0);

    // Stages parked on full queues still observe shutdown.
    trigger.trigger();
    let report = timeout(WAIT, running)
        .await
        .expect("blocked stages must exit on shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(report.pipeline.produced, 1);
    assert_eq!(handle.drain_outputs(), vec![events[0].clone()]);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_workers_never_lose_updates() {
    let url = "https://example.com/hot";
    let events = fixtures::numbered_events(url, 200);
    let cache = InMemoryCache::new();
    let store = InMemoryStore::new();

    let (report, outputs) = run_to_end(pipeline_over(cache.clone(), store.clone(), 4), &events).await;

    assert_eq!(report.pipeline.processed, 200);
    assert_eq!(report.pipeline.process_failures, 0);
    assert_eq!(outputs.len(), 200);

    let last = cached(&cache, url).await.unwrap();
    assert_eq!(last.fetch_time, 200);
    assert_eq!(last.text, "v200");
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_workers_across_urls() {
    let urls: Vec<String> = (0..8).map(|i| format!("https://example.com/{}", i)).collect();
    let mut events = Vec::new();
    for round in fixtures::numbered_events("r", 25) {
        for url in &urls {
            events.push(fixtures::doc(url, &round.text, round.fetch_time, round.pub_date));
        }
    }
    let cache = InMemoryCache::new();

    let (report, _) = run_to_end(pipeline_over(cache.clone(), InMemoryStore::new(), 3), &events).await;

    assert_eq!(report.pipeline.processed, 200);
    for url in &urls {
        let doc = cached(&cache, url).await.unwrap();
        assert_eq!(doc.fetch_time, 25, "{}", url);
        assert_eq!(doc.text, "v25");
    }
}

#[tokio::test]
async fn test_attached_synchronizer_flushes_cache_to_store() {
    let (existing, incoming, expected) = fixtures::scenario_a();
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    let locks = Arc::new(KeyLocks::default());
    cache
        .set(&DocumentKey::for_url(&existing.url), &existing, CacheTtl::Persistent)
        .await
        .unwrap();

    let engine = ReconciliationEngine::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&locks),
        TtlPolicy::default(),
    );
    let synchronizer = CacheSynchronizer::new(Arc::clone(&cache), Arc::clone(&store), locks);
    let pipeline = Pipeline::new(Arc::new(engine), PipelineConfig::default()).with_synchronizer(
        Arc::new(synchronizer),
        CacheSyncConfig {
            interval: Duration::from_millis(10),
            evict_expired: true,
        },
    );

    let (bus, mut handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (_trigger, external) = shutdown::channel();
    let running = tokio::spawn(pipeline.run(consumer, producer, external));

    handle.publish(&incoming).await.unwrap();
    let produced = timeout(WAIT, handle.next_output()).await.unwrap().unwrap().unwrap();
    assert_eq!(produced, expected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.close_input();
    let report = timeout(WAIT, running).await.unwrap().unwrap().unwrap();

    let sync = report.sync.expect("synchronizer attached");
    assert!(sync.sweeps >= 1);
    assert!(sync.inserted + sync.updated >= 1);
    assert_eq!(store.get(&expected.url).await.unwrap(), Some(expected));
}

/// Cache whose key listing panics, taking the sync task down with it.
struct PanickingListCache(InMemoryCache);

#[async_trait]
impl CacheStore for PanickingListCache {
    async fn get(&self, key: &DocumentKey) -> DocSyncResult<Option<Document>> {
        self.0.get(key).await
    }

    async fn set(&self, key: &DocumentKey, doc: &Document, ttl: CacheTtl) -> DocSyncResult<()> {
        self.0.set(key, doc, ttl).await
    }

    async fn list_keys(&self, _prefix: &str) -> DocSyncResult<Vec<String>> {
        panic!("key listing exploded");
    }
}

#[tokio::test]
async fn test_sync_task_panic_stops_running_pipeline() {
    let cache = Arc::new(PanickingListCache(InMemoryCache::new()));
    let store = Arc::new(InMemoryStore::new());
    let locks = Arc::new(KeyLocks::default());
    let engine = ReconciliationEngine::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&locks),
        TtlPolicy::default(),
    );
    let synchronizer = CacheSynchronizer::new(cache, store, locks);
    let pipeline = Pipeline::new(Arc::new(engine), PipelineConfig::default()).with_synchronizer(
        Arc::new(synchronizer),
        CacheSyncConfig {
            interval: Duration::from_millis(10),
            evict_expired: false,
        },
    );

    // Input stays open and no external shutdown arrives, so only the sync
    // task's failure can end the run.
    let (bus, _handle) = MemoryBus::new(8);
    let (consumer, producer) = bus.split();
    let (_trigger, external) = shutdown::channel();
    let result = timeout(WAIT, pipeline.run(consumer, producer, external))
        .await
        .expect("sync task failure must stop the pipeline");

    assert!(matches!(result, Err(DocSyncError::TaskAborted { .. })));
}
