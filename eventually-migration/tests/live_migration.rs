use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventually_object_store::codec::Event;
use eventually_object_store::object_store_adapter::{InMemoryProvider, ObjectStoreAdapter};
use eventually_object_store::registry::{ObjectDocumentRegistry, Registry};
use eventually_object_store::stream_store::{EventStreamStore, NewEvent};
use eventually_object_store::tags::TagStore;
use eventually_migration::{
    FailureStrategy, LiveMigrationContext, MigrationEngine, Options, TransformError, Transformer,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn fixtures() -> (EventStreamStore, Registry) {
    let adapter = Arc::new(ObjectStoreAdapter::new(Arc::new(InMemoryProvider::new())));
    let tags = Arc::new(TagStore::new(adapter.clone()));
    let registry = Registry::new(adapter.clone(), tags);
    let stream_store = EventStreamStore::new(adapter);
    (stream_store, registry)
}

fn sample(n: i64) -> NewEvent {
    NewEvent::new("Sample", serde_json::json!({"n": n}), 1)
}

fn context(target_stream_id: impl Into<String>, source_doc: eventually_object_store::registry::ObjectDocument, options: Options) -> LiveMigrationContext {
    LiveMigrationContext {
        migration_id: Uuid::new_v4(),
        object_document: source_doc,
        target_stream_id: target_stream_id.into(),
        target_stream_type: "memory".to_string(),
        data_store: "memory".to_string(),
        document_store: "memory".to_string(),
        options,
        transformer: None,
    }
}

#[tokio::test]
async fn migrates_an_idle_stream_end_to_end() {
    let (stream_store, registry) = fixtures();
    let doc = registry.get_or_create("orders", "order-1", "memory", None).await.unwrap();

    stream_store
        .append(&doc, vec![sample(1), sample(2), sample(3)], false, &CancellationToken::new())
        .await
        .unwrap();

    let mut options = Options::default();
    options.close_timeout = Duration::from_secs(5);
    options.catch_up_delay = Duration::from_millis(1);

    let ctx = context("order-1-v2", doc.clone(), options);
    let engine = MigrationEngine::new(&stream_store, &registry);

    let result = engine.run(ctx, CancellationToken::new()).await;

    assert!(result.success, "migration failed: {:?}", result.error);
    assert_eq!(result.total_events_copied, 3);
    assert_eq!(result.target_stream_id, "order-1-v2");

    let updated = registry.get("orders", "order-1").await.unwrap().unwrap();
    assert_eq!(updated.active.stream_identifier, "order-1-v2");
    assert_eq!(updated.terminated_streams.len(), 1);
    assert_eq!(updated.terminated_streams[0].stream_identifier, doc.active.stream_identifier);
    assert_eq!(updated.terminated_streams[0].continuation_stream_id.as_deref(), Some("order-1-v2"));

    let target_doc = eventually_object_store::registry::ObjectDocument {
        active: updated.active.clone(),
        ..doc.clone()
    };
    let events = stream_store.read(&target_doc, 0, None, None).await.unwrap().unwrap();
    assert_eq!(events.len(), 3);
    assert!(!events.iter().any(Event::is_closure_marker));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migration_converges_under_concurrent_writers() {
    let (stream_store, registry) = fixtures();
    let doc = registry.get_or_create("orders", "order-2", "memory", None).await.unwrap();

    stream_store
        .append(&doc, vec![sample(0)], false, &CancellationToken::new())
        .await
        .unwrap();

    let writer_store = stream_store.clone();
    let writer_doc = doc.clone();
    let writer = tokio::spawn(async move {
        for i in 1..=20 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let _ = writer_store
                .append(&writer_doc, vec![sample(i)], false, &CancellationToken::new())
                .await;
        }
    });

    let mut options = Options::default();
    options.close_timeout = Duration::from_secs(10);
    options.catch_up_delay = Duration::from_millis(1);

    let ctx = context("order-2-v2", doc.clone(), options);
    let engine = MigrationEngine::new(&stream_store, &registry);
    let result = engine.run(ctx, CancellationToken::new()).await;

    writer.await.unwrap();

    assert!(result.success, "migration failed: {:?}", result.error);

    let updated = registry.get("orders", "order-2").await.unwrap().unwrap();
    assert_eq!(updated.active.stream_identifier, "order-2-v2");

    let target_doc = eventually_object_store::registry::ObjectDocument {
        active: updated.active.clone(),
        ..doc.clone()
    };
    let events = stream_store.read(&target_doc, 0, None, None).await.unwrap().unwrap();
    assert_eq!(events.len() as u64, result.total_events_copied);
    assert!(!events.iter().any(Event::is_closure_marker));

    // The source stream must be sealed: no writer can append past the close.
    let append_after_close = stream_store
        .append(&doc, vec![sample(999)], false, &CancellationToken::new())
        .await;
    assert!(append_after_close.is_err());
}

struct RejectEvenVersions;

#[async_trait]
impl Transformer for RejectEvenVersions {
    async fn transform(&self, event: Event) -> Result<Event, TransformError> {
        if event.event_version % 2 == 0 {
            Err(TransformError {
                event_version: event.event_version,
                reason: "even versions are rejected by this test transformer".to_string(),
            })
        } else {
            Ok(event)
        }
    }
}

#[tokio::test]
async fn skips_events_the_transformer_rejects() {
    let (stream_store, registry) = fixtures();
    let doc = registry.get_or_create("orders", "order-3", "memory", None).await.unwrap();

    stream_store
        .append(&doc, vec![sample(0), sample(1), sample(2), sample(3)], false, &CancellationToken::new())
        .await
        .unwrap();

    let mut options = Options::default();
    options.close_timeout = Duration::from_secs(5);
    options.catch_up_delay = Duration::from_millis(1);

    let mut ctx = context("order-3-v2", doc.clone(), options);
    ctx.transformer = Some(Arc::new(RejectEvenVersions));

    let engine = MigrationEngine::new(&stream_store, &registry);
    let result = engine.run(ctx, CancellationToken::new()).await;

    assert!(result.success, "migration failed: {:?}", result.error);
    assert_eq!(result.total_events_copied, 2);

    let updated = registry.get("orders", "order-3").await.unwrap().unwrap();
    let target_doc = eventually_object_store::registry::ObjectDocument {
        active: updated.active.clone(),
        ..doc.clone()
    };
    let events = stream_store.read(&target_doc, 0, None, None).await.unwrap().unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn fails_with_max_iterations_exceeded_when_source_never_settles() {
    let (stream_store, registry) = fixtures();
    let doc = registry.get_or_create("orders", "order-4", "memory", None).await.unwrap();

    stream_store
        .append(&doc, vec![sample(0)], false, &CancellationToken::new())
        .await
        .unwrap();

    let writer_store = stream_store.clone();
    let writer_doc = doc.clone();
    let keep_writing = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let keep_writing_bg = keep_writing.clone();
    let writer = tokio::spawn(async move {
        let mut i = 1i64;
        while keep_writing_bg.load(std::sync::atomic::Ordering::Relaxed) {
            let _ = writer_store
                .append(&writer_doc, vec![sample(i)], false, &CancellationToken::new())
                .await;
            i += 1;
        }
    });

    let mut options = Options::default();
    options.close_timeout = Duration::from_secs(30);
    options.catch_up_delay = Duration::from_millis(1);
    options.max_iterations = 1;
    options.failure_strategy = FailureStrategy::Fail;

    let ctx = context("order-4-v2", doc.clone(), options);
    let engine = MigrationEngine::new(&stream_store, &registry);
    let result = engine.run(ctx, CancellationToken::new()).await;

    keep_writing.store(false, std::sync::atomic::Ordering::Relaxed);
    writer.await.unwrap();

    assert!(result.is_failure());
    assert!(matches!(result.error, Some(eventually_migration::MigrationError::MaxIterationsExceeded(1))));
}
