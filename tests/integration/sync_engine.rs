use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::common::{make_message, store_with_account, spawn_inference_stub, MockProvider};
use mailtriage::classifier::Classifier;
use mailtriage::config::AiSettings;
use mailtriage::store::PendingOp;
use mailtriage::sync::SyncEngine;
use mailtriage::tags;

async fn classifier_with_stub(responses: Vec<&str>) -> Arc<Classifier> {
    let addr = spawn_inference_stub(responses.into_iter().map(String::from).collect()).await;
    let settings = AiSettings {
        endpoint: format!("http://{}", addr),
        ..Default::default()
    };
    Arc::new(Classifier::new(settings, tags::merge_tags(true, &[], &[])))
}

#[tokio::test]
async fn classify_and_label_happy_path() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    let classifier = classifier_with_stub(vec![
        r#"{"tags":["finance","invoice"],"priority":"normal","action_required":true,"can_archive":false,"confidence":0.92}"#,
    ])
    .await;

    let provider = MockProvider::new("a1")
        .with_messages(vec![make_message("m1", "Invoice #4471 due", &["INBOX"])]);

    let engine = SyncEngine::new(provider, store.clone(), classifier, "AI");
    let result = engine.sync(100, &CancellationToken::new()).await;

    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert_eq!(result.messages_fetched, 1);
    assert_eq!(result.messages_classified, 1);
    assert_eq!(result.labels_updated, 1);
    assert_eq!(result.new_messages.len(), 1);
    assert_eq!(result.new_messages[0].id, "m1");

    // Stored classification carries the model's exact tags and confidence.
    let stored = store.get_classification("m1").await.unwrap().unwrap();
    assert_eq!(stored.tags, vec!["finance", "invoice"]);
    assert!((stored.confidence.unwrap() - 0.92).abs() < 1e-9);
    assert!(stored.todo);

    // The sync point advanced.
    assert!(store.last_sync_time("a1").await.unwrap().is_some());
}

#[tokio::test]
async fn label_delta_recorded_on_provider() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    let classifier = classifier_with_stub(vec![
        r#"{"tags":["finance","invoice"],"priority":"normal","action_required":true,"can_archive":false,"confidence":0.92}"#,
    ])
    .await;

    let provider = Arc::new(
        MockProvider::new("a1")
            .with_messages(vec![make_message("m1", "Invoice #4471 due", &["INBOX"])]),
    );

    let engine = SyncEngine::new(provider.clone(), store, classifier, "AI");
    let result = engine.sync(100, &CancellationToken::new()).await;
    assert!(result.errors.is_empty());

    let expected: HashSet<String> = ["AI/Finance", "AI/Invoice", "AI/ToDo"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let ensured = provider.ensured_labels.lock().unwrap();
    assert_eq!(ensured.len(), 1);
    assert_eq!(ensured[0], expected);

    let updates = provider.label_updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    let (message_id, add, remove) = &updates[0];
    assert_eq!(message_id, "m1");
    assert_eq!(add, &expected);
    assert!(remove.is_empty());
}

#[tokio::test]
async fn second_sync_pushes_no_labels_for_classified_messages() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    let classifier = classifier_with_stub(vec![
        r#"{"tags":["work"],"priority":"normal","action_required":false,"can_archive":false,"confidence":0.9}"#,
    ])
    .await;

    let provider = Arc::new(
        MockProvider::new("a1").with_messages(vec![make_message("m1", "Standup notes", &["INBOX"])]),
    );

    let engine = SyncEngine::new(provider.clone(), store, classifier, "AI");

    let first = engine.sync(100, &CancellationToken::new()).await;
    assert_eq!(first.messages_classified, 1);

    let second = engine.sync(100, &CancellationToken::new()).await;
    assert_eq!(second.messages_classified, 0);
    assert_eq!(second.new_messages.len(), 0);

    // No provider label traffic on the second run.
    assert_eq!(provider.label_updates.lock().unwrap().len(), 1);
    assert_eq!(provider.ensured_labels.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn auth_failure_aborts_without_advancing_sync_point() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    let classifier = classifier_with_stub(vec![r#"{"tags":["work"]}"#]).await;

    let provider = MockProvider::new("a1")
        .with_messages(vec![make_message("m1", "Never seen", &[])])
        .with_auth_error("401 Unauthorized");

    let engine = SyncEngine::new(provider, store.clone(), classifier, "AI");
    let result = engine.sync(100, &CancellationToken::new()).await;

    assert_eq!(result.messages_fetched, 0);
    assert_eq!(result.messages_classified, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("401"));
    assert!(store.last_sync_time("a1").await.unwrap().is_none());
    assert!(store.get_message("m1").await.unwrap().is_none());
}

#[tokio::test]
async fn unparsable_model_reply_degrades_to_low_confidence_default() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    let classifier = classifier_with_stub(vec!["this is not json"]).await;

    let provider =
        MockProvider::new("a1").with_messages(vec![make_message("m1", "Mystery", &[])]);

    let engine = SyncEngine::new(provider, store.clone(), classifier, "AI");
    let result = engine.sync(100, &CancellationToken::new()).await;
    assert!(result.errors.is_empty());

    let stored = store.get_classification("m1").await.unwrap().unwrap();
    assert_eq!(stored.tags, vec!["personal"]);
    assert_eq!(stored.priority, "normal");
    assert!((stored.confidence.unwrap() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn cancelled_runs_leave_sync_point_untouched() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    let classifier = classifier_with_stub(vec![r#"{"tags":["work"]}"#]).await;

    let provider =
        MockProvider::new("a1").with_messages(vec![make_message("m1", "Pending", &[])]);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let engine = SyncEngine::new(provider, store.clone(), classifier, "AI");
    let result = engine.sync(100, &cancel).await;

    assert_eq!(result.messages_classified, 0);
    assert!(store.last_sync_time("a1").await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_queue_entries_cause_no_provider_calls() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    store.upsert_message("a1", &make_message("m2", "Two", &[])).await.unwrap();

    // Trash then restore cancel out before any sync runs.
    store.enqueue_pending("a1", "m2", PendingOp::Trash).await.unwrap();
    store.enqueue_pending("a1", "m2", PendingOp::Restore).await.unwrap();

    let classifier = classifier_with_stub(vec![r#"{"tags":["work"]}"#]).await;
    let provider = Arc::new(MockProvider::new("a1"));

    let engine = SyncEngine::new(provider.clone(), store, classifier, "AI");
    let result = engine.sync(100, &CancellationToken::new()).await;
    assert!(result.errors.is_empty());

    assert!(provider.operation_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pending_operations_drain_fifo_and_complete() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();

    store.set_read_state("a1", "m1", false).await.unwrap();
    store.trash_message("a1", "m1").await.unwrap();

    let classifier = classifier_with_stub(vec![r#"{"tags":["work"]}"#]).await;
    let provider = Arc::new(MockProvider::new("a1"));

    let engine = SyncEngine::new(provider.clone(), store.clone(), classifier, "AI");
    let result = engine.sync(100, &CancellationToken::new()).await;
    assert!(result.errors.is_empty());

    let calls = provider.operation_calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["mark_read:m1".to_string(), "trash:m1".to_string()]);

    // Echoed operations left the pending queue.
    assert!(store.dequeue_pending(Some("a1"), 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_drain_attempts_stay_pending_with_attempt_counts() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();
    store.set_read_state("a1", "m1", false).await.unwrap();

    let classifier = classifier_with_stub(vec![r#"{"tags":["work"]}"#]).await;
    let provider = Arc::new(MockProvider::new("a1"));
    *provider.fail_operations.lock().unwrap() = true;

    let engine = SyncEngine::new(provider.clone(), store.clone(), classifier, "AI");
    engine.sync(100, &CancellationToken::new()).await;

    let pending = store.dequeue_pending(Some("a1"), 50).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());
}

#[tokio::test]
async fn restore_drain_uses_recorded_original_folder() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);

    let mut message = make_message("m1", "One", &[]);
    message.folder = "archive".to_string();
    store.upsert_message("a1", &message).await.unwrap();

    store.trash_message("a1", "m1").await.unwrap();
    // Provider ack for the trash happens in its own run.
    let classifier = classifier_with_stub(vec![r#"{"tags":["work"]}"#]).await;
    let provider = Arc::new(MockProvider::new("a1"));
    let engine = SyncEngine::new(provider.clone(), store.clone(), classifier, "AI");
    engine.sync(100, &CancellationToken::new()).await;

    store.restore_message("a1", "m1").await.unwrap();
    engine.sync(100, &CancellationToken::new()).await;

    let calls = provider.operation_calls.lock().unwrap().clone();
    assert!(calls.contains(&"trash:m1".to_string()));
    // The local row already went back to its folder; that folder travels
    // with the provider call.
    assert!(calls.contains(&"restore:m1:archive".to_string()));
}

#[tokio::test]
async fn reclassify_runs_over_stored_messages() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();
    store.upsert_message("a1", &make_message("m2", "Two", &[])).await.unwrap();

    let classifier = classifier_with_stub(vec![
        r#"{"tags":["work"],"priority":"normal","action_required":false,"can_archive":false,"confidence":0.9}"#,
    ])
    .await;
    let provider = MockProvider::new("a1");

    let engine = SyncEngine::new(provider, store.clone(), classifier, "AI");
    let result = engine.reclassify(None, &CancellationToken::new()).await;

    assert_eq!(result.messages_fetched, 0);
    assert_eq!(result.messages_classified, 2);
    assert!(store.get_classification("m1").await.unwrap().is_some());
    assert!(store.get_classification("m2").await.unwrap().is_some());
}
