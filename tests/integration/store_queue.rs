use crate::common::{make_message, store_with_account};
use mailtriage::store::{OperationStatus, PendingOp, DEFAULT_MAX_ATTEMPTS};

#[tokio::test]
async fn opposite_operations_cancel_out() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();

    store.enqueue_pending("a1", "m1", PendingOp::MarkRead).await.unwrap();
    let second = store
        .enqueue_pending("a1", "m1", PendingOp::MarkUnread)
        .await
        .unwrap();

    assert!(second.is_none(), "cancelling enqueue returns nothing");
    assert!(store.dequeue_pending(Some("a1"), 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn trash_and_restore_cancel_out() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m2", "Two", &[])).await.unwrap();

    store.enqueue_pending("a1", "m2", PendingOp::Trash).await.unwrap();
    store.enqueue_pending("a1", "m2", PendingOp::Restore).await.unwrap();

    assert!(store.dequeue_pending(Some("a1"), 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_enqueue_is_idempotent() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();

    let first = store
        .enqueue_pending("a1", "m1", PendingOp::MarkRead)
        .await
        .unwrap()
        .unwrap();
    let second = store
        .enqueue_pending("a1", "m1", PendingOp::MarkRead)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.dequeue_pending(Some("a1"), 50).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dequeue_is_fifo_per_account() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();
    store.upsert_message("a1", &make_message("m2", "Two", &[])).await.unwrap();

    store.enqueue_pending("a1", "m1", PendingOp::MarkRead).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.enqueue_pending("a1", "m2", PendingOp::Trash).await.unwrap();

    let ops = store.dequeue_pending(Some("a1"), 50).await.unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].message_id, "m1");
    assert_eq!(ops[1].message_id, "m2");
    assert_eq!(ops[0].operation, PendingOp::MarkRead);
}

#[tokio::test]
async fn failed_attempts_reach_terminal_state() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();

    let op_id = store
        .enqueue_pending("a1", "m1", PendingOp::Trash)
        .await
        .unwrap()
        .unwrap();

    // Two failures leave it pending with attempts counted.
    store.fail_pending(&op_id, "timeout", DEFAULT_MAX_ATTEMPTS).await.unwrap();
    store.fail_pending(&op_id, "timeout", DEFAULT_MAX_ATTEMPTS).await.unwrap();

    let pending = store.dequeue_pending(Some("a1"), 50).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));

    // The third failure is terminal.
    store.fail_pending(&op_id, "timeout", DEFAULT_MAX_ATTEMPTS).await.unwrap();
    assert!(store.dequeue_pending(Some("a1"), 50).await.unwrap().is_empty());

    let failed = store.get_failed_operations(Some("a1")).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, OperationStatus::Failed);
    assert_eq!(failed[0].attempts, 3);
}

#[tokio::test]
async fn completed_operations_leave_the_queue() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();

    let op_id = store
        .enqueue_pending("a1", "m1", PendingOp::MarkRead)
        .await
        .unwrap()
        .unwrap();
    assert!(store.complete_pending(&op_id).await.unwrap());
    assert!(store.dequeue_pending(Some("a1"), 50).await.unwrap().is_empty());

    // Completed rows are eligible for cleanup by age (0 hours = everything).
    let removed = store.cleanup_completed_operations(0).await.unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn local_mutation_and_enqueue_are_atomic() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();

    // Mark read then trash, the way a UI would.
    store.set_read_state("a1", "m1", false).await.unwrap();
    store.trash_message("a1", "m1").await.unwrap();

    let row = store.get_message("m1").await.unwrap().unwrap();
    assert!(!row.is_unread);
    assert_eq!(row.folder, "trash");

    let ops = store.dequeue_pending(Some("a1"), 50).await.unwrap();
    let kinds: Vec<PendingOp> = ops.iter().map(|op| op.operation).collect();
    assert_eq!(kinds, vec![PendingOp::MarkRead, PendingOp::Trash]);
}

#[tokio::test]
async fn provider_state_never_clobbers_local_after_user_actions() {
    let store = store_with_account("a1", "me@example.com").await;

    let mut message = make_message("m1", "One", &[]);
    store.upsert_message("a1", &message).await.unwrap();

    store.set_read_state("a1", "m1", false).await.unwrap();
    store.trash_message("a1", "m1").await.unwrap();

    // A later fetch still reports the provider's stale view.
    message.is_unread = true;
    store.upsert_message("a1", &message).await.unwrap();

    let row = store.get_message("m1").await.unwrap().unwrap();
    assert!(!row.is_unread);
    assert_eq!(row.folder, "trash");

    // The queued echoes are untouched by the fetch.
    let ops = store.dequeue_pending(Some("a1"), 50).await.unwrap();
    assert_eq!(ops.len(), 2);
}
