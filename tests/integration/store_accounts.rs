use serde_json::json;

use crate::common::{make_message, store_with_account};
use mailtriage::store::Store;

#[tokio::test]
async fn upsert_creates_and_updates_accounts() {
    let store = Store::in_memory().await.unwrap();

    let account = store
        .upsert_account("a1", "Work", "work@example.com", "imap", &json!({"host": "mail"}))
        .await
        .unwrap();
    assert_eq!(account.id, "a1");
    assert_eq!(account.email, "work@example.com");
    assert!(account.last_sync.is_none());

    let updated = store
        .upsert_account("a1", "Work Mail", "work@example.com", "imap", &json!({}))
        .await
        .unwrap();
    assert_eq!(updated.name, "Work Mail");
    assert_eq!(store.list_accounts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn rename_moves_messages_and_preserves_last_sync() {
    let store = store_with_account("old_id", "me@example.com").await;

    let timestamp = chrono::Utc::now();
    store.update_last_sync("old_id", timestamp).await.unwrap();

    store
        .upsert_message("old_id", &make_message("old_id:INBOX:1", "Hello", &[]))
        .await
        .unwrap();
    store
        .upsert_message("old_id", &make_message("old_id:INBOX:2", "World", &[]))
        .await
        .unwrap();

    // Same email under a new id is a rename.
    let renamed = store
        .upsert_account("new_id", "Me", "me@example.com", "imap", &json!({}))
        .await
        .unwrap();
    assert_eq!(renamed.id, "new_id");
    assert_eq!(renamed.email, "me@example.com");
    assert_eq!(
        renamed.last_sync.map(|t| t.timestamp()),
        Some(timestamp.timestamp())
    );

    let accounts = store.list_accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, "new_id");

    let moved = store.get_message("old_id:INBOX:1").await.unwrap().unwrap();
    assert_eq!(moved.account_id, "new_id");
    assert_eq!(store.message_count(Some("new_id")).await.unwrap(), 2);
}

#[tokio::test]
async fn deleting_account_cascades_to_messages() {
    let store = store_with_account("a1", "me@example.com").await;
    store
        .upsert_message("a1", &make_message("a1:INBOX:1", "Hello", &[]))
        .await
        .unwrap();

    assert!(store.delete_account("a1").await.unwrap());
    assert!(store.get_message("a1:INBOX:1").await.unwrap().is_none());
}

#[tokio::test]
async fn last_sync_round_trip() {
    let store = store_with_account("a1", "me@example.com").await;
    assert!(store.last_sync_time("a1").await.unwrap().is_none());

    let now = chrono::Utc::now();
    store.update_last_sync("a1", now).await.unwrap();
    let read_back = store.last_sync_time("a1").await.unwrap().unwrap();
    assert_eq!(read_back.timestamp(), now.timestamp());
}
