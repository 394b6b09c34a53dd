use crate::common::{make_message, store_with_account};
use mailtriage::provider::{Classification, Priority};
use mailtriage::store::MessageFilters;

#[tokio::test]
async fn upsert_preserves_local_state_on_existing_rows() {
    let store = store_with_account("a1", "me@example.com").await;

    let mut message = make_message("a1:INBOX:1", "Hello", &["INBOX"]);
    assert!(store.upsert_message("a1", &message).await.unwrap());

    // User reads the message and trashes it locally.
    store.update_message_read("a1:INBOX:1", false).await.unwrap();
    store.move_to_trash("a1:INBOX:1").await.unwrap();

    // Provider still reports it unread in the inbox.
    message.is_unread = true;
    message.folder = "inbox".to_string();
    message.subject = "Hello (edited)".to_string();
    assert!(!store.upsert_message("a1", &message).await.unwrap());

    let row = store.get_message("a1:INBOX:1").await.unwrap().unwrap();
    assert!(!row.is_unread, "local read state is the authority");
    assert_eq!(row.folder, "trash", "local folder is the authority");
    assert_eq!(row.original_folder.as_deref(), Some("inbox"));
    assert_eq!(row.subject, "Hello (edited)", "provider fields still refresh");
}

#[tokio::test]
async fn trash_and_restore_round_trip() {
    let store = store_with_account("a1", "me@example.com").await;
    store
        .upsert_message("a1", &make_message("m1", "Subject", &[]))
        .await
        .unwrap();

    let trashed = store.move_to_trash("m1").await.unwrap().unwrap();
    assert_eq!(trashed.folder, "trash");
    assert_eq!(trashed.original_folder.as_deref(), Some("inbox"));

    // Trashing again is a no-op, not a folder overwrite.
    let again = store.move_to_trash("m1").await.unwrap().unwrap();
    assert_eq!(again.original_folder.as_deref(), Some("inbox"));

    let restored = store.restore_from_trash("m1").await.unwrap().unwrap();
    assert_eq!(restored.folder, "inbox");
    assert!(restored.original_folder.is_none());

    // Restoring a message that is not in trash does nothing.
    assert!(store.restore_from_trash("m1").await.unwrap().is_none());
}

#[tokio::test]
async fn hard_delete_cascades_to_classification() {
    let store = store_with_account("a1", "me@example.com").await;
    store
        .upsert_message("a1", &make_message("m1", "Subject", &[]))
        .await
        .unwrap();

    let classification = Classification {
        tags: vec!["work".to_string()],
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.9,
    };
    store
        .store_classification("m1", &classification, "llama3.2")
        .await
        .unwrap();

    assert!(store.delete_message("m1").await.unwrap());
    assert!(store.get_message("m1").await.unwrap().is_none());
    assert!(store.get_classification("m1").await.unwrap().is_none());
}

#[tokio::test]
async fn replacing_classification_keeps_the_message() {
    let store = store_with_account("a1", "me@example.com").await;
    store
        .upsert_message("a1", &make_message("m1", "Subject", &[]))
        .await
        .unwrap();

    let first = Classification {
        tags: vec!["work".to_string()],
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.7,
    };
    store.store_classification("m1", &first, "llama3.2").await.unwrap();

    let second = Classification {
        tags: vec!["finance".to_string()],
        priority: Priority::High,
        todo: true,
        can_archive: false,
        confidence: 0.95,
    };
    store.store_classification("m1", &second, "llama3.2").await.unwrap();

    let stored = store.get_classification("m1").await.unwrap().unwrap();
    assert_eq!(stored.tags, vec!["finance"]);
    assert_eq!(stored.priority, "high");
    assert!(store.get_message("m1").await.unwrap().is_some());
}

#[tokio::test]
async fn query_messages_filters_compose() {
    let store = store_with_account("a1", "me@example.com").await;
    store
        .upsert_account("a2", "Other", "other@example.com", "api", &serde_json::json!({}))
        .await
        .unwrap();

    let mut inbox_read = make_message("m1", "Quarterly report", &[]);
    inbox_read.is_unread = false;
    store.upsert_message("a1", &inbox_read).await.unwrap();

    store
        .upsert_message("a1", &make_message("m2", "Invoice attached", &[]))
        .await
        .unwrap();
    store
        .upsert_message("a2", &make_message("m3", "Hello from a2", &[]))
        .await
        .unwrap();

    let classification = Classification {
        tags: vec!["finance".to_string(), "invoice".to_string()],
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.9,
    };
    store.store_classification("m2", &classification, "llama3.2").await.unwrap();

    // Account filter.
    let filters = MessageFilters::for_account("a1");
    assert_eq!(store.query_messages(&filters, 50, 0).await.unwrap().len(), 2);

    // Unread filter.
    let filters = MessageFilters {
        account_id: Some("a1".to_string()),
        is_unread: Some(true),
        ..Default::default()
    };
    let unread = store.query_messages(&filters, 50, 0).await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, "m2");

    // Taxonomy tag filter joins through classifications.
    let filters = MessageFilters {
        tags: vec!["finance".to_string()],
        ..Default::default()
    };
    let tagged = store.query_messages(&filters, 50, 0).await.unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, "m2");

    // An account email acts as a pseudo-tag selecting that account.
    let filters = MessageFilters {
        tags: vec!["other@example.com".to_string()],
        ..Default::default()
    };
    let by_email = store.query_messages(&filters, 50, 0).await.unwrap();
    assert_eq!(by_email.len(), 1);
    assert_eq!(by_email[0].id, "m3");

    // Free-text filter over subject/from/snippet.
    let filters = MessageFilters {
        text: Some("Invoice".to_string()),
        ..Default::default()
    };
    let found = store.query_messages(&filters, 50, 0).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "m2");

    assert_eq!(store.count_messages(&MessageFilters::default()).await.unwrap(), 3);
}

#[tokio::test]
async fn full_text_search_matches_body() {
    let store = store_with_account("a1", "me@example.com").await;

    let mut message = make_message("m1", "Weekly digest", &[]);
    message.body_text = Some("the quarterly earnings exceeded projections".to_string());
    store.upsert_message("a1", &message).await.unwrap();
    store
        .upsert_message("a1", &make_message("m2", "Unrelated", &[]))
        .await
        .unwrap();

    let hits = store.search_messages(Some("a1"), "earnings", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "m1");
}

#[tokio::test]
async fn lazy_body_fetch_updates_both_bodies() {
    let store = store_with_account("a1", "me@example.com").await;
    let mut message = make_message("m1", "Subject", &[]);
    message.body_text = None;
    store.upsert_message("a1", &message).await.unwrap();

    let updated = store
        .update_message_body("m1", Some("plain"), Some("<p>html</p>"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.body_text.as_deref(), Some("plain"));
    assert_eq!(updated.body_html.as_deref(), Some("<p>html</p>"));
}

#[tokio::test]
async fn unclassified_listing_excludes_classified() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "One", &[])).await.unwrap();
    store.upsert_message("a1", &make_message("m2", "Two", &[])).await.unwrap();

    let classification = Classification {
        tags: vec!["work".to_string()],
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.8,
    };
    store.store_classification("m1", &classification, "llama3.2").await.unwrap();

    let unclassified = store.unclassified_messages(Some("a1"), 100).await.unwrap();
    assert_eq!(unclassified.len(), 1);
    assert_eq!(unclassified[0].id, "m2");
}

#[tokio::test]
async fn drafts_and_attachments_lifecycle() {
    use chrono::Utc;
    use mailtriage::store::{AttachmentRecord, DraftRecord};

    let store = store_with_account("a1", "me@example.com").await;

    let draft = DraftRecord {
        id: "d1".to_string(),
        account_id: "a1".to_string(),
        subject: "Draft subject".to_string(),
        to_emails: vec!["to@example.com".to_string()],
        cc_emails: None,
        bcc_emails: None,
        body_text: Some("draft body".to_string()),
        body_html: None,
        thread_id: None,
        in_reply_to: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create_draft(&draft).await.unwrap();

    let updated = store
        .update_draft("d1", Some("New subject"), None, None, None, None, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.subject, "New subject");
    assert_eq!(updated.to_emails, vec!["to@example.com"]);

    let attachment = AttachmentRecord {
        id: "att1".to_string(),
        draft_id: Some("d1".to_string()),
        message_id: None,
        filename: "report.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        size: 3,
        data: vec![1, 2, 3],
        created_at: Utc::now(),
    };
    store.add_attachment(&attachment).await.unwrap();

    // Attachment must belong to a draft XOR a message.
    let invalid = AttachmentRecord {
        id: "att2".to_string(),
        draft_id: None,
        message_id: None,
        ..attachment.clone()
    };
    assert!(store.add_attachment(&invalid).await.is_err());

    assert_eq!(store.list_attachments(Some("d1"), None).await.unwrap().len(), 1);

    // Draft deletion cascades to attachments.
    assert!(store.delete_draft("d1").await.unwrap());
    assert!(store.get_attachment("att1").await.unwrap().is_none());
}

#[tokio::test]
async fn trusted_senders_are_per_account() {
    let store = store_with_account("a1", "me@example.com").await;
    store
        .upsert_account("a2", "Other", "other@example.com", "api", &serde_json::json!({}))
        .await
        .unwrap();

    store.add_trusted_sender("a1", "News@Example.com").await.unwrap();
    // Duplicate adds are idempotent.
    store.add_trusted_sender("a1", "news@example.com").await.unwrap();

    assert!(store.is_trusted_sender("a1", "news@example.com").await.unwrap());
    assert!(!store.is_trusted_sender("a2", "news@example.com").await.unwrap());
    assert_eq!(store.list_trusted_senders("a1").await.unwrap().len(), 1);

    assert!(store.remove_trusted_sender("a1", "news@example.com").await.unwrap());
    assert!(!store.is_trusted_sender("a1", "news@example.com").await.unwrap());
}

#[tokio::test]
async fn push_subscription_upsert_by_endpoint() {
    let store = store_with_account("a1", "me@example.com").await;

    store
        .add_push_subscription("https://push/ep1", "key1", "auth1")
        .await
        .unwrap();
    store
        .add_push_subscription("https://push/ep1", "key2", "auth2")
        .await
        .unwrap();

    let subs = store.list_push_subscriptions().await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].p256dh, "key2");

    assert!(store.delete_push_subscription("https://push/ep1").await.unwrap());
    assert!(store.list_push_subscriptions().await.unwrap().is_empty());
}
