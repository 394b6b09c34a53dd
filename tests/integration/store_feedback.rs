use crate::common::{make_message, store_with_account};
use mailtriage::provider::{Classification, Priority};

async fn classify(store: &mailtriage::store::Store, message_id: &str, tags: &[&str]) {
    let classification = Classification {
        tags: tags.iter().map(|t| t.to_string()).collect(),
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.8,
    };
    store
        .store_classification(message_id, &classification, "llama3.2")
        .await
        .unwrap();
}

#[tokio::test]
async fn user_edit_records_feedback_with_derived_fields() {
    let store = store_with_account("a1", "me@example.com").await;

    let mut message = make_message("m1", "Re: Invoice #4471 overdue", &[]);
    message.from_email = "billing@vendor.com".to_string();
    store.upsert_message("a1", &message).await.unwrap();
    classify(&store, "m1", &["social"]).await;

    store
        .update_message_tags("m1", &["finance".to_string()], None, true)
        .await
        .unwrap();

    assert!(store.has_user_feedback("m1").await.unwrap());

    let feedback = store.relevant_feedback("a1", "vendor.com", 5).await.unwrap();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].sender_domain, "vendor.com");
    assert_eq!(feedback[0].subject_pattern, "Invoice #XXX overdue");
    assert_eq!(feedback[0].original_tags, vec!["social"]);
    assert_eq!(feedback[0].corrected_tags, vec!["finance"]);
}

#[tokio::test]
async fn non_user_edits_and_unchanged_sets_record_nothing() {
    let store = store_with_account("a1", "me@example.com").await;
    store.upsert_message("a1", &make_message("m1", "Hello", &[])).await.unwrap();
    classify(&store, "m1", &["work"]).await;

    // Same tag set, user-edited: no feedback.
    store
        .update_message_tags("m1", &["work".to_string()], None, true)
        .await
        .unwrap();
    assert!(!store.has_user_feedback("m1").await.unwrap());

    // Different tags, but a machine edit: no feedback.
    store
        .update_message_tags("m1", &["personal".to_string()], None, false)
        .await
        .unwrap();
    assert!(!store.has_user_feedback("m1").await.unwrap());
}

#[tokio::test]
async fn relevant_feedback_prefers_domain_matches_and_counts_usage() {
    let store = store_with_account("a1", "me@example.com").await;

    for (index, domain) in ["github.com", "github.com", "github.com", "github.com", "other.io"]
        .iter()
        .enumerate()
    {
        let id = format!("m{}", index);
        let mut message = make_message(&id, &format!("Notification {}", index), &[]);
        message.from_email = format!("noreply@{}", domain);
        store.upsert_message("a1", &message).await.unwrap();
        classify(&store, &id, &["social"]).await;
        store
            .update_message_tags(&id, &["dev".to_string()], None, true)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let feedback = store.relevant_feedback("a1", "GitHub.com", 5).await.unwrap();
    assert_eq!(feedback.len(), 5);

    // At most three domain matches lead, rest topped up by recency.
    let leading_domains: Vec<&str> = feedback[..3].iter().map(|f| f.sender_domain.as_str()).collect();
    assert_eq!(leading_domains, vec!["github.com"; 3]);

    // Every returned row had its usage bumped atomically with the read.
    assert!(feedback.iter().all(|f| f.used_count == 1));

    let again = store.relevant_feedback("a1", "github.com", 2).await.unwrap();
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|f| f.used_count == 2));
}

#[tokio::test]
async fn cleanup_trims_per_account_excess_oldest_first() {
    let store = store_with_account("a1", "me@example.com").await;

    for index in 0..6 {
        let id = format!("m{}", index);
        store.upsert_message("a1", &make_message(&id, "Subject", &[])).await.unwrap();
        classify(&store, &id, &["social"]).await;
        store
            .update_message_tags(&id, &["dev".to_string()], None, true)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // Nothing is old enough for the age bound; the cap trims to 4.
    let removed = store.cleanup_feedback(90, 4).await.unwrap();
    assert_eq!(removed, 2);

    let remaining = store.relevant_feedback("a1", "nomatch.example", 10).await.unwrap();
    assert_eq!(remaining.len(), 4);
    // The oldest corrections (for m0 and m1) are the ones that went away.
    assert!(remaining.iter().all(|f| f.message_id != "m0" && f.message_id != "m1"));
}

#[tokio::test]
async fn feedback_stats_aggregate_by_domain() {
    let store = store_with_account("a1", "me@example.com").await;

    for (index, domain) in ["github.com", "github.com", "vendor.com"].iter().enumerate() {
        let id = format!("m{}", index);
        let mut message = make_message(&id, "Subject", &[]);
        message.from_email = format!("x@{}", domain);
        store.upsert_message("a1", &message).await.unwrap();
        classify(&store, &id, &["social"]).await;
        store
            .update_message_tags(&id, &["dev".to_string()], None, true)
            .await
            .unwrap();
    }

    let stats = store.feedback_stats("a1").await.unwrap();
    assert_eq!(stats["total_corrections"], serde_json::json!(3));
    let top = stats["top_domains"].as_array().unwrap();
    assert_eq!(top[0]["domain"], "github.com");
    assert_eq!(top[0]["count"], 2);
}
