use std::sync::Arc;
use std::time::Duration;

use crate::common::{make_message, spawn_gateway_stub, spawn_inference_stub, store_with_account};
use mailtriage::actions::default_actions;
use mailtriage::agent::ActionAgent;
use mailtriage::classifier::Classifier;
use mailtriage::config::AiSettings;
use mailtriage::gateway::GatewayClient;
use mailtriage::provider::{Classification, Priority};
use mailtriage::store::Store;
use mailtriage::tags;

const DAV_TOOLS: &str =
    r#"[{"server_id":"mcp-dav","name":"create_contact","description":"","schema":{}}]"#;

async fn classifier_with_stub(responses: Vec<&str>) -> Arc<Classifier> {
    let addr = spawn_inference_stub(responses.into_iter().map(String::from).collect()).await;
    let settings = AiSettings {
        endpoint: format!("http://{}", addr),
        ..Default::default()
    };
    Arc::new(Classifier::new(settings, tags::merge_tags(true, &[], &[])))
}

async fn tagged_message(store: &Store, message_id: &str, tags: &[&str]) {
    store
        .upsert_message("a1", &make_message(message_id, "Please add me", &[]))
        .await
        .unwrap();
    let classification = Classification {
        tags: tags.iter().map(|t| t.to_string()).collect(),
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.9,
    };
    store
        .store_classification(message_id, &classification, "llama3.2")
        .await
        .unwrap();
}

fn agent(store: Arc<Store>, gateway: Arc<GatewayClient>, classifier: Arc<Classifier>) -> ActionAgent {
    ActionAgent::new(
        store,
        gateway,
        classifier,
        default_actions(),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn extraction_failure_retries_until_the_cap() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    tagged_message(&store, "m1", &["add-contact", "personal"]).await;

    let gateway_addr = spawn_gateway_stub(DAV_TOOLS.to_string()).await;
    let gateway = Arc::new(GatewayClient::new(&format!("http://{}", gateway_addr), 5));
    let classifier = classifier_with_stub(vec!["not json"]).await;

    let agent = agent(store.clone(), gateway, classifier);

    // First pass: extraction fails, one failed attempt on record.
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);

    let logs = store.action_logs_for_message("m1").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "failed");
    assert_eq!(logs[0].attempts, 1);

    // The tag stays, so the message is retried.
    let classification = store.get_classification("m1").await.unwrap().unwrap();
    assert!(classification.tags.contains(&"add-contact".to_string()));

    // Second pass: same failure, attempts advance.
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.failed, 1);
    let logs = store.action_logs_for_message("m1").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].attempts, 2);

    // Third pass: the cap is reached and the pair is skipped.
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 0);

    let logs = store.action_logs_for_message("m1").await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].status, "skipped");
    assert!(logs[0].error.as_deref().unwrap().contains("Max retries exceeded"));

    let classification = store.get_classification("m1").await.unwrap().unwrap();
    assert!(classification.tags.contains(&"add-contact".to_string()));
}

#[tokio::test]
async fn successful_action_removes_the_tag() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    tagged_message(&store, "m1", &["add-contact", "work"]).await;

    let gateway_addr = spawn_gateway_stub(DAV_TOOLS.to_string()).await;
    let gateway = Arc::new(GatewayClient::new(&format!("http://{}", gateway_addr), 5));
    let classifier = classifier_with_stub(vec![
        r#"{"formatted_name":"Alice Example","emails":["alice@example.com"],"phones":null}"#,
    ])
    .await;

    let agent = agent(store.clone(), gateway, classifier);
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.succeeded, 1);

    let logs = store.action_logs_for_message("m1").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "success");
    assert_eq!(logs[0].attempts, 1);

    // Null fields were dropped from the extracted payload.
    let extracted = logs[0].extracted_data.as_ref().unwrap();
    assert!(extracted.get("phones").is_none());
    assert_eq!(extracted["formatted_name"], "Alice Example");
    assert!(logs[0].tool_result.is_some());

    // The action tag is gone; other tags survive.
    let classification = store.get_classification("m1").await.unwrap().unwrap();
    assert_eq!(classification.tags, vec!["work"]);

    // Nothing left to process.
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn missing_tool_skips_without_counting_an_attempt() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    tagged_message(&store, "m1", &["add-contact"]).await;

    let gateway_addr = spawn_gateway_stub("[]".to_string()).await;
    let gateway = Arc::new(GatewayClient::new(&format!("http://{}", gateway_addr), 5));
    let classifier = classifier_with_stub(vec![r#"{}"#]).await;

    let agent = agent(store.clone(), gateway, classifier);
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.skipped, 1);

    let logs = store.action_logs_for_message("m1").await.unwrap();
    assert_eq!(logs[0].status, "skipped");
    assert!(logs[0].error.as_deref().unwrap().contains("not available"));

    // Skips are not failed attempts; the counter is still clear.
    assert_eq!(store.action_attempt_count("m1", "add-contact").await.unwrap(), 0);
}

#[tokio::test]
async fn unreachable_gateway_skips_the_whole_pipeline() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    tagged_message(&store, "m1", &["add-contact"]).await;

    // Discard port; nothing listens there.
    let gateway = Arc::new(GatewayClient::new("http://127.0.0.1:9", 1));
    let classifier = classifier_with_stub(vec![r#"{}"#]).await;

    let agent = agent(store.clone(), gateway, classifier);
    let stats = agent.process_actions("a1", 10).await;

    assert_eq!(stats.processed, 0);
    assert!(store.action_logs_for_message("m1").await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_action_logs_resets_the_retry_counter() {
    let store = Arc::new(store_with_account("a1", "me@example.com").await);
    tagged_message(&store, "m1", &["add-contact"]).await;

    let gateway_addr = spawn_gateway_stub(DAV_TOOLS.to_string()).await;
    let gateway = Arc::new(GatewayClient::new(&format!("http://{}", gateway_addr), 5));
    let classifier = classifier_with_stub(vec!["not json"]).await;

    let agent = agent(store.clone(), gateway, classifier);
    agent.process_actions("a1", 10).await;
    agent.process_actions("a1", 10).await;
    assert_eq!(store.action_attempt_count("m1", "add-contact").await.unwrap(), 2);

    store.delete_action_logs("m1").await.unwrap();
    assert_eq!(store.action_attempt_count("m1", "add-contact").await.unwrap(), 0);

    // Retrying works again after the explicit reset.
    let stats = agent.process_actions("a1", 10).await;
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn reply_suggestions_trim_and_cap() {
    let classifier = classifier_with_stub(vec![
        r#"{"replies":["  One  ","Two","Three","Four","Five"]}"#,
    ])
    .await;

    let message = make_message("m1", "Lunch tomorrow?", &[]).clone();
    let replies = classifier.suggest_replies(&message).await.unwrap();
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0], "One");
}

#[tokio::test]
async fn reply_suggestions_degrade_to_empty_on_parse_failure() {
    let classifier = classifier_with_stub(vec!["absolutely not json"]).await;
    let message = make_message("m1", "Lunch tomorrow?", &[]);
    let replies = classifier.suggest_replies(&message).await.unwrap();
    assert!(replies.is_empty());
}
