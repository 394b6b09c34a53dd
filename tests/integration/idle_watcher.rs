use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::spawn_idle_imap_stub;
use mailtriage::provider::idle::{IdleConfig, IdleWatcher};

async fn wait_for(counter: &Arc<AtomicUsize>, expected: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn password_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("imap-pass");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"secret\n").unwrap();
    path
}

#[tokio::test]
async fn exists_fires_callback_once_and_expunge_does_not() {
    crate::common::init_logging();
    let dir = tempfile::TempDir::new().unwrap();
    let addr = spawn_idle_imap_stub(vec![
        Some("* 2 EXISTS".to_string()),
        Some("* 1 EXPUNGE".to_string()),
        None,
    ])
    .await;

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let watcher = IdleWatcher::new(
        IdleConfig {
            account_id: "a1".to_string(),
            email: "me@example.com".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            credential_file: password_file(&dir),
            use_tls: false,
            folder: "INBOX".to_string(),
        },
        Arc::new(move |account_id: &str| {
            assert_eq!(account_id, "a1");
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );

    watcher.start();
    assert!(watcher.is_running());

    // The EXISTS push raises the callback exactly once.
    assert!(wait_for(&counter, 1, Duration::from_secs(5)).await);

    // Let the EXPUNGE cycle run; it must not fire the callback.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    watcher.stop().await;
    assert!(!watcher.is_running());

    // Stopping twice is harmless.
    watcher.stop().await;
}

#[tokio::test]
async fn start_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let addr = spawn_idle_imap_stub(vec![None]).await;

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let watcher = IdleWatcher::new(
        IdleConfig {
            account_id: "a1".to_string(),
            email: "me@example.com".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            credential_file: password_file(&dir),
            use_tls: false,
            folder: "INBOX".to_string(),
        },
        Arc::new(move |_: &str| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );

    watcher.start();
    watcher.start();
    assert!(watcher.is_running());

    tokio::time::sleep(Duration::from_millis(200)).await;
    watcher.stop().await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial_test::serial]
async fn global_registries_have_explicit_lifecycle() {
    use mailtriage::provider::{idle, pool};

    // Nothing is created implicitly; init and shutdown are explicit.
    assert!(pool::connection_pool().is_none());
    pool::init_connection_pool(300);
    assert!(pool::connection_pool().is_some());
    pool::shutdown_connection_pool().await;
    assert!(pool::connection_pool().is_none());

    assert!(idle::idle_registry().is_none());
    idle::init_idle_registry(None);
    assert!(idle::idle_registry().is_some());
    idle::shutdown_idle_registry().await;
    assert!(idle::idle_registry().is_none());
}

#[tokio::test]
async fn registry_add_and_remove() {
    use mailtriage::provider::idle::IdleRegistry;

    let dir = tempfile::TempDir::new().unwrap();
    let addr = spawn_idle_imap_stub(vec![None]).await;

    let registry = IdleRegistry::new(None);
    registry.add_account(
        IdleConfig {
            account_id: "a1".to_string(),
            email: "me@example.com".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            credential_file: password_file(&dir),
            use_tls: false,
            folder: "INBOX".to_string(),
        },
        None,
    );

    assert!(registry.is_watching("a1"));
    assert_eq!(registry.watched_accounts(), vec!["a1".to_string()]);

    // Duplicate adds are refused.
    registry.add_account(
        IdleConfig {
            account_id: "a1".to_string(),
            email: "me@example.com".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            credential_file: password_file(&dir),
            use_tls: false,
            folder: "INBOX".to_string(),
        },
        None,
    );
    assert_eq!(registry.watched_accounts().len(), 1);

    registry.remove_account("a1").await;
    assert!(!registry.is_watching("a1"));

    registry.stop_all().await;
}
