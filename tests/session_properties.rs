//! Behavioural properties of the page session manager.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::assert_ok;

use pagekeeper_mcp::browser::{BrowserBackend, MemoryBackend, PageHandle, BLANK_URL};
use pagekeeper_mcp::config::SessionConfig;
use pagekeeper_mcp::session::{PageId, PageIdInput, PageMetadata, PageOrigin, SessionManager};

fn config(dir: &Path) -> SessionConfig {
    let mut config = SessionConfig::new(dir);
    config.navigation_timeout = Duration::from_secs(2);
    config.lock_timeout = Duration::from_millis(200);
    config.lock_poll_interval = Duration::from_millis(10);
    config
}

async fn open(dir: &Path) -> SessionManager {
    SessionManager::open(&config(dir), Arc::new(MemoryBackend::new())).await
}

fn id(raw: &str) -> PageId {
    PageId::parse(raw).unwrap()
}

fn write_state(dir: &Path, state: Value) {
    std::fs::write(config(dir).state_path(), serde_json::to_vec(&state).unwrap()).unwrap();
}

fn read_state(dir: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(config(dir).state_path()).unwrap()).unwrap()
}

/// Memory backend whose first page takes a while to open.
struct SlowFirstPage {
    inner: MemoryBackend,
    delayed: AtomicBool,
}

#[async_trait::async_trait]
impl BrowserBackend for SlowFirstPage {
    fn name(&self) -> &'static str {
        "slow-first-page"
    }

    async fn open_page(&self) -> pagekeeper_mcp::Result<Arc<dyn PageHandle>> {
        if !self.delayed.swap(true, Ordering::SeqCst) {
            let page = self.inner.open_page().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            return page;
        }
        self.inner.open_page().await
    }

    async fn shutdown(&self) -> pagekeeper_mcp::Result<()> {
        self.inner.shutdown().await
    }
}

fn snapshot(pages: Vec<pagekeeper_mcp::session::PageInfo>) -> Vec<(PageId, PageMetadata)> {
    pages.into_iter().map(|p| (p.id, p.metadata)).collect()
}

#[tokio::test]
async fn numeric_and_string_ids_resolve_to_the_same_page() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;

    let as_number = PageIdInput::from(json!(3)).resolve();
    let as_string = PageIdInput::from(json!("3")).resolve();
    assert_eq!(as_number, as_string);

    let first = assert_ok!(manager.get_or_create_page(as_number).await);
    let handle = first.page().handle_id().to_string();
    drop(first);

    let second = assert_ok!(manager.get_or_create_page(as_string).await);
    assert_eq!(second.origin(), PageOrigin::Existing);
    assert_eq!(second.page().handle_id(), handle);
    drop(second);

    assert_eq!(manager.list_known_ids().await, vec![id("3")]);
}

#[tokio::test]
async fn fresh_ids_increase_past_every_known_id() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;

    let mut seen = Vec::new();
    for _ in 0..5 {
        let lease = assert_ok!(manager.get_or_create_page(None).await);
        assert_eq!(lease.origin(), PageOrigin::Created);
        seen.push(lease.id().as_number().unwrap());
    }
    assert_eq!(seen, [1, 2, 3, 4, 5]);

    drop(manager.get_or_create_page(Some(id("10"))).await.unwrap());
    let next = manager.get_or_create_page(None).await.unwrap();
    assert_eq!(next.id().as_str(), "11");
}

#[tokio::test]
async fn unreachable_last_url_falls_back_to_blank_page() {
    let dir = tempfile::tempdir().unwrap();
    write_state(
        dir.path(),
        json!({"pageMetadata": {"5": {"last_url": "https://bad.invalid", "created_at": 1.0}}}),
    );
    let manager = open(dir.path()).await;

    let lease = assert_ok!(manager.get_or_create_page(Some(id("5"))).await);
    assert_eq!(lease.origin(), PageOrigin::RestoreFailed);
    assert_eq!(lease.page().current_url().await.unwrap(), BLANK_URL);
    drop(lease);

    // The remembered URL is kept for a later attempt.
    let info = manager.page_info(&id("5")).await.unwrap();
    assert_eq!(info.metadata.last_url.as_deref(), Some("https://bad.invalid"));
    assert!(info.live);
}

#[tokio::test]
async fn metadata_round_trips_through_restart() {
    let dir = tempfile::tempdir().unwrap();

    let before = {
        let manager = open(dir.path()).await;
        for url in ["https://a.test", "https://b.test/x?y=1"] {
            let lease = manager.get_or_create_page(None).await.unwrap();
            manager.update_metadata(lease.id(), url).await;
        }
        drop(manager.get_or_create_page(Some(id("notes"))).await.unwrap());
        snapshot(manager.pages().await)
    };

    let manager = open(dir.path()).await;
    let after = snapshot(manager.pages().await);
    assert_eq!(after, before);
    assert_eq!(after[0].1.last_url.as_deref(), Some("https://a.test"));
    assert_eq!(after[1].1.last_url.as_deref(), Some("https://b.test/x?y=1"));
    assert_eq!(manager.live_count().await, 0);
}

#[tokio::test]
async fn closed_page_is_remembered_and_reopened_on_a_new_handle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;

    drop(manager.get_or_create_page(None).await.unwrap());
    let lease = manager.get_or_create_page(None).await.unwrap();
    assert_eq!(lease.id().as_str(), "2");
    let old_handle = lease.page().clone();
    drop(lease);

    assert!(manager.close_page(&id("2"), false).await);
    assert!(manager.list_known_ids().await.contains(&id("2")));

    let reopened = manager.get_or_create_page(Some(id("2"))).await.unwrap();
    assert!(!Arc::ptr_eq(reopened.page(), &old_handle));
    assert_ne!(reopened.page().handle_id(), old_handle.handle_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_requests_never_cross_assign_handles() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(open(dir.path()).await);

    let mut first_handles = HashMap::new();
    for round in 0..3 {
        let mut tasks = Vec::new();
        for n in 1..=8u64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let requested = PageId::from_number(n);
                let lease = manager.get_or_create_page(Some(requested.clone())).await.unwrap();
                tokio::task::yield_now().await;
                assert_eq!(lease.id(), &requested);
                (requested, lease.page().handle_id().to_string())
            }));
        }
        for task in tasks {
            let (page_id, handle) = task.await.unwrap();
            if round == 0 {
                first_handles.insert(page_id, handle);
            } else {
                assert_eq!(first_handles[&page_id], handle, "page {page_id} changed handle");
            }
        }
    }

    let mut distinct: Vec<_> = first_handles.values().collect();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 8);
}

#[tokio::test]
async fn fresh_allocation_never_takes_an_id_being_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SlowFirstPage {
        inner: MemoryBackend::new(),
        delayed: AtomicBool::new(false),
    });
    let manager = Arc::new(SessionManager::open(&config(dir.path()), backend.clone()).await);

    let adopting = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let lease = manager.get_or_create_page(Some(id("1"))).await.unwrap();
            (lease.id().clone(), lease.page().handle_id().to_string(), lease.origin())
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fresh = manager.get_or_create_page(None).await.unwrap();
    let fresh = (fresh.id().clone(), fresh.page().handle_id().to_string(), fresh.origin());
    let adopted = adopting.await.unwrap();

    assert_eq!(adopted, (id("1"), "h1".to_string(), PageOrigin::Adopted));
    assert_eq!(fresh, (id("2"), "h2".to_string(), PageOrigin::Created));

    // Each id still resolves to the handle it was created with.
    for (page_id, handle) in [adopted.0, fresh.0].into_iter().zip(["h1", "h2"]) {
        let lease = manager.get_or_create_page(Some(page_id)).await.unwrap();
        assert_eq!(lease.origin(), PageOrigin::Existing);
        assert_eq!(lease.page().handle_id(), handle);
    }
    assert_eq!(backend.inner.open_pages(), 2);
}

#[tokio::test]
async fn close_all_then_reopen_restores_last_url() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;

    let lease = manager.get_or_create_page(None).await.unwrap();
    assert_eq!(lease.id().as_str(), "1");
    assert_eq!(lease.page().handle_id(), "h1");
    drop(lease);

    manager.update_metadata(&id("1"), "https://example.com").await;
    assert_eq!(manager.close_all().await, 1);

    let lease = manager.get_or_create_page(Some(id("1"))).await.unwrap();
    assert_eq!(lease.page().handle_id(), "h2");
    assert_eq!(lease.origin(), PageOrigin::Restored);
    assert_eq!(lease.page().current_url().await.unwrap(), "https://example.com");
}

#[tokio::test]
async fn held_lock_is_taken_over_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let other = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(config.lock_path())
        .unwrap();
    let mut other = fd_lock::RwLock::new(other);
    let _held = other.write().unwrap();

    let manager = SessionManager::open(&config, Arc::new(MemoryBackend::new())).await;
    let lease = assert_ok!(manager.get_or_create_page(None).await);
    manager.update_metadata(lease.id(), "https://example.com").await;

    let state = read_state(dir.path());
    assert_eq!(state["pageMetadata"]["1"]["last_url"], "https://example.com");
}

#[tokio::test]
async fn corrupt_state_file_starts_fresh_and_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(config(dir.path()).state_path(), b"{\"pageMetadata\": [oops").unwrap();

    let manager = open(dir.path()).await;
    assert!(manager.list_known_ids().await.is_empty());

    drop(manager.get_or_create_page(None).await.unwrap());
    let state = read_state(dir.path());
    assert_eq!(state["pageMetadata"]["1"]["last_url"], BLANK_URL);
}

#[tokio::test]
async fn purge_removes_the_id_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    drop(manager.get_or_create_page(None).await.unwrap());
    drop(manager.get_or_create_page(None).await.unwrap());

    assert!(manager.close_page(&id("1"), true).await);
    let state = read_state(dir.path());
    assert!(state["pageMetadata"].get("1").is_none());
    assert!(state["pageMetadata"].get("2").is_some());

    let manager = open(dir.path()).await;
    assert_eq!(manager.list_known_ids().await, vec![id("2")]);
}

#[tokio::test]
async fn same_id_requests_wait_for_the_outstanding_lease() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(open(dir.path()).await);

    let lease = manager.get_or_create_page(Some(id("1"))).await.unwrap();

    let waiting = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let lease = manager.get_or_create_page(Some(id("1"))).await.unwrap();
            lease.origin()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    // Other ids are not held up.
    let other = tokio::time::timeout(
        Duration::from_secs(1),
        manager.get_or_create_page(Some(id("2"))),
    )
    .await;
    assert!(other.is_ok());

    drop(lease);
    let origin = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(origin, PageOrigin::Existing);
}

#[tokio::test]
async fn legacy_snake_case_key_is_loaded_and_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    write_state(
        dir.path(),
        json!({"page_metadata": {"4": {"last_url": "https://legacy.test", "created_at": 1.5}}}),
    );

    let manager = open(dir.path()).await;
    assert_eq!(manager.list_known_ids().await, vec![id("4")]);

    let lease = manager.get_or_create_page(Some(id("4"))).await.unwrap();
    assert_eq!(lease.page().current_url().await.unwrap(), "https://legacy.test");
    drop(lease);

    let state = read_state(dir.path());
    assert!(state.get("page_metadata").is_none());
    assert_eq!(state["pageMetadata"]["4"]["created_at"], 1.5);

    let next = manager.get_or_create_page(None).await.unwrap();
    assert_eq!(next.id().as_str(), "5");
}
