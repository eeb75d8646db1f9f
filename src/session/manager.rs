//! Page session manager.
//!
//! Resolves page ids to live browser pages across otherwise stateless tool
//! calls. Ids survive process restarts through the [`StateStore`]; handles do
//! not, so a remembered id without a handle is restored by opening a new page
//! and re-navigating it to the last reported URL.
//!
//! Everything below the automation context is fail-open: navigation failures
//! fall back to a blank page and persistence failures are logged while the
//! in-memory state carries on. The only error a caller sees is the backend
//! being unable to open pages at all.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::lock::StateLock;
use super::page_id::PageId;
use super::registry::{next_page_id, PageRegistry, PageSlots};
use super::store::{now_secs, PageMetadata, PersistedState, StateStore};
use crate::browser::{ActivityLog, BrowserBackend, NavigateOptions, PageHandle, BLANK_URL};
use crate::config::SessionConfig;
use crate::error::Result;

/// How a lease's page came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOrigin {
    /// The id already had a live handle.
    Existing,
    /// A new id was allocated.
    Created,
    /// An unknown caller-supplied id was registered as new.
    Adopted,
    /// Metadata existed; the page was re-navigated to its last URL.
    Restored,
    /// Metadata existed but re-navigation failed; the page is blank.
    RestoreFailed,
}

/// Exclusive use of one page for the duration of a tool call.
///
/// Holding a lease blocks other leases (and `close_page`) for the same id.
pub struct PageLease {
    id: PageId,
    page: Arc<dyn PageHandle>,
    origin: PageOrigin,
    _slot: OwnedMutexGuard<()>,
}

impl PageLease {
    /// Canonical page id.
    pub fn id(&self) -> &PageId {
        &self.id
    }

    /// The live page.
    pub fn page(&self) -> &Arc<dyn PageHandle> {
        &self.page
    }

    /// How the page was obtained.
    pub fn origin(&self) -> PageOrigin {
        self.origin
    }
}

impl std::fmt::Debug for PageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("id", &self.id)
            .field("handle", &self.page.handle_id())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Snapshot of one known page.
#[derive(Debug, Clone, Serialize)]
pub struct PageInfo {
    /// Page id.
    pub id: PageId,
    /// Whether a handle is open in this process.
    pub live: bool,
    /// Persisted metadata.
    #[serde(flatten)]
    pub metadata: PageMetadata,
}

struct ManagerState {
    registry: PageRegistry,
    persisted: PersistedState,
}

/// Tracks pages across tool invocations.
pub struct SessionManager {
    backend: Arc<dyn BrowserBackend>,
    store: StateStore,
    state: Mutex<ManagerState>,
    slots: PageSlots,
    activity: StdMutex<HashMap<PageId, Arc<ActivityLog>>>,
    capture_network: bool,
    activity_capacity: usize,
    navigation_timeout: Duration,
}

impl SessionManager {
    /// Load persisted page state from `config.storage_dir` and wrap `backend`.
    pub async fn open(config: &SessionConfig, backend: Arc<dyn BrowserBackend>) -> Self {
        let lock = StateLock::new(
            config.lock_path(),
            config.lock_timeout,
            config.lock_poll_interval,
        );
        let store = StateStore::new(config.state_path(), lock);
        let persisted = store.load().await;

        info!(
            backend = backend.name(),
            known_pages = persisted.page_metadata.len(),
            "session manager ready"
        );

        Self {
            backend,
            store,
            state: Mutex::new(ManagerState {
                registry: PageRegistry::new(),
                persisted,
            }),
            slots: PageSlots::new(),
            activity: StdMutex::new(HashMap::new()),
            capture_network: config.capture_network,
            activity_capacity: config.activity_capacity,
            navigation_timeout: config.navigation_timeout,
        }
    }

    /// Resolve `id` to a live page, creating or restoring one as needed.
    ///
    /// `None` allocates a fresh numeric id. The lease must be dropped before
    /// asking for the same id again.
    pub async fn get_or_create_page(&self, id: Option<PageId>) -> Result<PageLease> {
        let Some(id) = id else {
            return self.create_page().await;
        };

        let slot = self.slots.acquire(&id).await;

        let existing = self.state.lock().await.registry.get(&id);
        if let Some(page) = existing {
            if page.current_url().await.is_ok() {
                let mut state = self.state.lock().await;
                if let Some(meta) = state.persisted.page_metadata.get_mut(&id) {
                    meta.last_accessed = Some(now_secs());
                }
                self.persist(&state).await;
                debug!(page_id = %id, handle = page.handle_id(), "using live page");
                return Ok(PageLease {
                    id,
                    page,
                    origin: PageOrigin::Existing,
                    _slot: slot,
                });
            }
            warn!(page_id = %id, handle = page.handle_id(), "live page stopped responding, recreating");
            let dead = self.state.lock().await.registry.remove(&id);
            if let Some(dead) = dead {
                dispose(&id, dead).await;
            }
        }

        // Seed metadata for an unknown id before awaiting the backend so a
        // concurrent fresh allocation cannot pick the same id.
        let last_url = {
            let mut state = self.state.lock().await;
            match state.persisted.page_metadata.get(&id) {
                Some(meta) => Some(meta.last_url.clone()),
                None => {
                    state
                        .persisted
                        .page_metadata
                        .insert(id.clone(), PageMetadata::new(BLANK_URL));
                    None
                }
            }
        };

        let page = match self.backend.open_page().await {
            Ok(page) => page,
            Err(e) => {
                if last_url.is_none() {
                    self.state.lock().await.persisted.page_metadata.remove(&id);
                }
                return Err(e);
            }
        };
        self.watch(&id, page.as_ref()).await;

        let origin = match last_url {
            Some(last_url) => {
                info!(page_id = %id, "recreating page from metadata");
                self.restore(&id, page.as_ref(), last_url.as_deref()).await
            }
            None => {
                warn!(
                    page_id = %id,
                    event = "unknown_page_id_adopted",
                    "no page known under this id, creating it"
                );
                PageOrigin::Adopted
            }
        };

        let displaced = {
            let mut state = self.state.lock().await;
            let meta = state
                .persisted
                .page_metadata
                .entry(id.clone())
                .or_insert_with(|| PageMetadata::new(BLANK_URL));
            meta.last_accessed = Some(now_secs());
            let displaced = state.registry.insert(id.clone(), page.clone());
            self.persist(&state).await;
            displaced
        };
        if let Some(displaced) = displaced {
            dispose(&id, displaced).await;
        }

        Ok(PageLease {
            id,
            page,
            origin,
            _slot: slot,
        })
    }

    async fn create_page(&self) -> Result<PageLease> {
        let page = self.backend.open_page().await?;

        let id = {
            let mut state = self.state.lock().await;
            let ManagerState {
                registry,
                persisted,
            } = &mut *state;
            let id = next_page_id(registry.ids().chain(persisted.page_metadata.keys()));
            persisted
                .page_metadata
                .insert(id.clone(), PageMetadata::new(BLANK_URL));
            registry.insert(id.clone(), page.clone());
            self.persist(&state).await;
            id
        };

        info!(page_id = %id, handle = page.handle_id(), "created new page");
        let slot = self.slots.acquire(&id).await;
        self.watch(&id, page.as_ref()).await;
        Ok(PageLease {
            id,
            page,
            origin: PageOrigin::Created,
            _slot: slot,
        })
    }

    async fn restore(&self, id: &PageId, page: &dyn PageHandle, last_url: Option<&str>) -> PageOrigin {
        let Some(url) = last_url.filter(|url| !url.is_empty() && *url != BLANK_URL) else {
            debug!(page_id = %id, "no URL to restore, leaving page blank");
            return PageOrigin::Restored;
        };

        let options = NavigateOptions::with_timeout(self.navigation_timeout);
        let failure = match tokio::time::timeout(self.navigation_timeout, page.navigate(url, options)).await {
            Ok(Ok(())) => {
                info!(page_id = %id, url, "restored page");
                return PageOrigin::Restored;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no response within {}ms", self.navigation_timeout.as_millis()),
        };

        warn!(page_id = %id, url, error = %failure, "restore failed, falling back to blank page");
        match tokio::time::timeout(self.navigation_timeout, page.navigate(BLANK_URL, options)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(page_id = %id, error = %e, "blank fallback navigation failed"),
            Err(_) => warn!(page_id = %id, "blank fallback navigation timed out"),
        }
        PageOrigin::RestoreFailed
    }

    /// Route the page's console, errors and requests into the log for `id`.
    async fn watch(&self, id: &PageId, page: &dyn PageHandle) {
        if let Err(e) = page.watch(self.activity_log(id)).await {
            warn!(page_id = %id, error = %e, "page activity not captured");
        }
    }

    fn logs(&self) -> std::sync::MutexGuard<'_, HashMap<PageId, Arc<ActivityLog>>> {
        match self.activity.lock() {
            Ok(logs) => logs,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn activity_log(&self, id: &PageId) -> Arc<ActivityLog> {
        self.logs()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ActivityLog::new(self.activity_capacity, self.capture_network)))
            .clone()
    }

    /// Whether page activity logs keep network requests.
    pub fn captures_network(&self) -> bool {
        self.capture_network
    }

    /// Activity captured for `id` in this process, if any page was opened
    /// under it.
    pub fn activity(&self, id: &PageId) -> Option<Arc<ActivityLog>> {
        self.logs().get(id).cloned()
    }

    /// Every activity log, ordered as [`list_known_ids`](Self::list_known_ids).
    pub fn activity_logs(&self) -> Vec<(PageId, Arc<ActivityLog>)> {
        let mut logs: Vec<_> = self
            .logs()
            .iter()
            .map(|(id, log)| (id.clone(), log.clone()))
            .collect();
        logs.sort_by(|a, b| compare_ids(&a.0, &b.0));
        logs
    }

    /// Record the URL a handler left `id` on. Unknown ids are ignored.
    pub async fn update_metadata(&self, id: &PageId, url: &str) {
        let mut state = self.state.lock().await;
        let Some(meta) = state.persisted.page_metadata.get_mut(id) else {
            debug!(page_id = %id, "metadata update for unknown page ignored");
            return;
        };
        meta.last_url = Some(url.to_string());
        meta.last_updated = Some(now_secs());
        self.persist(&state).await;
    }

    /// Close the live page for `id`. Metadata is kept unless `purge` is set,
    /// so a closed page can be reopened later. Returns whether `id` was known.
    ///
    /// Waits for any outstanding lease on `id`; do not call it while holding
    /// one for the same id.
    pub async fn close_page(&self, id: &PageId, purge: bool) -> bool {
        let _slot = self.slots.acquire(id).await;

        let (handle, known) = {
            let mut state = self.state.lock().await;
            let handle = state.registry.remove(id);
            let known = if purge {
                state.persisted.page_metadata.remove(id).is_some()
            } else {
                state.persisted.page_metadata.contains_key(id)
            };
            self.persist(&state).await;
            let live = handle.is_some();
            (handle, known || live)
        };
        if purge {
            self.logs().remove(id);
        }

        if let Some(page) = handle {
            dispose(id, page).await;
            info!(page_id = %id, purge, "closed page");
        }
        known
    }

    /// Close every live page, recording the URL each one shows so it
    /// restores there. Pages sitting on the blank placeholder keep the URL
    /// last reported for them.
    ///
    /// Waits for outstanding leases page by page; do not call it while
    /// holding one.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<PageId> = self.state.lock().await.registry.ids().cloned().collect();

        let mut closed = 0;
        for id in ids {
            let _slot = self.slots.acquire(&id).await;
            let removed = self.state.lock().await.registry.remove(&id);
            let Some(page) = removed else {
                continue;
            };
            match page.current_url().await {
                Ok(url) if url != BLANK_URL => {
                    let mut state = self.state.lock().await;
                    if let Some(meta) = state.persisted.page_metadata.get_mut(&id) {
                        meta.last_url = Some(url);
                        meta.last_updated = Some(now_secs());
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(page_id = %id, error = %e, "page URL unreadable at close"),
            }
            dispose(&id, page).await;
            closed += 1;
        }

        self.persist(&*self.state.lock().await).await;
        info!(closed, "closed all pages");
        closed
    }

    /// Close every page and release the automation context.
    pub async fn shutdown(&self) -> Result<()> {
        self.close_all().await;
        self.backend.shutdown().await
    }

    /// Every id that is live or remembered. Numeric ids come first in numeric
    /// order, then the rest alphabetically.
    pub async fn list_known_ids(&self) -> Vec<PageId> {
        let state = self.state.lock().await;
        let mut ids: Vec<PageId> = state
            .persisted
            .page_metadata
            .keys()
            .chain(state.registry.ids())
            .cloned()
            .collect();
        ids.sort_by(compare_ids);
        ids.dedup();
        ids
    }

    /// Metadata and liveness for every known id, ordered as
    /// [`list_known_ids`](Self::list_known_ids).
    pub async fn pages(&self) -> Vec<PageInfo> {
        let state = self.state.lock().await;
        let mut pages: Vec<PageInfo> = state
            .persisted
            .page_metadata
            .iter()
            .map(|(id, meta)| PageInfo {
                id: id.clone(),
                live: state.registry.contains(id),
                metadata: meta.clone(),
            })
            .collect();
        pages.sort_by(|a, b| compare_ids(&a.id, &b.id));
        pages
    }

    /// Metadata and liveness for `id`.
    pub async fn page_info(&self, id: &PageId) -> Option<PageInfo> {
        let state = self.state.lock().await;
        state.persisted.page_metadata.get(id).map(|meta| PageInfo {
            id: id.clone(),
            live: state.registry.contains(id),
            metadata: meta.clone(),
        })
    }

    /// Number of live pages.
    pub async fn live_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    async fn persist(&self, state: &ManagerState) {
        if let Err(e) = self.store.save(&state.persisted).await {
            warn!(
                path = %self.store.path().display(),
                error = %e,
                "page state not persisted, continuing in memory"
            );
        }
    }
}

async fn dispose(id: &PageId, page: Arc<dyn PageHandle>) {
    if let Err(e) = page.close().await {
        warn!(page_id = %id, handle = page.handle_id(), error = %e, "error closing page");
    }
}

fn compare_ids(a: &PageId, b: &PageId) -> Ordering {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
