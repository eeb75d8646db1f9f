//! Live page handles and per-id serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::page_id::PageId;
use crate::browser::PageHandle;

/// Page id to live handle map. Owns every handle it holds.
#[derive(Default)]
pub struct PageRegistry {
    live: HashMap<PageId, Arc<dyn PageHandle>>,
}

impl PageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live handle for `id`.
    pub fn get(&self, id: &PageId) -> Option<Arc<dyn PageHandle>> {
        self.live.get(id).cloned()
    }

    /// Register `handle` under `id`, returning any handle it displaced.
    pub fn insert(&mut self, id: PageId, handle: Arc<dyn PageHandle>) -> Option<Arc<dyn PageHandle>> {
        self.live.insert(id, handle)
    }

    /// Drop the entry for `id`.
    pub fn remove(&mut self, id: &PageId) -> Option<Arc<dyn PageHandle>> {
        self.live.remove(id)
    }

    /// Take every entry, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<(PageId, Arc<dyn PageHandle>)> {
        self.live.drain().collect()
    }

    /// Whether `id` has a live handle.
    pub fn contains(&self, id: &PageId) -> bool {
        self.live.contains_key(id)
    }

    /// Ids with live handles.
    pub fn ids(&self) -> impl Iterator<Item = &PageId> {
        self.live.keys()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no handle is live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Next free numeric id: one past the largest numeric id seen, or `1`.
///
/// Counting entries instead would hand out an id that a closed-but-remembered
/// page still owns.
pub fn next_page_id<'a>(known: impl IntoIterator<Item = &'a PageId>) -> PageId {
    let max = known.into_iter().filter_map(PageId::as_number).max().unwrap_or(0);
    PageId::from_number(max.saturating_add(1))
}

/// One async mutex per page id so that two operations on the same page run
/// one after the other while distinct pages proceed independently.
#[derive(Default)]
pub struct PageSlots {
    slots: StdMutex<HashMap<PageId, Arc<Mutex<()>>>>,
}

impl PageSlots {
    /// Empty slot table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `id`.
    pub async fn acquire(&self, id: &PageId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Slots nobody holds or waits on only have the table's reference.
            slots.retain(|key, slot| key == id || Arc::strong_count(slot) > 1);
            slots.entry(id.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::browser::{BrowserBackend, MemoryBackend};

    fn ids(raw: &[&str]) -> Vec<PageId> {
        raw.iter().filter_map(|s| PageId::parse(s)).collect()
    }

    #[test]
    fn next_id_skips_past_the_maximum() {
        assert_eq!(next_page_id(&ids(&[])).as_str(), "1");
        assert_eq!(next_page_id(&ids(&["1", "2", "7"])).as_str(), "8");
        assert_eq!(next_page_id(&ids(&["docs", "3"])).as_str(), "4");
        assert_eq!(next_page_id(&ids(&["docs"])).as_str(), "1");
    }

    #[tokio::test]
    async fn registry_tracks_handles() {
        let backend = MemoryBackend::new();
        let mut registry = PageRegistry::new();
        let id = PageId::from_number(1);
        let handle = backend.open_page().await.unwrap();

        assert!(registry.insert(id.clone(), handle.clone()).is_none());
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().handle_id(), handle.handle_id());
        assert_eq!(registry.len(), 1);

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn same_id_waits_distinct_ids_do_not() {
        let slots = Arc::new(PageSlots::new());
        let one = PageId::from_number(1);
        let two = PageId::from_number(2);

        let held = slots.acquire(&one).await;

        // a different id is available immediately
        let other = tokio::time::timeout(Duration::from_millis(50), slots.acquire(&two)).await;
        assert!(other.is_ok());

        // the same id blocks until released
        let waiting = {
            let slots = slots.clone();
            let one = one.clone();
            tokio::spawn(async move {
                let _guard = slots.acquire(&one).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }
}
