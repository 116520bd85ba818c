//! In-process queue store

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Enqueued, QueueStore, StoreError};
use crate::types::{ItemId, ItemStatus, QueueItem, Transition};

#[derive(Default)]
struct State {
    items: BTreeMap<ItemId, QueueItem>,
    by_url: HashMap<String, ItemId>,
    last_id: ItemId,
}

/// Queue store held in memory behind a single lock.
///
/// Useful for tests and one-shot runs; nothing survives the process.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<State>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn enqueue(&self, url: &str, now: DateTime<Utc>) -> Result<Enqueued, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(&id) = state.by_url.get(url) {
            if let Some(item) = state.items.get_mut(&id) {
                item.apply(&Transition::Touch, now)?;
            }
            return Ok(Enqueued::Existing(id));
        }

        state.last_id += 1;
        let id = state.last_id;
        state.items.insert(id, QueueItem::new(id, url, now));
        state.by_url.insert(url.to_string(), id);
        Ok(Enqueued::Created(id))
    }

    fn get(&self, id: ItemId) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.state.lock().items.get(&id).cloned())
    }

    fn select_pending(&self, limit: usize, max_retries: u32) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.is_eligible(max_retries))
            .take(limit)
            .cloned()
            .collect())
    }

    fn scan(&self, status: ItemStatus) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect())
    }

    fn count(&self, status: ItemStatus) -> Result<usize, StoreError> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.status == status)
            .count())
    }

    fn update(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let mut state = self.state.lock();
        let item = state.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        item.apply(transition, now)?;
        Ok(item.clone())
    }
}
