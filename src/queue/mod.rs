//! Durable work queue of pages awaiting CSS optimization
//!
//! The store is the single source of truth for item state. All mutation goes
//! through [`QueueStore::update`], which applies a [`Transition`] atomically:
//! the transition's preconditions are checked against the stored row at the
//! moment of the write, so two workers racing to claim the same item cannot
//! both win.

mod memory;
mod sled_store;

pub use memory::MemoryQueueStore;
pub use sled_store::SledQueueStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ItemId, ItemStatus, QueueItem, Transition, TransitionError};

/// Errors from the queue store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("corrupt queue record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("queue item {0} not found")]
    NotFound(ItemId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Result of recording a page view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new pending item was created
    Created(ItemId),
    /// The URL already had an item; its access time was bumped
    Existing(ItemId),
}

impl Enqueued {
    pub fn id(&self) -> ItemId {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }
}

/// Item counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    /// Error items that exhausted their retries
    pub dead_lettered: usize,
}

/// Persistent table of queue items
pub trait QueueStore: Send + Sync {
    /// Record a page view: create a pending item for a new URL, or bump
    /// `last_accessed` on the existing one.
    fn enqueue(&self, url: &str, now: DateTime<Utc>) -> Result<Enqueued, StoreError>;

    /// Fetch one item
    fn get(&self, id: ItemId) -> Result<Option<QueueItem>, StoreError>;

    /// Eligible items (`pending`, `retries < max_retries`) in ascending id order
    fn select_pending(&self, limit: usize, max_retries: u32) -> Result<Vec<QueueItem>, StoreError>;

    /// All items in the given status, ascending id order
    fn scan(&self, status: ItemStatus) -> Result<Vec<QueueItem>, StoreError>;

    /// Atomically apply a transition and return the updated item
    fn update(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError>;

    /// Atomic `pending -> processing`. Returns false if the item is no longer
    /// pending (another caller claimed it first).
    fn claim(&self, id: ItemId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self.update(id, &Transition::Claim, now) {
            Ok(_) => Ok(true),
            Err(StoreError::Transition(TransitionError::Invalid { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Number of items in the given status
    fn count(&self, status: ItemStatus) -> Result<usize, StoreError> {
        Ok(self.scan(status)?.len())
    }

    /// Count items per status. Only `error` rows are read in full, to tell
    /// dead-lettered items apart.
    fn stats(&self, max_retries: u32) -> Result<QueueStats, StoreError> {
        let errored = self.scan(ItemStatus::Error)?;
        Ok(QueueStats {
            pending: self.count(ItemStatus::Pending)?,
            processing: self.count(ItemStatus::Processing)?,
            completed: self.count(ItemStatus::Completed)?,
            error: errored.len(),
            dead_lettered: errored.iter().filter(|i| i.is_dead_lettered(max_retries)).count(),
        })
    }
}
