//! Durable queue store on the sled embedded database
//!
//! Three trees share one database:
//! - `items`: the JSON row, keyed by big-endian id, so key order is FIFO order
//! - `urls`: URL to item id
//! - `statuses`: one empty-valued key `[status tag][id]` per item, so a status
//!   can be listed without decoding every row
//!
//! Every write touching more than one tree runs in a sled transaction. A
//! transition's preconditions are checked against the row read inside the
//! transaction, which makes [`QueueStore::update`] atomic across threads.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use tracing::{info, warn};

use super::{Enqueued, QueueStore, StoreError};
use crate::types::{ItemId, ItemStatus, QueueItem, Transition};

type TxResult<T> = ConflictableTransactionResult<T, StoreError>;

/// Value stored under every status index key
const PRESENT: &[u8] = &[];

/// sled-backed queue store
pub struct SledQueueStore {
    db: sled::Db,
    items: sled::Tree,
    urls: sled::Tree,
    statuses: sled::Tree,
}

fn item_key(id: ItemId) -> [u8; 8] {
    id.to_be_bytes()
}

fn status_tag(status: ItemStatus) -> u8 {
    match status {
        ItemStatus::Pending => 0,
        ItemStatus::Processing => 1,
        ItemStatus::Completed => 2,
        ItemStatus::Error => 3,
    }
}

fn status_key(status: ItemStatus, id: ItemId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = status_tag(status);
    key[1..].copy_from_slice(&item_key(id));
    key
}

fn decode_id(bytes: &[u8]) -> Option<ItemId> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn decode(bytes: &[u8]) -> Result<QueueItem, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode(item: &QueueItem) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(item)?)
}

fn abort(e: impl Into<StoreError>) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e.into())
}

fn committed<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Database(e),
    })
}

impl SledQueueStore {
    /// Open or create the queue database under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = data_dir.as_ref().join("queue.sled");
        let db = sled::open(&db_path)
            .with_context(|| format!("Failed to open queue database at {:?}", db_path))?;
        let items = db.open_tree("items").context("Failed to open items tree")?;
        let urls = db.open_tree("urls").context("Failed to open url index tree")?;
        let statuses = db.open_tree("statuses").context("Failed to open status index tree")?;
        let store = Self {
            db,
            items,
            urls,
            statuses,
        };

        if store.statuses.is_empty() && !store.items.is_empty() {
            let indexed = store
                .rebuild_status_index()
                .context("Failed to rebuild status index")?;
            info!("Rebuilt status index for {} queue items", indexed);
        }
        Ok(store)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn next_id(&self) -> Result<ItemId, StoreError> {
        // generate_id starts at 0; ids start at 1
        Ok(self.db.generate_id()? + 1)
    }

    fn rebuild_status_index(&self) -> Result<usize, StoreError> {
        self.statuses.clear()?;
        let mut indexed = 0;
        for entry in self.items.iter() {
            let (_, value) = entry?;
            let item = decode(&value)?;
            self.statuses.insert(status_key(item.status, item.id), PRESENT)?;
            indexed += 1;
        }
        Ok(indexed)
    }

    /// Ids indexed under `status`, ascending
    fn ids_with_status(&self, status: ItemStatus) -> impl Iterator<Item = Result<ItemId, StoreError>> + '_ {
        self.statuses
            .scan_prefix([status_tag(status)])
            .filter_map(|entry| match entry {
                Ok((key, _)) => decode_id(&key[1..]).map(Ok),
                Err(e) => Some(Err(e.into())),
            })
    }

    /// Rows indexed under `status`; rows whose index entry is out of date
    /// are skipped
    fn items_with_status(&self, status: ItemStatus) -> impl Iterator<Item = Result<QueueItem, StoreError>> + '_ {
        self.ids_with_status(status).filter_map(move |id| {
            let item = id.and_then(|id| self.get(id));
            match item {
                Ok(Some(item)) if item.status == status => Some(Ok(item)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }
}

impl QueueStore for SledQueueStore {
    fn enqueue(&self, url: &str, now: DateTime<Utc>) -> Result<Enqueued, StoreError> {
        let id = self.next_id()?;

        let outcome = (&self.items, &self.urls, &self.statuses).transaction(
            |(items, urls, statuses)| -> TxResult<Enqueued> {
                if let Some(existing) = urls.get(url.as_bytes())? {
                    match decode_id(&existing) {
                        Some(existing_id) => {
                            if let Some(current) = items.get(&item_key(existing_id)[..])? {
                                let mut item = decode(&current).map_err(abort)?;
                                item.apply(&Transition::Touch, now).map_err(abort)?;
                                items.insert(&item_key(existing_id)[..], encode(&item).map_err(abort)?)?;
                                return Ok(Enqueued::Existing(existing_id));
                            }
                            warn!("url index for {} points at missing item {}, replacing", url, existing_id);
                        }
                        None => warn!("corrupt url index entry for {}, replacing", url),
                    }
                }

                let item = QueueItem::new(id, url, now);
                items.insert(&item_key(id)[..], encode(&item).map_err(abort)?)?;
                urls.insert(url.as_bytes(), &item_key(id)[..])?;
                statuses.insert(&status_key(item.status, id)[..], PRESENT)?;
                Ok(Enqueued::Created(id))
            },
        );
        committed(outcome)
    }

    fn get(&self, id: ItemId) -> Result<Option<QueueItem>, StoreError> {
        self.items
            .get(item_key(id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn select_pending(&self, limit: usize, max_retries: u32) -> Result<Vec<QueueItem>, StoreError> {
        let mut selected = Vec::with_capacity(limit);
        for item in self.items_with_status(ItemStatus::Pending) {
            if selected.len() >= limit {
                break;
            }
            let item = item?;
            if item.is_eligible(max_retries) {
                selected.push(item);
            }
        }
        Ok(selected)
    }

    fn scan(&self, status: ItemStatus) -> Result<Vec<QueueItem>, StoreError> {
        self.items_with_status(status).collect()
    }

    fn count(&self, status: ItemStatus) -> Result<usize, StoreError> {
        let mut count = 0;
        for id in self.ids_with_status(status) {
            id?;
            count += 1;
        }
        Ok(count)
    }

    fn update(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let key = item_key(id);
        let outcome = (&self.items, &self.statuses).transaction(
            |(items, statuses)| -> TxResult<QueueItem> {
                let current = items
                    .get(&key[..])?
                    .ok_or_else(|| abort(StoreError::NotFound(id)))?;
                let mut item = decode(&current).map_err(abort)?;
                let before = item.status;
                item.apply(transition, now).map_err(abort)?;

                items.insert(&key[..], encode(&item).map_err(abort)?)?;
                if item.status != before {
                    statuses.remove(&status_key(before, id)[..])?;
                    statuses.insert(&status_key(item.status, id)[..], PRESENT)?;
                }
                Ok(item)
            },
        );
        committed(outcome)
    }
}
