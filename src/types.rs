//! Core types for the used-CSS queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Monotonically assigned queue item identifier (FIFO ordering key)
pub type ItemId = u64;

// ============================================================================
// Content Identity
// ============================================================================

/// Exact content hash using SHA256 (64-character hex string)
///
/// Used as the cache key for optimized CSS, so identical output from two
/// different pages lands in a single cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Compute SHA256 hash of content
    pub fn compute(content: &str) -> Self {
        Self::compute_bytes(content.as_bytes())
    }

    /// Compute SHA256 hash of raw bytes
    pub fn compute_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentHash(hex::encode(hasher.finalize()))
    }

    /// Parse a hash from a hex string, rejecting anything that is not 64 hex digits
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(ContentHash(hex.to_lowercase()))
        } else {
            None
        }
    }

    /// Get the underlying string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this hash was computed from `bytes`
    pub fn verifies(&self, bytes: &[u8]) -> bool {
        *self == Self::compute_bytes(bytes)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Queue Item
// ============================================================================

/// Processing status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page URL considered for optimization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub url: String,
    pub status: ItemStatus,
    /// Minified, filtered CSS; present iff status is completed
    pub css: Option<String>,
    /// Hash of `css`; present iff status is completed
    pub hash: Option<ContentHash>,
    /// Failed attempts so far; never decreases outside an operator reset
    pub retries: u32,
    /// Last failure; present iff status is error
    pub error_message: Option<String>,
    /// Last state transition
    pub modified: DateTime<Utc>,
    /// Last page view that referenced this URL
    pub last_accessed: DateTime<Utc>,
}

impl QueueItem {
    /// Create a new pending item
    pub fn new(id: ItemId, url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            url: url.into(),
            status: ItemStatus::Pending,
            css: None,
            hash: None,
            retries: 0,
            error_message: None,
            modified: now,
            last_accessed: now,
        }
    }

    /// Whether the processor may pick this item up
    pub fn is_eligible(&self, max_retries: u32) -> bool {
        self.status == ItemStatus::Pending && self.retries < max_retries
    }

    /// Whether the item exhausted its retry budget and needs operator action
    pub fn is_dead_lettered(&self, max_retries: u32) -> bool {
        self.status == ItemStatus::Error && self.retries >= max_retries
    }

    /// Apply a state transition, enforcing the item lifecycle.
    ///
    /// On error the item is left untouched.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let invalid = |item: &QueueItem| TransitionError::Invalid {
            id: item.id,
            from: item.status,
            transition: transition.name(),
        };

        match transition {
            Transition::Touch => {
                self.last_accessed = now;
                return Ok(());
            }
            Transition::Claim => {
                if self.status != ItemStatus::Pending {
                    return Err(invalid(self));
                }
                self.status = ItemStatus::Processing;
            }
            Transition::Complete { css, hash } => {
                if self.status != ItemStatus::Processing {
                    return Err(invalid(self));
                }
                if !hash.verifies(css.as_bytes()) {
                    return Err(TransitionError::HashMismatch { id: self.id });
                }
                self.status = ItemStatus::Completed;
                self.css = Some(css.clone());
                self.hash = Some(hash.clone());
                self.error_message = None;
            }
            Transition::Fail { message } => {
                if self.status != ItemStatus::Processing {
                    return Err(invalid(self));
                }
                self.mark_error(message.clone(), self.retries.saturating_add(1));
            }
            Transition::Reject { message, max_retries } => {
                if self.status != ItemStatus::Processing {
                    return Err(invalid(self));
                }
                let retries = self.retries.saturating_add(1).max(*max_retries);
                self.mark_error(message.clone(), retries);
            }
            Transition::Abandon { stale_before } => {
                if self.status != ItemStatus::Processing || self.modified >= *stale_before {
                    return Err(invalid(self));
                }
                self.mark_error(
                    "processing attempt abandoned before completion".to_string(),
                    self.retries.saturating_add(1),
                );
            }
            Transition::Requeue { max_retries } => {
                if self.status != ItemStatus::Error || self.retries >= *max_retries {
                    return Err(invalid(self));
                }
                self.status = ItemStatus::Pending;
                self.error_message = None;
            }
            Transition::Reset => {
                if self.status != ItemStatus::Error {
                    return Err(invalid(self));
                }
                self.status = ItemStatus::Pending;
                self.error_message = None;
                self.retries = 0;
            }
        }

        self.modified = now;
        Ok(())
    }

    fn mark_error(&mut self, message: String, retries: u32) {
        self.status = ItemStatus::Error;
        self.error_message = Some(message);
        self.retries = retries;
        self.css = None;
        self.hash = None;
    }
}

/// A state change applied atomically to one queue item
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Record a page view (does not change `modified`)
    Touch,
    /// `pending -> processing`; fails if another caller got there first
    Claim,
    /// `processing -> completed`
    Complete { css: String, hash: ContentHash },
    /// `processing -> error`, consuming one retry
    Fail { message: String },
    /// `processing -> error`, dead-lettering immediately
    Reject { message: String, max_retries: u32 },
    /// Stale `processing -> error`; only if `modified` is before `stale_before`
    Abandon { stale_before: DateTime<Utc> },
    /// `error -> pending` while retries remain
    Requeue { max_retries: u32 },
    /// Operator reset: `error -> pending` with the retry counter cleared
    Reset,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Touch => "touch",
            Self::Claim => "claim",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Reject { .. } => "reject",
            Self::Abandon { .. } => "abandon",
            Self::Requeue { .. } => "requeue",
            Self::Reset => "reset",
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {transition} item {id} in state {from}")]
    Invalid {
        id: ItemId,
        from: ItemStatus,
        transition: &'static str,
    },
    #[error("hash does not match CSS for item {id}")]
    HashMismatch { id: ItemId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> QueueItem {
        QueueItem::new(1, "https://example.com/", Utc::now())
    }

    #[test]
    fn content_hash_is_deterministic() {
        let a = ContentHash::compute("body{color:red}");
        let b = ContentHash::compute("body{color:red}");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, ContentHash::compute("body{color:blue}"));
    }

    #[test]
    fn from_hex_rejects_path_like_input() {
        assert!(ContentHash::from_hex("../etc/passwd").is_none());
        let h = ContentHash::compute("x");
        assert_eq!(ContentHash::from_hex(h.as_str()), Some(h));
    }

    #[test]
    fn claim_only_from_pending() {
        let mut it = item();
        it.apply(&Transition::Claim, Utc::now()).unwrap();
        assert_eq!(it.status, ItemStatus::Processing);
        assert!(it.apply(&Transition::Claim, Utc::now()).is_err());
    }

    #[test]
    fn complete_requires_matching_hash() {
        let mut it = item();
        it.apply(&Transition::Claim, Utc::now()).unwrap();
        let bad = Transition::Complete {
            css: "a{b:c}".into(),
            hash: ContentHash::compute("other"),
        };
        assert_eq!(
            it.apply(&bad, Utc::now()),
            Err(TransitionError::HashMismatch { id: 1 })
        );
        assert_eq!(it.status, ItemStatus::Processing);

        let good = Transition::Complete {
            css: "a{b:c}".into(),
            hash: ContentHash::compute("a{b:c}"),
        };
        it.apply(&good, Utc::now()).unwrap();
        assert_eq!(it.status, ItemStatus::Completed);
        assert!(it.css.is_some() && it.hash.is_some());
    }

    #[test]
    fn fail_increments_retries_and_sets_message() {
        let mut it = item();
        it.apply(&Transition::Claim, Utc::now()).unwrap();
        it.apply(&Transition::Fail { message: "boom".into() }, Utc::now()).unwrap();
        assert_eq!(it.status, ItemStatus::Error);
        assert_eq!(it.retries, 1);
        assert_eq!(it.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn reject_dead_letters_immediately() {
        let mut it = item();
        it.apply(&Transition::Claim, Utc::now()).unwrap();
        it.apply(
            &Transition::Reject { message: "bad url".into(), max_retries: 3 },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(it.retries, 3);
        assert!(it.is_dead_lettered(3));
        assert!(it.apply(&Transition::Requeue { max_retries: 3 }, Utc::now()).is_err());
    }

    #[test]
    fn requeue_clears_message_but_keeps_retries() {
        let mut it = item();
        it.apply(&Transition::Claim, Utc::now()).unwrap();
        it.apply(&Transition::Fail { message: "x".into() }, Utc::now()).unwrap();
        it.apply(&Transition::Requeue { max_retries: 3 }, Utc::now()).unwrap();
        assert_eq!(it.status, ItemStatus::Pending);
        assert_eq!(it.retries, 1);
        assert!(it.error_message.is_none());
        assert!(it.is_eligible(3));
    }

    #[test]
    fn abandon_respects_staleness_cutoff() {
        let now = Utc::now();
        let mut it = item();
        it.apply(&Transition::Claim, now).unwrap();

        let fresh = Transition::Abandon { stale_before: now - Duration::seconds(60) };
        assert!(it.apply(&fresh, now).is_err());

        let stale = Transition::Abandon { stale_before: now + Duration::seconds(1) };
        it.apply(&stale, now).unwrap();
        assert_eq!(it.status, ItemStatus::Error);
        assert_eq!(it.retries, 1);
    }

    #[test]
    fn touch_updates_access_time_only() {
        let mut it = item();
        let before = it.modified;
        let later = before + Duration::seconds(30);
        it.apply(&Transition::Touch, later).unwrap();
        assert_eq!(it.last_accessed, later);
        assert_eq!(it.modified, before);
    }
}
