//! Idempotency Guard
//!
//! Short-lived lock keyed by the caller's request id. A granted caller
//! must finish with `mark_success` or `release`; otherwise the PROCESSING
//! record simply expires and the request becomes retryable.
//!
//! | record            | TTL      |
//! |-------------------|----------|
//! | PROCESSING        | ~60s     |
//! | SUCCESS:<ref>     | ~24h     |

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyRecord {
    Processing,
    Succeeded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Duplicate(IdempotencyRecord),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("Idempotency store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    async fn try_acquire(&self, request_id: &str) -> Result<AcquireOutcome, GuardError>;

    /// Record the terminal outcome reference (the txn id).
    async fn mark_success(&self, request_id: &str, reference: &str) -> Result<(), GuardError>;

    /// Drop a PROCESSING record after a definitive failure so the caller may retry.
    async fn release(&self, request_id: &str) -> Result<(), GuardError>;

    /// Outcome reference of a request that already succeeded.
    async fn succeeded(&self, request_id: &str) -> Result<Option<String>, GuardError>;

    /// Housekeeping hook for stores without native expiry.
    async fn purge_expired(&self) -> Result<usize, GuardError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardTtl {
    #[serde(default = "default_processing_ttl_secs")]
    pub processing_secs: u64,
    #[serde(default = "default_success_ttl_secs")]
    pub success_secs: u64,
}

fn default_processing_ttl_secs() -> u64 {
    60
}

fn default_success_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for GuardTtl {
    fn default() -> Self {
        Self {
            processing_secs: default_processing_ttl_secs(),
            success_secs: default_success_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    record: IdempotencyRecord,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process guard. Expiry is evaluated lazily on access.
#[derive(Debug)]
pub struct MemoryIdempotencyGuard {
    slots: DashMap<String, Slot>,
    processing_ttl: Duration,
    success_ttl: Duration,
}

impl MemoryIdempotencyGuard {
    pub fn new(ttl: GuardTtl) -> Self {
        Self {
            slots: DashMap::new(),
            processing_ttl: Duration::from_secs(ttl.processing_secs),
            success_ttl: Duration::from_secs(ttl.success_secs),
        }
    }

    fn processing(&self) -> Slot {
        Slot {
            record: IdempotencyRecord::Processing,
            expires_at: Instant::now() + self.processing_ttl,
        }
    }
}

impl Default for MemoryIdempotencyGuard {
    fn default() -> Self {
        Self::new(GuardTtl::default())
    }
}

#[async_trait]
impl IdempotencyGuard for MemoryIdempotencyGuard {
    async fn try_acquire(&self, request_id: &str) -> Result<AcquireOutcome, GuardError> {
        let now = Instant::now();
        match self.slots.entry(request_id.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().live(now) {
                    debug!(request_id, "Duplicate request");
                    Ok(AcquireOutcome::Duplicate(slot.get().record.clone()))
                } else {
                    slot.insert(self.processing());
                    Ok(AcquireOutcome::Granted)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(self.processing());
                Ok(AcquireOutcome::Granted)
            }
        }
    }

    async fn mark_success(&self, request_id: &str, reference: &str) -> Result<(), GuardError> {
        self.slots.insert(
            request_id.to_string(),
            Slot {
                record: IdempotencyRecord::Succeeded(reference.to_string()),
                expires_at: Instant::now() + self.success_ttl,
            },
        );
        Ok(())
    }

    async fn release(&self, request_id: &str) -> Result<(), GuardError> {
        self.slots
            .remove_if(request_id, |_, slot| slot.record == IdempotencyRecord::Processing);
        Ok(())
    }

    async fn succeeded(&self, request_id: &str) -> Result<Option<String>, GuardError> {
        let now = Instant::now();
        Ok(self.slots.get(request_id).and_then(|slot| match &slot.record {
            IdempotencyRecord::Succeeded(reference) if slot.live(now) => Some(reference.clone()),
            _ => None,
        }))
    }

    async fn purge_expired(&self) -> Result<usize, GuardError> {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.live(now));
        Ok(before.saturating_sub(self.slots.len()))
    }
}
