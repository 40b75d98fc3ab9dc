//! Per-subject advisory lock
//!
//! Serializes submissions from the same payer account to shorten the CAS
//! retry window. Acquisition waits a bounded time; every lease expires on
//! its own so a holder that crashed (or forgot) cannot wedge the subject.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectLockConfig {
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

fn default_wait_ms() -> u64 {
    3_000
}

fn default_lease_ms() -> u64 {
    10_000
}

impl Default for SubjectLockConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_wait_ms(),
            lease_ms: default_lease_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockTable {
    leases: DashMap<String, Lease>,
    next_token: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SubjectLocks {
    table: Arc<LockTable>,
    wait: Duration,
    lease: Duration,
}

/// Held lease; released on drop unless it already expired and was taken over.
#[derive(Debug)]
pub struct SubjectLease {
    table: Arc<LockTable>,
    subject: String,
    token: u64,
}

impl SubjectLocks {
    pub fn new(config: SubjectLockConfig) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            wait: Duration::from_millis(config.wait_ms),
            lease: Duration::from_millis(config.lease_ms),
        }
    }

    /// Wait up to the configured bound for the subject. `None` = still busy.
    pub async fn acquire(&self, subject: &str) -> Option<SubjectLease> {
        let deadline = Instant::now() + self.wait;
        loop {
            if let Some(lease) = self.try_acquire(subject) {
                return Some(lease);
            }
            if Instant::now() >= deadline {
                warn!(subject, "Subject lock wait exhausted");
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn try_acquire(&self, subject: &str) -> Option<SubjectLease> {
        let now = Instant::now();
        let token = self.table.next_token.fetch_add(1, Ordering::Relaxed);
        let fresh = Lease {
            token,
            expires_at: now + self.lease,
        };
        match self.table.leases.entry(subject.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return None;
                }
                warn!(subject, "Taking over expired subject lease");
                held.insert(fresh);
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
        Some(SubjectLease {
            table: self.table.clone(),
            subject: subject.to_string(),
            token,
        })
    }
}

impl Drop for SubjectLease {
    fn drop(&mut self) {
        let token = self.token;
        self.table
            .leases
            .remove_if(&self.subject, |_, lease| lease.token == token);
    }
}
