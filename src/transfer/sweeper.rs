//! Compensation Sweeper
//!
//! Safety net running beside the request and message paths. Each pass:
//! 1. Finds freeze logs still open after the freeze timeout and releases
//!    them (through the order's timeout edge when the order still waits on
//!    the hold, directly through the ledger for orphans).
//! 2. Resumes orders stalled in SETTLING / UNFREEZING.
//! 3. Purges expired idempotency records.
//!
//! Records are handled independently; a failure is logged for manual
//! escalation and the hold is parked on a doubling backoff so it cannot
//! fill every batch ahead of newer holds.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::TransferError;
use super::executor::{DriveOutcome, StateMachineExecutor};
use super::state::TransferStatus;
use super::store::OrderQuery;
use super::strategy::StrategyRegistry;
use super::types::{TraceContext, TransferOrder, TxnId};
use crate::idempotency::IdempotencyGuard;
use crate::ledger::{AccountFreezeLog, Ledger, LedgerRequest};

pub const FREEZE_TIMEOUT_REASON: &str = "freeze timed out";

/// Upper bound on how long a failing hold sits out.
const MAX_PARK_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Age after which an open freeze is compensated
    #[serde(default = "default_freeze_timeout_secs")]
    pub freeze_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Age after which a SETTLING / UNFREEZING order is resumed
    #[serde(default = "default_stall_secs")]
    pub stall_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_freeze_timeout_secs() -> u64 {
    30 * 60
}

fn default_batch_size() -> usize {
    100
}

fn default_stall_secs() -> u64 {
    120
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            freeze_timeout_secs: default_freeze_timeout_secs(),
            batch_size: default_batch_size(),
            stall_secs: default_stall_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub compensated: usize,
    /// Already released or advanced by someone else
    pub skipped: usize,
    pub failed: usize,
    /// Failed earlier and still backing off
    pub parked: usize,
    pub resumed: usize,
    pub purged: usize,
}

pub struct CompensationSweeper {
    executor: Arc<StateMachineExecutor>,
    strategies: StrategyRegistry,
    ledger: Arc<Ledger>,
    guard: Arc<dyn IdempotencyGuard>,
    config: SweeperConfig,
    parked: DashMap<Uuid, Parked>,
}

#[derive(Debug, Clone, Copy)]
struct Parked {
    attempts: u32,
    retry_after: DateTime<Utc>,
}

enum Compensation {
    Done,
    Skipped,
}

impl CompensationSweeper {
    pub fn new(
        executor: Arc<StateMachineExecutor>,
        strategies: StrategyRegistry,
        ledger: Arc<Ledger>,
        guard: Arc<dyn IdempotencyGuard>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            executor,
            strategies,
            ledger,
            guard,
            config,
            parked: DashMap::new(),
        }
    }

    /// Run until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            freeze_timeout_secs = self.config.freeze_timeout_secs,
            batch_size = self.config.batch_size,
            "Starting compensation sweeper"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report == SweepReport::default() => debug!("Nothing to sweep"),
                        Ok(report) => info!(?report, "Sweep finished"),
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
        info!("Compensation sweeper stopped");
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, TransferError> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, TransferError> {
        let mut report = SweepReport::default();
        let cutoff = ago(now, self.config.freeze_timeout_secs);
        let backing_off: Vec<Uuid> = self
            .parked
            .iter()
            .filter(|p| p.retry_after > now)
            .map(|p| *p.key())
            .collect();
        report.parked = backing_off.len();
        let stale = self
            .executor
            .store()
            .stale_freezes(cutoff, self.config.batch_size, &backing_off)
            .await?;

        for log in &stale {
            report.scanned += 1;
            match self.compensate(log).await {
                Ok(Compensation::Done) => {
                    self.parked.remove(&log.id);
                    report.compensated += 1;
                }
                Ok(Compensation::Skipped) => {
                    self.parked.remove(&log.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    let parked = self.park(log.id, now);
                    error!(
                        correlation_id = %log.correlation_id,
                        account_no = %log.account_no,
                        currency = %log.currency,
                        amount = %log.amount,
                        attempts = parked.attempts,
                        retry_after = %parked.retry_after,
                        error = %e,
                        "Freeze compensation failed, needs manual review"
                    );
                }
            }
        }

        // Due entries that no longer come back were closed elsewhere.
        let seen: HashSet<Uuid> = stale.iter().map(|l| l.id).collect();
        self.parked
            .retain(|id, p| p.retry_after > now || seen.contains(id));

        report.resumed = self.resume_stalled(now).await?;
        report.purged = match self.guard.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Idempotency purge failed");
                0
            }
        };
        Ok(report)
    }

    fn park(&self, id: Uuid, now: DateTime<Utc>) -> Parked {
        let mut entry = self.parked.entry(id).or_insert(Parked {
            attempts: 0,
            retry_after: now,
        });
        entry.attempts += 1;
        let backoff = self
            .config
            .interval_secs
            .max(1)
            .saturating_mul(1 << (entry.attempts - 1).min(16))
            .min(MAX_PARK_SECS);
        entry.retry_after = later(now, backoff);
        *entry
    }

    async fn compensate(&self, log: &AccountFreezeLog) -> Result<Compensation, TransferError> {
        let order = match log.correlation_id.parse::<TxnId>() {
            Ok(txn_id) => self.executor.store().find_order_by_txn(&txn_id).await?,
            Err(_) => None,
        };
        match order {
            Some(order) if order.status.holds_freeze() => self.time_out(order).await,
            Some(order) => {
                warn!(
                    txn_id = %order.txn_id,
                    status = %order.status,
                    "Open freeze on an order past its hold, releasing directly"
                );
                self.release(log).await
            }
            None => {
                warn!(correlation_id = %log.correlation_id, "Orphan freeze, releasing directly");
                self.release(log).await
            }
        }
    }

    /// FROZEN / RISK_PENDING -> UNFREEZING -> FAILED.
    async fn time_out(&self, order: TransferOrder) -> Result<Compensation, TransferError> {
        let strategy = self.strategies.get(order.transfer_type)?;
        let mut ctx = self
            .executor
            .contexts()
            .rehydrate(order, TraceContext::system())
            .await?;
        let outcome = self
            .executor
            .drive_with(&mut ctx, |c| {
                let transition = strategy.timeout_transition(c.order.status);
                if transition.is_some() {
                    c.order.failure_reason = Some(FREEZE_TIMEOUT_REASON.to_string());
                }
                transition
            })
            .await?;
        if let DriveOutcome::NoTransition { .. } = outcome {
            return Ok(Compensation::Skipped);
        }
        let status = self.executor.advance(&mut ctx, strategy.as_ref()).await?;
        info!(txn_id = %ctx.order.txn_id, %status, "Timed-out transfer compensated");
        Ok(Compensation::Done)
    }

    /// Ledger-only unfreeze for holds no order accounts for.
    async fn release(&self, log: &AccountFreezeLog) -> Result<Compensation, TransferError> {
        let req = LedgerRequest::new(
            format!("{}:COMPENSATE:{}", log.correlation_id, log.id),
            log.correlation_id.clone(),
            log.account_no.clone(),
            log.currency.clone(),
            log.amount,
        );
        let mut uow = self.executor.store().begin().await?;
        let receipt = match self.ledger.unfreeze(uow.as_mut(), &req).await {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Err(rb) = uow.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                return Err(e.into());
            }
        };
        uow.commit().await?;
        if receipt.replayed {
            return Ok(Compensation::Skipped);
        }
        info!(
            correlation_id = %log.correlation_id,
            account_no = %log.account_no,
            amount = %log.amount,
            "Orphan freeze released"
        );
        Ok(Compensation::Done)
    }

    async fn resume_stalled(&self, now: DateTime<Utc>) -> Result<usize, TransferError> {
        let query = OrderQuery {
            statuses: vec![TransferStatus::Settling, TransferStatus::Unfreezing],
            shard: None,
            updated_before: Some(ago(now, self.config.stall_secs)),
            limit: self.config.batch_size,
        };
        let stalled = self.executor.store().list_orders(&query).await?;
        let mut resumed = 0;
        for order in stalled {
            let txn_id = order.txn_id;
            match self.resume(order).await {
                Ok(status) => {
                    info!(%txn_id, %status, "Stalled transfer resumed");
                    resumed += 1;
                }
                Err(e) => error!(%txn_id, error = %e, "Failed to resume stalled transfer"),
            }
        }
        Ok(resumed)
    }

    async fn resume(&self, order: TransferOrder) -> Result<TransferStatus, TransferError> {
        let strategy = self.strategies.get(order.transfer_type)?;
        let mut ctx = self
            .executor
            .contexts()
            .rehydrate(order, TraceContext::system())
            .await?;
        self.executor.advance(&mut ctx, strategy.as_ref()).await
    }
}

fn later(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn ago(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
