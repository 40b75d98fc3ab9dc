//! State Machine Executor
//!
//! Runs one transition atomically: every handler of the transition, the
//! order status update (compare-and-swap on the order version) and the
//! staged events share one unit of work. Events are published only after
//! commit. Any failure rolls everything back and leaves the context as it
//! was before the transition. Each attempt leaves one audit record.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::audit::{AuditRecord, AuditSink};
use super::context::{ContextBuilder, PhaseScratch, TransferContext};
use super::error::TransferError;
use super::events::EventPublisher;
use super::pipeline::{HandlerRegistry, PhaseHandler};
use super::retry::RetryPolicy;
use super::state::TransferStatus;
use super::store::{TransferStore, UnitOfWork};
use super::strategy::{StateTransition, TransferStrategy};

/// Upper bound on chained automatic edges in one `advance`.
const MAX_AUTO_STEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Advanced {
        from: TransferStatus,
        to: TransferStatus,
    },
    /// No edge for the current state; nothing was touched.
    NoTransition { status: TransferStatus },
}

pub struct StateMachineExecutor {
    store: Arc<dyn TransferStore>,
    handlers: HandlerRegistry,
    publisher: Arc<dyn EventPublisher>,
    contexts: ContextBuilder,
    retry: RetryPolicy,
    audit: Arc<dyn AuditSink>,
}

impl StateMachineExecutor {
    pub fn new(
        store: Arc<dyn TransferStore>,
        handlers: HandlerRegistry,
        publisher: Arc<dyn EventPublisher>,
        contexts: ContextBuilder,
        retry: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            handlers,
            publisher,
            contexts,
            retry,
            audit,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    pub fn contexts(&self) -> &ContextBuilder {
        &self.contexts
    }

    /// Execute a single transition. `None` is a late or duplicate trigger
    /// and is ignored.
    pub async fn drive(
        &self,
        ctx: &mut TransferContext,
        transition: Option<StateTransition>,
    ) -> Result<DriveOutcome, TransferError> {
        let from = ctx.order.status;
        let Some(transition) = transition else {
            warn!(txn_id = %ctx.order.txn_id, status = %from, "No transition for current state, ignoring");
            return Ok(DriveOutcome::NoTransition { status: from });
        };

        let handlers = self.handlers.resolve(&transition.phases)?;
        let started = tokio::time::Instant::now();
        let record = AuditRecord::new(&ctx.trace, ctx.order.txn_id, from, transition.next_status);
        let order_before = ctx.order.clone();
        let balance_before = ctx.payer_balance.clone();
        ctx.scratch = PhaseScratch::default();

        let mut uow = self.store.begin().await?;
        if let Err(e) = run(ctx, &handlers, &transition, uow.as_mut()).await {
            if let Err(rb) = uow.rollback().await {
                error!(txn_id = %ctx.order.txn_id, error = %rb, "Rollback failed");
            }
            ctx.order = order_before;
            ctx.payer_balance = balance_before;
            self.audit.record(record.failed(&e).took(elapsed_ms(started)));
            return Err(e);
        }

        let events = match uow.commit().await {
            Ok(events) => events,
            Err(e) => {
                ctx.order = order_before;
                ctx.payer_balance = balance_before;
                let e = TransferError::from(e);
                self.audit.record(record.failed(&e).took(elapsed_ms(started)));
                return Err(e);
            }
        };
        self.audit.record(record.took(elapsed_ms(started)));

        info!(
            txn_id = %ctx.order.txn_id,
            from = %from,
            to = %ctx.order.status,
            "Transfer state advanced"
        );

        for event in events {
            let message_id = event.message_id();
            if let Err(e) = self.publisher.publish(event).await {
                // order stays in its waiting state; the sweeper compensates
                error!(txn_id = %ctx.order.txn_id, %message_id, error = %e, "Event publish failed");
            }
        }

        Ok(DriveOutcome::Advanced {
            from,
            to: ctx.order.status,
        })
    }

    /// `drive` with bounded retry on transient errors. `choose` runs on
    /// fresh state before every attempt (it may stamp the order first), so
    /// a race lost to another worker ends as `NoTransition` instead of a
    /// double apply.
    pub async fn drive_with<F>(
        &self,
        ctx: &mut TransferContext,
        choose: F,
    ) -> Result<DriveOutcome, TransferError>
    where
        F: Fn(&mut TransferContext) -> Option<StateTransition> + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let transition = choose(ctx);
            match self.drive(ctx, transition).await {
                Err(e) if e.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        txn_id = %ctx.order.txn_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying transition"
                    );
                    tokio::time::sleep(delay).await;
                    self.contexts.refresh(ctx).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Follow the strategy's automatic edges until the order waits for an
    /// external trigger or reaches a terminal state.
    pub async fn advance(
        &self,
        ctx: &mut TransferContext,
        strategy: &dyn TransferStrategy,
    ) -> Result<TransferStatus, TransferError> {
        for _ in 0..MAX_AUTO_STEPS {
            if strategy
                .next_transition(ctx.order.status, ctx.order.risk_outcome)
                .is_none()
            {
                debug!(txn_id = %ctx.order.txn_id, status = %ctx.order.status, "Transfer waiting");
                return Ok(ctx.order.status);
            }
            let outcome = self
                .drive_with(ctx, |c| {
                    strategy.next_transition(c.order.status, c.order.risk_outcome)
                })
                .await?;
            if let DriveOutcome::NoTransition { status } = outcome {
                return Ok(status);
            }
            if ctx.order.status.is_terminal() {
                return Ok(ctx.order.status);
            }
        }
        Err(TransferError::InvalidStateTransition(format!(
            "{} did not settle after {} steps",
            ctx.order.txn_id, MAX_AUTO_STEPS
        )))
    }
}

fn elapsed_ms(started: tokio::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn run(
    ctx: &mut TransferContext,
    handlers: &[Arc<dyn PhaseHandler>],
    transition: &StateTransition,
    uow: &mut dyn UnitOfWork,
) -> Result<(), TransferError> {
    for handler in handlers {
        let phase = handler.phase();
        debug!(txn_id = %ctx.order.txn_id, %phase, "Running phase");
        if let Err(e) = handler.handle(ctx, uow).await {
            warn!(txn_id = %ctx.order.txn_id, %phase, error = %e, "Phase failed, rolling back transition");
            return Err(e);
        }
    }

    let expected = ctx.order.version;
    ctx.order.status = transition.next_status;
    ctx.order.updated_at = Utc::now();
    let id = uow.save_order(&ctx.order, expected).await?;
    ctx.order.id = id;
    ctx.order.version = expected + 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use crate::ledger::{Ledger, LedgerRequest};
    use crate::transfer::audit::{AuditResult, MemoryAuditSink};
    use crate::transfer::adapters::MemoryAccountDirectory;
    use crate::transfer::events::ChannelPublisher;
    use crate::transfer::pipeline::Phase;
    use crate::transfer::store::MemoryTransferStore;
    use crate::transfer::testkit::{self, mop};
    use crate::transfer::types::TraceContext;

    /// Credits 1 MOP to the payee, then optionally fails.
    struct Scripted {
        phase: Phase,
        ledger: Arc<Ledger>,
        failures: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl PhaseHandler for Scripted {
        fn phase(&self) -> Phase {
            self.phase
        }

        async fn handle(
            &self,
            ctx: &mut TransferContext,
            uow: &mut dyn UnitOfWork,
        ) -> Result<(), TransferError> {
            let req = LedgerRequest::new(
                self.phase.request_id(&ctx.txn_ref()),
                ctx.txn_ref(),
                "888002",
                mop(),
                Decimal::ONE,
            );
            self.ledger.credit(uow, &req).await?;
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.transient {
                    TransferError::ConcurrencyConflict("lost race".into())
                } else {
                    TransferError::LedgerRejected("boom".into())
                });
            }
            Ok(())
        }
    }

    struct Setup {
        store: Arc<MemoryTransferStore>,
        audit: Arc<MemoryAuditSink>,
        executor: StateMachineExecutor,
        events: tokio::sync::mpsc::Receiver<crate::transfer::events::OutboundEvent>,
    }

    fn setup(failures: usize, transient: bool) -> Setup {
        let ledger = testkit::ledger();
        let store = Arc::new(MemoryTransferStore::new());
        store.put_balance(testkit::opened("888001", 1000));
        store.put_balance(testkit::opened("888002", 0));

        let registry = Phase::ALL.iter().fold(HandlerRegistry::builder(), |b, p| {
            b.register(Arc::new(Scripted {
                phase: *p,
                ledger: ledger.clone(),
                failures: AtomicUsize::new(if *p == Phase::FreezeFund { failures } else { 0 }),
                transient,
            }))
        });
        let (publisher, events) = ChannelPublisher::channel(8);
        let contexts = ContextBuilder::new(
            Arc::new(MemoryAccountDirectory::new()),
            store.clone(),
            ledger,
        );
        let audit = Arc::new(MemoryAuditSink::new());
        let executor = StateMachineExecutor::new(
            store.clone(),
            registry.build().unwrap(),
            Arc::new(publisher),
            contexts,
            RetryPolicy {
                base_delay_ms: 1,
                ..RetryPolicy::default()
            },
            audit.clone(),
        );
        Setup {
            store,
            audit,
            executor,
            events,
        }
    }

    fn freeze() -> Option<StateTransition> {
        Some(StateTransition::new([Phase::FreezeFund], TransferStatus::Frozen))
    }

    async fn payee_balance(store: &MemoryTransferStore) -> Decimal {
        store.balance("888002", &mop()).await.unwrap().unwrap().balance()
    }

    #[tokio::test]
    async fn test_commit_persists_order_and_ledger() {
        let s = setup(0, false);
        let mut ctx = TransferContext::new(testkit::order(200), TraceContext::system());

        let outcome = s.executor.drive(&mut ctx, freeze()).await.unwrap();
        assert_eq!(
            outcome,
            DriveOutcome::Advanced {
                from: TransferStatus::Init,
                to: TransferStatus::Frozen
            }
        );
        assert_eq!(ctx.order.version, 1);
        let stored = s.store.find_order(ctx.order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Frozen);
        assert_eq!(payee_balance(&s.store).await, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_failed_phase_rolls_back_everything() {
        let s = setup(1, false);
        let mut ctx = TransferContext::new(testkit::order(200), TraceContext::system());

        let err = s.executor.drive(&mut ctx, freeze()).await.unwrap_err();
        assert_eq!(err, TransferError::LedgerRejected("boom".into()));
        assert_eq!(ctx.order.status, TransferStatus::Init);
        assert_eq!(ctx.order.version, 0);
        assert_eq!(s.store.order_count(), 0);
        assert_eq!(payee_balance(&s.store).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_each_attempt_is_audited() {
        let s = setup(1, false);
        let trace = TraceContext::new(Some("u-alice".into()));
        let mut ctx = TransferContext::new(testkit::order(200), trace.clone());

        s.executor.drive(&mut ctx, freeze()).await.unwrap_err();
        s.executor.drive(&mut ctx, freeze()).await.unwrap();
        s.executor.drive(&mut ctx, None).await.unwrap();

        let records = s.audit.for_txn(&ctx.order.txn_id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].result, AuditResult::Failure);
        assert_eq!(records[0].error.as_deref(), Some("Ledger rejected operation: boom"));
        assert_eq!(records[1].result, AuditResult::Success);
        assert_eq!(records[1].from, TransferStatus::Init);
        assert_eq!(records[1].to, TransferStatus::Frozen);
        assert_eq!(records[1].actor, "u-alice");
        assert_eq!(records[1].trace_id, trace.trace_id.to_string());
    }

    #[tokio::test]
    async fn test_missing_transition_is_noop() {
        let s = setup(0, false);
        let mut ctx = TransferContext::new(testkit::order(200), TraceContext::system());
        let outcome = s.executor.drive(&mut ctx, None).await.unwrap();
        assert_eq!(
            outcome,
            DriveOutcome::NoTransition {
                status: TransferStatus::Init
            }
        );
        assert_eq!(s.store.order_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let s = setup(2, true);
        let mut ctx = TransferContext::new(testkit::order(200), TraceContext::system());

        let outcome = s.executor.drive_with(&mut ctx, |_| freeze()).await.unwrap();
        assert!(matches!(outcome, DriveOutcome::Advanced { .. }));
        // two rolled-back attempts left no trace
        assert_eq!(payee_balance(&s.store).await, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let s = setup(5, true);
        let mut ctx = TransferContext::new(testkit::order(200), TraceContext::system());
        let err = s
            .executor
            .drive_with(&mut ctx, |_| freeze())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(s.store.order_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_order_race_rejected() {
        let s = setup(0, false);
        let mut ctx = TransferContext::new(testkit::order(200), TraceContext::system());
        s.executor.drive(&mut ctx, freeze()).await.unwrap();

        let mut stale = TransferContext::new(ctx.order.clone(), TraceContext::system());
        let to_risk = Some(StateTransition::new([Phase::SendRiskRequest], TransferStatus::RiskPending));
        s.executor.drive(&mut ctx, to_risk.clone()).await.unwrap();

        let err = s.executor.drive(&mut stale, to_risk).await.unwrap_err();
        assert!(matches!(err, TransferError::ConcurrencyConflict(_)));
        assert_eq!(stale.order.status, TransferStatus::Frozen);
        drop(s.events);
    }
}
