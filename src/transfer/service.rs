//! Transfer Service
//!
//! Entry point for new transfers and operator reversals.
//!
//! Submit flow:
//! 1. Idempotency guard on the caller's request id
//! 2. Per-payer subject lease (one submission in flight per account)
//! 3. Directory lookups, strategy validation, fee and channel
//! 4. Transaction credential check; plaintext wiped right after
//! 5. Drive INIT -> FROZEN -> RISK_PENDING in the executor
//!
//! The order then waits for the risk verdict (see `continuation`).

use std::sync::Arc;

use chrono::Utc;
use tracing::{Instrument, error, info, info_span, warn};

use super::adapters::CredentialVerifier;
use super::context::TransferContext;
use super::error::TransferError;
use super::executor::StateMachineExecutor;
use super::state::TransferStatus;
use super::store::{OrderQuery, Shard};
use super::strategy::{StateTransition, StrategyRegistry, TransferDraft, TransferStrategy};
use super::types::{
    PayerInfo, ReversalRequest, RiskOutcome, SubmitTransferRequest, SubmitTransferResponse,
    TraceContext, TransferOrder, TxnId,
};
use crate::idempotency::{AcquireOutcome, IdempotencyGuard, IdempotencyRecord};
use crate::money::{CurrencyCode, Money};
use crate::subject_lock::{SubjectLease, SubjectLocks};

pub struct TransferService {
    guard: Arc<dyn IdempotencyGuard>,
    locks: Arc<SubjectLocks>,
    credentials: Arc<dyn CredentialVerifier>,
    strategies: StrategyRegistry,
    executor: Arc<StateMachineExecutor>,
}

impl TransferService {
    pub fn new(
        guard: Arc<dyn IdempotencyGuard>,
        locks: Arc<SubjectLocks>,
        credentials: Arc<dyn CredentialVerifier>,
        strategies: StrategyRegistry,
        executor: Arc<StateMachineExecutor>,
    ) -> Self {
        Self {
            guard,
            locks,
            credentials,
            strategies,
            executor,
        }
    }

    /// Accept a transfer. Returns once the order is RISK_PENDING (or
    /// further along when the strategy settles without review).
    ///
    /// # Errors
    /// * `DuplicateRequest` - request id seen before (`prior` carries the txn id once it succeeded)
    /// * validation family - rejected, nothing persisted
    /// * `InsufficientFunds` - order persisted as FAILED
    /// * `SubjectBusy` / `ConcurrencyConflict` - try again
    pub async fn submit(
        &self,
        req: SubmitTransferRequest,
        trace: TraceContext,
    ) -> Result<SubmitTransferResponse, TransferError> {
        let request_key = req.request_id.trim().to_string();
        let request_id = request_key.as_str();
        if request_id.is_empty() {
            return Err(TransferError::MissingField("request_id"));
        }

        match self.guard.try_acquire(request_id).await? {
            AcquireOutcome::Granted => {}
            AcquireOutcome::Duplicate(IdempotencyRecord::Succeeded(prior)) => {
                info!(request_id, prior = %prior, "Duplicate transfer request");
                return Err(TransferError::DuplicateRequest { prior: Some(prior) });
            }
            AcquireOutcome::Duplicate(IdempotencyRecord::Processing) => {
                info!(request_id, "Transfer request already in flight");
                return Err(TransferError::DuplicateRequest { prior: None });
            }
        }

        let _lease = match self.lease(&req.payer_account_no).await {
            Ok(lease) => lease,
            Err(e) => {
                self.release_guard(request_id).await;
                return Err(e);
            }
        };

        let span = info_span!("submit", trace_id = %trace.trace_id, request_id);
        let (mut ctx, strategy) = match self.prepare(req, trace).instrument(span.clone()).await {
            Ok(prepared) => prepared,
            Err(e) => {
                info!(request_id, code = e.code(), error = %e, "Transfer rejected");
                self.release_guard(request_id).await;
                return Err(e);
            }
        };

        let advanced = self
            .executor
            .advance(&mut ctx, strategy.as_ref())
            .instrument(span)
            .await;
        match advanced {
            Ok(status) => {
                let txn_id = ctx.order.txn_id;
                self.mark_guard(request_id, &txn_id).await;
                info!(request_id, %txn_id, %status, "Transfer accepted");
                Ok(SubmitTransferResponse {
                    txn_id,
                    status,
                    message: acceptance_message(status).to_string(),
                })
            }
            Err(TransferError::InsufficientFunds { txn_id }) => {
                ctx.order.failure_reason = Some("insufficient available balance".to_string());
                let failed = Some(StateTransition::to(TransferStatus::Failed));
                if let Err(e) = self.executor.drive(&mut ctx, failed).await {
                    self.release_guard(request_id).await;
                    return Err(e);
                }
                self.mark_guard(request_id, &ctx.order.txn_id).await;
                info!(request_id, txn_id = %txn_id, "Transfer failed: insufficient funds");
                Err(TransferError::InsufficientFunds { txn_id })
            }
            Err(e) if ctx.order.is_persisted() => {
                // the order exists and holds funds; the sweeper owns it now
                warn!(
                    request_id,
                    txn_id = %ctx.order.txn_id,
                    status = %ctx.order.status,
                    error = %e,
                    "Transfer stalled after persisting"
                );
                self.mark_guard(request_id, &ctx.order.txn_id).await;
                Err(e)
            }
            Err(e) => {
                self.release_guard(request_id).await;
                Err(e)
            }
        }
    }

    /// Validate and build the INIT context.
    async fn prepare(
        &self,
        req: SubmitTransferRequest,
        trace: TraceContext,
    ) -> Result<(TransferContext, Arc<dyn TransferStrategy>), TransferError> {
        let strategy = self.strategies.get(req.transfer_type)?;
        let contexts = self.executor.contexts();

        let currency = CurrencyCode::parse(&req.currency)?;
        let amount = Money::new(req.amount, currency)?;
        let payer = contexts
            .account(&req.payer_account_no)
            .await?
            .ok_or(TransferError::PayerAccountNotFound)?;
        let payee_account = contexts.account(&req.payee.account_no).await?;
        let mut payee = req.payee.clone();
        if let Some(known) = &payee_account {
            payee.account_name = Some(known.account_name.clone());
        }

        let draft = TransferDraft {
            user_id: &req.user_id,
            payer: &payer,
            payee: &req.payee,
            payee_account: payee_account.as_ref(),
            amount: &amount,
            channel_hint: req.channel_hint,
        };
        strategy.validate(&draft)?;
        let balance = contexts
            .balance(&payer.account_no, amount.currency())
            .await?
            .ok_or_else(|| TransferError::PayerCurrencyNotHeld(amount.currency().to_string()))?;
        let channel = strategy.select_channel(&draft);
        let fee = strategy.calculate_fee(&draft, channel)?;
        let settlement_account = strategy.settlement_account(&draft, channel)?;

        let now = Utc::now();
        let order = TransferOrder {
            id: 0,
            txn_id: TxnId::new(),
            request_id: req.request_id.trim().to_string(),
            payer: PayerInfo {
                user_id: req.user_id.clone(),
                account_no: payer.account_no.clone(),
                account_name: payer.account_name.clone(),
            },
            payee,
            amount: amount.clone(),
            fee,
            transfer_type: req.transfer_type,
            channel,
            status: TransferStatus::Init,
            risk_outcome: RiskOutcome::Unknown,
            failure_reason: None,
            settlement_account,
            network_reference: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let ctx = TransferContext::new(order, trace).with_payer_balance(Some(balance));

        let verdict = self.credentials.verify(&req.user_id, &req.credential).await;
        // wipes the plaintext before anything else runs
        drop(req);
        verdict?;

        Ok((ctx, strategy))
    }

    /// Undo a settled transfer: SUCCESS -> REVERSING -> REVERSED.
    /// A transfer already REVERSING is resumed.
    pub async fn reverse(
        &self,
        req: ReversalRequest,
        trace: TraceContext,
    ) -> Result<TransferOrder, TransferError> {
        let order = self
            .executor
            .store()
            .find_order(req.order_id)
            .await?
            .ok_or_else(|| TransferError::OrderNotFound(req.order_id.to_string()))?;
        if !matches!(
            order.status,
            TransferStatus::Success | TransferStatus::Reversing
        ) {
            return Err(TransferError::InvalidStateTransition(format!(
                "cannot reverse {} in {}",
                order.txn_id, order.status
            )));
        }

        // No subject lease: the recall below is an external call, and the
        // order version already serializes competing reversals
        let strategy = self.strategies.get(order.transfer_type)?;
        let mut ctx = self.executor.contexts().rehydrate(order, trace).await?;

        let reason = req.reason.as_str();
        if ctx.order.status == TransferStatus::Success {
            self.executor
                .drive_with(&mut ctx, |c| {
                    if c.order.status != TransferStatus::Success {
                        return None;
                    }
                    c.order.failure_reason = Some(format!("reversal: {}", reason));
                    strategy.reversal_transition(c.order.status)
                })
                .await?;
        }

        if ctx.order.status == TransferStatus::Reversing {
            let undo = self
                .executor
                .drive_with(&mut ctx, |c| strategy.reversal_transition(c.order.status))
                .await;
            if let Err(e) = undo {
                error!(
                    txn_id = %ctx.order.txn_id,
                    reason,
                    error = %e,
                    "Reversal failed, order left REVERSING"
                );
                self.annotate(&mut ctx, format!("reversal failed: {}", e)).await;
                return Err(e);
            }
        }
        info!(txn_id = %ctx.order.txn_id, status = %ctx.order.status, reason, "Reversal processed");
        Ok(ctx.order)
    }

    /// Record a failure note without changing status.
    async fn annotate(&self, ctx: &mut TransferContext, note: String) {
        if let Err(e) = self.executor.contexts().refresh(ctx).await {
            warn!(txn_id = %ctx.order.txn_id, error = %e, "Could not reload order to annotate");
            return;
        }
        ctx.order.failure_reason = Some(note);
        let same = Some(StateTransition::to(ctx.order.status));
        if let Err(e) = self.executor.drive(ctx, same).await {
            warn!(txn_id = %ctx.order.txn_id, error = %e, "Could not annotate order");
        }
    }

    pub async fn get_order(&self, id: i64) -> Result<TransferOrder, TransferError> {
        self.executor
            .store()
            .find_order(id)
            .await?
            .ok_or_else(|| TransferError::OrderNotFound(id.to_string()))
    }

    pub async fn order_by_txn(&self, txn_id: &TxnId) -> Result<TransferOrder, TransferError> {
        self.executor
            .store()
            .find_order_by_txn(txn_id)
            .await?
            .ok_or_else(|| TransferError::OrderNotFound(txn_id.to_string()))
    }

    /// Order created by a request id that went through, if any.
    pub async fn outcome_of(&self, request_id: &str) -> Result<Option<TransferOrder>, TransferError> {
        let Some(reference) = self.guard.succeeded(request_id).await? else {
            return Ok(None);
        };
        let txn_id: TxnId = reference.parse().map_err(|_| {
            TransferError::IntegrityViolation(format!("bad outcome reference {}", reference))
        })?;
        Ok(self.executor.store().find_order_by_txn(&txn_id).await?)
    }

    /// Orders owned by one shard of `total`, for per-shard batch workers.
    pub async fn orders_for_shard(
        &self,
        index: u32,
        total: u32,
        statuses: Vec<TransferStatus>,
        limit: usize,
    ) -> Result<Vec<TransferOrder>, TransferError> {
        if total == 0 || index >= total {
            return Err(TransferError::Configuration(format!(
                "shard {} of {} is out of range",
                index, total
            )));
        }
        let query = OrderQuery {
            statuses,
            shard: Some(Shard { index, total }),
            updated_before: None,
            limit,
        };
        Ok(self.executor.store().list_orders(&query).await?)
    }

    async fn lease(&self, account_no: &str) -> Result<SubjectLease, TransferError> {
        self.locks
            .acquire(account_no)
            .await
            .ok_or_else(|| TransferError::SubjectBusy(account_no.to_string()))
    }

    async fn mark_guard(&self, request_id: &str, txn_id: &TxnId) {
        if let Err(e) = self
            .guard
            .mark_success(request_id, &txn_id.to_string())
            .await
        {
            warn!(request_id, %txn_id, error = %e, "Failed to record request outcome");
        }
    }

    async fn release_guard(&self, request_id: &str) {
        if let Err(e) = self.guard.release(request_id).await {
            warn!(request_id, error = %e, "Failed to release idempotency record");
        }
    }
}

fn acceptance_message(status: TransferStatus) -> &'static str {
    match status {
        TransferStatus::RiskPending => "Transfer accepted, pending risk review",
        TransferStatus::Success => "Transfer completed",
        TransferStatus::Failed => "Transfer failed",
        _ => "Transfer accepted",
    }
}
