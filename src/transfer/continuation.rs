//! Risk continuation
//!
//! Consumes risk-result events and resumes the matching order. Duplicate
//! and late deliveries are normal: a verdict for an order that is missing,
//! terminal or already past the risk step is discarded or no-ops.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::error::TransferError;
use super::events::{Envelope, RiskResultEvent};
use super::executor::{DriveOutcome, StateMachineExecutor};
use super::state::TransferStatus;
use super::strategy::StrategyRegistry;
use super::types::RiskOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    /// Deliveries including the first
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_redelivery_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_redelivery_delay_ms() -> u64 {
    1000
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: default_max_deliveries(),
            delay_ms: default_redelivery_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationOutcome {
    /// Order moved on; final status after automatic edges.
    Applied(TransferStatus),
    /// Order unknown, terminal, or the verdict no longer applies.
    Discarded,
}

pub struct RiskContinuation {
    executor: Arc<StateMachineExecutor>,
    strategies: StrategyRegistry,
}

impl RiskContinuation {
    pub fn new(
        executor: Arc<StateMachineExecutor>,
        strategies: StrategyRegistry,
    ) -> Self {
        Self {
            executor,
            strategies,
        }
    }

    /// Apply one verdict. Errors mean "redeliver".
    pub async fn on_risk_result(
        &self,
        envelope: &Envelope<RiskResultEvent>,
    ) -> Result<ContinuationOutcome, TransferError> {
        let event = &envelope.payload;
        let Some(order) = self
            .executor
            .store()
            .find_order_by_txn(&event.txn_id)
            .await?
        else {
            warn!(txn_id = %event.txn_id, "Risk result for unknown transfer, discarding");
            return Ok(ContinuationOutcome::Discarded);
        };
        if order.status.is_terminal() {
            info!(txn_id = %event.txn_id, status = %order.status, "Risk result for finished transfer, discarding");
            return Ok(ContinuationOutcome::Discarded);
        }

        // Settlement can reach the payment network, so no subject lease is
        // held here; the order CAS rejects a concurrent driver
        let strategy = self.strategies.get(order.transfer_type)?;
        let mut ctx = self
            .executor
            .contexts()
            .rehydrate(order, envelope.trace())
            .await?;

        let verdict = if event.passed {
            RiskOutcome::Passed
        } else {
            RiskOutcome::Rejected
        };
        let reason = event.reason.as_deref();
        let first = self
            .executor
            .drive_with(&mut ctx, |c| {
                if c.order.status.holds_freeze() && c.order.risk_outcome == RiskOutcome::Unknown {
                    c.order.risk_outcome = verdict;
                    if verdict == RiskOutcome::Rejected {
                        c.order.failure_reason =
                            Some(reason.unwrap_or("rejected by risk review").to_string());
                    }
                }
                strategy.next_transition(c.order.status, c.order.risk_outcome)
            })
            .await?;

        if let DriveOutcome::NoTransition { status } = first {
            debug!(txn_id = %event.txn_id, %status, "Risk result no longer applies");
            return Ok(ContinuationOutcome::Discarded);
        }
        let status = if ctx.order.status.is_terminal() {
            ctx.order.status
        } else {
            self.executor.advance(&mut ctx, strategy.as_ref()).await?
        };
        info!(txn_id = %event.txn_id, passed = event.passed, %status, "Risk result applied");
        Ok(ContinuationOutcome::Applied(status))
    }

    /// Consume until shutdown. Failed deliveries go back on `redeliver`
    /// after the policy delay; the last failure is dead-lettered.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<Envelope<RiskResultEvent>>,
        redeliver: mpsc::Sender<Envelope<RiskResultEvent>>,
        policy: RedeliveryPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            max_deliveries = policy.max_deliveries,
            delay_ms = policy.delay_ms,
            "Starting risk continuation consumer"
        );
        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                next = inbox.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let span = info_span!(
                "risk_result",
                trace_id = %envelope.trace_id,
                txn_id = %envelope.payload.txn_id,
                attempt = envelope.delivery_attempt
            );
            let result = self.on_risk_result(&envelope).instrument(span).await;
            let Err(e) = result else {
                continue;
            };

            if envelope.delivery_attempt >= policy.max_deliveries {
                error!(
                    txn_id = %envelope.payload.txn_id,
                    message_id = %envelope.message_id,
                    attempts = envelope.delivery_attempt,
                    error = %e,
                    "Risk result dead-lettered"
                );
                continue;
            }
            warn!(
                txn_id = %envelope.payload.txn_id,
                attempt = envelope.delivery_attempt,
                error = %e,
                "Risk result failed, scheduling redelivery"
            );
            let tx = redeliver.clone();
            let delay = Duration::from_millis(policy.delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if tx.send(envelope.redelivered()).await.is_err() {
                    warn!("Risk inbox closed, redelivery dropped");
                }
            });
        }
        info!("Risk continuation consumer stopped");
    }
}
