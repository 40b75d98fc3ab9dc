//! In-process risk engine for dev and test builds.
//!
//! Answers every risk request with a verdict after a fixed latency:
//! approve below the configured amount, reject at or above it.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::MockRiskConfig;
use crate::transfer::events::{Envelope, OutboundEvent, RiskRequestEvent, RiskResultEvent};

pub struct MockRiskEngine {
    approve_below: Decimal,
    latency: Duration,
}

impl MockRiskEngine {
    pub fn new(config: &MockRiskConfig) -> Self {
        Self {
            approve_below: config.approve_below,
            latency: Duration::from_millis(config.latency_ms),
        }
    }

    pub fn assess(&self, request: &Envelope<RiskRequestEvent>) -> Envelope<RiskResultEvent> {
        let event = &request.payload;
        let passed = event.amount < self.approve_below;
        let reason = (!passed).then(|| {
            format!(
                "amount {} {} at or above review threshold",
                event.amount, event.currency
            )
        });
        Envelope::new(
            &request.trace(),
            RiskResultEvent {
                txn_id: event.txn_id,
                passed,
                reason,
            },
        )
    }

    pub async fn run(
        self,
        mut requests: mpsc::Receiver<OutboundEvent>,
        results: mpsc::Sender<Envelope<RiskResultEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        warn!("Mock risk engine enabled, do not run in production");
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                next = requests.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            let OutboundEvent::RiskRequest(request) = event;
            let verdict = self.assess(&request);
            debug!(
                txn_id = %request.payload.txn_id,
                passed = verdict.payload.passed,
                "Mock risk verdict"
            );
            let tx = results.clone();
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                if tx.send(verdict).await.is_err() {
                    warn!("Risk inbox closed, verdict dropped");
                }
            });
        }
        info!("Mock risk engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::CurrencyCode;
    use crate::transfer::types::{TraceContext, TxnId};

    fn request(amount: i64) -> Envelope<RiskRequestEvent> {
        Envelope::new(
            &TraceContext::new(Some("u-alice".into())),
            RiskRequestEvent {
                txn_id: TxnId::new(),
                account_no: "888001".into(),
                amount: Decimal::from(amount),
                currency: CurrencyCode::parse("MOP").unwrap(),
                destination_country: "MO".into(),
            },
        )
    }

    #[test]
    fn test_threshold_and_trace_propagation() {
        let engine = MockRiskEngine::new(&MockRiskConfig {
            approve_below: Decimal::from(1000),
            latency_ms: 0,
        });
        let small = request(999);
        let verdict = engine.assess(&small);
        assert!(verdict.payload.passed);
        assert_eq!(verdict.trace_id, small.trace_id);
        assert_eq!(verdict.payload.txn_id, small.payload.txn_id);

        let large = engine.assess(&request(1000));
        assert!(!large.payload.passed);
        assert!(large.payload.reason.unwrap().contains("1000 MOP"));
    }
}
