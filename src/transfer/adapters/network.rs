//! Payment network gateways

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{GatewayError, NetworkGateway};
use crate::transfer::types::{TraceContext, TransferChannel, TransferOrder, TxnId};

/// Writes every instruction to the log and acknowledges it. Used when no
/// network endpoint is configured.
#[derive(Debug, Default)]
pub struct LoggingNetworkGateway;

#[async_trait]
impl NetworkGateway for LoggingNetworkGateway {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn dispatch(
        &self,
        order: &TransferOrder,
        trace: &TraceContext,
    ) -> Result<String, GatewayError> {
        info!(
            txn_id = %order.txn_id,
            trace_id = %trace.trace_id,
            channel = %order.channel,
            amount = %order.amount,
            payee = %order.payee.account_no,
            "Network dispatch"
        );
        Ok(format!("{}-{}", order.channel, order.txn_id))
    }

    async fn recall(
        &self,
        order: &TransferOrder,
        reason: &str,
        trace: &TraceContext,
    ) -> Result<String, GatewayError> {
        info!(
            txn_id = %order.txn_id,
            trace_id = %trace.trace_id,
            channel = %order.channel,
            reason,
            "Network recall"
        );
        Ok(format!("RECALL-{}", order.txn_id))
    }
}

#[derive(Debug, Serialize)]
struct Instruction<'a> {
    txn_id: TxnId,
    channel: TransferChannel,
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    currency: &'a str,
    payee_account: &'a str,
    payee_name: Option<&'a str>,
    bank_code: Option<&'a str>,
    swift_code: Option<&'a str>,
    fps_id: Option<&'a str>,
    country: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RecallInstruction<'a> {
    txn_id: TxnId,
    network_reference: Option<&'a str>,
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct Acknowledgement {
    reference: String,
}

/// JSON-over-HTTP gateway.
///
/// `POST {base}/transfers` and `POST {base}/transfers/{txn_id}/recall`,
/// both answering `{"reference": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpNetworkGateway {
    client: Client,
    base_url: String,
}

impl HttpNetworkGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            GatewayError::Unavailable(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        url: String,
        body: &B,
        trace: &TraceContext,
    ) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(&url)
            .header("x-trace-id", trace.trace_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("{} from {}", status, url)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%url, %status, body = %text, "Network rejected instruction");
            return Err(GatewayError::Rejected(format!("{}: {}", status, text)));
        }
        let ack: Acknowledgement = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("Invalid acknowledgement: {}", e)))?;
        Ok(ack.reference)
    }
}

#[async_trait]
impl NetworkGateway for HttpNetworkGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn dispatch(
        &self,
        order: &TransferOrder,
        trace: &TraceContext,
    ) -> Result<String, GatewayError> {
        let body = Instruction {
            txn_id: order.txn_id,
            channel: order.channel,
            amount: order.net_amount(),
            currency: order.currency().as_str(),
            payee_account: &order.payee.account_no,
            payee_name: order.payee.account_name.as_deref(),
            bank_code: order.payee.bank_code.as_deref(),
            swift_code: order.payee.swift_code.as_deref(),
            fps_id: order.payee.fps_id.as_deref(),
            country: order.payee.country.as_deref(),
        };
        self.post(format!("{}/transfers", self.base_url), &body, trace)
            .await
    }

    async fn recall(
        &self,
        order: &TransferOrder,
        reason: &str,
        trace: &TraceContext,
    ) -> Result<String, GatewayError> {
        let body = RecallInstruction {
            txn_id: order.txn_id,
            network_reference: order.network_reference.as_deref(),
            reason,
        };
        self.post(
            format!("{}/transfers/{}/recall", self.base_url, order.txn_id),
            &body,
            trace,
        )
        .await
    }
}
