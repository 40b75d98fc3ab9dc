//! Saga messages
//!
//! Risk request (outbound) and risk result (inbound) travel inside an
//! [`Envelope`] that carries the trace context across the async hop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::TransferError;
use super::types::{TraceContext, TxnId};
use crate::money::CurrencyCode;

/// Default destination country stamped on risk requests.
pub const DEFAULT_DESTINATION_COUNTRY: &str = "MO";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub message_id: Uuid,
    pub trace_id: Uuid,
    pub user_id: Option<String>,
    pub emitted_at: DateTime<Utc>,
    /// 1 on first delivery; bumped by the consumer on redelivery.
    pub delivery_attempt: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(trace: &TraceContext, payload: T) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id: trace.trace_id,
            user_id: trace.user_id.clone(),
            emitted_at: Utc::now(),
            delivery_attempt: 1,
            payload,
        }
    }

    pub fn trace(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id,
            user_id: self.user_id.clone(),
        }
    }

    pub fn redelivered(mut self) -> Self {
        self.delivery_attempt += 1;
        self
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRequestEvent {
    pub txn_id: TxnId,
    pub account_no: String,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub destination_country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskResultEvent {
    pub txn_id: TxnId,
    pub passed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Everything the saga emits; staged in the unit of work, published after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "envelope", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    RiskRequest(Envelope<RiskRequestEvent>),
}

impl OutboundEvent {
    pub fn message_id(&self) -> Uuid {
        match self {
            OutboundEvent::RiskRequest(e) => e.message_id,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> Result<(), TransferError>;
}

/// Publishes onto an in-process channel (consumed by the mock risk engine
/// or a bridge to the real broker).
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<OutboundEvent>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: OutboundEvent) -> Result<(), TransferError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TransferError::DownstreamUnavailable("event channel closed".into()))
    }
}
