use async_trait::async_trait;

use crate::execution::order::{Order, SubmitOrder};
use crate::types::{ExecStatus, Fill};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    OrderNotFound(String),
    InvalidQuantity(f64),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::OrderNotFound(id) => write!(f, "order not found: {}", id),
            BrokerError::InvalidQuantity(q) => write!(f, "invalid order quantity: {}", q),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Point-in-time view of an order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecReport {
    pub order_id: String,
    pub submitted_at: u64,
    pub fills: Vec<Fill>,
    pub avg_price: f64,
    pub slippage_bps: f64,
    pub status: ExecStatus,
    /// No further fills will be appended.
    pub done: bool,
}

impl ExecReport {
    pub fn filled_qty(&self) -> f64 {
        self.fills.iter().map(|f| f.qty).sum()
    }

    /// Summarize `order` against `reference_price`.
    ///
    /// avg is notional / filled qty (4 dp), slippage is signed by side
    /// (2 dp); status is rejected without fills, filled once done, otherwise
    /// partial.
    pub fn from_order(order: &Order, reference_price: f64) -> Self {
        let qty = order.filled_qty();
        let notional: f64 = order.fills.iter().map(|f| f.qty * f.price).sum();
        let avg = if qty > 0.0 { notional / qty } else { 0.0 };
        let side = order.request.side.sign();
        let slippage = if avg > 0.0 && reference_price > 0.0 {
            (avg - reference_price) / reference_price * 1e4 * side
        } else {
            0.0
        };
        let status = if qty == 0.0 {
            ExecStatus::Rejected
        } else if order.done() {
            ExecStatus::Filled
        } else {
            ExecStatus::Partial
        };
        Self {
            order_id: order.id.clone(),
            submitted_at: order.submitted_at,
            fills: order.fills.clone(),
            avg_price: round_to(avg, 4),
            slippage_bps: round_to(slippage, 2),
            status,
            done: order.done(),
        }
    }
}

pub fn round_to(x: f64, dp: i32) -> f64 {
    let m = 10f64.powi(dp);
    (x * m).round() / m
}

/// Order venue capability.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit(&self, order: SubmitOrder) -> Result<String, BrokerError>;
    /// Advance the order by one fill step and report it.
    async fn poll(&self, order_id: &str) -> Result<ExecReport, BrokerError>;
    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError>;
}
