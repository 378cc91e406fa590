//! In-process simulated venue.
//!
//! Quotes oscillate around the reference price with a size-proportional
//! impact term and a little seeded noise. Each poll fills one chunk of the
//! order while it is eligible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::execution::broker::{round_to, Broker, BrokerError, ExecReport};
use crate::execution::order::{apply_event, Event, Order, OrderState, SubmitOrder};
use crate::logging::{log, log_fallback, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::types::{Fill, Side};

pub const VENUE: &str = "SIM";
const CHUNK_FRACTION: f64 = 0.2;
const IMPACT_PER_10K: f64 = 0.08;
const NOISE_SPAN: f64 = 0.06;

pub struct SimMarket {
    orders: Mutex<HashMap<String, Order>>,
    rng: Mutex<StdRng>,
    next_id: AtomicU64,
    reference_price: f64,
}

impl Default for SimMarket {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimMarket {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic noise for tests and replays.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            next_id: AtomicU64::new(1),
            reference_price: 150.0,
        }
    }

    pub fn with_reference_price(mut self, price: f64) -> Self {
        self.reference_price = price;
        self
    }

    pub fn reference_price(&self) -> f64 {
        self.reference_price
    }

    pub fn quote(&self, side: Side, qty: f64, now_ms: u64) -> f64 {
        let base = self.reference_price + (now_ms as f64 / 2000.0).sin();
        let impact = qty / 10_000.0 * IMPACT_PER_10K * side.sign();
        let noise = (locked(&self.rng).gen::<f64>() - 0.5) * NOISE_SPAN;
        round_to(base + impact + noise, 4)
    }

    pub fn submit_at(&self, request: SubmitOrder, now_ms: u64) -> Result<String, BrokerError> {
        if !request.qty.is_finite() || request.qty <= 0.0 {
            return Err(BrokerError::InvalidQuantity(request.qty));
        }
        let id = format!("SIM-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        log(
            Level::Info,
            Domain::Exec,
            "order_submitted",
            obj(&[
                ("order_id", v_str(&id)),
                ("asset", v_str(&request.asset)),
                ("side", v_str(request.side.as_str())),
                ("qty", v_num(request.qty)),
                ("type", v_str(request.order_type.as_str())),
            ]),
        );
        locked(&self.orders).insert(id.clone(), Order::new(id.clone(), request, now_ms));
        Ok(id)
    }

    /// One fill step at `now_ms`. Finished orders just report.
    pub fn poll_at(&self, order_id: &str, now_ms: u64) -> Result<ExecReport, BrokerError> {
        let mut orders = locked(&self.orders);
        let order = orders.get_mut(order_id).ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        if order.done() {
            return Ok(ExecReport::from_order(order, self.reference_price));
        }

        let chunk = (order.request.qty * CHUNK_FRACTION).floor().max(1.0).min(order.remaining());
        if order.request.in_window(now_ms) && chunk > 0.0 {
            let price = self.quote(order.request.side, order.request.qty, now_ms);
            if order.request.accepts_price(price) {
                let timestamp = order.fills.last().map(|f| f.timestamp.max(now_ms)).unwrap_or(now_ms);
                let fill = Fill { qty: chunk, price, timestamp, venue: VENUE.to_string() };
                if let Err(e) = apply_event(order, Event::Fill(fill)) {
                    log_fallback(Domain::Exec, "sim_fill", &e.to_string());
                }
            }
        }
        if !order.done() && order.request.window_elapsed(now_ms) {
            if let Err(e) = apply_event(order, Event::Expire) {
                log_fallback(Domain::Exec, "sim_expire", &e.to_string());
            }
        }
        Ok(ExecReport::from_order(order, self.reference_price))
    }

    pub fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut orders = locked(&self.orders);
        let order = orders.get_mut(order_id).ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        apply_event(order, Event::Cancel).map_err(|e| {
            log_fallback(Domain::Exec, "sim_cancel", &e.to_string());
            BrokerError::OrderNotFound(order_id.to_string())
        })
    }

    pub fn state_of(&self, order_id: &str) -> Option<OrderState> {
        locked(&self.orders).get(order_id).map(|o| o.state)
    }
}

#[async_trait]
impl Broker for SimMarket {
    async fn submit(&self, order: SubmitOrder) -> Result<String, BrokerError> {
        self.submit_at(order, ts_epoch_ms())
    }

    async fn poll(&self, order_id: &str) -> Result<ExecReport, BrokerError> {
        self.poll_at(order_id, ts_epoch_ms())
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        self.cancel_order(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecStatus, OrderType};

    fn market_order(qty: f64) -> SubmitOrder {
        SubmitOrder {
            asset: "AAPL".into(),
            side: Side::Buy,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            start_ms: None,
            end_ms: None,
        }
    }

    #[test]
    fn test_market_order_fills_in_chunks() {
        let sim = SimMarket::with_seed(7);
        let id = sim.submit_at(market_order(100.0), 0).unwrap();
        let mut report = sim.poll_at(&id, 1).unwrap();
        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.fills[0].qty, 20.0);
        assert_eq!(report.status, ExecStatus::Partial);
        for t in 2..10 {
            report = sim.poll_at(&id, t).unwrap();
        }
        assert_eq!(report.fills.len(), 5);
        assert_eq!(report.filled_qty(), 100.0);
        assert_eq!(report.status, ExecStatus::Filled);
        assert!(report.done);
        assert!(report.fills.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        // avg within the oscillator, impact and noise band
        assert!((report.avg_price - 150.0).abs() < 1.05);
    }

    #[test]
    fn test_small_orders_fill_at_least_one_unit() {
        let sim = SimMarket::with_seed(1);
        let id = sim.submit_at(market_order(3.0), 0).unwrap();
        let r = sim.poll_at(&id, 1).unwrap();
        assert_eq!(r.fills[0].qty, 1.0);
    }

    #[test]
    fn test_unreachable_limit_never_fills() {
        let sim = SimMarket::with_seed(3);
        let mut req = market_order(10.0);
        req.order_type = OrderType::Limit;
        req.limit_price = Some(100.0);
        let id = sim.submit_at(req, 0).unwrap();
        for t in 0..20 {
            let r = sim.poll_at(&id, t * 1000).unwrap();
            assert!(r.fills.is_empty());
            assert_eq!(r.status, ExecStatus::Rejected);
            assert!(!r.done);
        }
    }

    #[test]
    fn test_window_expiry() {
        let sim = SimMarket::with_seed(5);
        let mut req = market_order(100.0);
        req.order_type = OrderType::Twap;
        req.start_ms = Some(1_000);
        req.end_ms = Some(2_000);
        let id = sim.submit_at(req, 1_000).unwrap();
        let r = sim.poll_at(&id, 1_500).unwrap();
        assert_eq!(r.filled_qty(), 20.0);
        let r = sim.poll_at(&id, 2_500).unwrap();
        // outside the window: no fill, remainder abandoned
        assert_eq!(r.filled_qty(), 20.0);
        assert!(r.done);
        assert_eq!(r.status, ExecStatus::Filled);
    }

    #[test]
    fn test_unreachable_limit_expires_with_its_window() {
        let sim = SimMarket::with_seed(3);
        let mut req = market_order(10.0);
        req.order_type = OrderType::Limit;
        req.limit_price = Some(100.0);
        req.end_ms = Some(2_000);
        let id = sim.submit_at(req, 0).unwrap();
        let r = sim.poll_at(&id, 1_000).unwrap();
        assert!(!r.done);
        let r = sim.poll_at(&id, 2_001).unwrap();
        assert!(r.fills.is_empty());
        assert!(r.done);
        assert_eq!(r.status, ExecStatus::Rejected);
        assert_eq!(sim.state_of(&id), Some(OrderState::Rejected));
    }

    #[test]
    fn test_no_fills_after_open_start_window_ends() {
        let sim = SimMarket::with_seed(5);
        let mut req = market_order(100.0);
        req.end_ms = Some(2_000);
        let id = sim.submit_at(req, 0).unwrap();
        assert_eq!(sim.poll_at(&id, 1_000).unwrap().filled_qty(), 20.0);
        let r = sim.poll_at(&id, 3_000).unwrap();
        assert_eq!(r.filled_qty(), 20.0);
        assert!(r.done);
    }

    #[test]
    fn test_cancel_then_poll_returns_last_report() {
        let sim = SimMarket::with_seed(9);
        let id = sim.submit_at(market_order(100.0), 0).unwrap();
        let first = sim.poll_at(&id, 1).unwrap();
        sim.cancel_order(&id).unwrap();
        sim.cancel_order(&id).unwrap();
        assert_eq!(sim.state_of(&id), Some(OrderState::Cancelled));
        let after = sim.poll_at(&id, 2).unwrap();
        assert_eq!(after.fills, first.fills);
        assert!(after.done);
    }

    #[test]
    fn test_unknown_order_and_bad_qty() {
        let sim = SimMarket::with_seed(0);
        assert_eq!(sim.poll_at("nope", 0), Err(BrokerError::OrderNotFound("nope".into())));
        assert!(sim.cancel_order("nope").is_err());
        assert_eq!(sim.submit_at(market_order(0.0), 0), Err(BrokerError::InvalidQuantity(0.0)));
    }
}
