//! Turns approved trades into broker orders and reports their outcome.
//!
//! One task per approved trade: submit, poll until the order is done or the
//! poll timeout passes, then publish the execution result, an optional
//! anomaly note and the reward.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::advisory::Advisor;
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::config::ExecConfig;
use crate::execution::broker::{Broker, BrokerError, ExecReport};
use crate::execution::order::SubmitOrder;
use crate::execution::quality::execution_quality;
use crate::logging::{log, log_gated, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::safety::{Compliance, SafetySwitch};
use crate::types::{ApprovedTrade, ExecutionResult, OpsNote, OrderType, Reward};

/// Explicit hint wins; otherwise confident trades go to market and the rest
/// are sliced over a time window.
pub fn choose_order(trade: &ApprovedTrade, cfg: &ExecConfig, now_ms: u64) -> SubmitOrder {
    let plan = &trade.plan;
    let order_type = plan.hints.order_type.unwrap_or(if plan.confidence > cfg.market_confidence {
        OrderType::Market
    } else {
        OrderType::Twap
    });
    let (start_ms, end_ms) = if order_type.is_windowed() {
        let duration = plan.hints.duration_sec.unwrap_or(cfg.default_duration_sec);
        (Some(now_ms), Some(now_ms.saturating_add(duration.saturating_mul(1000))))
    } else {
        (None, None)
    };
    SubmitOrder {
        asset: plan.asset.clone(),
        side: plan.direction,
        qty: plan.size,
        order_type,
        limit_price: plan.hints.limit_price,
        start_ms,
        end_ms,
    }
}

/// Signed markout of the average fill against the reference price.
pub fn markout(result: &ExecutionResult, reference_price: f64) -> f64 {
    let qty = result.filled_qty();
    if qty <= 0.0 {
        return 0.0;
    }
    result.direction.sign() * (reference_price - result.avg_price) * qty
}

pub struct ExecutionEngine {
    cfg: ExecConfig,
    broker: Arc<dyn Broker>,
    compliance: Arc<dyn Compliance>,
    advisor: Arc<dyn Advisor>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
}

impl ExecutionEngine {
    pub fn new(
        cfg: ExecConfig,
        broker: Arc<dyn Broker>,
        compliance: Arc<dyn Compliance>,
        advisor: Arc<dyn Advisor>,
        safety: Arc<SafetySwitch>,
        bus: Arc<Bus>,
    ) -> Self {
        Self { cfg, broker, compliance, advisor, safety, bus }
    }

    pub fn id(&self) -> &str {
        &self.cfg.agent_id
    }

    async fn drive(&self, order_id: &str) -> Result<ExecReport, BrokerError> {
        let started = Instant::now();
        let mut report = self.broker.poll(order_id).await?;
        while !report.done && started.elapsed() < self.cfg.poll_timeout {
            tokio::time::sleep(self.cfg.poll_interval).await;
            report = self.broker.poll(order_id).await?;
        }
        if !report.done {
            log(
                Level::Warn,
                Domain::Exec,
                "poll_timeout",
                obj(&[
                    ("order_id", v_str(order_id)),
                    ("filled", v_num(report.filled_qty())),
                    ("status", v_str(report.status.as_str())),
                ]),
            );
            self.broker.cancel(order_id).await?;
        }
        Ok(report)
    }

    pub async fn execute(&self, trade: ApprovedTrade) -> Result<Option<ExecutionResult>, BrokerError> {
        if self.safety.blocked(&self.cfg.agent_id) {
            log_gated(Domain::Exec, &self.cfg.agent_id, "approved_trade");
            return Ok(None);
        }
        let asset = trade.plan.asset.clone();
        if !self.compliance.is_asset_allowed(&asset) || !self.compliance.is_trade_legal(&self.cfg.agent_id, &asset) {
            log(Level::Warn, Domain::Exec, "compliance_block", obj(&[("asset", v_str(&asset))]));
            return Ok(None);
        }

        let request = choose_order(&trade, &self.cfg, ts_epoch_ms());
        let order_type = request.order_type;
        let order_id = self.broker.submit(request).await?;
        let report = self.drive(&order_id).await?;

        let executed_at = ts_epoch_ms();
        let latency_ms = executed_at.saturating_sub(trade.approval_time);
        let eqs = execution_quality(report.slippage_bps, report.fills.len(), latency_ms);
        let result = ExecutionResult {
            asset,
            direction: trade.plan.direction,
            size: trade.plan.size,
            avg_price: report.avg_price,
            slippage_bps: report.slippage_bps,
            status: report.status,
            fills: report.fills,
            executed_at,
            latency_ms,
            trade_id: order_id,
            eqs,
        };
        log(
            Level::Info,
            Domain::Exec,
            "executed",
            obj(&[
                ("trade_id", v_str(&result.trade_id)),
                ("asset", v_str(&result.asset)),
                ("type", v_str(order_type.as_str())),
                ("status", v_str(result.status.as_str())),
                ("avg_price", v_num(result.avg_price)),
                ("slippage_bps", v_num(result.slippage_bps)),
                ("eqs", v_num(eqs)),
            ]),
        );
        self.bus.publish(&self.cfg.agent_id, Role::Action, Topic::ExecutionResults, Payload::Execution(result.clone()));

        if result.slippage_bps > self.cfg.anomaly_slippage_bps {
            if let Some(note) = self.advisor.anomalous_fill_note(&result, order_type.as_str()).await.text() {
                let note = OpsNote { component: Some("execution".to_string()), asset: Some(result.asset.clone()), note };
                self.bus.publish(&self.cfg.agent_id, Role::Meta, Topic::OpsNotes, Payload::Note(note));
            }
        }

        let mut metrics = BTreeMap::new();
        metrics.insert("slippageBps".to_string(), result.slippage_bps);
        metrics.insert("latency".to_string(), result.latency_ms as f64);
        metrics.insert("eqs".to_string(), eqs);
        let reward = Reward {
            agent: self.cfg.reward_agent.clone(),
            trade_id: result.trade_id.clone(),
            profit_loss: markout(&result, self.cfg.reference_price),
            metrics,
        };
        self.bus.publish(&self.cfg.agent_id, Role::Feedback, Topic::Rewards, Payload::Reward(reward));
        Ok(Some(result))
    }

    /// Each approved trade runs on its own task so a slow order never holds
    /// up the next one.
    pub async fn run(self: Arc<Self>, mut rx: UnboundedReceiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            if let Payload::Approved(trade) = env.payload {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = engine.execute(trade).await {
                        log(Level::Error, Domain::Exec, "broker_error", obj(&[("error", v_str(&e.to_string()))]));
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::advisory::NoAdvisor;
    use crate::execution::sim::SimMarket;
    use crate::safety::RestrictedList;
    use crate::types::{ExecStatus, ExecutionHints, Side, TradePlan};

    fn trade(asset: &str, confidence: f64, hints: ExecutionHints) -> ApprovedTrade {
        ApprovedTrade {
            plan: TradePlan {
                asset: asset.into(),
                direction: Side::Buy,
                size: 100.0,
                confidence,
                sources: vec![],
                timestamp: 0,
                explanation: None,
                hints,
            },
            approved_by: "risk-agent".into(),
            approval_time: ts_epoch_ms(),
        }
    }

    fn fast_cfg() -> ExecConfig {
        ExecConfig {
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(300),
            default_duration_sec: 5,
            ..ExecConfig::default()
        }
    }

    fn engine(bus: Arc<Bus>, broker: Arc<SimMarket>) -> ExecutionEngine {
        ExecutionEngine::new(
            fast_cfg(),
            broker,
            Arc::new(RestrictedList::default()),
            Arc::new(NoAdvisor),
            Arc::new(SafetySwitch::new()),
            bus,
        )
    }

    #[test]
    fn test_choose_order() {
        let cfg = ExecConfig::default();
        let o = choose_order(&trade("AAPL", 0.8, ExecutionHints::default()), &cfg, 1_000);
        assert_eq!(o.order_type, OrderType::Market);
        assert_eq!((o.start_ms, o.end_ms), (None, None));

        let o = choose_order(&trade("AAPL", 0.7, ExecutionHints::default()), &cfg, 1_000);
        assert_eq!(o.order_type, OrderType::Twap);
        assert_eq!((o.start_ms, o.end_ms), (Some(1_000), Some(21_000)));

        let hints = ExecutionHints { order_type: Some(OrderType::Vwap), limit_price: None, duration_sec: Some(3) };
        let o = choose_order(&trade("AAPL", 0.9, hints), &cfg, 0);
        assert_eq!(o.order_type, OrderType::Vwap);
        assert_eq!(o.end_ms, Some(3_000));
    }

    #[test]
    fn test_huge_duration_hint_saturates() {
        let cfg = ExecConfig::default();
        let hints = ExecutionHints { order_type: Some(OrderType::Twap), limit_price: None, duration_sec: Some(u64::MAX) };
        let o = choose_order(&trade("AAPL", 0.9, hints), &cfg, 1_000);
        assert_eq!((o.start_ms, o.end_ms), (Some(1_000), Some(u64::MAX)));
        assert!(o.in_window(u64::MAX));
        assert!(!o.window_elapsed(u64::MAX));
    }

    #[tokio::test]
    async fn test_market_trade_fills_and_rewards() {
        let bus = Arc::new(Bus::new());
        let mut results = bus.subscribe(Topic::ExecutionResults);
        let mut rewards = bus.subscribe(Topic::Rewards);
        let sim = Arc::new(SimMarket::with_seed(11));
        let engine = engine(bus.clone(), sim);

        let result = engine.execute(trade("AAPL", 0.9, ExecutionHints::default())).await.unwrap().unwrap();
        assert_eq!(result.status, ExecStatus::Filled);
        assert_eq!(result.filled_qty(), 100.0);
        assert_eq!(result.fills.len(), 5);
        assert!(result.eqs > 0.0 && result.eqs <= 1.0);
        assert!(result.trade_id.starts_with("SIM-"));
        let expected = (result.avg_price - 150.0) / 150.0 * 1e4;
        assert!((result.slippage_bps - expected).abs() < 0.01);

        assert!(matches!(results.try_recv().unwrap().payload, Payload::Execution(_)));
        match rewards.try_recv().unwrap().payload {
            Payload::Reward(r) => {
                assert_eq!(r.agent, "strategy-agent");
                assert_eq!(r.trade_id, result.trade_id);
                assert!(r.metrics.contains_key("eqs"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_limit_is_rejected_after_timeout() {
        let bus = Arc::new(Bus::new());
        let sim = Arc::new(SimMarket::with_seed(2));
        let engine = engine(bus, sim.clone());
        let hints = ExecutionHints { order_type: Some(OrderType::Limit), limit_price: Some(1.0), duration_sec: None };
        let result = engine.execute(trade("AAPL", 0.9, hints)).await.unwrap().unwrap();
        assert_eq!(result.status, ExecStatus::Rejected);
        assert!(result.fills.is_empty());
        assert_eq!(result.eqs, 0.0);
        assert_eq!(
            sim.state_of(&result.trade_id),
            Some(crate::execution::order::OrderState::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_restricted_asset_is_not_executed() {
        let bus = Arc::new(Bus::new());
        let mut results = bus.subscribe(Topic::ExecutionResults);
        let engine = engine(bus.clone(), Arc::new(SimMarket::with_seed(4)));
        assert!(engine.execute(trade("GME", 0.9, ExecutionHints::default())).await.unwrap().is_none());
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn test_markout_sign() {
        let mut r = ExecutionResult {
            asset: "AAPL".into(),
            direction: Side::Buy,
            size: 10.0,
            avg_price: 149.0,
            slippage_bps: 0.0,
            status: ExecStatus::Filled,
            fills: vec![crate::types::Fill { qty: 10.0, price: 149.0, timestamp: 0, venue: "SIM".into() }],
            executed_at: 0,
            latency_ms: 0,
            trade_id: "t".into(),
            eqs: 0.0,
        };
        assert_eq!(markout(&r, 150.0), 10.0);
        r.direction = Side::Sell;
        assert_eq!(markout(&r, 150.0), -10.0);
    }
}
