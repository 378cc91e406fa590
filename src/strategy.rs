//! Consensus fusion of signal, sentiment and trend into trade plans.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::advisory::Advisor;
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::config::StrategyConfig;
use crate::logging::{log, log_gated, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::safety::SafetySwitch;
use crate::types::{
    ActionType, ExecutionHints, SentimentScore, Side, SignalAction, TradePlan, TrendDirection, TrendState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub buy_score: f64,
    pub sell_score: f64,
    pub total_weight: f64,
    pub reasons: Vec<String>,
}

impl Consensus {
    pub fn net(&self) -> f64 {
        self.buy_score - self.sell_score
    }

    pub fn confidence(&self) -> f64 {
        self.net().abs() / if self.total_weight > 0.0 { self.total_weight } else { 1.0 }
    }

    /// Buy above `threshold`, sell below its negation, otherwise nothing.
    pub fn direction(&self, threshold: f64) -> Option<Side> {
        let net = self.net();
        if net > threshold {
            Some(Side::Buy)
        } else if net < -threshold {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Signal counts double, sentiment and trend once each.
pub fn consensus(signal: &SignalAction, sentiment: &SentimentScore, trend: &TrendState) -> Consensus {
    let mut c = Consensus { buy_score: 0.0, sell_score: 0.0, total_weight: 0.0, reasons: Vec::new() };

    match signal.action_type {
        ActionType::Buy => {
            c.buy_score += signal.confidence * 2.0;
            c.total_weight += 2.0;
            c.reasons.push(format!("Signal: Buy (confidence {:.2})", signal.confidence));
        }
        ActionType::Sell => {
            c.sell_score += signal.confidence * 2.0;
            c.total_weight += 2.0;
            c.reasons.push(format!("Signal: Sell (confidence {:.2})", signal.confidence));
        }
        ActionType::Hold => {}
    }

    if sentiment.score > 0.0 {
        c.buy_score += sentiment.score;
        c.reasons.push(format!("Sentiment: Bullish ({:.2})", sentiment.score));
    } else if sentiment.score < 0.0 {
        c.sell_score += sentiment.score.abs();
        c.reasons.push(format!("Sentiment: Bearish ({:.2})", sentiment.score));
    }
    c.total_weight += 1.0;

    match trend.direction {
        TrendDirection::Bullish => {
            c.buy_score += 1.0;
            c.reasons.push("Trend: Bullish".to_string());
        }
        TrendDirection::Bearish => {
            c.sell_score += 1.0;
            c.reasons.push("Trend: Bearish".to_string());
        }
        TrendDirection::Neutral => {}
    }
    c.total_weight += 1.0;
    c
}

/// Latest inputs per asset; last write wins.
#[derive(Default)]
struct Inputs {
    signal: Option<SignalAction>,
    sentiment: Option<SentimentScore>,
    trend: Option<TrendState>,
}

pub struct StrategyAgent {
    cfg: StrategyConfig,
    inputs: HashMap<String, Inputs>,
    advisor: Arc<dyn Advisor>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
}

impl StrategyAgent {
    pub fn new(cfg: StrategyConfig, advisor: Arc<dyn Advisor>, safety: Arc<SafetySwitch>, bus: Arc<Bus>) -> Self {
        Self { cfg, inputs: HashMap::new(), advisor, safety, bus }
    }

    pub fn on_sentiment(&mut self, s: SentimentScore) {
        if self.safety.blocked(&self.cfg.agent_id) {
            return;
        }
        let asset = s.asset.clone();
        self.inputs.entry(asset).or_default().sentiment = Some(s);
    }

    pub fn on_trend(&mut self, t: TrendState) {
        if self.safety.blocked(&self.cfg.agent_id) {
            return;
        }
        let asset = t.asset.clone();
        self.inputs.entry(asset).or_default().trend = Some(t);
    }

    pub async fn on_signal(&mut self, s: SignalAction) -> Option<TradePlan> {
        if self.safety.blocked(&self.cfg.agent_id) {
            log_gated(Domain::Strategy, &self.cfg.agent_id, "signal");
            return None;
        }
        let asset = s.asset.clone();
        self.inputs.entry(asset.clone()).or_default().signal = Some(s);
        self.generate_plan(&asset).await
    }

    async fn generate_plan(&self, asset: &str) -> Option<TradePlan> {
        let inputs = self.inputs.get(asset)?;
        let (Some(signal), Some(sentiment), Some(trend)) = (&inputs.signal, &inputs.sentiment, &inputs.trend) else {
            return None;
        };

        let c = consensus(signal, sentiment, trend);
        let direction = c.direction(self.cfg.net_threshold)?;
        let mut plan = TradePlan {
            asset: asset.to_string(),
            direction,
            size: self.cfg.order_size,
            confidence: c.confidence(),
            sources: c.reasons.clone(),
            timestamp: ts_epoch_ms(),
            explanation: None,
            hints: ExecutionHints::default(),
        };
        plan.explanation = self.advisor.explain_trade(&plan).await.text();

        log(
            Level::Info,
            Domain::Strategy,
            "plan",
            obj(&[
                ("asset", v_str(asset)),
                ("direction", v_str(direction.as_str())),
                ("net", v_num(c.net())),
                ("confidence", v_num(plan.confidence)),
            ]),
        );
        self.bus.publish(&self.cfg.agent_id, Role::Action, Topic::TradePlans, Payload::Plan(plan.clone()));
        Some(plan)
    }

    pub async fn run(
        mut self,
        mut signals: UnboundedReceiver<Envelope>,
        mut sentiment: UnboundedReceiver<Envelope>,
        mut trends: UnboundedReceiver<Envelope>,
    ) {
        loop {
            tokio::select! {
                Some(env) = signals.recv() => {
                    if let Payload::Signal(s) = env.payload {
                        self.on_signal(s).await;
                    }
                }
                Some(env) = sentiment.recv() => {
                    if let Payload::Sentiment(s) = env.payload {
                        self.on_sentiment(s);
                    }
                }
                Some(env) = trends.recv() => {
                    if let Payload::Trend(t) = env.payload {
                        self.on_trend(t);
                    }
                }
                else => break,
            }
        }
    }
}
