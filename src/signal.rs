//! Ensemble signal scoring.
//!
//! Indicator snapshots become normalized features, an interpretable rule
//! score and a weighted score. The decision takes the weighted score unless
//! the rule score is decisive.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::advisory::{Advice, Advisor, Bias, MarketOpinion};
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::config::{weights_or_default, EnsembleWeights, SignalConfig, WeightSource};
use crate::drift::DriftMonitor;
use crate::indicators::{IndicatorWindow, SignalSnapshot};
use crate::logging::{log_drift, log_gated, log_signal, Domain};
use crate::safety::SafetySwitch;
use crate::types::{ActionType, EnsembleFeatures, Observation, SignalAction, SignalDiagnostics};

// =============================================================================
// Scoring
// =============================================================================

pub fn build_features(snap: &SignalSnapshot, orderbook_imbalance: f64) -> EnsembleFeatures {
    let price = snap.price;
    // momentum orientation: RSI above 50 leans bullish
    let rsi_feature = ((snap.rsi14 - 50.0) / 50.0).clamp(-1.0, 1.0);
    let macd_feature = if price > 0.0 { (snap.macd.diff() / (price * 0.01)).tanh() } else { 0.0 };
    let ema_cross = (((snap.ema9 - snap.ema21) / price.max(1e-9)) * 10.0).tanh();
    let vwap_feature = match snap.vwap {
        Some(v) if v.is_finite() && price > 0.0 => ((price - v) / (price * 0.01)).clamp(-1.0, 1.0),
        _ => 0.0,
    };

    EnsembleFeatures {
        rsi14: snap.rsi14,
        macd: snap.macd.macd,
        macd_signal: snap.macd.signal,
        ema9: snap.ema9,
        ema21: snap.ema21,
        volume: snap.volume,
        volume_z: snap.volume_z,
        vwap: snap.vwap.unwrap_or(price),
        rsi_feature,
        macd_feature,
        bb_pos: snap.bands.position(price),
        ema_cross,
        vwap_feature,
        volume_feature: (snap.volume_z / 3.0).clamp(-1.0, 1.0),
        orderbook_imbalance: orderbook_imbalance.clamp(-1.0, 1.0),
    }
}

/// Integer-stepped technical score and the reasons behind each step.
pub fn rule_score(snap: &SignalSnapshot) -> (f64, Vec<&'static str>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();
    let price = snap.price;

    if snap.rsi14 < 30.0 {
        score += 1.0;
        reasons.push("RSI Oversold");
    } else if snap.rsi14 > 70.0 {
        score -= 1.0;
        reasons.push("RSI Overbought");
    }

    if let Some(signal) = snap.macd.signal {
        if snap.macd.macd > signal {
            score += 1.0;
            reasons.push("MACD Bullish");
        } else if snap.macd.macd < signal {
            score -= 1.0;
            reasons.push("MACD Bearish");
        }
    }

    if snap.ema12 > snap.ema26 {
        score += 1.0;
        reasons.push("EMA Bullish Cross");
    } else if snap.ema12 < snap.ema26 {
        score -= 1.0;
        reasons.push("EMA Bearish Cross");
    }

    if price > snap.bands.upper {
        score -= 1.0;
        reasons.push("Above Bollinger Upper Band");
    } else if price < snap.bands.lower {
        score += 1.0;
        reasons.push("Below Bollinger Lower Band");
    }

    if let Some(vwap) = snap.vwap {
        if price > vwap {
            score += 0.5;
            reasons.push("Above VWAP");
        } else {
            score -= 0.5;
            reasons.push("Below VWAP");
        }
    }

    (score, reasons)
}

/// Σ weight·feature over the seven deterministic features, clamped to [-1, 1].
/// Bollinger position enters inverted: below the middle band is bullish.
pub fn deterministic_score(f: &EnsembleFeatures, w: &EnsembleWeights) -> f64 {
    let sum = w.rsi * f.rsi_feature
        + w.macd * f.macd_feature
        + w.bb * -f.bb_pos
        + w.ema * f.ema_cross
        + w.vol * f.volume_feature
        + w.vwap * f.vwap_feature
        + w.obi * f.orderbook_imbalance;
    sum.clamp(-1.0, 1.0)
}

pub fn decide(score: f64, rule: f64, cfg: &SignalConfig) -> ActionType {
    if rule >= cfg.rule_override {
        return ActionType::Buy;
    }
    if rule <= -cfg.rule_override {
        return ActionType::Sell;
    }
    if score > cfg.buy_threshold {
        ActionType::Buy
    } else if score < cfg.sell_threshold {
        ActionType::Sell
    } else {
        ActionType::Hold
    }
}

pub fn confidence(score: f64, rule: f64, action: ActionType, opinion: Option<&MarketOpinion>) -> f64 {
    let base = score.abs().max(rule.abs() / 5.0).min(1.0);
    let Some(op) = opinion else {
        return base;
    };
    let agrees = match (op.bias, action) {
        (Bias::Bullish, ActionType::Buy) | (Bias::Bearish, ActionType::Sell) => op.confidence > 0.5,
        _ => false,
    };
    let neutral_low = op.bias == Bias::Neutral && base < 0.4;
    if agrees || neutral_low {
        ((base + op.confidence) / 2.0).clamp(0.0, 1.0)
    } else {
        base
    }
}

// =============================================================================
// Agent
// =============================================================================

struct AssetState {
    window: IndicatorWindow,
    orderbook_imbalance: f64,
    drift: DriftMonitor,
}

pub struct SignalAgent {
    cfg: SignalConfig,
    assets: HashMap<String, AssetState>,
    weights: Arc<dyn WeightSource>,
    advisor: Arc<dyn Advisor>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
}

impl SignalAgent {
    pub fn new(
        cfg: SignalConfig,
        weights: Arc<dyn WeightSource>,
        advisor: Arc<dyn Advisor>,
        safety: Arc<SafetySwitch>,
        bus: Arc<Bus>,
    ) -> Self {
        Self { cfg, assets: HashMap::new(), weights, advisor, safety, bus }
    }

    pub fn id(&self) -> &str {
        &self.cfg.agent_id
    }

    pub fn history_len(&self, asset: &str) -> usize {
        self.assets.get(asset).map(|s| s.window.len()).unwrap_or(0)
    }

    /// Append an observation to its asset window. Ticks without a price are
    /// ignored.
    pub fn on_observation(&mut self, obs: &Observation) {
        if self.safety.blocked(&self.cfg.agent_id) {
            log_gated(Domain::Signal, &self.cfg.agent_id, "observation");
            return;
        }
        let Some(price) = obs.price() else {
            return;
        };
        let cfg = &self.cfg;
        let state = self.assets.entry(obs.asset.clone()).or_insert_with(|| AssetState {
            window: IndicatorWindow::new(cfg.window_cap),
            orderbook_imbalance: 0.0,
            drift: DriftMonitor::new(cfg.drift_window, cfg.drift_threshold),
        });
        let close = obs.metric("close").unwrap_or(price);
        state.window.push_tick(close, obs.metric("high"), obs.metric("low"), obs.metric("volume"));

        if let (Some(bid), Some(ask)) = (obs.metric("bid_size"), obs.metric("ask_size")) {
            if bid + ask > 0.0 {
                state.orderbook_imbalance = ((bid - ask) / (bid + ask)).clamp(-1.0, 1.0);
            }
        }
    }

    /// Score the current window for `asset`; publishes and returns the action
    /// unless it is a hold or history is insufficient.
    pub async fn generate_action(&mut self, asset: &str) -> Option<SignalAction> {
        if self.safety.blocked(&self.cfg.agent_id) {
            log_gated(Domain::Signal, &self.cfg.agent_id, "generate");
            return None;
        }
        let (snap, obi) = {
            let state = self.assets.get(asset)?;
            (state.window.signal_snapshot(self.cfg.min_history)?, state.orderbook_imbalance)
        };

        let features = build_features(&snap, obi);
        let (rule, reasons) = rule_score(&snap);
        let weights = weights_or_default(self.weights.as_ref(), &self.cfg.weights).await;
        let det = deterministic_score(&features, &weights);

        let indicators = json!({
            "rsi": snap.rsi14,
            "macd": snap.macd.macd,
            "macdSignal": snap.macd.signal,
            "ema12": snap.ema12,
            "ema26": snap.ema26,
            "bollinger": { "upper": snap.bands.upper, "lower": snap.bands.lower },
            "vwap": snap.vwap,
            "price": snap.price,
        });
        let opinion = match self.advisor.classify_signal(asset, &indicators).await {
            Advice::Given(op) => Some(op),
            Advice::Neutral | Advice::Unavailable => None,
        };
        let meta = opinion.as_ref().map(MarketOpinion::score).unwrap_or(0.0);

        let score = (det + weights.llm * meta).clamp(-1.0, 1.0);
        let action_type = decide(score, rule, &self.cfg);
        if action_type == ActionType::Hold {
            return None;
        }

        if let Some(state) = self.assets.get_mut(asset) {
            let report = state.drift.update(snap.rsi14);
            if report.drifted {
                log_drift(&self.cfg.agent_id, asset, "rsi14", report.value, report.deviation);
            }
        }

        let mut notes = reasons.join(", ");
        if let Some(op) = &opinion {
            notes.push_str(&format!(" | LLM: {}", op.reasoning));
        }
        if notes.is_empty() {
            notes = format!("score={:.3} rsi={:.1}", score, snap.rsi14);
        }

        let action = SignalAction {
            action_type,
            asset: asset.to_string(),
            size: self.cfg.order_size,
            confidence: confidence(score, rule, action_type, opinion.as_ref()),
            notes,
        };
        log_signal(&self.cfg.agent_id, asset, action_type.as_str(), score, rule, &action.notes);

        let id = self.cfg.agent_id.as_str();
        self.bus.publish(id, Role::Action, Topic::SignalActions, Payload::Signal(action.clone()));
        let diagnostics = SignalDiagnostics {
            asset: asset.to_string(),
            score,
            deterministic_score: det,
            meta_score: meta,
            rule_score: rule,
            weights,
            features,
        };
        self.bus.publish(id, Role::Meta, Topic::SignalDiagnostics, Payload::Diagnostics(diagnostics));
        Some(action)
    }

    pub async fn handle(&mut self, obs: &Observation) -> Option<SignalAction> {
        self.on_observation(obs);
        self.generate_action(&obs.asset).await
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            if let Payload::Observation(obs) = env.payload {
                self.handle(&obs).await;
            }
        }
    }
}
