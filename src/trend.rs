//! Trend direction and market regime classification.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::advisory::{Advisor, RegimeContext};
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::config::TrendConfig;
use crate::indicators::{IndicatorWindow, TrendSnapshot};
use crate::logging::{log, log_gated, obj, v_num, v_str, Domain, Level};
use crate::safety::SafetySwitch;
use crate::types::{Observation, Regime, TrendDirection, TrendState};

/// Bullish when the short SMA leads and MACD is above its signal; bearish
/// when both are reversed. An unseeded signal line is neutral.
pub fn direction(snap: &TrendSnapshot) -> TrendDirection {
    let Some(signal) = snap.macd.signal else {
        return TrendDirection::Neutral;
    };
    if snap.sma_short > snap.sma_long && snap.macd.macd > signal {
        TrendDirection::Bullish
    } else if snap.sma_short < snap.sma_long && snap.macd.macd < signal {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    }
}

/// First match wins: trending, ranging, volatile, stable.
pub fn regime(adx: f64, choppiness: f64, atr: f64, cfg: &TrendConfig) -> Regime {
    if adx > cfg.adx_trending && choppiness < cfg.chop_trending {
        Regime::Trending
    } else if choppiness > cfg.chop_ranging {
        Regime::Ranging
    } else if atr > cfg.atr_volatile {
        Regime::Volatile
    } else {
        Regime::Stable
    }
}

fn direction_str(d: TrendDirection) -> &'static str {
    match d {
        TrendDirection::Bullish => "bullish",
        TrendDirection::Bearish => "bearish",
        TrendDirection::Neutral => "neutral",
    }
}

pub struct TrendAgent {
    cfg: TrendConfig,
    windows: HashMap<String, IndicatorWindow>,
    advisor: Arc<dyn Advisor>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
}

impl TrendAgent {
    pub fn new(cfg: TrendConfig, advisor: Arc<dyn Advisor>, safety: Arc<SafetySwitch>, bus: Arc<Bus>) -> Self {
        Self { cfg, windows: HashMap::new(), advisor, safety, bus }
    }

    /// Append a candle and, with enough history, publish the trend state.
    pub async fn on_candle(&mut self, obs: &Observation) -> Option<TrendState> {
        if self.safety.blocked(&self.cfg.agent_id) {
            log_gated(Domain::Trend, &self.cfg.agent_id, "candle");
            return None;
        }
        let close = obs.metric("close").or_else(|| obs.price())?;
        let cap = self.cfg.window_cap;
        let window = self.windows.entry(obs.asset.clone()).or_insert_with(|| IndicatorWindow::new(cap));
        window.push_tick(close, obs.metric("high"), obs.metric("low"), obs.metric("volume"));

        let snap = window.trend_snapshot(self.cfg.min_history, self.cfg.sma_short, self.cfg.sma_long)?;
        let dir = direction(&snap);
        let adx = snap.adx.unwrap_or(0.0);
        let atr = snap.atr.unwrap_or(0.0);
        let reg = regime(adx, snap.choppiness, atr, &self.cfg);

        let explanation = self
            .advisor
            .explain_regime(&RegimeContext {
                asset: &obs.asset,
                adx,
                atr,
                choppiness: snap.choppiness,
                trend: direction_str(dir),
            })
            .await
            .text();

        let state = TrendState {
            asset: obs.asset.clone(),
            sma_short: snap.sma_short,
            sma_long: snap.sma_long,
            macd: snap.macd.macd,
            signal: snap.macd.signal.unwrap_or(0.0),
            histogram: snap.macd.histogram().unwrap_or(0.0),
            direction: dir,
            regime: reg,
            adx,
            choppiness: snap.choppiness,
            atr,
            timestamp: obs.timestamp,
            explanation,
        };
        log(
            Level::Debug,
            Domain::Trend,
            "trend_state",
            obj(&[
                ("asset", v_str(&state.asset)),
                ("direction", v_str(direction_str(dir))),
                ("adx", v_num(adx)),
                ("choppiness", v_num(state.choppiness)),
            ]),
        );
        self.bus.publish(&self.cfg.agent_id, Role::Observation, Topic::Trend, Payload::Trend(state.clone()));
        Some(state)
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            if let Payload::Observation(obs) = env.payload {
                self.on_candle(&obs).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::NoAdvisor;
    use crate::indicators::MacdValue;

    fn snap(short: f64, long: f64, macd: f64, signal: Option<f64>) -> TrendSnapshot {
        TrendSnapshot {
            sma_short: short,
            sma_long: long,
            macd: MacdValue { macd, signal },
            adx: None,
            atr: None,
            choppiness: 50.0,
        }
    }

    #[test]
    fn test_direction_requires_agreement() {
        assert_eq!(direction(&snap(2.0, 1.0, 1.0, Some(0.5))), TrendDirection::Bullish);
        assert_eq!(direction(&snap(1.0, 2.0, 0.0, Some(0.5))), TrendDirection::Bearish);
        assert_eq!(direction(&snap(2.0, 1.0, 0.0, Some(0.5))), TrendDirection::Neutral);
        assert_eq!(direction(&snap(2.0, 1.0, 1.0, None)), TrendDirection::Neutral);
    }

    #[test]
    fn test_regime_priority() {
        let cfg = TrendConfig::default();
        assert_eq!(regime(30.0, 40.0, 5.0, &cfg), Regime::Trending);
        assert_eq!(regime(30.0, 65.0, 5.0, &cfg), Regime::Ranging);
        assert_eq!(regime(10.0, 55.0, 5.0, &cfg), Regime::Volatile);
        assert_eq!(regime(10.0, 55.0, 1.0, &cfg), Regime::Stable);
        assert_eq!(regime(25.0, 40.0, 1.0, &cfg), Regime::Stable);
    }

    #[tokio::test]
    async fn test_publishes_after_min_history() {
        let bus = Arc::new(Bus::new());
        let mut rx = bus.subscribe(Topic::Trend);
        let mut agent = TrendAgent::new(
            TrendConfig::default(),
            Arc::new(NoAdvisor),
            Arc::new(SafetySwitch::new()),
            bus.clone(),
        );
        for i in 0..25u64 {
            assert!(agent.on_candle(&Observation::new("AAPL", i, 100.0 + i as f64)).await.is_none());
        }
        let state = agent.on_candle(&Observation::new("AAPL", 25, 125.0)).await.unwrap();
        assert_eq!(state.timestamp, 25);
        assert_eq!(state.direction, TrendDirection::Neutral);
        assert!(state.explanation.is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_rising_series_is_bullish() {
        let bus = Arc::new(Bus::new());
        let mut agent = TrendAgent::new(
            TrendConfig::default(),
            Arc::new(NoAdvisor),
            Arc::new(SafetySwitch::new()),
            bus,
        );
        let mut last = None;
        for i in 0..40u64 {
            let price = 150.0 + 20.0 * (i as f64 / 39.0).powf(1.2);
            last = agent.on_candle(&Observation::new("AAPL", i, price)).await;
        }
        let state = last.unwrap();
        assert_eq!(state.direction, TrendDirection::Bullish);
        assert!(state.sma_short > state.sma_long);
        assert!(state.macd > state.signal);
    }
}
