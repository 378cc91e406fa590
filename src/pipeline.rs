//! Wires every agent onto one bus.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::advisory::{self, Advisor};
use crate::bus::{Bus, Payload, Role, Topic};
use crate::config::{Config, WeightSource};
use crate::execution::{Broker, ExecutionEngine, SimMarket};
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::risk::RiskAgent;
use crate::rollup::RollupAgent;
use crate::safety::{Compliance, RestrictedList, SafetySwitch};
use crate::sentiment::SentimentAgent;
use crate::signal::SignalAgent;
use crate::strategy::StrategyAgent;
use crate::trend::TrendAgent;
use crate::types::{Observation, TextObservation};

/// Capabilities shared by the agents.
pub struct Deps {
    pub weights: Arc<dyn WeightSource>,
    pub advisor: Arc<dyn Advisor>,
    pub compliance: Arc<dyn Compliance>,
    pub broker: Arc<dyn Broker>,
    pub safety: Arc<SafetySwitch>,
}

impl Deps {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let safety = match &cfg.kill_file {
            Some(path) => SafetySwitch::with_kill_file(path),
            None => SafetySwitch::new(),
        };
        Ok(Self {
            weights: Arc::from(cfg.weight_source()?),
            advisor: Arc::from(advisory::from_config(&cfg.advisory)),
            compliance: Arc::new(RestrictedList::default()),
            broker: Arc::new(SimMarket::new().with_reference_price(cfg.exec.reference_price)),
            safety: Arc::new(safety),
        })
    }
}

pub struct Swarm {
    pub bus: Arc<Bus>,
    pub safety: Arc<SafetySwitch>,
    handles: Vec<JoinHandle<()>>,
}

impl Swarm {
    /// Subscribes every agent before any task starts, so nothing published
    /// after this returns is missed.
    pub fn spawn(cfg: Config, deps: Deps) -> Self {
        let bus = Arc::new(Bus::new());
        let Deps { weights, advisor, compliance, broker, safety } = deps;

        let signal = SignalAgent::new(cfg.signal, weights, advisor.clone(), safety.clone(), bus.clone());
        let trend = TrendAgent::new(cfg.trend, advisor.clone(), safety.clone(), bus.clone());
        let sentiment = SentimentAgent::new(
            &cfg.sentiment_agent_id,
            advisor.clone(),
            compliance.clone(),
            safety.clone(),
            bus.clone(),
        );
        let strategy = StrategyAgent::new(cfg.strategy, advisor.clone(), safety.clone(), bus.clone());
        let risk = RiskAgent::new(cfg.risk, compliance.clone(), advisor.clone(), safety.clone(), bus.clone());
        let engine = Arc::new(ExecutionEngine::new(
            cfg.exec,
            broker,
            compliance,
            advisor.clone(),
            safety.clone(),
            bus.clone(),
        ));
        let rollup = RollupAgent::new(cfg.rollup, advisor, safety.clone(), bus.clone());

        let signal_rx = bus.subscribe(Topic::Observations);
        let trend_rx = bus.subscribe(Topic::Observations);
        let text_rx = bus.subscribe(Topic::TextObservations);
        let strat_signals = bus.subscribe(Topic::SignalActions);
        let strat_sentiment = bus.subscribe(Topic::Sentiment);
        let strat_trends = bus.subscribe(Topic::Trend);
        let risk_rx = bus.subscribe(Topic::TradePlans);
        let exec_rx = bus.subscribe(Topic::Approved);
        let rollup_exec = bus.subscribe(Topic::ExecutionResults);
        let rollup_rewards = bus.subscribe(Topic::Rewards);
        let rollup_plans = bus.subscribe(Topic::TradePlans);

        let handles = vec![
            tokio::spawn(signal.run(signal_rx)),
            tokio::spawn(trend.run(trend_rx)),
            tokio::spawn(sentiment.run(text_rx)),
            tokio::spawn(strategy.run(strat_signals, strat_sentiment, strat_trends)),
            tokio::spawn(risk.run(risk_rx)),
            tokio::spawn(engine.run(exec_rx)),
            tokio::spawn(rollup.run(rollup_exec, rollup_rewards, rollup_plans)),
        ];
        log(Level::Info, Domain::System, "swarm_started", obj(&[("agents", v_num(handles.len() as f64))]));
        Self { bus, safety, handles }
    }

    pub fn publish_observation(&self, obs: Observation) -> String {
        self.bus.publish("market-feed", Role::Observation, Topic::Observations, Payload::Observation(obs))
    }

    pub fn publish_text(&self, text: TextObservation) -> String {
        self.bus.publish("news-feed", Role::Observation, Topic::TextObservations, Payload::Text(text))
    }

    /// Halt every agent, then stop their tasks.
    pub fn shutdown(self) {
        self.safety.halt_all();
        for handle in self.handles {
            handle.abort();
        }
        log(Level::Info, Domain::System, "swarm_stopped", obj(&[]));
    }
}
