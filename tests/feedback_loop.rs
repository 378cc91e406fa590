//! Rollup driven over the bus with short timers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tradeswarm::advisory::NoAdvisor;
use tradeswarm::bus::{Bus, Payload, Role, Topic};
use tradeswarm::config::RollupConfig;
use tradeswarm::rollup::RollupAgent;
use tradeswarm::safety::SafetySwitch;
use tradeswarm::storage::LeaderboardStore;
use tradeswarm::types::{ExecutionHints, MetaReport, Reward, Side, TradePlan};

fn fast_rollup() -> RollupConfig {
    RollupConfig {
        leaderboard_every: Duration::from_millis(50),
        hints_every: Duration::from_millis(50),
        summary_every: Duration::from_millis(50),
        ..RollupConfig::default()
    }
}

fn reward(agent: &str, pnl: f64) -> Payload {
    Payload::Reward(Reward { agent: agent.into(), trade_id: "t".into(), profit_loss: pnl, metrics: BTreeMap::new() })
}

fn plan(source: &str) -> Payload {
    Payload::Plan(TradePlan {
        asset: "AAPL".into(),
        direction: Side::Buy,
        size: 100.0,
        confidence: 0.5,
        sources: vec!["Signal: Buy (confidence 0.60)".into(), source.into()],
        timestamp: 0,
        explanation: None,
        hints: ExecutionHints::default(),
    })
}

#[tokio::test]
async fn test_leaderboard_published_best_first() {
    let bus = Arc::new(Bus::new());
    let mut reports = bus.subscribe(Topic::MetaReports);
    let agent = RollupAgent::new(fast_rollup(), Arc::new(NoAdvisor), Arc::new(SafetySwitch::new()), bus.clone());
    let executions = bus.subscribe(Topic::ExecutionResults);
    let rewards = bus.subscribe(Topic::Rewards);
    let plans = bus.subscribe(Topic::TradePlans);

    for (agent_id, pnl) in [("b", 10.0), ("c", -5.0), ("a", 20.0)] {
        bus.publish("execution-agent", Role::Feedback, Topic::Rewards, reward(agent_id, pnl));
    }
    let handle = tokio::spawn(agent.run(executions, rewards, plans));

    let board = loop {
        let env = timeout(Duration::from_secs(2), reports.recv()).await.unwrap().unwrap();
        if let Payload::Report(MetaReport::Leaderboard { board }) = env.payload {
            break board;
        }
    };
    assert_eq!(board.iter().map(|r| r.pnl).collect::<Vec<_>>(), vec![20.0, 10.0, -5.0]);
    assert_eq!(board.iter().map(|r| r.agent.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
    handle.abort();
}

#[tokio::test]
async fn test_losing_sentiment_driven_strategy_gets_decrease_hint() {
    let bus = Arc::new(Bus::new());
    let mut hints = bus.subscribe(Topic::TuningHints);
    let agent = RollupAgent::new(fast_rollup(), Arc::new(NoAdvisor), Arc::new(SafetySwitch::new()), bus.clone());
    let executions = bus.subscribe(Topic::ExecutionResults);
    let rewards = bus.subscribe(Topic::Rewards);
    let plans = bus.subscribe(Topic::TradePlans);

    for pnl in [2.0, -1.0, 3.0, -4.0, -0.5] {
        bus.publish("execution-agent", Role::Feedback, Topic::Rewards, reward("strategy-agent", pnl));
    }
    for i in 0..10 {
        let source = if i % 5 < 3 { "Sentiment: Bearish (-0.40)" } else { "Trend: Bullish" };
        bus.publish("strategy-agent", Role::Action, Topic::TradePlans, plan(source));
    }
    let handle = tokio::spawn(agent.run(executions, rewards, plans));

    let env = timeout(Duration::from_secs(2), hints.recv()).await.unwrap().unwrap();
    match env.payload {
        Payload::Hint(h) => {
            assert_eq!(h.component, "sentiment");
            assert_eq!(h.action, "decrease_weight");
            assert_eq!(h.delta, 0.1);
            assert_eq!(h.reason, "low win rate; sentiment overfitting suspected");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    handle.abort();
}

#[tokio::test]
async fn test_leaderboard_snapshots_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.db");
    let bus = Arc::new(Bus::new());
    let cfg = RollupConfig { sqlite_path: Some(path.clone()), ..RollupConfig::default() };
    let mut agent = RollupAgent::new(cfg, Arc::new(NoAdvisor), Arc::new(SafetySwitch::new()), bus);
    if let Payload::Reward(r) = reward("strategy-agent", 4.0) {
        agent.on_reward(&r);
    }
    agent.publish_leaderboard();
    drop(agent);

    let store = LeaderboardStore::open(&path).unwrap();
    let latest = store.latest().unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].agent, "strategy-agent");
    assert_eq!(latest[0].pnl, 4.0);
}
