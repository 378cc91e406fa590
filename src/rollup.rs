//! Per-agent performance rollup and the tuning feedback loop.
//!
//! Execution results feed quality averages for the executing agent, rewards
//! feed pnl and win/loss for the agent they name. Timers publish the
//! leaderboard, a tuning hint and a textual summary.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::advisory::Advisor;
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::config::RollupConfig;
use crate::execution::broker::round_to;
use crate::logging::{log, log_fallback, log_gated, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::safety::SafetySwitch;
use crate::storage::LeaderboardStore;
use crate::types::{ExecutionResult, LeaderboardRow, MetaReport, OpsNote, Reward, TradePlan, TuningHint};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub pnl: f64,
    /// Executions contributing to the quality averages.
    pub samples: u64,
    pub eqs_sum: f64,
    pub latency_sum: f64,
    pub slippage_sum: f64,
}

impl AgentStats {
    pub fn record_reward(&mut self, profit_loss: f64) {
        self.trades += 1;
        self.pnl += profit_loss;
        if profit_loss > 0.0 {
            self.wins += 1;
        } else if profit_loss < 0.0 {
            self.losses += 1;
        }
    }

    pub fn record_execution(&mut self, eqs: f64, latency_ms: f64, slippage_bps: f64) {
        self.samples += 1;
        self.eqs_sum += eqs;
        self.latency_sum += latency_ms;
        self.slippage_sum += slippage_bps;
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }

    fn avg(&self, sum: f64) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            sum / self.samples as f64
        }
    }

    pub fn avg_eqs(&self) -> f64 {
        self.avg(self.eqs_sum)
    }

    pub fn avg_latency(&self) -> f64 {
        self.avg(self.latency_sum)
    }

    pub fn avg_slippage(&self) -> f64 {
        self.avg(self.slippage_sum)
    }

    pub fn row(&self, agent: &str) -> LeaderboardRow {
        LeaderboardRow {
            agent: agent.to_string(),
            pnl: round_to(self.pnl, 2),
            win_rate: round_to(self.win_rate() * 100.0, 1),
            eqs: round_to(self.avg_eqs(), 2),
        }
    }

    pub fn summary_line(&self, agent: &str) -> String {
        format!(
            "{}: PnL {:.2}, WR {:.1}%, EQS {:.2}",
            agent,
            self.pnl,
            self.win_rate() * 100.0,
            self.avg_eqs()
        )
    }
}

pub fn decrease_sentiment_hint() -> TuningHint {
    TuningHint {
        component: "sentiment".to_string(),
        action: "decrease_weight".to_string(),
        delta: 0.1,
        reason: "low win rate; sentiment overfitting suspected".to_string(),
    }
}

pub fn increase_trend_hint() -> TuningHint {
    TuningHint {
        component: "trend".to_string(),
        action: "increase_weight".to_string(),
        delta: 0.05,
        reason: "stable EQS & lower slippage during trend-following".to_string(),
    }
}

fn cites_sentiment(plan: &TradePlan) -> bool {
    plan.sources
        .iter()
        .any(|s| s.starts_with("Sentiment: Bullish") || s.starts_with("Sentiment: Bearish"))
}

/// Stats book. Single owner, no interior locking.
pub struct Rollup {
    cfg: RollupConfig,
    stats: BTreeMap<String, AgentStats>,
    recent_plans: VecDeque<TradePlan>,
}

impl Rollup {
    pub fn new(cfg: RollupConfig) -> Self {
        Self { cfg, stats: BTreeMap::new(), recent_plans: VecDeque::new() }
    }

    pub fn stats(&self, agent: &str) -> Option<&AgentStats> {
        self.stats.get(agent)
    }

    /// Returns ops notes for slow or expensive fills.
    pub fn on_execution(&mut self, agent: &str, result: &ExecutionResult) -> Vec<OpsNote> {
        let mut notes = Vec::new();
        if result.slippage_bps > self.cfg.slippage_note_bps {
            notes.push(OpsNote {
                component: None,
                asset: Some(result.asset.clone()),
                note: format!("High slippage on {} ({} bps). Consider LMT/TWAP.", result.asset, result.slippage_bps),
            });
        }
        if result.latency_ms > self.cfg.latency_note_ms {
            notes.push(OpsNote {
                component: None,
                asset: Some(result.asset.clone()),
                note: format!("High latency on {} ({}ms). Check routing.", result.asset, result.latency_ms),
            });
        }
        self.stats.entry(agent.to_string()).or_default().record_execution(
            result.eqs,
            result.latency_ms as f64,
            result.slippage_bps,
        );
        notes
    }

    pub fn on_reward(&mut self, reward: &Reward) {
        self.stats.entry(reward.agent.clone()).or_default().record_reward(reward.profit_loss);
    }

    pub fn on_plan(&mut self, plan: TradePlan) {
        self.recent_plans.push_back(plan);
        while self.recent_plans.len() > self.cfg.plan_lookback {
            self.recent_plans.pop_front();
        }
    }

    /// All agents, best pnl first.
    pub fn leaderboard(&self) -> Vec<LeaderboardRow> {
        let mut board: Vec<LeaderboardRow> = self.stats.iter().map(|(agent, s)| s.row(agent)).collect();
        board.sort_by(|a, b| b.pnl.total_cmp(&a.pnl));
        board
    }

    /// None until the strategy agent has enough rewarded trades.
    pub fn tuning_hint(&self) -> Option<TuningHint> {
        let strat = self.stats.get(&self.cfg.strategy_agent)?;
        if strat.trades < self.cfg.min_trades {
            return None;
        }
        let citing = self.recent_plans.iter().filter(|p| cites_sentiment(p)).count();
        if strat.win_rate() < 0.5 && citing >= self.cfg.sentiment_citations {
            Some(decrease_sentiment_hint())
        } else {
            Some(increase_trend_hint())
        }
    }

    pub fn summary(&self) -> Vec<String> {
        self.stats.iter().map(|(agent, s)| s.summary_line(agent)).collect()
    }
}

pub struct RollupAgent {
    rollup: Rollup,
    advisor: Arc<dyn Advisor>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
    store: Option<LeaderboardStore>,
}

impl RollupAgent {
    pub fn new(cfg: RollupConfig, advisor: Arc<dyn Advisor>, safety: Arc<SafetySwitch>, bus: Arc<Bus>) -> Self {
        let store = cfg.sqlite_path.as_ref().and_then(|path| match LeaderboardStore::open(path) {
            Ok(store) => Some(store),
            Err(e) => {
                log_fallback(Domain::Rollup, "leaderboard_store", &e.to_string());
                None
            }
        });
        Self { rollup: Rollup::new(cfg), advisor, safety, bus, store }
    }

    pub fn with_store(mut self, store: LeaderboardStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rollup(&self) -> &Rollup {
        &self.rollup
    }

    fn id(&self) -> &str {
        &self.rollup.cfg.agent_id
    }

    fn gated(&self, what: &str) -> bool {
        if self.safety.blocked(self.id()) {
            log_gated(Domain::Rollup, self.id(), what);
            return true;
        }
        false
    }

    pub fn on_execution(&mut self, sender: &str, result: &ExecutionResult) {
        if self.gated("execution_result") {
            return;
        }
        for note in self.rollup.on_execution(sender, result) {
            self.bus.publish(self.id(), Role::Meta, Topic::OpsNotes, Payload::Note(note));
        }
    }

    pub fn on_reward(&mut self, reward: &Reward) {
        if self.gated("reward") {
            return;
        }
        self.rollup.on_reward(reward);
    }

    pub fn on_plan(&mut self, plan: TradePlan) {
        if self.gated("trade_plan") {
            return;
        }
        self.rollup.on_plan(plan);
    }

    pub fn publish_leaderboard(&mut self) -> Option<Vec<LeaderboardRow>> {
        if self.gated("leaderboard") {
            return None;
        }
        let board = self.rollup.leaderboard();
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.persist_snapshot(ts_epoch_ms(), &board) {
                log_fallback(Domain::Rollup, "persist_leaderboard", &e.to_string());
            }
        }
        log(Level::Info, Domain::Rollup, "leaderboard", obj(&[("agents", v_num(board.len() as f64))]));
        self.bus.publish(
            self.id(),
            Role::Meta,
            Topic::MetaReports,
            Payload::Report(MetaReport::Leaderboard { board: board.clone() }),
        );
        Some(board)
    }

    pub fn emit_tuning_hint(&self) -> Option<TuningHint> {
        if self.gated("tuning_hint") {
            return None;
        }
        let hint = self.rollup.tuning_hint()?;
        log(
            Level::Info,
            Domain::Rollup,
            "tuning_hint",
            obj(&[
                ("component", v_str(&hint.component)),
                ("action", v_str(&hint.action)),
                ("delta", v_num(hint.delta)),
            ]),
        );
        self.bus.publish(self.id(), Role::Meta, Topic::TuningHints, Payload::Hint(hint.clone()));
        Some(hint)
    }

    /// Publishes the summary now; the advisory narrative follows on its own
    /// task.
    pub fn publish_summary(&self) -> Option<Vec<String>> {
        if self.gated("summary") {
            return None;
        }
        let summary = self.rollup.summary();
        self.bus.publish(
            self.id(),
            Role::Meta,
            Topic::MetaReports,
            Payload::Report(MetaReport::Summary { summary: summary.clone() }),
        );

        let advisor = Arc::clone(&self.advisor);
        let bus = Arc::clone(&self.bus);
        let sender = self.id().to_string();
        let lines = summary.clone();
        tokio::spawn(async move {
            if let Some(bullets) = advisor.summarize_period(&lines).await.text() {
                let note = OpsNote { component: None, asset: None, note: format!("Summary:\n{}", bullets) };
                bus.publish(&sender, Role::Meta, Topic::OpsNotes, Payload::Note(note));
            }
        });
        Some(summary)
    }

    pub async fn run(
        mut self,
        mut executions: UnboundedReceiver<Envelope>,
        mut rewards: UnboundedReceiver<Envelope>,
        mut plans: UnboundedReceiver<Envelope>,
    ) {
        let cfg = self.rollup.cfg.clone();
        let mut leaderboard = interval_at(Instant::now() + cfg.leaderboard_every, cfg.leaderboard_every);
        let mut hints = interval_at(Instant::now() + cfg.hints_every, cfg.hints_every);
        let mut summary = interval_at(Instant::now() + cfg.summary_every, cfg.summary_every);
        for timer in [&mut leaderboard, &mut hints, &mut summary] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                Some(env) = executions.recv() => {
                    if let Payload::Execution(result) = &env.payload {
                        self.on_execution(&env.sender, result);
                    }
                }
                Some(env) = rewards.recv() => {
                    if let Payload::Reward(reward) = &env.payload {
                        self.on_reward(reward);
                    }
                }
                Some(env) = plans.recv() => {
                    if let Payload::Plan(plan) = env.payload {
                        self.on_plan(plan);
                    }
                }
                _ = leaderboard.tick() => {
                    self.publish_leaderboard();
                }
                _ = hints.tick() => {
                    self.emit_tuning_hint();
                }
                _ = summary.tick() => {
                    self.publish_summary();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::NoAdvisor;
    use crate::types::{ExecStatus, ExecutionHints, Side};

    fn reward(agent: &str, pnl: f64) -> Reward {
        Reward { agent: agent.into(), trade_id: "t".into(), profit_loss: pnl, metrics: BTreeMap::new() }
    }

    fn result(slippage_bps: f64, latency_ms: u64, eqs: f64) -> ExecutionResult {
        ExecutionResult {
            asset: "AAPL".into(),
            direction: Side::Buy,
            size: 100.0,
            avg_price: 150.0,
            slippage_bps,
            status: ExecStatus::Filled,
            fills: vec![],
            executed_at: 0,
            latency_ms,
            trade_id: "t".into(),
            eqs,
        }
    }

    fn plan(sources: &[&str]) -> TradePlan {
        TradePlan {
            asset: "AAPL".into(),
            direction: Side::Buy,
            size: 100.0,
            confidence: 0.6,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            timestamp: 0,
            explanation: None,
            hints: ExecutionHints::default(),
        }
    }

    #[test]
    fn test_leaderboard_sorted_by_pnl() {
        let mut r = Rollup::new(RollupConfig::default());
        r.on_reward(&reward("b", 10.0));
        r.on_reward(&reward("c", -5.0));
        r.on_reward(&reward("a", 20.0));
        let board = r.leaderboard();
        assert_eq!(board.iter().map(|row| row.pnl).collect::<Vec<_>>(), vec![20.0, 10.0, -5.0]);
        assert_eq!(board[0].agent, "a");
        assert_eq!(board[0].win_rate, 100.0);
        assert_eq!(board[2].win_rate, 0.0);
    }

    #[test]
    fn test_execution_feeds_quality_only() {
        let mut r = Rollup::new(RollupConfig::default());
        assert!(r.on_execution("execution-agent", &result(5.0, 1_000, 0.5)).is_empty());
        r.on_execution("execution-agent", &result(15.0, 3_000, 0.3));
        let s = r.stats("execution-agent").unwrap();
        assert_eq!(s.trades, 0);
        assert_eq!(s.samples, 2);
        assert!((s.avg_eqs() - 0.4).abs() < 1e-12);
        assert_eq!(s.avg_latency(), 2_000.0);
        assert_eq!(s.avg_slippage(), 10.0);
        assert_eq!(s.summary_line("execution-agent"), "execution-agent: PnL 0.00, WR 0.0%, EQS 0.40");
    }

    #[test]
    fn test_ops_notes_for_slippage_and_latency() {
        let mut r = Rollup::new(RollupConfig::default());
        let notes = r.on_execution("execution-agent", &result(25.0, 21_000, 0.1));
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, "High slippage on AAPL (25 bps). Consider LMT/TWAP.");
        assert_eq!(notes[1].note, "High latency on AAPL (21000ms). Check routing.");
    }

    #[test]
    fn test_tuning_hint_needs_min_trades() {
        let mut r = Rollup::new(RollupConfig::default());
        for _ in 0..4 {
            r.on_reward(&reward("strategy-agent", 1.0));
        }
        assert!(r.tuning_hint().is_none());
        r.on_reward(&reward("strategy-agent", 1.0));
        assert_eq!(r.tuning_hint(), Some(increase_trend_hint()));
    }

    #[test]
    fn test_tuning_hint_flags_sentiment_overfit() {
        let mut r = Rollup::new(RollupConfig::default());
        // win rate 0.4
        for pnl in [1.0, 1.0, -1.0, -1.0, -1.0] {
            r.on_reward(&reward("strategy-agent", pnl));
        }
        for i in 0..10 {
            if i < 6 {
                r.on_plan(plan(&["Signal: Buy (confidence 0.80)", "Sentiment: Bullish (0.50)"]));
            } else {
                r.on_plan(plan(&["Trend: Bullish"]));
            }
        }
        assert_eq!(r.tuning_hint(), Some(decrease_sentiment_hint()));

        // older citations fall out of the lookback window
        for _ in 0..6 {
            r.on_plan(plan(&["Trend: Bullish"]));
        }
        assert_eq!(r.tuning_hint(), Some(increase_trend_hint()));
    }

    #[tokio::test]
    async fn test_agent_publishes_and_persists_leaderboard() {
        let bus = Arc::new(Bus::new());
        let mut reports = bus.subscribe(Topic::MetaReports);
        let mut agent = RollupAgent::new(RollupConfig::default(), Arc::new(NoAdvisor), Arc::new(SafetySwitch::new()), bus.clone())
            .with_store(LeaderboardStore::in_memory().unwrap());
        agent.on_reward(&reward("strategy-agent", 3.456));
        let board = agent.publish_leaderboard().unwrap();
        assert_eq!(board[0].pnl, 3.46);
        match reports.try_recv().unwrap().payload {
            Payload::Report(MetaReport::Leaderboard { board }) => assert_eq!(board.len(), 1),
            other => panic!("unexpected payload {other:?}"),
        }
        let summary = agent.publish_summary().unwrap();
        assert_eq!(summary, vec!["strategy-agent: PnL 3.46, WR 100.0%, EQS 0.00"]);
    }

    #[tokio::test]
    async fn test_halted_rollup_is_silent() {
        let bus = Arc::new(Bus::new());
        let mut hints = bus.subscribe(Topic::TuningHints);
        let safety = Arc::new(SafetySwitch::new());
        let mut agent = RollupAgent::new(RollupConfig::default(), Arc::new(NoAdvisor), safety.clone(), bus.clone());
        for _ in 0..5 {
            agent.on_reward(&reward("strategy-agent", 1.0));
        }
        safety.halt_all();
        assert!(agent.emit_tuning_hint().is_none());
        assert!(hints.try_recv().is_err());
        safety.resume();
        assert!(agent.emit_tuning_hint().is_some());
    }
}
