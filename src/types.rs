//! Message payloads exchanged between agents.
//!
//! All timestamps are epoch milliseconds. Field names serialize in camelCase
//! so the wire format matches the topic consumers outside this crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::EnsembleWeights;

pub type Timestamp = u64;

// =============================================================================
// Market input
// =============================================================================

/// One market tick: an asset plus an open set of named metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub asset: String,
    pub timestamp: Timestamp,
    pub metrics: BTreeMap<String, f64>,
}

impl Observation {
    pub fn new(asset: &str, timestamp: Timestamp, price: f64) -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert("price".to_string(), price);
        Self { asset: asset.to_string(), timestamp, metrics }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// Finite metric value, if present.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn price(&self) -> Option<f64> {
        self.metric("price")
    }
}

/// Free text attributed to an asset (headline, post, filing excerpt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextObservation {
    pub source: String,
    pub text: String,
    pub asset: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentScore {
    pub asset: String,
    /// Polarity in [-1, 1].
    pub score: f64,
    #[serde(default)]
    pub comparative: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub source: String,
    pub timestamp: Timestamp,
}

impl SentimentScore {
    pub fn new(asset: &str, score: f64, timestamp: Timestamp) -> Self {
        Self {
            asset: asset.to_string(),
            score: score.clamp(-1.0, 1.0),
            comparative: 0.0,
            keywords: Vec::new(),
            source: String::new(),
            timestamp,
        }
    }
}

// =============================================================================
// Signal / trend
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buy, -1 for sell.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Buy,
    Sell,
    Hold,
}

impl ActionType {
    pub fn side(&self) -> Option<Side> {
        match self {
            ActionType::Buy => Some(Side::Buy),
            ActionType::Sell => Some(Side::Sell),
            ActionType::Hold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Buy => "buy",
            ActionType::Sell => "sell",
            ActionType::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalAction {
    pub action_type: ActionType,
    pub asset: String,
    pub size: f64,
    /// In [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub notes: String,
}

/// Normalized indicator features for one scoring cycle.
///
/// The `*_feature` fields lie in [-1, 1]; the rest are raw pass-through
/// values kept for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleFeatures {
    pub rsi14: f64,
    pub macd: f64,
    pub macd_signal: Option<f64>,
    pub ema9: f64,
    pub ema21: f64,
    pub volume: f64,
    pub volume_z: f64,
    pub vwap: f64,
    pub rsi_feature: f64,
    pub macd_feature: f64,
    /// Position inside the Bollinger band; positive above the middle.
    pub bb_pos: f64,
    pub ema_cross: f64,
    pub vwap_feature: f64,
    pub volume_feature: f64,
    pub orderbook_imbalance: f64,
}

/// Full score breakdown published next to every signal action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDiagnostics {
    pub asset: String,
    pub score: f64,
    pub deterministic_score: f64,
    pub meta_score: f64,
    pub rule_score: f64,
    pub weights: EnsembleWeights,
    pub features: EnsembleFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendState {
    pub asset: String,
    pub sma_short: f64,
    pub sma_long: f64,
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub direction: TrendDirection,
    pub regime: Regime,
    pub adx: f64,
    pub choppiness: f64,
    pub atr: f64,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

// =============================================================================
// Plans and risk
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MKT")]
    Market,
    #[serde(rename = "LMT")]
    Limit,
    #[serde(rename = "TWAP")]
    Twap,
    #[serde(rename = "VWAP")]
    Vwap,
}

impl OrderType {
    pub fn is_windowed(&self) -> bool {
        matches!(self, OrderType::Twap | OrderType::Vwap)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
            OrderType::Twap => "TWAP",
            OrderType::Vwap => "VWAP",
        }
    }
}

/// Optional execution overrides carried from plan to order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePlan {
    pub asset: String,
    pub direction: Side,
    pub size: f64,
    pub confidence: f64,
    /// Human-readable rationale, in contribution order.
    pub sources: Vec<String>,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(flatten)]
    pub hints: ExecutionHints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedTrade {
    #[serde(flatten)]
    pub plan: TradePlan,
    pub approved_by: String,
    pub approval_time: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeSuggestion {
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionFeedback {
    pub reason: String,
    pub plan: TradePlan,
    pub rejected_by: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<SizeSuggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

// =============================================================================
// Execution
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub qty: f64,
    pub price: f64,
    pub timestamp: Timestamp,
    pub venue: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Filled,
    Partial,
    Rejected,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Filled => "filled",
            ExecStatus::Partial => "partial",
            ExecStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub asset: String,
    pub direction: Side,
    pub size: f64,
    pub avg_price: f64,
    pub slippage_bps: f64,
    pub status: ExecStatus,
    pub fills: Vec<Fill>,
    pub executed_at: Timestamp,
    pub latency_ms: u64,
    pub trade_id: String,
    pub eqs: f64,
}

impl ExecutionResult {
    pub fn filled_qty(&self) -> f64 {
        self.fills.iter().map(|f| f.qty).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    /// Agent the reward is attributed to.
    pub agent: String,
    pub trade_id: String,
    pub profit_loss: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

// =============================================================================
// Rollup output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub agent: String,
    pub pnl: f64,
    /// Percent, one decimal.
    pub win_rate: f64,
    pub eqs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetaReport {
    Leaderboard { board: Vec<LeaderboardRow> },
    Summary { summary: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningHint {
    pub component: String,
    pub action: String,
    pub delta: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    pub note: String,
}
