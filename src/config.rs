//! Runtime configuration.
//!
//! Every tunable comes from an environment variable with a compiled default.
//! Ensemble weights can additionally be served by a remote key-value config
//! service; any failure there falls back to the local defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::{log_fallback, Domain};
use crate::retry::{is_retryable_http_error, retry_async, RetryConfig};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

// =============================================================================
// Ensemble weights
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub rsi: f64,
    pub macd: f64,
    pub bb: f64,
    pub ema: f64,
    pub vol: f64,
    pub vwap: f64,
    pub obi: f64,
    /// Weight of the advisory opinion, applied on top of the deterministic sum.
    pub llm: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self { rsi: 0.25, macd: 0.25, bb: 0.15, ema: 0.2, vol: 0.05, vwap: 0.05, obi: 0.05, llm: 0.1 }
    }
}

impl EnsembleWeights {
    /// Compiled defaults overridden per weight by `SIGNAL_W_*`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            rsi: env_or("SIGNAL_W_RSI", d.rsi),
            macd: env_or("SIGNAL_W_MACD", d.macd),
            bb: env_or("SIGNAL_W_BB", d.bb),
            ema: env_or("SIGNAL_W_EMA", d.ema),
            vol: env_or("SIGNAL_W_VOL", d.vol),
            vwap: env_or("SIGNAL_W_VWAP", d.vwap),
            obi: env_or("SIGNAL_W_OBI", d.obi),
            llm: env_or("SIGNAL_W_LLM", d.llm),
        }
    }

    /// Sum of absolute deterministic weights (excludes `llm`).
    pub fn deterministic_mass(&self) -> f64 {
        [self.rsi, self.macd, self.bb, self.ema, self.vol, self.vwap, self.obi]
            .iter()
            .map(|w| w.abs())
            .sum()
    }
}

/// Remote weights; absent or non-numeric fields keep the local value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialWeights {
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub bb: Option<f64>,
    pub ema: Option<f64>,
    pub vol: Option<f64>,
    pub vwap: Option<f64>,
    pub obi: Option<f64>,
    pub llm: Option<f64>,
}

impl PartialWeights {
    pub fn merge_over(&self, base: &EnsembleWeights) -> EnsembleWeights {
        let pick = |v: Option<f64>, d: f64| v.filter(|x| x.is_finite()).unwrap_or(d);
        EnsembleWeights {
            rsi: pick(self.rsi, base.rsi),
            macd: pick(self.macd, base.macd),
            bb: pick(self.bb, base.bb),
            ema: pick(self.ema, base.ema),
            vol: pick(self.vol, base.vol),
            vwap: pick(self.vwap, base.vwap),
            obi: pick(self.obi, base.obi),
            llm: pick(self.llm, base.llm),
        }
    }
}

#[async_trait]
pub trait WeightSource: Send + Sync {
    async fn fetch(&self) -> Result<EnsembleWeights>;
}

/// Fixed weights, no I/O.
pub struct StaticWeights(pub EnsembleWeights);

#[async_trait]
impl WeightSource for StaticWeights {
    async fn fetch(&self) -> Result<EnsembleWeights> {
        Ok(self.0)
    }
}

#[derive(Deserialize)]
struct ConfigGetResponse {
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// Non-success HTTP status from the config service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigStatusError {
    pub status: u16,
}

impl std::fmt::Display for ConfigStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config service returned {}", self.status)
    }
}

impl std::error::Error for ConfigStatusError {}

/// Weights served by the `config.get` tool of the host service.
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
    key: String,
    defaults: EnsembleWeights,
    retry: RetryConfig,
}

impl HttpConfigSource {
    pub fn new(host_url: &str, defaults: EnsembleWeights, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/call/config", host_url.trim_end_matches('/')),
            key: "signal.weights".to_string(),
            defaults,
            retry: RetryConfig::from_env(),
        })
    }

    async fn fetch_once(&self) -> Result<EnsembleWeights> {
        let body = json!({ "tool": "config.get", "input": { "key": self.key } });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ConfigStatusError { status: status.as_u16() }.into());
        }
        let parsed: ConfigGetResponse = resp.json().await?;
        let partial = match parsed.value {
            Some(v) if v.is_object() => serde_json::from_value::<PartialWeights>(v).unwrap_or_default(),
            _ => PartialWeights::default(),
        };
        Ok(partial.merge_over(&self.defaults))
    }
}

#[async_trait]
impl WeightSource for HttpConfigSource {
    async fn fetch(&self) -> Result<EnsembleWeights> {
        retry_async(&self.retry, "config.get", move || async move {
            match self.fetch_once().await {
                Err(e) if non_retryable(&e) => Ok(Err(e)),
                other => other.map(Ok),
            }
        })
        .await?
    }
}

/// Only a typed status outside the retryable set stops the retry loop.
fn non_retryable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ConfigStatusError>()
        .map(|s| !is_retryable_http_error(s.status))
        .unwrap_or(false)
}

/// Fetch weights, falling back to `fallback` on any failure.
pub async fn weights_or_default(source: &dyn WeightSource, fallback: &EnsembleWeights) -> EnsembleWeights {
    match source.fetch().await {
        Ok(w) => w,
        Err(e) => {
            log_fallback(Domain::Signal, "signal.weights", &e.to_string());
            *fallback
        }
    }
}

// =============================================================================
// Component configs
// =============================================================================

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub agent_id: String,
    pub window_cap: usize,
    pub min_history: usize,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    /// |rule score| at which the rule decision overrides the weighted score.
    pub rule_override: f64,
    pub order_size: f64,
    pub drift_window: usize,
    pub drift_threshold: f64,
    pub weights: EnsembleWeights,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            agent_id: "signal-agent".to_string(),
            window_cap: 200,
            min_history: 30,
            buy_threshold: 0.25,
            sell_threshold: -0.25,
            rule_override: 2.0,
            order_size: 100.0,
            drift_window: 20,
            drift_threshold: 0.15,
            weights: EnsembleWeights::default(),
        }
    }
}

impl SignalConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agent_id: std::env::var("SIGNAL_AGENT_ID").unwrap_or(d.agent_id),
            window_cap: env_or("SIGNAL_WINDOW", d.window_cap),
            min_history: env_or("SIGNAL_MIN_HISTORY", d.min_history),
            buy_threshold: env_or("SIGNAL_BUY_TH", d.buy_threshold),
            sell_threshold: env_or("SIGNAL_SELL_TH", d.sell_threshold),
            rule_override: env_or("SIGNAL_RULE_OVERRIDE", d.rule_override),
            order_size: env_or("SIGNAL_ORDER_SIZE", d.order_size),
            drift_window: env_or("DRIFT_WINDOW", d.drift_window),
            drift_threshold: env_or("DRIFT_THRESHOLD", d.drift_threshold),
            weights: EnsembleWeights::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrendConfig {
    pub agent_id: String,
    pub window_cap: usize,
    pub min_history: usize,
    pub sma_short: usize,
    pub sma_long: usize,
    pub adx_trending: f64,
    pub chop_trending: f64,
    pub chop_ranging: f64,
    pub atr_volatile: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            agent_id: "trend-agent".to_string(),
            window_cap: 200,
            min_history: 26,
            sma_short: 10,
            sma_long: 30,
            adx_trending: 25.0,
            chop_trending: 50.0,
            chop_ranging: 60.0,
            atr_volatile: 3.0,
        }
    }
}

impl TrendConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agent_id: std::env::var("TREND_AGENT_ID").unwrap_or(d.agent_id),
            window_cap: env_or("TREND_WINDOW", d.window_cap),
            min_history: env_or("TREND_MIN_HISTORY", d.min_history),
            sma_short: env_or("TREND_SMA_SHORT", d.sma_short),
            sma_long: env_or("TREND_SMA_LONG", d.sma_long),
            adx_trending: env_or("TREND_ADX_TH", d.adx_trending),
            chop_trending: env_or("TREND_CHOP_TRENDING", d.chop_trending),
            chop_ranging: env_or("TREND_CHOP_RANGING", d.chop_ranging),
            atr_volatile: env_or("TREND_ATR_VOLATILE", d.atr_volatile),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub agent_id: String,
    pub order_size: f64,
    pub net_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { agent_id: "strategy-agent".to_string(), order_size: 100.0, net_threshold: 1.0 }
    }
}

impl StrategyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agent_id: std::env::var("STRATEGY_AGENT_ID").unwrap_or(d.agent_id),
            order_size: env_or("STRATEGY_ORDER_SIZE", d.order_size),
            net_threshold: env_or("STRATEGY_NET_TH", d.net_threshold),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub agent_id: String,
    pub base_max_size: f64,
    pub vol_adjustment: f64,
    pub min_confidence: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            agent_id: "risk-agent".to_string(),
            base_max_size: 500.0,
            vol_adjustment: 1.0,
            min_confidence: 0.35,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agent_id: std::env::var("RISK_AGENT_ID").unwrap_or(d.agent_id),
            base_max_size: env_or("RISK_BASE_MAX", d.base_max_size),
            vol_adjustment: env_or("RISK_VOL_ADJ", d.vol_adjustment),
            min_confidence: env_or("RISK_MIN_CONF", d.min_confidence),
        }
    }

    /// floor(base / max(0.5, volAdj))
    pub fn max_size(&self) -> f64 {
        (self.base_max_size / self.vol_adjustment.max(0.5)).floor()
    }
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub agent_id: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub default_duration_sec: u64,
    pub market_confidence: f64,
    pub anomaly_slippage_bps: f64,
    pub reference_price: f64,
    /// Agent credited with execution rewards.
    pub reward_agent: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            agent_id: "execution-agent".to_string(),
            poll_interval: Duration::from_millis(1200),
            poll_timeout: Duration::from_secs(25),
            default_duration_sec: 20,
            market_confidence: 0.7,
            anomaly_slippage_bps: 20.0,
            reference_price: 150.0,
            reward_agent: "strategy-agent".to_string(),
        }
    }
}

impl ExecConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agent_id: std::env::var("EXEC_AGENT_ID").unwrap_or(d.agent_id),
            poll_interval: Duration::from_millis(env_or("EXEC_POLL_MS", 1200u64)),
            poll_timeout: Duration::from_millis(env_or("EXEC_TIMEOUT_MS", 25_000u64)),
            default_duration_sec: env_or("EXEC_DURATION_SEC", d.default_duration_sec),
            market_confidence: env_or("EXEC_MKT_CONF", d.market_confidence),
            anomaly_slippage_bps: env_or("EXEC_ANOMALY_BPS", d.anomaly_slippage_bps),
            reference_price: env_or("EXEC_REF_PRICE", d.reference_price),
            reward_agent: std::env::var("STRATEGY_AGENT_ID").unwrap_or(d.reward_agent),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub agent_id: String,
    pub leaderboard_every: Duration,
    pub hints_every: Duration,
    pub summary_every: Duration,
    /// Agent whose stats drive tuning hints.
    pub strategy_agent: String,
    pub min_trades: u64,
    pub plan_lookback: usize,
    pub sentiment_citations: usize,
    pub slippage_note_bps: f64,
    pub latency_note_ms: u64,
    pub sqlite_path: Option<PathBuf>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            agent_id: "meta-agent".to_string(),
            leaderboard_every: Duration::from_secs(15),
            hints_every: Duration::from_secs(30),
            summary_every: Duration::from_secs(60),
            strategy_agent: "strategy-agent".to_string(),
            min_trades: 5,
            plan_lookback: 10,
            sentiment_citations: 5,
            slippage_note_bps: 20.0,
            latency_note_ms: 20_000,
            sqlite_path: None,
        }
    }
}

impl RollupConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agent_id: std::env::var("ROLLUP_AGENT_ID").unwrap_or(d.agent_id),
            leaderboard_every: Duration::from_secs(env_or("ROLLUP_LEADERBOARD_SECS", 15u64)),
            hints_every: Duration::from_secs(env_or("ROLLUP_HINTS_SECS", 30u64)),
            summary_every: Duration::from_secs(env_or("ROLLUP_SUMMARY_SECS", 60u64)),
            strategy_agent: std::env::var("STRATEGY_AGENT_ID").unwrap_or(d.strategy_agent),
            min_trades: env_or("ROLLUP_MIN_TRADES", d.min_trades),
            plan_lookback: d.plan_lookback,
            sentiment_citations: env_or("ROLLUP_SENTIMENT_CITES", d.sentiment_citations),
            slippage_note_bps: d.slippage_note_bps,
            latency_note_ms: d.latency_note_ms,
            sqlite_path: std::env::var("ROLLUP_SQLITE_PATH").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdvisoryConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.anthropic.com".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            timeout: Duration::from_secs(4),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl AdvisoryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()),
            api_base: std::env::var("ADVISORY_BASE").unwrap_or(d.api_base),
            model: std::env::var("ADVISORY_MODEL").unwrap_or(d.model),
            timeout: Duration::from_millis(env_or("ADVISORY_TIMEOUT_MS", 4000u64)),
            failure_threshold: env_or("ADVISORY_FAILURES", d.failure_threshold),
            cooldown: Duration::from_secs(env_or("ADVISORY_COOLDOWN_SECS", 60u64)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host_url: Option<String>,
    pub config_timeout: Duration,
    pub kill_file: Option<PathBuf>,
    pub sentiment_agent_id: String,
    pub signal: SignalConfig,
    pub trend: TrendConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub exec: ExecConfig,
    pub rollup: RollupConfig,
    pub advisory: AdvisoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_url: None,
            config_timeout: Duration::from_secs(2),
            kill_file: None,
            sentiment_agent_id: "sentiment-agent".to_string(),
            signal: SignalConfig::default(),
            trend: TrendConfig::default(),
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            exec: ExecConfig::default(),
            rollup: RollupConfig::default(),
            advisory: AdvisoryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host_url: std::env::var("HOST_URL").ok().filter(|h| !h.is_empty()),
            config_timeout: Duration::from_millis(env_or("CONFIG_TIMEOUT_MS", 2000u64)),
            kill_file: std::env::var("KILL_FILE").ok().map(PathBuf::from),
            sentiment_agent_id: std::env::var("SENTIMENT_AGENT_ID")
                .unwrap_or_else(|_| "sentiment-agent".to_string()),
            signal: SignalConfig::from_env(),
            trend: TrendConfig::from_env(),
            strategy: StrategyConfig::from_env(),
            risk: RiskConfig::from_env(),
            exec: ExecConfig::from_env(),
            rollup: RollupConfig::from_env(),
            advisory: AdvisoryConfig::from_env(),
        }
    }

    /// Remote weight source if `HOST_URL` is set, else the local weights.
    pub fn weight_source(&self) -> Result<Box<dyn WeightSource>> {
        match &self.host_url {
            Some(host) => Ok(Box::new(HttpConfigSource::new(host, self.signal.weights, self.config_timeout)?)),
            None => Ok(Box::new(StaticWeights(self.signal.weights))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Failing;

    #[async_trait]
    impl WeightSource for Failing {
        async fn fetch(&self) -> Result<EnsembleWeights> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = EnsembleWeights::default();
        assert!((w.deterministic_mass() - 1.0).abs() < 1e-12);
        assert_eq!(w.llm, 0.1);
    }

    #[test]
    fn test_partial_weights_merge() {
        let partial: PartialWeights = serde_json::from_value(json!({ "rsi": 0.5, "ema": 0.1 })).unwrap();
        let merged = partial.merge_over(&EnsembleWeights::default());
        assert_eq!(merged.rsi, 0.5);
        assert_eq!(merged.ema, 0.1);
        assert_eq!(merged.macd, 0.25);
        assert_eq!(merged.llm, 0.1);
    }

    #[test]
    fn test_risk_max_size() {
        let mut risk = RiskConfig::default();
        assert_eq!(risk.max_size(), 500.0);
        risk.vol_adjustment = 0.1;
        assert_eq!(risk.max_size(), 1000.0);
        risk.vol_adjustment = 3.0;
        assert_eq!(risk.max_size(), 166.0);
    }

    #[test]
    fn test_non_retryable_classification() {
        assert!(non_retryable(&ConfigStatusError { status: 404 }.into()));
        assert!(!non_retryable(&ConfigStatusError { status: 503 }.into()));
        assert!(!non_retryable(&anyhow!("timed out")));
        // an error that merely reads like a status is still retried
        assert!(!non_retryable(&anyhow!("config service returned 404")));
        let wrapped = anyhow::Error::from(ConfigStatusError { status: 400 }).context("signal.weights");
        assert!(non_retryable(&wrapped));
        assert_eq!(ConfigStatusError { status: 404 }.to_string(), "config service returned 404");
    }

    /// Answers every request with `status` and counts connections.
    fn status_server(status: &'static str) -> (String, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0u8; content_length];
                let _ = reader.read_exact(&mut body);
                let resp = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(resp.as_bytes());
            }
        });
        (url, hits)
    }

    #[tokio::test]
    async fn test_client_error_status_is_not_retried() {
        use std::sync::atomic::Ordering;

        let (url, hits) = status_server("404 Not Found");
        let mut source = HttpConfigSource::new(&url, EnsembleWeights::default(), Duration::from_secs(2)).unwrap();
        source.retry = RetryConfig { max_retries: 2, base_delay_ms: 1, max_delay_ms: 5, jitter_factor: 0.0 };
        let err = source.fetch().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ConfigStatusError>(), Some(&ConfigStatusError { status: 404 }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (url, hits) = status_server("503 Service Unavailable");
        let mut source = HttpConfigSource::new(&url, EnsembleWeights::default(), Duration::from_secs(2)).unwrap();
        source.retry = RetryConfig { max_retries: 2, base_delay_ms: 1, max_delay_ms: 5, jitter_factor: 0.0 };
        assert!(source.fetch().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failing_source_falls_back() {
        let fallback = EnsembleWeights { rsi: 0.9, ..Default::default() };
        let w = weights_or_default(&Failing, &fallback).await;
        assert_eq!(w, fallback);
        let w = weights_or_default(&StaticWeights(EnsembleWeights::default()), &fallback).await;
        assert_eq!(w, EnsembleWeights::default());
    }
}
