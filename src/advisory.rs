//! Optional advisory opinions and narratives.
//!
//! Every call returns an [`Advice`]; failures, timeouts, missing credentials
//! and an open circuit all collapse to `Advice::Unavailable`. Callers treat
//! advice as enrichment only.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::circuit::CircuitBreaker;
use crate::config::AdvisoryConfig;
use crate::logging::log_fallback;
use crate::logging::Domain;
use crate::types::{ExecutionResult, TradePlan};

#[derive(Debug, Clone, PartialEq)]
pub enum Advice<T> {
    /// No advisor configured, or the call failed.
    Unavailable,
    /// The advisor answered without an opinion.
    Neutral,
    Given(T),
}

impl<T> Advice<T> {
    pub fn given(self) -> Option<T> {
        match self {
            Advice::Given(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Advice::Unavailable)
    }
}

impl Advice<String> {
    /// Non-empty text, if any.
    pub fn text(self) -> Option<String> {
        self.given().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn sign(&self) -> f64 {
        match self {
            Bias::Bullish => 1.0,
            Bias::Bearish => -1.0,
            Bias::Neutral => 0.0,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bullish" => Some(Bias::Bullish),
            "bearish" => Some(Bias::Bearish),
            "neutral" => Some(Bias::Neutral),
            _ => None,
        }
    }
}

/// Directional opinion on an indicator snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOpinion {
    pub bias: Bias,
    pub confidence: f64,
    pub reasoning: String,
}

impl MarketOpinion {
    /// Signed opinion in [-1, 1].
    pub fn score(&self) -> f64 {
        self.bias.sign() * self.confidence.clamp(0.0, 1.0)
    }
}

/// Classified headline.
#[derive(Debug, Clone, PartialEq)]
pub struct SentimentOpinion {
    pub bias: Bias,
    pub confidence: f64,
    pub topics: Vec<String>,
}

impl SentimentOpinion {
    pub fn score(&self) -> f64 {
        self.bias.sign() * self.confidence
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeContext<'a> {
    pub asset: &'a str,
    pub adx: f64,
    pub atr: f64,
    pub choppiness: f64,
    pub trend: &'a str,
}

/// Advisory capability. Every method defaults to `Unavailable`.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn classify_signal(&self, _asset: &str, _indicators: &Value) -> Advice<MarketOpinion> {
        Advice::Unavailable
    }

    async fn classify_sentiment(&self, _text: &str) -> Advice<SentimentOpinion> {
        Advice::Unavailable
    }

    async fn explain_rejection(&self, _reason: &str, _suggested_size: Option<f64>) -> Advice<String> {
        Advice::Unavailable
    }

    async fn explain_trade(&self, _plan: &TradePlan) -> Advice<String> {
        Advice::Unavailable
    }

    async fn explain_regime(&self, _ctx: &RegimeContext<'_>) -> Advice<String> {
        Advice::Unavailable
    }

    async fn anomalous_fill_note(&self, _result: &ExecutionResult, _order_type: &str) -> Advice<String> {
        Advice::Unavailable
    }

    async fn summarize_period(&self, _lines: &[String]) -> Advice<String> {
        Advice::Unavailable
    }
}

/// Advisor that never answers.
pub struct NoAdvisor;

#[async_trait]
impl Advisor for NoAdvisor {}

// =============================================================================
// HTTP advisor (Anthropic Messages API)
// =============================================================================

pub struct HttpAdvisor {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    timeout: Duration,
    breaker: Mutex<CircuitBreaker>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl HttpAdvisor {
    pub fn new(api_key: &str, cfg: &AdvisoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            url: format!("{}/v1/messages", cfg.api_base.trim_end_matches('/')),
            model: cfg.model.clone(),
            timeout: cfg.timeout,
            breaker: Mutex::new(CircuitBreaker::new(cfg.failure_threshold, cfg.cooldown)),
        })
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": 0.3,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let resp = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("advisor returned {}", status.as_u16()));
        }
        let parsed: MessagesResponse = resp.json().await?;
        Ok(parsed.content.into_iter().next().map(|b| b.text.trim().to_string()).unwrap_or_default())
    }

    /// Run `fut` under the breaker and timeout; any failure is `Unavailable`.
    async fn guarded<F>(&self, what: &str, fut: F) -> Advice<String>
    where
        F: Future<Output = Result<String>> + Send,
    {
        {
            let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            if !breaker.allow() {
                return Advice::Unavailable;
            }
        }
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!("timed out after {:?}", self.timeout)),
        };
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(text) => {
                breaker.record_success();
                if text.is_empty() {
                    Advice::Neutral
                } else {
                    Advice::Given(text)
                }
            }
            Err(e) => {
                breaker.record_failure();
                log_fallback(Domain::Advisory, what, &e.to_string());
                Advice::Unavailable
            }
        }
    }

    async fn text(&self, what: &str, prompt: String, max_tokens: u32) -> Advice<String> {
        self.guarded(what, self.complete(&prompt, max_tokens)).await
    }

    async fn json(&self, what: &str, prompt: String) -> Advice<Value> {
        match self.text(what, prompt, 300).await {
            Advice::Given(text) => match extract_json(&text) {
                Some(v) => Advice::Given(v),
                None => Advice::Neutral,
            },
            Advice::Neutral => Advice::Neutral,
            Advice::Unavailable => Advice::Unavailable,
        }
    }
}

/// Parse the outermost `{...}` block of a model response.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn confidence_of(v: &Value) -> f64 {
    v.get("confidence").and_then(Value::as_f64).unwrap_or(0.5)
}

pub fn parse_market_opinion(v: &Value) -> Option<MarketOpinion> {
    let bias = Bias::parse(v.get("bias")?.as_str()?)?;
    Some(MarketOpinion {
        bias,
        confidence: confidence_of(v),
        reasoning: v.get("reasoning").and_then(Value::as_str).unwrap_or_default().to_string(),
    })
}

pub fn parse_sentiment_opinion(v: &Value) -> Option<SentimentOpinion> {
    let bias = Bias::parse(v.get("sentiment")?.as_str()?)?;
    let topics = v
        .get("topics")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    Some(SentimentOpinion { bias, confidence: confidence_of(v), topics })
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn classify_signal(&self, asset: &str, indicators: &Value) -> Advice<MarketOpinion> {
        let input = json!({ "asset": asset, "indicators": indicators });
        let prompt = format!(
            "You are a market signal classifier. Given technical indicator data, classify the \
             short-term price action as bullish, bearish, or neutral.\n\
             Return JSON only: {{\"bias\":\"bullish|bearish|neutral\",\"confidence\":0..1,\"reasoning\":\"...\"}}\n\
             INPUT:\n{input}"
        );
        match self.json("classify_signal", prompt).await {
            Advice::Given(v) => parse_market_opinion(&v).map(Advice::Given).unwrap_or(Advice::Neutral),
            Advice::Neutral => Advice::Neutral,
            Advice::Unavailable => Advice::Unavailable,
        }
    }

    async fn classify_sentiment(&self, text: &str) -> Advice<SentimentOpinion> {
        let prompt = format!(
            "You are a financial sentiment classifier.\nGiven the headline:\n\"{text}\"\n\
             Classify the sentiment as bullish, bearish, or neutral. Return JSON only: \
             {{\"sentiment\":\"bullish\",\"confidence\":0.9,\"reasoning\":\"...\",\"topics\":[\"earnings\"]}}"
        );
        match self.json("classify_sentiment", prompt).await {
            Advice::Given(v) => parse_sentiment_opinion(&v).map(Advice::Given).unwrap_or(Advice::Neutral),
            Advice::Neutral => Advice::Neutral,
            Advice::Unavailable => Advice::Unavailable,
        }
    }

    async fn explain_rejection(&self, reason: &str, suggested_size: Option<f64>) -> Advice<String> {
        let suggestion = suggested_size.map(|s| format!(" Suggested size: {s}.")).unwrap_or_default();
        let prompt = format!(
            "You are a risk officer. In one or two sentences, explain to a trader why this trade \
             was rejected and what to change.\nReason: {reason}.{suggestion}"
        );
        self.text("explain_rejection", prompt, 150).await
    }

    async fn explain_trade(&self, plan: &TradePlan) -> Advice<String> {
        let prompt = format!(
            "Explain in two sentences why this trade plan makes sense.\nAsset: {}\nDirection: {}\n\
             Confidence: {:.2}\nRationale: {}",
            plan.asset,
            plan.direction.as_str(),
            plan.confidence,
            plan.sources.join("; ")
        );
        self.text("explain_trade", prompt, 150).await
    }

    async fn explain_regime(&self, ctx: &RegimeContext<'_>) -> Advice<String> {
        let prompt = format!(
            "In one sentence, describe the market regime for {} given ADX {:.2}, ATR {:.2}, \
             choppiness {:.2} and a {} trend.",
            ctx.asset, ctx.adx, ctx.atr, ctx.choppiness, ctx.trend
        );
        self.text("explain_regime", prompt, 120).await
    }

    async fn anomalous_fill_note(&self, result: &ExecutionResult, order_type: &str) -> Advice<String> {
        let prompt = format!(
            "Write a one-line operations note about an execution with unusual slippage.\n\
             Asset: {} Side: {} Type: {} AvgPrice: {:.4} SlippageBps: {:.2} Parts: {}",
            result.asset,
            result.direction.as_str(),
            order_type,
            result.avg_price,
            result.slippage_bps,
            result.fills.len()
        );
        self.text("anomalous_fill_note", prompt, 100).await
    }

    async fn summarize_period(&self, lines: &[String]) -> Advice<String> {
        let prompt = format!(
            "Summarize this trading period for an operations channel in three sentences or fewer.\n{}",
            lines.join("\n")
        );
        self.text("summarize_period", prompt, 200).await
    }
}

/// `HttpAdvisor` when an API key is configured, otherwise `NoAdvisor`.
pub fn from_config(cfg: &AdvisoryConfig) -> Box<dyn Advisor> {
    match cfg.api_key.as_deref() {
        Some(key) => match HttpAdvisor::new(key, cfg) {
            Ok(adv) => Box::new(adv),
            Err(e) => {
                log_fallback(Domain::Advisory, "http_advisor", &e.to_string());
                Box::new(NoAdvisor)
            }
        },
        None => Box::new(NoAdvisor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_prose() {
        let text = "Sure! {\"bias\": \"Bullish\", \"confidence\": 0.8, \"reasoning\": \"x\"} hope that helps";
        let v = extract_json(text).unwrap();
        let op = parse_market_opinion(&v).unwrap();
        assert_eq!(op.bias, Bias::Bullish);
        assert!((op.score() - 0.8).abs() < 1e-12);
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
    }

    #[test]
    fn test_opinion_score_clamps_confidence() {
        let op = MarketOpinion { bias: Bias::Bearish, confidence: 1.7, reasoning: String::new() };
        assert_eq!(op.score(), -1.0);
    }

    #[test]
    fn test_sentiment_opinion_parse() {
        let v = json!({ "sentiment": "bearish", "confidence": 0.6, "topics": ["guidance"] });
        let op = parse_sentiment_opinion(&v).unwrap();
        assert!((op.score() + 0.6).abs() < 1e-12);
        assert_eq!(op.topics, vec!["guidance".to_string()]);
        assert!(parse_sentiment_opinion(&json!({ "sentiment": "sideways" })).is_none());
    }

    #[tokio::test]
    async fn test_no_advisor_is_unavailable() {
        let adv = NoAdvisor;
        assert!(adv.classify_sentiment("beats estimates").await.is_unavailable());
        assert_eq!(adv.summarize_period(&[]).await.text(), None);
    }

    #[tokio::test]
    async fn test_unreachable_advisor_degrades() {
        let cfg = AdvisoryConfig {
            api_key: Some("test".into()),
            api_base: "http://127.0.0.1:9".into(),
            timeout: Duration::from_millis(300),
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            ..Default::default()
        };
        let adv = HttpAdvisor::new("test", &cfg).unwrap();
        assert!(adv.explain_regime(&RegimeContext {
            asset: "AAPL",
            adx: 30.0,
            atr: 1.0,
            choppiness: 40.0,
            trend: "bullish",
        })
        .await
        .is_unavailable());
        // breaker is now open: no network attempt, still unavailable
        assert!(adv.summarize_period(&["x".into()]).await.is_unavailable());
    }
}
