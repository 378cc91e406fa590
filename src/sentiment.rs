//! Headline sentiment scoring.
//!
//! A small AFINN-style lexicon gives a raw score (sum of word valences) and a
//! comparative score (raw / token count). When the advisor classifies the
//! text, its signed confidence is blended in.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::advisory::{Advice, Advisor};
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::logging::{log, log_gated, obj, v_num, v_str, Domain, Level};
use crate::safety::{Compliance, SafetySwitch};
use crate::types::{SentimentScore, TextObservation};

const LEXICON: &[(&str, i32)] = &[
    ("beat", 3),
    ("beats", 3),
    ("bullish", 3),
    ("surge", 3),
    ("surges", 3),
    ("soar", 3),
    ("soars", 3),
    ("record", 2),
    ("growth", 2),
    ("strong", 2),
    ("upgrade", 2),
    ("upgraded", 2),
    ("raises", 2),
    ("raised", 2),
    ("profit", 2),
    ("gain", 2),
    ("gains", 2),
    ("rally", 2),
    ("outperform", 2),
    ("positive", 2),
    ("rises", 1),
    ("up", 1),
    ("buyback", 1),
    ("approval", 2),
    ("miss", -2),
    ("misses", -2),
    ("weak", -2),
    ("loss", -3),
    ("losses", -3),
    ("downgrade", -2),
    ("downgraded", -2),
    ("cuts", -2),
    ("cut", -1),
    ("falls", -1),
    ("down", -1),
    ("plunge", -3),
    ("plunges", -3),
    ("crash", -3),
    ("bearish", -3),
    ("lawsuit", -2),
    ("probe", -2),
    ("recall", -2),
    ("bankruptcy", -4),
    ("fraud", -4),
    ("layoffs", -2),
    ("negative", -2),
    ("warning", -2),
];

#[derive(Debug, Clone, PartialEq)]
pub struct LexiconScore {
    pub score: f64,
    pub comparative: f64,
    pub words: Vec<String>,
}

pub fn analyze(text: &str) -> LexiconScore {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    let mut score = 0i32;
    let mut words = Vec::new();
    for tok in &tokens {
        if let Some((_, v)) = LEXICON.iter().find(|(w, _)| w == tok) {
            score += v;
            words.push(tok.clone());
        }
    }
    let comparative = if tokens.is_empty() { 0.0 } else { score as f64 / tokens.len() as f64 };
    LexiconScore { score: score as f64, comparative, words }
}

/// clamp(raw/10·0.4 + comparative·0.2 + advisory·0.4, -1, 1)
pub fn blend(raw: f64, comparative: f64, advisory: f64) -> f64 {
    (raw / 10.0 * 0.4 + comparative * 0.2 + advisory * 0.4).clamp(-1.0, 1.0)
}

pub struct SentimentAgent {
    id: String,
    advisor: Arc<dyn Advisor>,
    compliance: Arc<dyn Compliance>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
}

impl SentimentAgent {
    pub fn new(
        id: &str,
        advisor: Arc<dyn Advisor>,
        compliance: Arc<dyn Compliance>,
        safety: Arc<SafetySwitch>,
        bus: Arc<Bus>,
    ) -> Self {
        Self { id: id.to_string(), advisor, compliance, safety, bus }
    }

    pub async fn on_text(&self, obs: &TextObservation) -> Option<SentimentScore> {
        if self.safety.blocked(&self.id) {
            log_gated(Domain::Sentiment, &self.id, "text");
            return None;
        }
        if !self.compliance.is_trade_legal(&self.id, &obs.asset) {
            log(
                Level::Warn,
                Domain::Sentiment,
                "compliance_skip",
                obj(&[("agent", v_str(&self.id)), ("asset", v_str(&obs.asset))]),
            );
            return None;
        }

        let lex = analyze(&obs.text);
        let opinion = match self.advisor.classify_sentiment(&obs.text).await {
            Advice::Given(op) => Some(op),
            Advice::Neutral | Advice::Unavailable => None,
        };
        let advisory = opinion.as_ref().map(|o| o.score()).unwrap_or(0.0);

        let keywords = match &opinion {
            Some(op) if !op.topics.is_empty() => op.topics.clone(),
            _ => lex.words.clone(),
        };
        let score = SentimentScore {
            asset: obs.asset.clone(),
            score: blend(lex.score, lex.comparative, advisory),
            comparative: opinion.as_ref().map(|o| o.confidence).unwrap_or(lex.comparative),
            keywords,
            source: obs.source.clone(),
            timestamp: obs.timestamp,
        };
        log(
            Level::Debug,
            Domain::Sentiment,
            "sentiment",
            obj(&[
                ("asset", v_str(&score.asset)),
                ("score", v_num(score.score)),
                ("raw", v_num(lex.score)),
            ]),
        );
        self.bus.publish(&self.id, Role::Observation, Topic::Sentiment, Payload::Sentiment(score.clone()));
        Some(score)
    }

    pub async fn run(self, mut rx: UnboundedReceiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            if let Payload::Text(obs) = env.payload {
                self.on_text(&obs).await;
            }
        }
    }
}
