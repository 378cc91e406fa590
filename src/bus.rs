//! In-process topic bus.
//!
//! Each subscriber gets its own unbounded channel, so a slow consumer never
//! blocks publishers or other consumers. Delivery per subscriber follows
//! publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::logging::{enabled, log, log_message, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::types::{
    ApprovedTrade, ExecutionResult, MetaReport, Observation, OpsNote, RejectionFeedback, Reward,
    SentimentScore, SignalAction, SignalDiagnostics, TextObservation, TradePlan, TrendState,
    TuningHint,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "market.observations")]
    Observations,
    #[serde(rename = "text.observations")]
    TextObservations,
    #[serde(rename = "sentiment_data_stream")]
    Sentiment,
    #[serde(rename = "signal_actions")]
    SignalActions,
    #[serde(rename = "signals.ensemble")]
    SignalDiagnostics,
    #[serde(rename = "trend_data_stream")]
    Trend,
    #[serde(rename = "trade_plan_drafts")]
    TradePlans,
    #[serde(rename = "rejected_trades")]
    Rejected,
    #[serde(rename = "approved_trades")]
    Approved,
    #[serde(rename = "execution_result")]
    ExecutionResults,
    #[serde(rename = "reward")]
    Rewards,
    #[serde(rename = "meta_reports")]
    MetaReports,
    #[serde(rename = "tuning_hints")]
    TuningHints,
    #[serde(rename = "ops_notes")]
    OpsNotes,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Observations => "market.observations",
            Topic::TextObservations => "text.observations",
            Topic::Sentiment => "sentiment_data_stream",
            Topic::SignalActions => "signal_actions",
            Topic::SignalDiagnostics => "signals.ensemble",
            Topic::Trend => "trend_data_stream",
            Topic::TradePlans => "trade_plan_drafts",
            Topic::Rejected => "rejected_trades",
            Topic::Approved => "approved_trades",
            Topic::ExecutionResults => "execution_result",
            Topic::Rewards => "reward",
            Topic::MetaReports => "meta_reports",
            Topic::TuningHints => "tuning_hints",
            Topic::OpsNotes => "ops_notes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Observation,
    Action,
    Feedback,
    Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Observation(Observation),
    Text(TextObservation),
    Sentiment(SentimentScore),
    Signal(SignalAction),
    Diagnostics(SignalDiagnostics),
    Trend(TrendState),
    Plan(TradePlan),
    Rejected(RejectionFeedback),
    Approved(ApprovedTrade),
    Execution(ExecutionResult),
    Reward(Reward),
    Report(MetaReport),
    Hint(TuningHint),
    Note(OpsNote),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub sender: String,
    pub role: Role,
    pub topic: Topic,
    pub timestamp: u64,
    pub payload: Payload,
}

pub struct Bus {
    subscribers: Mutex<HashMap<Topic, Vec<UnboundedSender<Envelope>>>>,
    seq: AtomicU64,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(HashMap::new()), seq: AtomicU64::new(0) }
    }

    pub fn subscribe(&self, topic: Topic) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(topic).or_default().push(tx);
        rx
    }

    /// Wrap `payload` in an envelope and deliver it. Returns the envelope id.
    pub fn publish(&self, sender: &str, role: Role, topic: Topic, payload: Payload) -> String {
        let timestamp = ts_epoch_ms();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            id: format!("{sender}-{timestamp}-{seq}"),
            sender: sender.to_string(),
            role,
            topic,
            timestamp,
            payload,
        };
        let id = envelope.id.clone();
        self.deliver(envelope);
        id
    }

    pub fn deliver(&self, envelope: Envelope) {
        // the digest serializes the whole payload; skip it unless audited
        if enabled(Level::Debug, Domain::Audit) {
            if let Ok(value) = serde_json::to_value(&envelope.payload) {
                log_message(&envelope.sender, envelope.topic.as_str(), &envelope.id, &value);
            }
        }
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = subs.get_mut(&envelope.topic) else {
            return;
        };
        let before = list.len();
        list.retain(|tx| tx.send(envelope.clone()).is_ok());
        if list.len() < before {
            log(
                Level::Trace,
                Domain::Bus,
                "pruned_subscribers",
                obj(&[("topic", v_str(envelope.topic.as_str()))]),
            );
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.get(&topic).map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpsNote;

    fn note(text: &str) -> Payload {
        Payload::Note(OpsNote { component: None, asset: None, note: text.to_string() })
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(Topic::OpsNotes);
        bus.publish("a", Role::Meta, Topic::OpsNotes, note("one"));
        bus.publish("a", Role::Meta, Topic::OpsNotes, note("two"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload, note("one"));
        assert_eq!(second.payload, note("two"));
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = Bus::new();
        let mut hints = bus.subscribe(Topic::TuningHints);
        bus.publish("a", Role::Meta, Topic::OpsNotes, note("x"));
        assert!(hints.try_recv().is_err());
    }

    #[test]
    fn test_dead_subscribers_pruned() {
        let bus = Bus::new();
        let rx = bus.subscribe(Topic::OpsNotes);
        let _live = bus.subscribe(Topic::OpsNotes);
        drop(rx);
        bus.publish("a", Role::Meta, Topic::OpsNotes, note("x"));
        assert_eq!(bus.subscriber_count(Topic::OpsNotes), 1);
    }

    #[test]
    fn test_delivery_does_not_depend_on_audit_logging() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(Topic::OpsNotes);
        let audited = enabled(Level::Debug, Domain::Audit);
        bus.publish("a", Role::Meta, Topic::OpsNotes, note("quiet"));
        assert_eq!(rx.try_recv().unwrap().payload, note("quiet"));
        // with default settings the audit digest is skipped entirely
        if std::env::var("LOG_LEVEL").is_err() {
            assert!(!audited);
        }
    }

    #[test]
    fn test_topic_wire_name_matches_serde() {
        let json = serde_json::to_string(&Topic::SignalDiagnostics).unwrap();
        assert_eq!(json, format!("\"{}\"", Topic::SignalDiagnostics.as_str()));
    }
}
