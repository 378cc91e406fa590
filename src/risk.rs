//! Pre-trade risk gate.
//!
//! Checks run in order: compliance, position limit, minimum confidence. The
//! first failure rejects the plan; rejections are terminal. Approved plans
//! move the per-asset net position by their signed size.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::advisory::Advisor;
use crate::bus::{Bus, Envelope, Payload, Role, Topic};
use crate::config::RiskConfig;
use crate::logging::{log, log_gated, log_risk_check, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::safety::{Compliance, SafetySwitch};
use crate::types::{ApprovedTrade, RejectionFeedback, SizeSuggestion, TradePlan};

pub const COMPLIANCE_VIOLATION: &str = "Compliance violation";

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved,
    Rejected { reason: String, suggestion: Option<SizeSuggestion> },
}

/// Pure policy evaluation against the current net position.
pub fn evaluate(plan: &TradePlan, position: f64, cfg: &RiskConfig, compliance: &dyn Compliance) -> Verdict {
    if !compliance.is_asset_allowed(&plan.asset) || !compliance.is_trade_legal(&cfg.agent_id, &plan.asset) {
        return Verdict::Rejected { reason: COMPLIANCE_VIOLATION.to_string(), suggestion: None };
    }

    let max_size = cfg.max_size();
    let projected = (position + plan.direction.sign() * plan.size).abs();
    log_risk_check(&plan.asset, "position_limit", if projected > max_size { "fail" } else { "pass" }, projected, max_size);
    if projected > max_size {
        return Verdict::Rejected {
            reason: format!("Trade would exceed position limit of {} shares.", max_size),
            suggestion: Some(SizeSuggestion { size: (max_size - position.abs()).max(0.0) }),
        };
    }

    let low = plan.confidence < cfg.min_confidence;
    log_risk_check(&plan.asset, "confidence", if low { "fail" } else { "pass" }, plan.confidence, cfg.min_confidence);
    if low {
        return Verdict::Rejected {
            reason: format!("Confidence too low ({:.2}).", plan.confidence),
            suggestion: Some(SizeSuggestion { size: (plan.size * 0.5).floor() }),
        };
    }
    Verdict::Approved
}

pub enum Decision {
    Approved(ApprovedTrade),
    Rejected(RejectionFeedback),
}

pub struct RiskAgent {
    cfg: RiskConfig,
    positions: HashMap<String, f64>,
    compliance: Arc<dyn Compliance>,
    advisor: Arc<dyn Advisor>,
    safety: Arc<SafetySwitch>,
    bus: Arc<Bus>,
}

impl RiskAgent {
    pub fn new(
        cfg: RiskConfig,
        compliance: Arc<dyn Compliance>,
        advisor: Arc<dyn Advisor>,
        safety: Arc<SafetySwitch>,
        bus: Arc<Bus>,
    ) -> Self {
        Self { cfg, positions: HashMap::new(), compliance, advisor, safety, bus }
    }

    pub fn position(&self, asset: &str) -> f64 {
        self.positions.get(asset).copied().unwrap_or(0.0)
    }

    pub async fn on_trade_plan(&mut self, plan: TradePlan) -> Option<Decision> {
        if self.safety.blocked(&self.cfg.agent_id) {
            log_gated(Domain::Risk, &self.cfg.agent_id, "trade_plan");
            return None;
        }
        let position = self.position(&plan.asset);
        match evaluate(&plan, position, &self.cfg, self.compliance.as_ref()) {
            Verdict::Approved => {
                self.positions.insert(plan.asset.clone(), position + plan.direction.sign() * plan.size);
                let approved = ApprovedTrade { plan, approved_by: self.cfg.agent_id.clone(), approval_time: ts_epoch_ms() };
                log(
                    Level::Info,
                    Domain::Risk,
                    "approved",
                    obj(&[
                        ("asset", v_str(&approved.plan.asset)),
                        ("size", v_num(approved.plan.size)),
                        ("position", v_num(self.position(&approved.plan.asset))),
                    ]),
                );
                self.bus.publish(&self.cfg.agent_id, Role::Action, Topic::Approved, Payload::Approved(approved.clone()));
                Some(Decision::Approved(approved))
            }
            Verdict::Rejected { reason, suggestion } => {
                let explanation = if reason == COMPLIANCE_VIOLATION {
                    None
                } else {
                    self.advisor.explain_rejection(&reason, suggestion.map(|s| s.size)).await.text()
                };
                log(
                    Level::Warn,
                    Domain::Risk,
                    "rejected",
                    obj(&[("asset", v_str(&plan.asset)), ("reason", v_str(&reason))]),
                );
                let feedback = RejectionFeedback {
                    reason,
                    plan,
                    rejected_by: self.cfg.agent_id.clone(),
                    timestamp: ts_epoch_ms(),
                    suggestion,
                    explanation,
                };
                self.bus.publish(&self.cfg.agent_id, Role::Feedback, Topic::Rejected, Payload::Rejected(feedback.clone()));
                Some(Decision::Rejected(feedback))
            }
        }
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            if let Payload::Plan(plan) = env.payload {
                self.on_trade_plan(plan).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::NoAdvisor;
    use crate::safety::RestrictedList;
    use crate::types::{ExecutionHints, Side};

    fn plan(asset: &str, direction: Side, size: f64, confidence: f64) -> TradePlan {
        TradePlan {
            asset: asset.into(),
            direction,
            size,
            confidence,
            sources: vec![],
            timestamp: 0,
            explanation: None,
            hints: ExecutionHints::default(),
        }
    }

    fn agent(bus: Arc<Bus>) -> RiskAgent {
        RiskAgent::new(
            RiskConfig::default(),
            Arc::new(RestrictedList::default()),
            Arc::new(NoAdvisor),
            Arc::new(SafetySwitch::new()),
            bus,
        )
    }

    #[test]
    fn test_compliance_rejection_has_no_suggestion() {
        let v = evaluate(&plan("GME", Side::Buy, 100.0, 0.9), 0.0, &RiskConfig::default(), &RestrictedList::default());
        assert_eq!(v, Verdict::Rejected { reason: "Compliance violation".into(), suggestion: None });
    }

    #[test]
    fn test_position_limit_suggestion() {
        let cfg = RiskConfig::default();
        let v = evaluate(&plan("AAPL", Side::Buy, 200.0, 0.9), 400.0, &cfg, &RestrictedList::permissive());
        assert_eq!(
            v,
            Verdict::Rejected {
                reason: "Trade would exceed position limit of 500 shares.".into(),
                suggestion: Some(SizeSuggestion { size: 100.0 }),
            }
        );
        // selling against a long position reduces exposure
        let v = evaluate(&plan("AAPL", Side::Sell, 200.0, 0.9), 400.0, &cfg, &RestrictedList::permissive());
        assert_eq!(v, Verdict::Approved);
    }

    #[test]
    fn test_confidence_boundary() {
        let cfg = RiskConfig::default();
        let list = RestrictedList::permissive();
        assert_eq!(evaluate(&plan("AAPL", Side::Buy, 100.0, 0.35), 0.0, &cfg, &list), Verdict::Approved);
        assert_eq!(
            evaluate(&plan("AAPL", Side::Buy, 101.0, 0.349), 0.0, &cfg, &list),
            Verdict::Rejected {
                reason: "Confidence too low (0.35).".into(),
                suggestion: Some(SizeSuggestion { size: 50.0 }),
            }
        );
    }

    #[tokio::test]
    async fn test_approval_updates_position() {
        let bus = Arc::new(Bus::new());
        let mut approved = bus.subscribe(Topic::Approved);
        let mut agent = agent(bus.clone());
        for _ in 0..5 {
            assert!(matches!(
                agent.on_trade_plan(plan("AAPL", Side::Buy, 100.0, 0.6)).await,
                Some(Decision::Approved(_))
            ));
        }
        assert_eq!(agent.position("AAPL"), 500.0);
        match agent.on_trade_plan(plan("AAPL", Side::Buy, 100.0, 0.6)).await {
            Some(Decision::Rejected(fb)) => {
                assert_eq!(fb.suggestion, Some(SizeSuggestion { size: 0.0 }));
                assert_eq!(fb.rejected_by, "risk-agent");
            }
            _ => panic!("expected rejection"),
        }
        assert_eq!(agent.position("AAPL"), 500.0);
        let env = approved.try_recv().unwrap();
        match env.payload {
            Payload::Approved(a) => assert_eq!(a.approved_by, "risk-agent"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_halted_gate_publishes_nothing() {
        let bus = Arc::new(Bus::new());
        let mut rejected = bus.subscribe(Topic::Rejected);
        let safety = Arc::new(SafetySwitch::new());
        safety.halt_all();
        let mut agent = RiskAgent::new(
            RiskConfig::default(),
            Arc::new(RestrictedList::default()),
            Arc::new(NoAdvisor),
            safety,
            bus.clone(),
        );
        assert!(agent.on_trade_plan(plan("GME", Side::Buy, 100.0, 0.9)).await.is_none());
        assert!(rejected.try_recv().is_err());
    }
}
