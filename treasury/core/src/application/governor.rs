// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fiduciary Governor Application Service
//!
//! Keeps one fiduciary circuit breaker per registered agent and gates
//! consequential spending through it:
//! - Domain layer: FiduciaryBreaker state machine and trip conditions
//! - Event bus: Publishing GovernanceEvents for the audit trail
//!
//! The governor is synchronous. Breakers are pure functions of their inputs
//! and the clock, so callers pass `now` explicitly and the event bus is the
//! only side channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::domain::circuit_breaker::{
    AgentModality, EscalationCondition, EscalationDecision, FcbEvaluation, FcbState,
    FiduciaryBreaker, TransactionSignals, TripCondition,
};
use crate::domain::error::TreasuryError;
use crate::domain::events::GovernanceEvent;
use crate::infrastructure::event_bus::EventBus;

pub struct FiduciaryGovernor {
    breakers: DashMap<String, FiduciaryBreaker>,
    event_bus: Arc<EventBus>,
}

impl FiduciaryGovernor {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            breakers: DashMap::new(),
            event_bus,
        }
    }

    /// Register an agent with its trip conditions. An agent is registered
    /// at most once; replacing conditions requires an explicit re-register
    /// flow, not a silent overwrite.
    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        conditions: Vec<TripCondition>,
        now: DateTime<Utc>,
    ) -> Result<(), TreasuryError> {
        let agent_id = agent_id.into();
        if self.breakers.contains_key(&agent_id) {
            return Err(TreasuryError::ConflictDetected {
                detail: format!("agent {agent_id} already has a registered breaker"),
            });
        }

        info!(
            "Registering fiduciary breaker for {} with {} trip conditions",
            agent_id,
            conditions.len()
        );
        self.breakers
            .insert(agent_id.clone(), FiduciaryBreaker::new(agent_id, conditions, now));
        Ok(())
    }

    /// Run a proposed transaction through the agent's breaker. Publishes
    /// BreakerOpened when this evaluation tripped it open.
    pub fn evaluate(
        &self,
        agent_id: &str,
        signals: &TransactionSignals,
        modality: AgentModality,
        now: DateTime<Utc>,
    ) -> Result<FcbEvaluation, TreasuryError> {
        let mut breaker = self
            .breakers
            .get_mut(agent_id)
            .ok_or_else(|| TreasuryError::not_found("breaker", agent_id))?;

        let previous_state = breaker.state;
        let evaluation = breaker.evaluate(signals, modality, now)?;
        drop(breaker);

        if evaluation.fcb_state == FcbState::Open && previous_state != FcbState::Open {
            if let Some(escalation) = &evaluation.human_escalation {
                warn!(
                    "Fiduciary breaker opened for {} (risk score {:.2}, escalation {})",
                    agent_id,
                    evaluation.risk_score.unwrap_or(0.0),
                    escalation.escalation_id
                );
                self.event_bus.publish_governance_event(GovernanceEvent::BreakerOpened {
                    agent_id: agent_id.to_string(),
                    escalation_id: escalation.escalation_id.clone(),
                    risk_score: evaluation.risk_score.unwrap_or(0.0),
                    opened_at: now,
                });
            }
        }

        Ok(evaluation)
    }

    /// Evaluate and refuse OPEN outcomes. The EscalationRequired error
    /// carries the escalation id a human must decide.
    pub fn ensure_permitted(
        &self,
        agent_id: &str,
        signals: &TransactionSignals,
        modality: AgentModality,
        now: DateTime<Utc>,
    ) -> Result<FcbEvaluation, TreasuryError> {
        let evaluation = self.evaluate(agent_id, signals, modality, now)?;
        if evaluation.fcb_state == FcbState::Open {
            let escalation_id = evaluation
                .human_escalation
                .as_ref()
                .map(|e| e.escalation_id.to_string())
                .unwrap_or_default();

            self.event_bus.publish_governance_event(GovernanceEvent::TransactionBlocked {
                agent_id: agent_id.to_string(),
                reason: format!(
                    "breaker is OPEN pending escalation {escalation_id}"
                ),
                blocked_at: now,
            });

            return Err(TreasuryError::EscalationRequired { escalation_id });
        }
        Ok(evaluation)
    }

    /// Apply a human approver's ruling to the agent's current escalation.
    pub fn apply_decision(
        &self,
        agent_id: &str,
        approver_id: &str,
        decision: EscalationDecision,
        conditions: Option<Vec<EscalationCondition>>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FcbState, TreasuryError> {
        let mut breaker = self
            .breakers
            .get_mut(agent_id)
            .ok_or_else(|| TreasuryError::not_found("breaker", agent_id))?;

        let escalation_id = breaker
            .escalation
            .as_ref()
            .map(|e| e.escalation_id.clone())
            .ok_or_else(|| TreasuryError::not_found("escalation", agent_id))?;

        let new_state = breaker.apply_decision(approver_id, decision, conditions, notes, now)?;
        drop(breaker);

        info!(
            "Escalation {} for {} decided by {}: {:?} -> {:?}",
            escalation_id, agent_id, approver_id, decision, new_state
        );
        self.event_bus.publish_governance_event(GovernanceEvent::EscalationDecided {
            agent_id: agent_id.to_string(),
            escalation_id,
            approver_id: approver_id.to_string(),
            decision,
            new_state,
            decided_at: now,
        });

        Ok(new_state)
    }

    /// Apply timeout defaults to every breaker whose escalation deadline
    /// passed undecided. Returns the affected agent ids.
    pub fn apply_timeout_defaults(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut applied = Vec::new();
        for mut entry in self.breakers.iter_mut() {
            let agent_id = entry.key().clone();
            let escalation_id = match entry.escalation.as_ref() {
                Some(e) => e.escalation_id.clone(),
                None => continue,
            };
            match entry.apply_timeout_default(now) {
                Ok(Some(new_state)) => {
                    warn!(
                        "Escalation {} for {} timed out, defaulted to {:?}",
                        escalation_id, agent_id, new_state
                    );
                    self.event_bus.publish_governance_event(
                        GovernanceEvent::EscalationTimedOut {
                            agent_id: agent_id.clone(),
                            escalation_id,
                            new_state,
                            timed_out_at: now,
                        },
                    );
                    applied.push(agent_id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Timeout default for {} not applied: {}", agent_id, e);
                }
            }
        }
        applied
    }

    pub fn get_state(&self, agent_id: &str) -> Result<FcbState, TreasuryError> {
        self.breakers
            .get(agent_id)
            .map(|b| b.state)
            .ok_or_else(|| TreasuryError::not_found("breaker", agent_id))
    }

    /// Snapshot of the agent's full breaker, escalation record included.
    pub fn get_breaker(&self, agent_id: &str) -> Result<FiduciaryBreaker, TreasuryError> {
        self.breakers
            .get(agent_id)
            .map(|b| b.clone())
            .ok_or_else(|| TreasuryError::not_found("breaker", agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit_breaker::TripConditionType;
    use crate::domain::money::Money;
    use crate::infrastructure::event_bus::TreasuryEvent;

    fn value_capped_governor(cap: f64) -> (FiduciaryGovernor, Arc<EventBus>) {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let governor = FiduciaryGovernor::new(event_bus.clone());
        governor
            .register_agent(
                "agent-a",
                vec![TripCondition::new(TripConditionType::ValueThreshold, cap)],
                Utc::now(),
            )
            .expect("Failed to register agent");
        (governor, event_bus)
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let (governor, _bus) = value_capped_governor(100.0);
        let err = governor
            .register_agent("agent-a", Vec::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, TreasuryError::ConflictDetected { .. }));
    }

    #[test]
    fn test_unknown_agent_is_not_found() {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let governor = FiduciaryGovernor::new(event_bus);
        let err = governor
            .evaluate(
                "ghost",
                &TransactionSignals::for_amount(Money::usd(1.0)),
                AgentModality::HumanNotPresent,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, TreasuryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_trip_opens_breaker_and_publishes() {
        let (governor, event_bus) = value_capped_governor(100.0);
        let mut receiver = event_bus.subscribe();
        let now = Utc::now();

        let evaluation = governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(50.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();
        assert_eq!(evaluation.fcb_state, FcbState::Closed);
        assert!(evaluation.human_escalation.is_none());

        let evaluation = governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(150.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();
        assert_eq!(evaluation.fcb_state, FcbState::Open);
        assert!(evaluation.human_escalation.is_some());
        assert_eq!(governor.get_state("agent-a").unwrap(), FcbState::Open);

        match receiver.try_recv().expect("expected BreakerOpened") {
            TreasuryEvent::Governance(GovernanceEvent::BreakerOpened {
                agent_id,
                risk_score,
                ..
            }) => {
                assert_eq!(agent_id, "agent-a");
                assert!(risk_score > 0.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_with_escalation_id() {
        let (governor, event_bus) = value_capped_governor(100.0);
        let now = Utc::now();
        governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(150.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();

        let mut receiver = event_bus.subscribe();
        let err = governor
            .ensure_permitted(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(1.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap_err();

        let expected_id = governor
            .get_breaker("agent-a")
            .unwrap()
            .escalation
            .expect("escalation present")
            .escalation_id;
        match err {
            TreasuryError::EscalationRequired { escalation_id } => {
                assert_eq!(escalation_id, expected_id.to_string());
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(matches!(
            receiver.try_recv(),
            Ok(TreasuryEvent::Governance(GovernanceEvent::TransactionBlocked { .. }))
        ));
    }

    #[test]
    fn test_human_present_skips_conditions_but_not_open_state() {
        let (governor, _bus) = value_capped_governor(100.0);
        let now = Utc::now();

        // Over the cap but with a human present: no trip runs.
        let evaluation = governor
            .ensure_permitted(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(500.0)),
                AgentModality::HumanPresent,
                now,
            )
            .unwrap();
        assert_eq!(evaluation.fcb_state, FcbState::Closed);
        assert_eq!(evaluation.trips_evaluated, 0);

        // Once OPEN, modality no longer helps.
        governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(150.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();
        let err = governor
            .ensure_permitted(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(1.0)),
                AgentModality::HumanPresent,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, TreasuryError::EscalationRequired { .. }));
    }

    #[tokio::test]
    async fn test_conditional_approval_bounds_autonomy() {
        let (governor, event_bus) = value_capped_governor(100.0);
        let now = Utc::now();
        governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(150.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();

        let mut receiver = event_bus.subscribe();
        let new_state = governor
            .apply_decision(
                "agent-a",
                "cfo@example.com",
                EscalationDecision::ApproveWithConditions,
                Some(vec![EscalationCondition::MaxAmount {
                    limit: Money::usd(25.0),
                }]),
                Some("small purchases only".to_string()),
                now,
            )
            .unwrap();
        assert_eq!(new_state, FcbState::HalfOpen);
        assert!(matches!(
            receiver.try_recv(),
            Ok(TreasuryEvent::Governance(GovernanceEvent::EscalationDecided { .. }))
        ));

        // Within the approved bound.
        governor
            .ensure_permitted(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(20.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .expect("within conditions");

        // Outside it: back to OPEN with a fresh escalation.
        let err = governor
            .ensure_permitted(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(30.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, TreasuryError::EscalationRequired { .. }));
        assert_eq!(governor.get_state("agent-a").unwrap(), FcbState::Open);
    }

    #[test]
    fn test_rejection_terminates_agent() {
        let (governor, _bus) = value_capped_governor(100.0);
        let now = Utc::now();
        governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(150.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();

        let new_state = governor
            .apply_decision(
                "agent-a",
                "cfo@example.com",
                EscalationDecision::Reject,
                None,
                None,
                now,
            )
            .unwrap();
        assert_eq!(new_state, FcbState::Terminated);

        let err = governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(1.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_timeout_default_rejects_undecided_escalations() {
        let (governor, event_bus) = value_capped_governor(100.0);
        let now = Utc::now();
        governor
            .evaluate(
                "agent-a",
                &TransactionSignals::for_amount(Money::usd(150.0)),
                AgentModality::HumanNotPresent,
                now,
            )
            .unwrap();

        let mut receiver = event_bus.subscribe();

        // Before the deadline nothing applies.
        assert!(governor.apply_timeout_defaults(now).is_empty());

        // Past the deadline the default (Reject) terminates the agent.
        let later = now + chrono::Duration::hours(2);
        let applied = governor.apply_timeout_defaults(later);
        assert_eq!(applied, vec!["agent-a".to_string()]);
        assert_eq!(governor.get_state("agent-a").unwrap(), FcbState::Terminated);

        match receiver.try_recv().expect("expected EscalationTimedOut") {
            TreasuryEvent::Governance(GovernanceEvent::EscalationTimedOut {
                new_state, ..
            }) => assert_eq!(new_state, FcbState::Terminated),
            other => panic!("unexpected event: {other:?}"),
        }

        // Idempotent: a decided escalation never times out again.
        assert!(governor.apply_timeout_defaults(later).is_empty());
    }
}
