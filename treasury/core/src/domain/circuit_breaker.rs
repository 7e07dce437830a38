// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fiduciary Circuit Breaker (BC-14, ADR-124)
//!
//! Governance state machine evaluated before any consequential treasury
//! action performed autonomously (human not present). Trip conditions grade
//! each proposed action; a failing condition opens the breaker and parks the
//! agent behind a human escalation.
//!
//! ## Breaker States
//!
//! ```text
//!                 any FAIL
//!      CLOSED ──────────────► OPEN ──────────► TERMINATED
//!        ▲                     │ ▲   REJECT        (absorbing)
//!        │ APPROVE /           │ │
//!        │ MODIFY_AND_APPROVE  │ │ outside conditions /
//!        │                     ▼ │ ESCALATE_FURTHER
//!        └──────────────── HALF_OPEN
//!                APPROVE_WITH_CONDITIONS
//! ```
//!
//! ## Invariants
//!
//! - TERMINATED is absorbing. No decision, timeout or retry path resets it.
//! - Only discrete trip results and the breaker state gate actions;
//!   `risk_score` is observability and never blocks anything.
//! - An OPEN breaker stays OPEN until its escalation is decided; evaluation
//!   while OPEN never re-runs trip conditions.
//! - HALF_OPEN permits only operations matching the escalation's recorded
//!   conditions; anything outside them is treated as if the breaker were
//!   OPEN.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::TreasuryError;
use crate::domain::money::Money;

/// Identifier for a human escalation (`esc_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscalationId(pub String);

impl EscalationId {
    pub fn new() -> Self {
        Self(format!("esc_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for EscalationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named risk checks the breaker can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripConditionType {
    ValueThreshold,
    CumulativeThreshold,
    Velocity,
    AuthorityScope,
    Anomaly,
    TimeBased,
    Deviation,
    VendorTrust,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripConditionStatus {
    Pass,
    Fail,
    Warning,
}

impl TripConditionStatus {
    /// Severity weight used for the aggregate risk score.
    pub fn severity(&self) -> f64 {
        match self {
            Self::Pass => 0.0,
            Self::Warning => 0.5,
            Self::Fail => 1.0,
        }
    }
}

/// Breaker state controlling how much autonomy the agent retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FcbState {
    /// Normal operation, agent acts autonomously.
    Closed,
    /// All consequential actions blocked pending human review.
    Open,
    /// Bounded autonomy under the escalation's recorded conditions.
    HalfOpen,
    /// Permanently halted. Absorbing.
    Terminated,
}

/// Whether a human was present for the transaction under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentModality {
    HumanPresent,
    HumanNotPresent,
}

/// A human approver's ruling on an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationDecision {
    Approve,
    ApproveWithConditions,
    Reject,
    EscalateFurther,
    ModifyAndApprove,
}

/// Outcome of one trip-condition check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripConditionResult {
    pub condition_type: TripConditionType,
    pub status: TripConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl TripConditionResult {
    pub fn pass(condition_type: TripConditionType) -> Self {
        Self {
            condition_type,
            status: TripConditionStatus::Pass,
            threshold: None,
            actual_value: None,
            message: None,
            suggestion: None,
        }
    }

    pub fn with_status(mut self, status: TripConditionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_values(mut self, threshold: f64, actual_value: f64) -> Self {
        self.threshold = Some(threshold);
        self.actual_value = Some(actual_value);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Condition attached to an APPROVE_WITH_CONDITIONS decision. While the
/// breaker is HALF_OPEN, only operations every condition permits may run
/// without re-escalating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationCondition {
    /// Cap on any single transaction amount.
    MaxAmount { limit: Money },
    /// Operations permitted but flagged for enhanced monitoring.
    MonitoredOnly,
    /// Only the listed merchants may be paid.
    AllowedMerchants { merchant_ids: Vec<String> },
}

impl EscalationCondition {
    /// Whether this condition permits a transaction of `amount` to the
    /// given merchant.
    pub fn permits(&self, amount: &Money, merchant_id: Option<&str>) -> bool {
        match self {
            Self::MaxAmount { limit } => {
                amount.same_currency(limit) && amount.value <= limit.value
            }
            Self::MonitoredOnly => true,
            Self::AllowedMerchants { merchant_ids } => merchant_id
                .map(|m| merchant_ids.iter().any(|allowed| allowed == m))
                .unwrap_or(false),
        }
    }
}

/// Record of a human review triggered by an open breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanEscalation {
    pub escalation_id: EscalationId,
    pub triggered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<EscalationDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<EscalationCondition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default = "default_timeout_action")]
    pub default_action_on_timeout: EscalationDecision,
}

impl HumanEscalation {
    pub fn new(now: DateTime<Utc>, timeout_seconds: u64) -> Self {
        Self {
            escalation_id: EscalationId::new(),
            triggered_at: now,
            approver_id: None,
            decision: None,
            decided_at: None,
            conditions: None,
            notes: None,
            timeout_at: Some(now + Duration::seconds(timeout_seconds as i64)),
            default_action_on_timeout: EscalationDecision::Reject,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        !self.is_decided() && self.timeout_at.map(|t| now > t).unwrap_or(false)
    }

    /// Record the approver's ruling. An escalation is decided at most once.
    pub fn record_decision(
        &mut self,
        approver_id: impl Into<String>,
        decision: EscalationDecision,
        conditions: Option<Vec<EscalationCondition>>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TreasuryError> {
        if self.is_decided() {
            return Err(TreasuryError::ConflictDetected {
                detail: format!("escalation {} already decided", self.escalation_id),
            });
        }
        self.approver_id = Some(approver_id.into());
        self.decision = Some(decision);
        self.decided_at = Some(now);
        self.conditions = conditions;
        self.notes = notes;
        Ok(())
    }
}

/// Full record of one breaker evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcbEvaluation {
    pub fcb_state: FcbState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<FcbState>,
    pub trips_evaluated: u32,
    pub trips_triggered: u32,
    #[serde(default)]
    pub trip_results: Vec<TripConditionResult>,
    /// Aggregate severity in [0, 1]. Reporting only; never gates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_escalation: Option<HumanEscalation>,
    pub evaluated_at: DateTime<Utc>,
}

impl FcbEvaluation {
    pub fn new(previous_state: FcbState, now: DateTime<Utc>) -> Self {
        Self {
            fcb_state: previous_state,
            previous_state: Some(previous_state),
            trips_evaluated: 0,
            trips_triggered: 0,
            trip_results: Vec::new(),
            risk_score: None,
            human_escalation: None,
            evaluated_at: now,
        }
    }

    /// Append a result and maintain the trip counters. FAIL and WARNING both
    /// count as triggered.
    pub fn add_trip_result(&mut self, result: TripConditionResult) {
        self.trips_evaluated += 1;
        if matches!(
            result.status,
            TripConditionStatus::Fail | TripConditionStatus::Warning
        ) {
            self.trips_triggered += 1;
        }
        self.trip_results.push(result);
    }

    /// Whether any condition FAILed. Warnings alone never trip the breaker.
    pub fn has_tripped(&self) -> bool {
        self.trip_results
            .iter()
            .any(|r| r.status == TripConditionStatus::Fail)
    }

    /// Mean severity over all evaluated conditions; 0.0 with none evaluated.
    pub fn mean_severity(&self) -> f64 {
        if self.trip_results.is_empty() {
            return 0.0;
        }
        let total: f64 = self.trip_results.iter().map(|r| r.status.severity()).sum();
        total / self.trip_results.len() as f64
    }
}

/// Risk exchange payload attached to outbound payment artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPayload {
    pub fcb_evaluation: Option<FcbEvaluation>,
    pub agent_modality: AgentModality,
    pub agent_id: Option<String>,
    pub agent_type: Option<String>,
    pub session_id: Option<String>,
    pub cumulative_session_value: Option<f64>,
    pub transaction_count_today: Option<u32>,
    pub custom_signals: Option<HashMap<String, serde_json::Value>>,
}

impl Default for RiskPayload {
    fn default() -> Self {
        Self {
            fcb_evaluation: None,
            agent_modality: AgentModality::HumanPresent,
            agent_id: None,
            agent_type: None,
            session_id: None,
            cumulative_session_value: None,
            transaction_count_today: None,
            custom_signals: None,
        }
    }
}

/// One configured guard the breaker runs per evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripCondition {
    pub condition_type: TripConditionType,
    /// Limit the observed value is graded against. A configured condition
    /// without a threshold grades WARNING (visible misconfiguration).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Fraction of the threshold at which the grade downgrades to WARNING
    /// instead of PASS (e.g. 0.8).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_ratio: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TripCondition {
    pub fn new(condition_type: TripConditionType, threshold: f64) -> Self {
        Self {
            condition_type,
            threshold: Some(threshold),
            warning_ratio: None,
            enabled: true,
            description: None,
        }
    }

    pub fn with_warning_ratio(mut self, ratio: f64) -> Self {
        self.warning_ratio = Some(ratio);
        self
    }
}

/// Caller-aggregated facts about the transaction under evaluation.
///
/// The breaker is a pure function of these inputs; whoever assembles them is
/// responsible for reading aggregate counters from a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSignals {
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    /// Session value before this transaction.
    #[serde(default)]
    pub cumulative_session_value: f64,
    /// Transactions already counted in the velocity window.
    #[serde(default)]
    pub transaction_count_in_window: u32,
    /// Per-transaction authority granted by the session intent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_cap: Option<Money>,
    /// Caller-computed actuals for ANOMALY, TIME_BASED, DEVIATION,
    /// VENDOR_TRUST and CUSTOM conditions, oriented so larger means riskier.
    #[serde(default)]
    pub actuals: HashMap<TripConditionType, f64>,
}

impl TransactionSignals {
    pub fn for_amount(amount: Money) -> Self {
        Self {
            amount,
            merchant_id: None,
            cumulative_session_value: 0.0,
            transaction_count_in_window: 0,
            authority_cap: None,
            actuals: HashMap::new(),
        }
    }
}

/// Per-agent breaker aggregate: configured conditions, current state and the
/// escalation governing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiduciaryBreaker {
    pub agent_id: String,
    pub state: FcbState,
    pub conditions: Vec<TripCondition>,
    /// Current escalation record; an undecided one blocks the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<HumanEscalation>,
    #[serde(default = "default_escalation_timeout")]
    pub escalation_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluation: Option<FcbEvaluation>,
    pub created_at: DateTime<Utc>,
}

impl FiduciaryBreaker {
    pub fn new(
        agent_id: impl Into<String>,
        conditions: Vec<TripCondition>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: FcbState::Closed,
            conditions,
            escalation: None,
            escalation_timeout_seconds: default_escalation_timeout(),
            last_evaluation: None,
            created_at: now,
        }
    }

    /// Evaluate a proposed transaction against the breaker.
    ///
    /// HUMAN_PRESENT activity skips trip conditions (they guard autonomous
    /// spending) but the current state still gates: an OPEN breaker blocks
    /// regardless of modality. TERMINATED is an error, never an evaluation.
    pub fn evaluate(
        &mut self,
        signals: &TransactionSignals,
        modality: AgentModality,
        now: DateTime<Utc>,
    ) -> Result<FcbEvaluation, TreasuryError> {
        if self.state == FcbState::Terminated {
            return Err(TreasuryError::invalid_state(
                "evaluate transaction",
                self.state,
            ));
        }

        let mut evaluation = FcbEvaluation::new(self.state, now);

        if modality == AgentModality::HumanPresent {
            evaluation.risk_score = Some(0.0);
            evaluation.human_escalation = self.escalation.clone();
            self.last_evaluation = Some(evaluation.clone());
            return Ok(evaluation);
        }

        match self.state {
            FcbState::Open => {
                // Parked behind an undecided escalation; nothing re-runs.
                evaluation.risk_score = Some(evaluation.mean_severity());
                evaluation.human_escalation = self.escalation.clone();
            }
            FcbState::HalfOpen if !self.half_open_permits(signals) => {
                // Outside the approver's conditions: treat as if OPEN.
                evaluation.add_trip_result(
                    TripConditionResult::pass(TripConditionType::AuthorityScope)
                        .with_status(TripConditionStatus::Fail)
                        .with_message("operation outside the escalation's recorded conditions")
                        .with_suggestion("request a fresh review for this operation"),
                );
                evaluation.risk_score = Some(evaluation.mean_severity());
                self.open_with_escalation(&mut evaluation, now);
            }
            FcbState::Closed | FcbState::HalfOpen => {
                for condition in &self.conditions {
                    if !condition.enabled {
                        continue;
                    }
                    evaluation.add_trip_result(self.evaluate_condition(condition, signals));
                }
                evaluation.risk_score = Some(evaluation.mean_severity());

                if evaluation.has_tripped() {
                    self.open_with_escalation(&mut evaluation, now);
                } else {
                    // Clean run: CLOSED stays CLOSED; HALF_OPEN stays until
                    // an APPROVE promotes it.
                    evaluation.fcb_state = self.state;
                    evaluation.human_escalation = self.escalation.clone();
                }
            }
            FcbState::Terminated => {
                return Err(TreasuryError::invalid_state(
                    "evaluate transaction",
                    self.state,
                ))
            }
        }

        self.last_evaluation = Some(evaluation.clone());
        Ok(evaluation)
    }

    /// Apply a human decision to the current escalation and transition the
    /// breaker accordingly.
    pub fn apply_decision(
        &mut self,
        approver_id: impl Into<String>,
        decision: EscalationDecision,
        conditions: Option<Vec<EscalationCondition>>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FcbState, TreasuryError> {
        if self.state == FcbState::Terminated {
            return Err(TreasuryError::invalid_state("apply decision", self.state));
        }
        let escalation = self
            .escalation
            .as_mut()
            .ok_or_else(|| TreasuryError::not_found("escalation", &self.agent_id))?;
        escalation.record_decision(approver_id, decision, conditions, notes, now)?;

        self.state = match decision {
            EscalationDecision::Approve | EscalationDecision::ModifyAndApprove => FcbState::Closed,
            EscalationDecision::ApproveWithConditions => FcbState::HalfOpen,
            EscalationDecision::Reject => FcbState::Terminated,
            EscalationDecision::EscalateFurther => {
                // Forwarded: the decided record is replaced by a fresh
                // escalation for the next approver.
                let forwarded_from = escalation.escalation_id.clone();
                let mut next = HumanEscalation::new(now, self.escalation_timeout_seconds);
                next.notes = Some(format!("forwarded from {forwarded_from}"));
                self.escalation = Some(next);
                FcbState::Open
            }
        };
        Ok(self.state)
    }

    /// Apply the escalation's default action once its deadline has passed
    /// without a decision. Returns the resulting state, or `None` when
    /// nothing was due.
    pub fn apply_timeout_default(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<FcbState>, TreasuryError> {
        let Some(escalation) = &self.escalation else {
            return Ok(None);
        };
        if !escalation.is_timed_out(now) {
            return Ok(None);
        }
        let action = escalation.default_action_on_timeout;
        let state = self.apply_decision(
            "system:timeout",
            action,
            None,
            Some("escalation deadline passed without a decision".to_string()),
            now,
        )?;
        Ok(Some(state))
    }

    /// Whether the escalation's conditions permit this operation while
    /// HALF_OPEN. No recorded conditions permits everything (monitored
    /// autonomy).
    pub fn half_open_permits(&self, signals: &TransactionSignals) -> bool {
        let Some(conditions) = self
            .escalation
            .as_ref()
            .and_then(|e| e.conditions.as_ref())
        else {
            return true;
        };
        conditions
            .iter()
            .all(|c| c.permits(&signals.amount, signals.merchant_id.as_deref()))
    }

    fn open_with_escalation(&mut self, evaluation: &mut FcbEvaluation, now: DateTime<Utc>) {
        self.state = FcbState::Open;
        evaluation.fcb_state = FcbState::Open;
        let escalation = HumanEscalation::new(now, self.escalation_timeout_seconds);
        evaluation.human_escalation = Some(escalation.clone());
        self.escalation = Some(escalation);
    }

    fn evaluate_condition(
        &self,
        condition: &TripCondition,
        signals: &TransactionSignals,
    ) -> TripConditionResult {
        let base = TripConditionResult::pass(condition.condition_type);
        match condition.condition_type {
            TripConditionType::ValueThreshold => {
                let Some(threshold) = condition.threshold else {
                    return misconfigured(base);
                };
                let actual = signals.amount.value;
                let status = grade(actual, threshold, condition.warning_ratio, false);
                let result = base.with_status(status).with_values(threshold, actual);
                if status == TripConditionStatus::Fail {
                    result
                        .with_message(format!("amount {actual} exceeds value threshold {threshold}"))
                        .with_suggestion("split the transaction or escalate for approval")
                } else {
                    result
                }
            }
            TripConditionType::CumulativeThreshold => {
                let Some(threshold) = condition.threshold else {
                    return misconfigured(base);
                };
                // Aggregate including the transaction under evaluation.
                let actual = signals.cumulative_session_value + signals.amount.value;
                let status = grade(actual, threshold, condition.warning_ratio, false);
                let result = base.with_status(status).with_values(threshold, actual);
                if status == TripConditionStatus::Fail {
                    result
                        .with_message(format!(
                            "cumulative session value {actual} exceeds threshold {threshold}"
                        ))
                        .with_suggestion("escalate to the treasury owner")
                } else {
                    result
                }
            }
            TripConditionType::Velocity => {
                let Some(threshold) = condition.threshold else {
                    return misconfigured(base);
                };
                let actual = f64::from(signals.transaction_count_in_window);
                // Reaching the limit already fails; there is no headroom for
                // one more transaction at the cap.
                let status = grade(actual, threshold, condition.warning_ratio, true);
                let result = base.with_status(status).with_values(threshold, actual);
                if status == TripConditionStatus::Fail {
                    result
                        .with_message(format!(
                            "transaction count {actual} reached velocity limit {threshold}"
                        ))
                        .with_suggestion("wait for the velocity window to roll over")
                } else {
                    result
                }
            }
            TripConditionType::AuthorityScope => {
                if let Some(cap) = &signals.authority_cap {
                    if !signals.amount.same_currency(cap) {
                        return base
                            .with_status(TripConditionStatus::Fail)
                            .with_message("amount currency outside the granted authority")
                            .with_suggestion("request a session intent in this currency");
                    }
                    let status = grade(signals.amount.value, cap.value, condition.warning_ratio, false);
                    let result = base
                        .with_status(status)
                        .with_values(cap.value, signals.amount.value);
                    if status == TripConditionStatus::Fail {
                        result
                            .with_message("amount exceeds the granted session authority")
                            .with_suggestion("request a broader session intent")
                    } else {
                        result
                    }
                } else if let Some(threshold) = condition.threshold {
                    let status =
                        grade(signals.amount.value, threshold, condition.warning_ratio, false);
                    base.with_status(status)
                        .with_values(threshold, signals.amount.value)
                } else {
                    base.with_status(TripConditionStatus::Fail)
                        .with_message("no spending authority recorded for this action")
                        .with_suggestion("grant a session intent covering this action")
                }
            }
            TripConditionType::Anomaly
            | TripConditionType::TimeBased
            | TripConditionType::Deviation
            | TripConditionType::VendorTrust
            | TripConditionType::Custom => {
                let Some(actual) = signals.actuals.get(&condition.condition_type).copied() else {
                    return base.with_message("no signal supplied for this condition");
                };
                let Some(threshold) = condition.threshold else {
                    return misconfigured(base);
                };
                let status = grade(actual, threshold, condition.warning_ratio, false);
                let result = base.with_status(status).with_values(threshold, actual);
                if status == TripConditionStatus::Fail {
                    result.with_message(format!(
                        "signal {actual} exceeds threshold {threshold}"
                    ))
                } else {
                    result
                }
            }
        }
    }
}

/// Grade an actual against a threshold. `at_threshold_fails` makes the
/// comparison inclusive (velocity-style counters).
fn grade(
    actual: f64,
    threshold: f64,
    warning_ratio: Option<f64>,
    at_threshold_fails: bool,
) -> TripConditionStatus {
    let failed = if at_threshold_fails {
        actual >= threshold
    } else {
        actual > threshold
    };
    if failed {
        return TripConditionStatus::Fail;
    }
    if let Some(ratio) = warning_ratio {
        if actual > threshold * ratio {
            return TripConditionStatus::Warning;
        }
    }
    TripConditionStatus::Pass
}

fn misconfigured(base: TripConditionResult) -> TripConditionResult {
    base.with_status(TripConditionStatus::Warning)
        .with_message("condition has no threshold configured")
        .with_suggestion("configure a threshold or disable the condition")
}

fn default_timeout_action() -> EscalationDecision {
    EscalationDecision::Reject
}

fn default_true() -> bool {
    true
}

fn default_escalation_timeout() -> u64 {
    3_600
}
