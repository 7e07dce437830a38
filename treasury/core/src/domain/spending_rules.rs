// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Programmable Spending Rules (BC-14, ADR-126)
//!
//! Typed constraints autonomous agents must satisfy before spending on a
//! user's behalf. Rules form a closed sum type so new constraint kinds keep
//! exhaustive-match safety, and a [`SpendingRuleSet`] aggregates them under
//! an ALL or ANY mode.
//!
//! ## Invariants
//!
//! - Rules are evaluated (and reported) in ascending priority order; lower
//!   numbers run first. Disabled rules produce no result entry.
//! - A rule whose evaluation errors (bad regex, unknown timezone) is
//!   recorded as failed with the error attached, never silently skipped.
//! - Evaluation is a pure function of the supplied [`TransactionContext`];
//!   historical aggregates are the caller's to pre-compute.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::money::{Money, MONEY_EPSILON};

/// Discriminant for the rule sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendingRuleType {
    AmountConstraint,
    TimeConstraint,
    MerchantConstraint,
    CategoryConstraint,
    FrequencyConstraint,
}

/// Comparison operators for amount constraints.
///
/// `In`, `NotIn` and `Matches` exist for forward compatibility with
/// list/pattern constraints; they carry no amount semantics and never pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
    In,
    NotIn,
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintType {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    All,
    Any,
}

/// Failure inside a single rule's evaluation. Captured per rule, never
/// propagated out of the rule set.
#[derive(Debug, Error)]
pub enum RuleEvaluationError {
    #[error("invalid merchant pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unrecognized timezone {timezone:?}")]
    InvalidTimezone { timezone: String },
}

/// Facts about the proposed transaction, assembled by the caller.
///
/// The `*_in_window` aggregates are externally pre-computed; this engine
/// never queries history itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub historical_amount_in_window: f64,
    #[serde(default)]
    pub merchant_transaction_count_in_window: u32,
    #[serde(default)]
    pub total_transaction_count_in_window: u32,
}

impl TransactionContext {
    pub fn for_amount(amount: Money) -> Self {
        Self {
            amount: Some(amount),
            ..Self::default()
        }
    }

    pub fn with_merchant(mut self, merchant_id: impl Into<String>) -> Self {
        self.merchant_id = Some(merchant_id.into());
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }
}

/// Per-transaction or windowed-aggregate amount limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountConstraint {
    pub limit_amount: Money,
    #[serde(default = "default_operator")]
    pub operator: ConstraintOperator,
    /// `None` applies the limit per transaction; otherwise the caller's
    /// windowed aggregate plus this amount is compared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window_hours: Option<u32>,
    /// Whether the caller's aggregate should count pending transactions.
    /// Recorded for the aggregating layer; not applied here.
    #[serde(default = "default_true")]
    pub include_pending: bool,
}

impl AmountConstraint {
    fn evaluate(&self, context: &TransactionContext) -> Result<bool, RuleEvaluationError> {
        let Some(amount) = &context.amount else {
            return Ok(false);
        };
        // No conversion service here: a currency mismatch fails the rule.
        if !amount.same_currency(&self.limit_amount) {
            return Ok(false);
        }

        let compared = match self.time_window_hours {
            None => amount.value,
            Some(_) => context.historical_amount_in_window + amount.value,
        };
        Ok(self.compare(compared, self.limit_amount.value))
    }

    fn compare(&self, value: f64, limit: f64) -> bool {
        match self.operator {
            ConstraintOperator::Lt => value < limit,
            ConstraintOperator::Lte => value <= limit,
            ConstraintOperator::Gt => value > limit,
            ConstraintOperator::Gte => value >= limit,
            ConstraintOperator::Eq => (value - limit).abs() < MONEY_EPSILON,
            ConstraintOperator::Ne => (value - limit).abs() >= MONEY_EPSILON,
            ConstraintOperator::In | ConstraintOperator::NotIn | ConstraintOperator::Matches => {
                false
            }
        }
    }
}

/// Absolute validity window plus hour-of-day and day-of-week filters,
/// evaluated in the rule's configured timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConstraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Allowed hours of day (0-23). `None` allows all hours.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_hours: Option<Vec<u32>>,
    /// Allowed days of week (0 = Monday, 6 = Sunday). `None` allows all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_days_of_week: Option<Vec<u32>>,
    /// `"UTC"` or a fixed offset such as `"+05:30"`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl TimeConstraint {
    fn evaluate(
        &self,
        context: &TransactionContext,
        now: DateTime<Utc>,
    ) -> Result<bool, RuleEvaluationError> {
        let transaction_time = context.timestamp.unwrap_or(now);

        // Absolute bounds compare instants, independent of timezone.
        if let Some(valid_from) = self.valid_from {
            if transaction_time < valid_from {
                return Ok(false);
            }
        }
        if let Some(valid_until) = self.valid_until {
            if transaction_time > valid_until {
                return Ok(false);
            }
        }

        if self.allowed_hours.is_none() && self.allowed_days_of_week.is_none() {
            return Ok(true);
        }

        let local = transaction_time.with_timezone(&self.resolve_offset()?);

        if let Some(hours) = &self.allowed_hours {
            if !hours.contains(&local.hour()) {
                return Ok(false);
            }
        }
        if let Some(days) = &self.allowed_days_of_week {
            if !days.contains(&local.weekday().num_days_from_monday()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn resolve_offset(&self) -> Result<FixedOffset, RuleEvaluationError> {
        let raw = if self.timezone.eq_ignore_ascii_case("utc") {
            "+00:00"
        } else {
            self.timezone.as_str()
        };
        raw.parse().map_err(|_| RuleEvaluationError::InvalidTimezone {
            timezone: self.timezone.clone(),
        })
    }
}

/// Allow-list or deny-list of merchants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantConstraint {
    /// At least one merchant identifier (or pattern).
    pub merchant_ids: Vec<String>,
    pub constraint_type: ConstraintType,
    #[serde(default = "default_match_type")]
    pub match_type: MatchType,
}

impl MerchantConstraint {
    fn evaluate(&self, context: &TransactionContext) -> Result<bool, RuleEvaluationError> {
        // A transaction without a merchant cannot satisfy a merchant rule,
        // deny-lists included: ambiguous data is denied.
        let Some(merchant_id) = &context.merchant_id else {
            return Ok(false);
        };

        let is_match = self.matches(merchant_id)?;
        Ok(match self.constraint_type {
            ConstraintType::Allow => is_match,
            ConstraintType::Deny => !is_match,
        })
    }

    fn matches(&self, merchant_id: &str) -> Result<bool, RuleEvaluationError> {
        for candidate in &self.merchant_ids {
            let matched = match self.match_type {
                MatchType::Exact => merchant_id == candidate,
                MatchType::Prefix => merchant_id.starts_with(candidate.as_str()),
                MatchType::Regex => {
                    // Anchored at the start; trailing content is allowed.
                    let pattern = format!(r"\A(?:{candidate})");
                    let regex =
                        Regex::new(&pattern).map_err(|source| RuleEvaluationError::InvalidPattern {
                            pattern: candidate.clone(),
                            source,
                        })?;
                    regex.is_match(merchant_id)
                }
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Allow-list or deny-list of product categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConstraint {
    /// At least one category.
    pub categories: Vec<String>,
    pub constraint_type: ConstraintType,
    #[serde(default = "default_category_system")]
    pub category_system: String,
}

impl CategoryConstraint {
    fn evaluate(&self, context: &TransactionContext) -> Result<bool, RuleEvaluationError> {
        if context.categories.is_empty() {
            // Without category data an allow-list cannot be satisfied; a
            // deny-list has nothing to deny.
            return Ok(self.constraint_type == ConstraintType::Deny);
        }

        let has_match = context
            .categories
            .iter()
            .any(|category| self.categories.contains(category));
        Ok(match self.constraint_type {
            ConstraintType::Allow => has_match,
            ConstraintType::Deny => !has_match,
        })
    }
}

/// Cap on transaction count within a window, globally or per merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyConstraint {
    pub max_transactions: u32,
    pub time_window_hours: u32,
    #[serde(default)]
    pub merchant_specific: bool,
}

impl FrequencyConstraint {
    fn evaluate(&self, context: &TransactionContext) -> Result<bool, RuleEvaluationError> {
        let count = if self.merchant_specific {
            context.merchant_transaction_count_in_window
        } else {
            context.total_transaction_count_in_window
        };
        Ok(count < self.max_transactions)
    }
}

/// The closed sum of constraint kinds, tagged by `rule_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleConstraint {
    AmountConstraint(AmountConstraint),
    TimeConstraint(TimeConstraint),
    MerchantConstraint(MerchantConstraint),
    CategoryConstraint(CategoryConstraint),
    FrequencyConstraint(FrequencyConstraint),
}

impl RuleConstraint {
    pub fn rule_type(&self) -> SpendingRuleType {
        match self {
            Self::AmountConstraint(_) => SpendingRuleType::AmountConstraint,
            Self::TimeConstraint(_) => SpendingRuleType::TimeConstraint,
            Self::MerchantConstraint(_) => SpendingRuleType::MerchantConstraint,
            Self::CategoryConstraint(_) => SpendingRuleType::CategoryConstraint,
            Self::FrequencyConstraint(_) => SpendingRuleType::FrequencyConstraint,
        }
    }

    fn evaluate(
        &self,
        context: &TransactionContext,
        now: DateTime<Utc>,
    ) -> Result<bool, RuleEvaluationError> {
        match self {
            Self::AmountConstraint(c) => c.evaluate(context),
            Self::TimeConstraint(c) => c.evaluate(context, now),
            Self::MerchantConstraint(c) => c.evaluate(context),
            Self::CategoryConstraint(c) => c.evaluate(context),
            Self::FrequencyConstraint(c) => c.evaluate(context),
        }
    }
}

/// One programmable constraint with scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingRule {
    pub rule_id: String,
    pub description: String,
    /// 1..=1000; lower numbers evaluate first.
    #[serde(default = "default_priority")]
    pub priority: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub constraint: RuleConstraint,
}

impl SpendingRule {
    pub fn new(
        rule_id: impl Into<String>,
        description: impl Into<String>,
        constraint: RuleConstraint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            description: description.into(),
            priority: default_priority(),
            enabled: true,
            created_at: now,
            constraint,
        }
    }

    /// Clamped to the valid 1..=1000 range.
    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority.clamp(1, 1000);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outcome of one rule within a rule-set evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub rule_type: SpendingRuleType,
    pub description: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated outcome of a rule-set evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetEvaluation {
    pub allowed: bool,
    pub rule_results: Vec<RuleResult>,
    pub message: String,
    pub evaluation_mode: EvaluationMode,
}

/// A prioritized collection of spending rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingRuleSet {
    #[serde(default)]
    pub rules: Vec<SpendingRule>,
    #[serde(default = "default_evaluation_mode")]
    pub evaluation_mode: EvaluationMode,
    pub created_at: DateTime<Utc>,
}

impl SpendingRuleSet {
    pub fn new(evaluation_mode: EvaluationMode, now: DateTime<Utc>) -> Self {
        Self {
            rules: Vec::new(),
            evaluation_mode,
            created_at: now,
        }
    }

    /// Evaluate every enabled rule, lowest priority number first.
    ///
    /// An empty rule set allows everything. ALL requires each evaluated rule
    /// to pass; ANY requires at least one.
    pub fn evaluate_transaction(
        &self,
        context: &TransactionContext,
        now: DateTime<Utc>,
    ) -> RuleSetEvaluation {
        if self.rules.is_empty() {
            return RuleSetEvaluation {
                allowed: true,
                rule_results: Vec::new(),
                message: "no rules defined".to_string(),
                evaluation_mode: self.evaluation_mode,
            };
        }

        let mut sorted: Vec<&SpendingRule> = self.rules.iter().collect();
        sorted.sort_by_key(|rule| rule.priority);

        let mut rule_results = Vec::new();
        for rule in sorted {
            if !rule.enabled {
                continue;
            }
            let (passed, error) = match rule.constraint.evaluate(context, now) {
                Ok(passed) => (passed, None),
                Err(e) => (false, Some(e.to_string())),
            };
            rule_results.push(RuleResult {
                rule_id: rule.rule_id.clone(),
                rule_type: rule.constraint.rule_type(),
                description: rule.description.clone(),
                passed,
                error,
            });
        }

        let (allowed, message) = match self.evaluation_mode {
            EvaluationMode::All => {
                let allowed = rule_results.iter().all(|r| r.passed);
                let message = if allowed {
                    "all rules passed"
                } else {
                    "one or more rules failed"
                };
                (allowed, message)
            }
            EvaluationMode::Any => {
                let allowed = rule_results.iter().any(|r| r.passed);
                let message = if allowed {
                    "at least one rule passed"
                } else {
                    "no rules passed"
                };
                (allowed, message)
            }
        };

        RuleSetEvaluation {
            allowed,
            rule_results,
            message: message.to_string(),
            evaluation_mode: self.evaluation_mode,
        }
    }

    /// Append a rule and report any conflicts the addition introduced.
    /// Conflicts are warnings for the caller to surface, never overrides.
    pub fn add_rule(&mut self, rule: SpendingRule) -> Vec<String> {
        self.rules.push(rule);
        self.detect_conflicts()
    }

    /// Returns `true` when a rule with the given id existed and was removed.
    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let initial = self.rules.len();
        self.rules.retain(|rule| rule.rule_id != rule_id);
        self.rules.len() < initial
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<&SpendingRule> {
        self.rules.iter().find(|rule| rule.rule_id == rule_id)
    }

    /// Scan for contradictory or overlapping rules:
    /// - a merchant present on both an allow-list and a deny-list
    /// - two amount constraints over the same currency and window
    pub fn detect_conflicts(&self) -> Vec<String> {
        let mut conflicts = Vec::new();

        let merchant_rules: Vec<(&SpendingRule, &MerchantConstraint)> = self
            .rules
            .iter()
            .filter_map(|rule| match &rule.constraint {
                RuleConstraint::MerchantConstraint(c) => Some((rule, c)),
                _ => None,
            })
            .collect();
        for (i, (rule_a, a)) in merchant_rules.iter().enumerate() {
            for (rule_b, b) in merchant_rules.iter().skip(i + 1) {
                if a.constraint_type == b.constraint_type {
                    continue;
                }
                for merchant in &a.merchant_ids {
                    if b.merchant_ids.contains(merchant) {
                        conflicts.push(format!(
                            "merchant {merchant:?} is both allowed and denied (rules {} and {})",
                            rule_a.rule_id, rule_b.rule_id
                        ));
                    }
                }
            }
        }

        let amount_rules: Vec<(&SpendingRule, &AmountConstraint)> = self
            .rules
            .iter()
            .filter_map(|rule| match &rule.constraint {
                RuleConstraint::AmountConstraint(c) => Some((rule, c)),
                _ => None,
            })
            .collect();
        for (i, (rule_a, a)) in amount_rules.iter().enumerate() {
            for (rule_b, b) in amount_rules.iter().skip(i + 1) {
                if a.limit_amount.currency == b.limit_amount.currency
                    && a.time_window_hours == b.time_window_hours
                {
                    conflicts.push(format!(
                        "overlapping amount constraints for {} over the same window (rules {} and {})",
                        a.limit_amount.currency, rule_a.rule_id, rule_b.rule_id
                    ));
                }
            }
        }

        conflicts
    }
}

fn default_operator() -> ConstraintOperator {
    ConstraintOperator::Lte
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_match_type() -> MatchType {
    MatchType::Exact
}

fn default_category_system() -> String {
    "custom".to_string()
}

fn default_priority() -> u16 {
    100
}

fn default_evaluation_mode() -> EvaluationMode {
    EvaluationMode::All
}
