// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Monetary Value Object (BC-14)
//!
//! [`Money`] is the currency-tagged amount used by every channel, stream,
//! rule and session type. It serializes as `{"currency": "...", "value": ...}`
//! to stay byte-compatible with the mandate payloads the treasury receives
//! from collaborating agents.
//!
//! ## Invariants
//!
//! - Arithmetic never crosses currencies; callers check [`Money::same_currency`]
//!   (or get a `PolicyViolation` from the aggregate that owns the check).
//! - Settlement and equality comparisons use [`MONEY_EPSILON`], never `==` on
//!   the raw `f64`.

use serde::{Deserialize, Serialize};

/// Tolerance for settlement sums and equality comparisons on monetary values.
pub const MONEY_EPSILON: f64 = 0.001;

/// A currency-tagged decimal amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    /// ISO 4217 currency code (opaque to this crate, compared verbatim).
    pub currency: String,
    pub value: f64,
}

impl Money {
    pub fn new(currency: impl Into<String>, value: f64) -> Self {
        Self {
            currency: currency.into(),
            value,
        }
    }

    /// Zero in the given currency.
    pub fn zero(currency: impl Into<String>) -> Self {
        Self::new(currency, 0.0)
    }

    pub fn usd(value: f64) -> Self {
        Self::new("USD", value)
    }

    pub fn same_currency(&self, other: &Money) -> bool {
        self.currency == other.currency
    }

    /// True when the currencies match and the values agree within
    /// [`MONEY_EPSILON`].
    pub fn approx_eq(&self, other: &Money) -> bool {
        self.same_currency(other) && (self.value - other.value).abs() < MONEY_EPSILON
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_currency_value_pair() {
        let money = Money::usd(50.0);
        let json = serde_json::to_value(&money).unwrap();
        assert_eq!(json, serde_json::json!({"currency": "USD", "value": 50.0}));
    }

    #[test]
    fn approx_eq_honours_epsilon() {
        let a = Money::usd(100.0);
        assert!(a.approx_eq(&Money::usd(100.0009)));
        assert!(!a.approx_eq(&Money::usd(100.002)));
        assert!(!a.approx_eq(&Money::new("EUR", 100.0)));
    }
}
