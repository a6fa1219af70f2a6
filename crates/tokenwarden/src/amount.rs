//! Validated token amounts.
//!
//! Event producers hand over whatever number they parsed out of the
//! assistant's output. [`TokenAmount`] is the only way into the trackers, so
//! negative, non-finite and fractional values are rejected at the boundary
//! with [`BudgetError::InvalidAmount`] before any state is touched.

use crate::error::BudgetError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 2^53; above it not every whole number has an exact `f64`.
const F64_EXACT_LIMIT: f64 = 9_007_199_254_740_992.0;

/// A non-negative whole number of tokens.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct TokenAmount(u64);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn new(tokens: u64) -> Self {
        Self(tokens)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TokenAmount> for u64 {
    fn from(amount: TokenAmount) -> u64 {
        amount.0
    }
}

macro_rules! unsigned_amount {
    ($($t:ty),*) => {$(
        impl TryFrom<$t> for TokenAmount {
            type Error = BudgetError;

            fn try_from(value: $t) -> Result<Self, Self::Error> {
                u64::try_from(value).map(TokenAmount).map_err(|_| {
                    BudgetError::invalid_amount(format!("{value} does not fit in u64"))
                })
            }
        }
    )*};
}

macro_rules! signed_amount {
    ($($t:ty),*) => {$(
        impl TryFrom<$t> for TokenAmount {
            type Error = BudgetError;

            fn try_from(value: $t) -> Result<Self, Self::Error> {
                if value < 0 {
                    return Err(BudgetError::invalid_amount(format!("{value} is negative")));
                }
                u64::try_from(value).map(TokenAmount).map_err(|_| {
                    BudgetError::invalid_amount(format!("{value} does not fit in u64"))
                })
            }
        }
    )*};
}

unsigned_amount!(u32, u64, usize, u128);
signed_amount!(i32, i64, i128);

impl TryFrom<f64> for TokenAmount {
    type Error = BudgetError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(BudgetError::invalid_amount(format!("{value} is not finite")));
        }
        if value < 0.0 {
            return Err(BudgetError::invalid_amount(format!("{value} is negative")));
        }
        if value.fract() != 0.0 {
            return Err(BudgetError::invalid_amount(format!("{value} is not a whole number")));
        }
        if value > u64::MAX as f64 {
            return Err(BudgetError::invalid_amount(format!("{value} does not fit in u64")));
        }
        Ok(TokenAmount(value as u64))
    }
}

impl FromStr for TokenAmount {
    type Err = BudgetError;

    /// Integer text is parsed exactly. Decimal or exponent forms go through
    /// the `f64` checks and are refused from 2^53 up, where they may round.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(value) = s.parse::<i128>() {
            return Self::try_from(value);
        }
        let value: f64 = s
            .parse()
            .map_err(|_| BudgetError::invalid_amount(format!("{s:?} is not a number")))?;
        if value.is_finite() && value >= F64_EXACT_LIMIT {
            return Err(BudgetError::invalid_amount(format!(
                "{s} is too large to read exactly; write it as a whole number"
            )));
        }
        Self::try_from(value)
    }
}
