#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Decimal-only money arithmetic and the hashing helpers shared by every
//! component that pins amounts or payloads.
//!
//! All amounts in the system are ILS with two fraction digits. Floating
//! point never touches a monetary value; rounding is banker's rounding at
//! every externally visible step.

use std::fmt;
use std::ops::Add;
use std::ops::Sub;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

pub const CURRENCY_ILS: &str = "ILS";

/// Left-to-right mark keeping the shekel sign on the left in bidi text.
pub const LRM: char = '\u{200E}';

pub type MoneyResult<T> = Result<T, MoneyError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("not a decimal amount: {0}")]
    Parse(String),
    #[error("amount out of range")]
    Overflow,
    #[error("negative amount not allowed: {0}")]
    Negative(String),
}

/// An exact ILS amount, normalized to two fraction digits.
///
/// Construction always re-rounds with `MidpointNearestEven`, so two `Money`
/// values compare equal iff their canonical two-digit forms are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    #[must_use]
    pub fn new(amount: Decimal) -> Self {
        Self(round2(amount))
    }

    pub fn parse(raw: &str) -> MoneyResult<Self> {
        let value = Decimal::from_str(raw.trim()).map_err(|_| MoneyError::Parse(raw.into()))?;
        Ok(Self::new(value))
    }

    #[must_use]
    pub fn amount(&self) -> Decimal {
        self.0
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Money) -> MoneyResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money::new)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, other: Money) -> MoneyResult<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money::new)
            .ok_or(MoneyError::Overflow)
    }

    /// Multiplies a unit price by a (possibly fractional) quantity.
    pub fn checked_mul_qty(self, qty: Decimal) -> MoneyResult<Money> {
        self.0
            .checked_mul(qty)
            .map(Money::new)
            .ok_or(MoneyError::Overflow)
    }

    /// Sums an iterator of amounts with overflow checking.
    pub fn sum<I>(amounts: I) -> MoneyResult<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        let mut total = Money::ZERO;
        for amount in amounts {
            total = total.checked_add(amount)?;
        }
        Ok(total)
    }

    /// Plain two-digit rendering without currency decoration, e.g. `1600.00`.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        format!("{:.2}", self.0)
    }

    /// ILS rendering: LRM, shekel sign, sign, thousands separators, two
    /// fraction digits. `₪-1,234.50` style, always left-to-right.
    #[must_use]
    pub fn format_ils(&self) -> String {
        let plain = format!("{:.2}", self.0.abs());
        let (int_part, frac_part) = match plain.split_once('.') {
            Some(parts) => parts,
            None => (plain.as_str(), "00"),
        };
        let grouped = group_thousands(int_part);
        let sign = if self.is_negative() { "-" } else { "" };
        format!("{LRM}\u{20AA}{sign}{grouped}.{frac_part}")
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, other: Money) -> Money {
        Money::new(self.0 + other.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, other: Money) -> Money {
        Money::new(self.0 - other.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_plain_string())
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_plain_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Money::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Banker's rounding to two fraction digits.
#[must_use]
pub fn round2(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(2);
    rounded
}

fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    let offset = digits.len() % 3;
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (idx + 3 - offset) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
///
/// `serde_json::Map` is a `BTreeMap` in this workspace, so re-serializing
/// through `Value` yields sorted keys; compact output is the default.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    value.to_string()
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of the canonical JSON form of `value`.
#[must_use]
pub fn payload_hash(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// First 12 hex characters of the SHA-256 of `bytes`, used for rule and
/// pricing pins.
#[must_use]
pub fn short_sha256_hex(bytes: &[u8]) -> String {
    let full = sha256_hex(bytes);
    full[..12].to_string()
}
