//! Exact fixed-point amounts.
//!
//! Chains express the same asset with different precisions (drops on XRPL, 18-decimal wei on most EVM chains). A
//! [Decimal] carries the integer mantissa and a decimal scale so conversions between them never go through floating
//! point.

use std::{fmt, str::FromStr};

use alloy::primitives::U256;

use crate::error::AmountError;

#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    mantissa: U256,
    scale: u32,
}

fn pow10(exp: u32) -> Option<U256> {
    U256::from(10u64).checked_pow(U256::from(exp))
}

fn parse_digits(digits: &str, original: &str) -> Result<U256, AmountError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Invalid(original.to_owned()));
    }
    U256::from_str_radix(digits, 10).map_err(|_| AmountError::Overflow(original.to_owned(), 0))
}

impl Decimal {
    pub fn new(mantissa: U256, scale: u32) -> Self {
        Decimal { mantissa, scale }
    }

    /// Interpret an integer amount in the smallest unit of an asset with `precision` decimals.
    pub fn from_whole(amount: &str, precision: u32) -> Result<Self, AmountError> {
        let mantissa = parse_digits(amount.trim(), amount)?;
        Ok(Decimal {
            mantissa,
            scale: precision,
        })
    }

    /// The amount in the smallest unit of an asset with `precision` decimals. Digits below that precision are
    /// truncated.
    pub fn to_whole(&self, precision: u32) -> Result<U256, AmountError> {
        if precision >= self.scale {
            pow10(precision - self.scale)
                .and_then(|factor| self.mantissa.checked_mul(factor))
                .ok_or_else(|| AmountError::Overflow(self.to_string(), precision))
        } else {
            // 10^78 exceeds U256, and any mantissa divided by it is zero.
            Ok(pow10(self.scale - precision)
                .map(|factor| self.mantissa / factor)
                .unwrap_or(U256::ZERO))
        }
    }

    pub fn mantissa(&self) -> U256 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Drop trailing fractional zeros.
    pub fn normalize(self) -> Self {
        let ten = U256::from(10u64);
        let mut d = self;
        while d.scale > 0 && !d.mantissa.is_zero() && (d.mantissa % ten).is_zero() {
            d.mantissa /= ten;
            d.scale -= 1;
        }
        if d.mantissa.is_zero() {
            d.scale = 0;
        }
        d
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.normalize(), other.normalize());
        a.mantissa == b.mantissa && a.scale == b.scale
    }
}

impl Eq for Decimal {}

/// Parses plain decimal notation (`"12"`, `"0.05"`) and the exponent form XRPL uses for issued currencies
/// (`"1.5e-3"`).
impl FromStr for Decimal {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (number, exponent) = match trimmed.split_once(['e', 'E']) {
            Some((number, exponent)) => {
                let exponent: i64 = exponent
                    .parse()
                    .map_err(|_| AmountError::Invalid(s.to_owned()))?;
                (number, exponent)
            }
            None => (trimmed, 0),
        };
        let (int, frac) = number.split_once('.').unwrap_or((number, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(AmountError::Invalid(s.to_owned()));
        }
        let digits = format!("{int}{frac}");
        let mantissa = parse_digits(&digits, s)?;
        let scale = (frac.len() as i64)
            .checked_sub(exponent)
            .ok_or_else(|| AmountError::Invalid(s.to_owned()))?;
        if scale >= 0 {
            let scale = u32::try_from(scale).map_err(|_| AmountError::Invalid(s.to_owned()))?;
            Ok(Decimal { mantissa, scale })
        } else {
            let shift = u32::try_from(scale.unsigned_abs()).map_err(|_| AmountError::Invalid(s.to_owned()))?;
            let mantissa = pow10(shift)
                .and_then(|factor| mantissa.checked_mul(factor))
                .ok_or_else(|| AmountError::Overflow(s.to_owned(), 0))?;
            Ok(Decimal { mantissa, scale: 0 })
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.normalize();
        let digits = d.mantissa.to_string();
        let scale = d.scale as usize;
        if scale == 0 {
            return f.write_str(&digits);
        }
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{int}.{frac}")
        } else {
            write!(f, "0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}
