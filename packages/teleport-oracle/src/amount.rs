//! Amount conversion from source-chain units to destination display amounts
//!
//! `ceil(raw / 10^D_src * multiplier)` at `D_dst` decimal places, computed
//! with exact integer arithmetic. Rounding is always up so the destination
//! never issues less than the multiplier implies; settled balances depend on
//! this rule, do not change it.

use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::{BigDecimal, Zero};
use std::fmt;
use std::str::FromStr;

use crate::error::InvalidAmountError;

/// Largest supported precision on either side
pub const MAX_DECIMALS: u32 = 77;

/// Destination amount as integer units plus precision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedAmount {
    units: BigInt,
    decimals: u32,
}

impl ConvertedAmount {
    /// Integer units at destination precision (e.g. 30137 for "3.0137")
    pub fn units(&self) -> &BigInt {
        &self.units
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// Amount with symbol, as the destination token contract expects it
    pub fn quantity(&self, symbol: &str) -> String {
        format!("{} {}", self, symbol)
    }
}

impl fmt::Display for ConvertedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.units.to_str_radix(10);
        let decimals = self.decimals as usize;
        if decimals == 0 {
            return write!(f, "{}", digits);
        }
        let padded = format!("{:0>width$}", digits, width = decimals + 1);
        let (whole, frac) = padded.split_at(padded.len() - decimals);
        write!(f, "{}.{}", whole, frac)
    }
}

/// Reusable converter bound to one decimal/multiplier configuration
#[derive(Debug, Clone)]
pub struct AmountConverter {
    source_decimals: u32,
    destination_decimals: u32,
    multiplier_units: BigInt,
    multiplier_scale: u32,
    multiplier: String,
}

impl AmountConverter {
    pub fn new(
        source_decimals: u32,
        destination_decimals: u32,
        multiplier: &str,
    ) -> Result<Self, InvalidAmountError> {
        if source_decimals > MAX_DECIMALS || destination_decimals > MAX_DECIMALS {
            return Err(InvalidAmountError::new(
                multiplier,
                format!("decimals must not exceed {}", MAX_DECIMALS),
            ));
        }

        let parsed = BigDecimal::from_str(multiplier.trim())
            .map_err(|e| InvalidAmountError::new(multiplier, format!("multiplier: {}", e)))?;
        if parsed <= BigDecimal::zero() {
            return Err(InvalidAmountError::new(
                multiplier,
                "multiplier must be positive",
            ));
        }

        let (mut units, exponent) = parsed.as_bigint_and_exponent();
        let scale = if exponent < 0 {
            units *= pow10(exponent.unsigned_abs() as u32);
            0
        } else {
            exponent as u32
        };

        Ok(Self {
            source_decimals,
            destination_decimals,
            multiplier_units: units,
            multiplier_scale: scale,
            multiplier: multiplier.trim().to_string(),
        })
    }

    pub fn source_decimals(&self) -> u32 {
        self.source_decimals
    }

    pub fn destination_decimals(&self) -> u32 {
        self.destination_decimals
    }

    pub fn multiplier(&self) -> &str {
        &self.multiplier
    }

    /// Convert a raw source amount (decimal integer string)
    pub fn convert(&self, raw: &str) -> Result<ConvertedAmount, InvalidAmountError> {
        let raw_units = parse_raw_amount(raw)?;

        let numerator =
            raw_units * &self.multiplier_units * pow10(self.destination_decimals);
        let denominator = pow10(self.source_decimals + self.multiplier_scale);

        Ok(ConvertedAmount {
            units: ceil_div(&numerator, &denominator),
            decimals: self.destination_decimals,
        })
    }
}

/// One-shot conversion: raw amount with `source_decimals`, times
/// `multiplier`, rounded up to `destination_decimals`
pub fn convert_amount(
    raw: &str,
    source_decimals: u32,
    multiplier: &str,
    destination_decimals: u32,
) -> Result<ConvertedAmount, InvalidAmountError> {
    AmountConverter::new(source_decimals, destination_decimals, multiplier)?.convert(raw)
}

fn parse_raw_amount(raw: &str) -> Result<BigInt, InvalidAmountError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidAmountError::new(raw, "amount is empty"));
    }
    if trimmed.starts_with('-') {
        return Err(InvalidAmountError::new(raw, "amount is negative"));
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidAmountError::new(raw, "amount is not an unsigned integer"));
    }
    BigInt::from_str(trimmed).map_err(|e| InvalidAmountError::new(raw, e.to_string()))
}

fn pow10(exp: u32) -> BigInt {
    BigInt::from(10u8).pow(exp)
}

/// Ceiling division for a non-negative numerator and positive denominator
fn ceil_div(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.sign() == Sign::Plus {
        quotient + 1
    } else {
        quotient
    }
}
