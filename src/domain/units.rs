//! Fixed-point value domains backed by rust_decimal.
//!
//! `Nav` (quote base units) and `TrancheUnits` (share base units) are integer
//! valued and never convert into each other implicitly. `Wad` is a
//! non-negative ratio carried at 18 decimal places. Every division takes an
//! explicit [`Rounding`], and arithmetic failures surface as [`MathError`].

use rust_decimal::{Decimal as RustDecimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal places carried by [`Wad`] ratios.
pub const WAD_DECIMALS: u32 = 18;

/// Direction a lossy division rounds toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    /// Toward negative infinity.
    Floor,
    /// Toward positive infinity.
    Ceil,
}

impl Rounding {
    fn strategy(self) -> RoundingStrategy {
        match self {
            Rounding::Floor => RoundingStrategy::ToNegativeInfinity,
            Rounding::Ceil => RoundingStrategy::ToPositiveInfinity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
    #[error("arithmetic underflow in {0}")]
    Underflow(&'static str),
    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),
    #[error("negative value for {0}")]
    Negative(&'static str),
    #[error("invalid decimal: {0}")]
    Parse(String),
}

fn round(value: RustDecimal, dp: u32, rounding: Rounding) -> RustDecimal {
    value
        .round_dp_with_strategy(dp, rounding.strategy())
        .normalize()
}

/// Compute `a * b / denominator` rounded to `dp` decimal places.
///
/// Integer operands take an exact remainder-based path. When the product does
/// not fit the 96-bit mantissa the division happens first, which keeps 28
/// significant digits before the final rounding.
pub fn mul_div(
    a: RustDecimal,
    b: RustDecimal,
    denominator: RustDecimal,
    dp: u32,
    rounding: Rounding,
) -> Result<RustDecimal, MathError> {
    if denominator.is_zero() {
        return Err(MathError::DivisionByZero("mul_div"));
    }

    let integral = a.scale() == 0 && b.scale() == 0 && denominator.scale() == 0;
    if dp == 0 && integral && !a.is_sign_negative() && !b.is_sign_negative() {
        if let Some(product) = a.checked_mul(b) {
            let remainder = product
                .checked_rem(denominator)
                .ok_or(MathError::Overflow("mul_div"))?;
            let quotient = (product - remainder)
                .checked_div(denominator)
                .ok_or(MathError::Overflow("mul_div"))?
                .trunc()
                .normalize();
            return match rounding {
                Rounding::Ceil if !remainder.is_zero() => quotient
                    .checked_add(RustDecimal::ONE)
                    .ok_or(MathError::Overflow("mul_div")),
                _ => Ok(quotient),
            };
        }
    }

    let quotient = match a.checked_mul(b) {
        Some(product) => product.checked_div(denominator),
        None => a.checked_div(denominator).and_then(|q| q.checked_mul(b)),
    }
    .ok_or(MathError::Overflow("mul_div"))?;

    Ok(round(quotient, dp, rounding))
}

macro_rules! fixed_point_unit {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(#[serde(with = "rust_decimal::serde::str")] RustDecimal);

        impl $name {
            pub const ZERO: $name = $name(RustDecimal::ZERO);

            /// Whole base units.
            pub fn new(units: u64) -> Self {
                $name(RustDecimal::from(units))
            }

            /// Quantize a decimal to whole base units.
            pub fn from_decimal(value: RustDecimal, rounding: Rounding) -> Result<Self, MathError> {
                if value.is_sign_negative() && !value.is_zero() {
                    return Err(MathError::Negative($label));
                }
                Ok($name(round(value, 0, rounding)))
            }

            pub fn inner(&self) -> RustDecimal {
                self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            pub fn checked_add(self, rhs: Self) -> Result<Self, MathError> {
                self.0
                    .checked_add(rhs.0)
                    .map($name)
                    .ok_or(MathError::Overflow($label))
            }

            pub fn checked_sub(self, rhs: Self) -> Result<Self, MathError> {
                if rhs.0 > self.0 {
                    return Err(MathError::Underflow($label));
                }
                Ok($name(self.0 - rhs.0))
            }

            pub fn saturating_sub(self, rhs: Self) -> Self {
                if rhs.0 >= self.0 {
                    Self::ZERO
                } else {
                    $name(self.0 - rhs.0)
                }
            }

            /// `|self - other|`.
            pub fn abs_diff(self, other: Self) -> Self {
                if self >= other {
                    $name(self.0 - other.0)
                } else {
                    $name(other.0 - self.0)
                }
            }

            /// Scale by a ratio, rounding to whole units.
            pub fn mul_wad(self, ratio: Wad, rounding: Rounding) -> Result<Self, MathError> {
                mul_div(self.0, ratio.0, RustDecimal::ONE, 0, rounding).map($name)
            }

            /// `self * numerator / denominator` within the same domain.
            pub fn mul_div(
                self,
                numerator: Self,
                denominator: Self,
                rounding: Rounding,
            ) -> Result<Self, MathError> {
                mul_div(self.0, numerator.0, denominator.0, 0, rounding).map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.normalize())
            }
        }

        impl FromStr for $name {
            type Err = MathError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value =
                    RustDecimal::from_str(s.trim()).map_err(|e| MathError::Parse(e.to_string()))?;
                if value.fract() != RustDecimal::ZERO {
                    return Err(MathError::Parse(format!(
                        "{} must be a whole number of base units, got {}",
                        $label, s
                    )));
                }
                Self::from_decimal(value, Rounding::Floor)
            }
        }
    };
}

fixed_point_unit!(
    /// Quote-denominated value in base units of the deposit asset.
    Nav,
    "nav"
);

fixed_point_unit!(
    /// Tranche share amount in share base units.
    TrancheUnits,
    "tranche units"
);

/// Shares minted for `assets` at the price `total_nav / total_supply`.
///
/// An empty tranche mints 1:1. A tranche with shares outstanding but no NAV
/// cannot price new shares.
pub fn convert_to_units(
    assets: Nav,
    total_supply: TrancheUnits,
    total_nav: Nav,
    rounding: Rounding,
) -> Result<TrancheUnits, MathError> {
    if total_supply.is_zero() {
        return Ok(TrancheUnits(assets.0));
    }
    if total_nav.is_zero() {
        return Err(MathError::DivisionByZero("tranche share price"));
    }
    mul_div(assets.0, total_supply.0, total_nav.0, 0, rounding).map(TrancheUnits)
}

/// Value of `shares` at the price `total_nav / total_supply`.
pub fn convert_to_nav(
    shares: TrancheUnits,
    total_supply: TrancheUnits,
    total_nav: Nav,
    rounding: Rounding,
) -> Result<Nav, MathError> {
    if total_supply.is_zero() {
        return Ok(Nav(shares.0));
    }
    mul_div(shares.0, total_nav.0, total_supply.0, 0, rounding).map(Nav)
}

/// Non-negative ratio with 18 decimal places.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Wad(#[serde(with = "rust_decimal::serde::str")] RustDecimal);

impl Wad {
    pub const ZERO: Wad = Wad(RustDecimal::ZERO);
    pub const ONE: Wad = Wad(RustDecimal::ONE);
    /// Stand-in for an unbounded ratio (e.g. LTV against zero junior capital).
    pub const MAX: Wad = Wad(RustDecimal::MAX);

    pub fn from_decimal(value: RustDecimal, rounding: Rounding) -> Result<Self, MathError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MathError::Negative("wad"));
        }
        Ok(Wad(round(value, WAD_DECIMALS, rounding)))
    }

    /// `numerator / denominator` as a ratio.
    pub fn ratio(
        numerator: RustDecimal,
        denominator: RustDecimal,
        rounding: Rounding,
    ) -> Result<Self, MathError> {
        if numerator.is_sign_negative() && !numerator.is_zero() {
            return Err(MathError::Negative("wad"));
        }
        mul_div(numerator, RustDecimal::ONE, denominator, WAD_DECIMALS, rounding).map(Wad)
    }

    pub fn inner(&self) -> RustDecimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn mul(self, rhs: Wad, rounding: Rounding) -> Result<Self, MathError> {
        self.0
            .checked_mul(rhs.0)
            .map(|v| Wad(round(v, WAD_DECIMALS, rounding)))
            .ok_or(MathError::Overflow("wad"))
    }

    pub fn clamp_to(self, lo: Wad, hi: Wad) -> Self {
        self.max(lo).min(hi)
    }
}

impl fmt::Display for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Wad {
    type Err = MathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = RustDecimal::from_str(s.trim()).map_err(|e| MathError::Parse(e.to_string()))?;
        Wad::from_decimal(value, Rounding::Floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn nav(s: &str) -> Nav {
        s.parse().unwrap()
    }

    #[test]
    fn test_mul_div_rounding_direction() {
        let down = mul_div(dec!(10), dec!(1), dec!(3), 0, Rounding::Floor).unwrap();
        let up = mul_div(dec!(10), dec!(1), dec!(3), 0, Rounding::Ceil).unwrap();
        assert_eq!(down, dec!(3));
        assert_eq!(up, dec!(4));
    }

    #[test]
    fn test_mul_div_exact_has_no_rounding_bias() {
        let down = mul_div(dec!(12), dec!(5), dec!(4), 0, Rounding::Floor).unwrap();
        let up = mul_div(dec!(12), dec!(5), dec!(4), 0, Rounding::Ceil).unwrap();
        assert_eq!(down, dec!(15));
        assert_eq!(up, dec!(15));
    }

    #[test]
    fn test_mul_div_division_by_zero() {
        let result = mul_div(dec!(1), dec!(1), dec!(0), 0, Rounding::Floor);
        assert!(matches!(result, Err(MathError::DivisionByZero(_))));
    }

    #[test]
    fn test_nav_underflow_fails_loudly() {
        let result = nav("5").checked_sub(nav("6"));
        assert_eq!(result, Err(MathError::Underflow("nav")));
        assert_eq!(nav("5").saturating_sub(nav("6")), Nav::ZERO);
    }

    #[test]
    fn test_nav_overflow_fails_loudly() {
        let big = Nav::from_decimal(RustDecimal::MAX, Rounding::Floor).unwrap();
        assert!(matches!(big.checked_add(nav("1")), Err(MathError::Overflow(_))));
    }

    #[test]
    fn test_nav_rejects_fractional_and_negative_input() {
        assert!("1.5".parse::<Nav>().is_err());
        assert!(matches!(
            Nav::from_decimal(dec!(-1), Rounding::Floor),
            Err(MathError::Negative(_))
        ));
    }

    #[test]
    fn test_mul_wad_ceil_favours_commitment() {
        let coverage: Wad = "0.2".parse().unwrap();
        assert_eq!(nav("1000").mul_wad(coverage, Rounding::Ceil).unwrap(), nav("200"));
        assert_eq!(nav("1001").mul_wad(coverage, Rounding::Ceil).unwrap(), nav("201"));
        assert_eq!(nav("1001").mul_wad(coverage, Rounding::Floor).unwrap(), nav("200"));
    }

    #[test]
    fn test_convert_empty_tranche_is_one_to_one() {
        let shares = convert_to_units(nav("500"), TrancheUnits::ZERO, Nav::ZERO, Rounding::Floor)
            .unwrap();
        assert_eq!(shares, TrancheUnits::new(500));
    }

    #[test]
    fn test_convert_round_trip_biases_against_holder() {
        let supply = TrancheUnits::new(3);
        let total = nav("10");
        let value = convert_to_nav(TrancheUnits::new(1), supply, total, Rounding::Floor).unwrap();
        assert_eq!(value, nav("3"));
        let shares = convert_to_units(nav("3"), supply, total, Rounding::Floor).unwrap();
        assert_eq!(shares, TrancheUnits::ZERO);
    }

    #[test]
    fn test_convert_rejects_worthless_tranche() {
        let result = convert_to_units(nav("1"), TrancheUnits::new(10), Nav::ZERO, Rounding::Floor);
        assert!(matches!(result, Err(MathError::DivisionByZero(_))));
    }

    #[test]
    fn test_wad_ratio_precision() {
        let third = Wad::ratio(dec!(1), dec!(3), Rounding::Floor).unwrap();
        assert_eq!(third.inner(), dec!(0.333333333333333333));
        let third_up = Wad::ratio(dec!(1), dec!(3), Rounding::Ceil).unwrap();
        assert_eq!(third_up.inner(), dec!(0.333333333333333334));
    }

    #[test]
    fn test_wad_clamp() {
        let w: Wad = "1.7".parse().unwrap();
        assert_eq!(w.clamp_to(Wad::ZERO, Wad::ONE), Wad::ONE);
    }

    #[test]
    fn test_units_serialize_as_strings() {
        let json = serde_json::to_value(nav("1234")).unwrap();
        assert_eq!(json, serde_json::json!("1234"));
    }
}
