//! Kinked yield curve whose anchor drifts toward equilibrium over time.
//!
//! The anchor (junior share at target utilization) moves as
//! `anchor * exp(speed * err * dt)`, where `err` is the normalized distance
//! from target utilization. The share paid over an interval uses the
//! trapezoidal average of the anchor at the start, midpoint and end of the
//! interval, so a single late sync pays the same as many frequent ones.
//! Adaptation is frozen while the market is in a fixed term.

use super::yield_curve::{CurveContext, CurveError, YieldCurve};
use crate::domain::{MarketState, MathError, Rounding, Timestamp, Wad};
use rust_decimal::Decimal as RustDecimal;
use rust_decimal_macros::dec;

/// Bound on `|speed * err * dt|` fed to `exp`; the clamped anchor saturates long before.
const MAX_EXPONENT: RustDecimal = dec!(40);

/// exp(x) by Taylor series, halving the argument until |x| <= 0.5 and
/// squaring back up.
fn exp_decimal(x: RustDecimal) -> Result<RustDecimal, MathError> {
    if x.abs() > dec!(0.5) {
        let half = exp_decimal(x / dec!(2))?;
        return half
            .checked_mul(half)
            .ok_or(MathError::Overflow("adaptive curve exp"));
    }
    let mut sum = RustDecimal::ONE;
    let mut term = RustDecimal::ONE;
    for n in 1u32..=30 {
        term = term
            .checked_mul(x)
            .ok_or(MathError::Overflow("adaptive curve exp"))?
            / RustDecimal::from(n);
        if term.is_zero() {
            break;
        }
        sum += term;
    }
    Ok(sum)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveCurveParams {
    pub target_utilization: Wad,
    pub initial_share_at_target: Wad,
    pub min_share_at_target: Wad,
    /// Ratio between the share at full utilization and the share at target.
    pub steepness: RustDecimal,
    /// Anchor drift per second at maximal error.
    pub adjustment_speed: RustDecimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveYieldCurve {
    params: AdaptiveCurveParams,
    share_at_target: Wad,
    last_adaptation: Option<Timestamp>,
}

impl AdaptiveYieldCurve {
    pub fn new(params: AdaptiveCurveParams) -> Result<Self, CurveError> {
        if params.target_utilization.is_zero() || params.target_utilization >= Wad::ONE {
            return Err(CurveError::InvalidParameters(format!(
                "target utilization must be in (0, 1), got {}",
                params.target_utilization
            )));
        }
        if params.min_share_at_target.is_zero()
            || params.min_share_at_target > params.initial_share_at_target
            || params.initial_share_at_target > Wad::ONE
        {
            return Err(CurveError::InvalidParameters(format!(
                "anchor bounds must satisfy 0 < {} <= {} <= 1",
                params.min_share_at_target, params.initial_share_at_target
            )));
        }
        if params.steepness < RustDecimal::ONE {
            return Err(CurveError::InvalidParameters(format!(
                "steepness must be >= 1, got {}",
                params.steepness
            )));
        }
        if params.adjustment_speed.is_sign_negative() {
            return Err(CurveError::InvalidParameters(format!(
                "adjustment speed must be >= 0, got {}",
                params.adjustment_speed
            )));
        }
        Ok(Self {
            params,
            share_at_target: params.initial_share_at_target,
            last_adaptation: None,
        })
    }

    pub fn params(&self) -> &AdaptiveCurveParams {
        &self.params
    }

    pub fn share_at_target(&self) -> Wad {
        self.share_at_target
    }

    pub fn last_adaptation(&self) -> Option<Timestamp> {
        self.last_adaptation
    }

    /// Distance from target scaled to [-1, 1].
    fn normalized_error(&self, u: Wad) -> RustDecimal {
        let target = self.params.target_utilization.inner();
        let u = u.inner();
        if u < target {
            (u - target) / target
        } else {
            (u - target) / (RustDecimal::ONE - target)
        }
    }

    /// Share on the kinked curve anchored at `anchor`.
    fn curve(&self, anchor: RustDecimal, err: RustDecimal) -> Result<Wad, MathError> {
        let steepness = self.params.steepness;
        let coefficient = if err.is_sign_negative() {
            RustDecimal::ONE - RustDecimal::ONE / steepness
        } else {
            steepness - RustDecimal::ONE
        };
        let share = coefficient
            .checked_mul(err)
            .and_then(|scaled| (RustDecimal::ONE + scaled).checked_mul(anchor))
            .ok_or(MathError::Overflow("adaptive curve"))?;
        Ok(Wad::from_decimal(share.max(RustDecimal::ZERO), Rounding::Floor)?
            .clamp_to(Wad::ZERO, Wad::ONE))
    }

    fn adapted_anchor(&self, exponent: RustDecimal) -> Result<RustDecimal, MathError> {
        let exponent = exponent.clamp(-MAX_EXPONENT, MAX_EXPONENT);
        let growth = exp_decimal(exponent)?;
        let anchor = self
            .share_at_target
            .inner()
            .checked_mul(growth)
            .ok_or(MathError::Overflow("adaptive curve anchor"))?;
        Ok(anchor.clamp(
            self.params.min_share_at_target.inner(),
            RustDecimal::ONE,
        ))
    }

    /// Share paid for the interval ending at `ctx.now` and the anchor at its end.
    fn evaluate(&self, ctx: &CurveContext) -> Result<(Wad, Wad), MathError> {
        let err = self.normalized_error(ctx.utilization()?);
        let start = self.share_at_target.inner();

        let elapsed = match (ctx.market_state, self.last_adaptation) {
            (MarketState::Perpetual, Some(last)) => ctx.now.seconds_since(last),
            _ => 0,
        };
        if elapsed == 0 {
            return Ok((self.curve(start, err)?, self.share_at_target));
        }

        let exponent = self
            .params
            .adjustment_speed
            .checked_mul(err)
            .and_then(|rate| rate.checked_mul(RustDecimal::from(elapsed)))
            .ok_or(MathError::Overflow("adaptive curve exponent"))?;
        let end = self.adapted_anchor(exponent)?;
        let mid = self.adapted_anchor(exponent / dec!(2))?;
        let average = (start + mid + mid + end) / dec!(4);

        let share = self.curve(average, err)?;
        Ok((share, Wad::from_decimal(end, Rounding::Floor)?))
    }
}

impl YieldCurve for AdaptiveYieldCurve {
    fn distribute(&mut self, ctx: &CurveContext) -> Result<Wad, MathError> {
        let (share, end_anchor) = self.evaluate(ctx)?;
        self.share_at_target = end_anchor;
        self.last_adaptation = Some(ctx.now);
        Ok(share)
    }

    fn quote(&self, ctx: &CurveContext) -> Result<Wad, MathError> {
        let err = self.normalized_error(ctx.utilization()?);
        self.curve(self.share_at_target.inner(), err)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn clone_box(&self) -> Box<dyn YieldCurve> {
        Box::new(self.clone())
    }
}
