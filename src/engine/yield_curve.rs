//! Utilization-driven yield distribution between tranches.

use crate::domain::{MarketState, MathError, Nav, Rounding, Timestamp, Wad};
use rust_decimal::Decimal as RustDecimal;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurveError {
    #[error("invalid curve parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Math(#[from] MathError),
}

/// Inputs a curve is evaluated against. Passed explicitly on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurveContext {
    pub st_raw_nav: Nav,
    pub jt_raw_nav: Nav,
    pub beta: Wad,
    pub coverage_ratio: Wad,
    pub jt_effective_nav: Nav,
    pub market_state: MarketState,
    pub now: Timestamp,
}

impl CurveContext {
    pub fn utilization(&self) -> Result<Wad, MathError> {
        utilization(
            self.st_raw_nav,
            self.jt_raw_nav,
            self.beta,
            self.coverage_ratio,
            self.jt_effective_nav,
        )
    }
}

/// `((st_raw + jt_raw * beta) * coverage) / jt_effective`, clamped to [0, 1].
///
/// Rounded up. A market without junior capital is fully utilized.
pub fn utilization(
    st_raw_nav: Nav,
    jt_raw_nav: Nav,
    beta: Wad,
    coverage_ratio: Wad,
    jt_effective_nav: Nav,
) -> Result<Wad, MathError> {
    if jt_effective_nav.is_zero() {
        return Ok(Wad::ONE);
    }
    let exposure = jt_raw_nav
        .inner()
        .checked_mul(beta.inner())
        .and_then(|weighted| weighted.checked_add(st_raw_nav.inner()))
        .and_then(|total| total.checked_mul(coverage_ratio.inner()))
        .ok_or(MathError::Overflow("utilization"))?;
    let ratio = Wad::ratio(exposure, jt_effective_nav.inner(), Rounding::Ceil)?;
    Ok(ratio.clamp_to(Wad::ZERO, Wad::ONE))
}

/// Junior's share of senior yield as a function of utilization.
pub trait YieldCurve: fmt::Debug + Send + Sync {
    /// Share for the interval ending at `ctx.now`. Stateful curves persist
    /// their adaptation here.
    fn distribute(&mut self, ctx: &CurveContext) -> Result<Wad, MathError>;

    /// Share at the current curve position without adapting.
    fn quote(&self, ctx: &CurveContext) -> Result<Wad, MathError>;

    fn name(&self) -> &'static str;

    fn clone_box(&self) -> Box<dyn YieldCurve>;
}

impl Clone for Box<dyn YieldCurve> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Breakpoints of a [`StaticYieldCurve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCurveParams {
    /// Y0: share at zero utilization.
    pub zero_util_share: Wad,
    /// U_T: kink position.
    pub target_utilization: Wad,
    /// Y_T: share at the kink.
    pub target_share: Wad,
    /// Y_full: share at full utilization.
    pub full_util_share: Wad,
}

/// Piecewise-linear curve with one kink, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticYieldCurve {
    params: StaticCurveParams,
}

impl StaticYieldCurve {
    pub fn new(params: StaticCurveParams) -> Result<Self, CurveError> {
        let StaticCurveParams {
            zero_util_share,
            target_utilization,
            target_share,
            full_util_share,
        } = params;
        if target_utilization.is_zero() || target_utilization >= Wad::ONE {
            return Err(CurveError::InvalidParameters(format!(
                "target utilization must be in (0, 1), got {}",
                target_utilization
            )));
        }
        if !(zero_util_share <= target_share
            && target_share <= full_util_share
            && full_util_share <= Wad::ONE)
        {
            return Err(CurveError::InvalidParameters(format!(
                "shares must satisfy 0 <= {} <= {} <= {} <= 1",
                zero_util_share, target_share, full_util_share
            )));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &StaticCurveParams {
        &self.params
    }

    /// (Y_T - Y0) / U_T.
    pub fn slope_below(&self) -> RustDecimal {
        (self.params.target_share.inner() - self.params.zero_util_share.inner())
            / self.params.target_utilization.inner()
    }

    /// (Y_full - Y_T) / (1 - U_T).
    pub fn slope_above(&self) -> RustDecimal {
        (self.params.full_util_share.inner() - self.params.target_share.inner())
            / (RustDecimal::ONE - self.params.target_utilization.inner())
    }

    /// Y0 + slope_lo * U.
    pub fn below_kink(&self, u: Wad) -> Result<Wad, MathError> {
        let rise = self.params.target_share.inner() - self.params.zero_util_share.inner();
        let step = crate::domain::mul_div(
            rise,
            u.inner(),
            self.params.target_utilization.inner(),
            28,
            Rounding::Floor,
        )?;
        Wad::from_decimal(self.params.zero_util_share.inner() + step, Rounding::Floor)
    }

    /// Y_T + slope_hi * (U - U_T).
    pub fn above_kink(&self, u: Wad) -> Result<Wad, MathError> {
        let rise = self.params.full_util_share.inner() - self.params.target_share.inner();
        let excess = u.inner() - self.params.target_utilization.inner();
        let run = RustDecimal::ONE - self.params.target_utilization.inner();
        let step = crate::domain::mul_div(rise, excess, run, 28, Rounding::Floor)?;
        Wad::from_decimal(self.params.target_share.inner() + step, Rounding::Floor)
    }

    pub fn share_at(&self, u: Wad) -> Result<Wad, MathError> {
        let u = u.clamp_to(Wad::ZERO, Wad::ONE);
        let share = if u < self.params.target_utilization {
            self.below_kink(u)?
        } else {
            self.above_kink(u)?
        };
        Ok(share.clamp_to(Wad::ZERO, Wad::ONE))
    }
}

impl YieldCurve for StaticYieldCurve {
    fn distribute(&mut self, ctx: &CurveContext) -> Result<Wad, MathError> {
        self.quote(ctx)
    }

    fn quote(&self, ctx: &CurveContext) -> Result<Wad, MathError> {
        self.share_at(ctx.utilization()?)
    }

    fn name(&self) -> &'static str {
        "static"
    }

    fn clone_box(&self) -> Box<dyn YieldCurve> {
        Box::new(self.clone())
    }
}
