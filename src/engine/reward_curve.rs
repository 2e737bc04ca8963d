//! Stateless utilization curve used to size incentive rewards.

use super::yield_curve::{CurveContext, CurveError};
use crate::domain::{mul_div, MathError, Nav, Rounding, Wad, WAD_DECIMALS};

/// Piecewise-linear map from utilization to a reward share.
///
/// Breakpoints start at U = 0, end at U = 1 and are strictly increasing in U.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardCurve {
    points: Vec<(Wad, Wad)>,
}

impl RewardCurve {
    pub fn new(points: Vec<(Wad, Wad)>) -> Result<Self, CurveError> {
        if points.len() < 2 {
            return Err(CurveError::InvalidParameters(
                "reward curve needs at least two breakpoints".to_string(),
            ));
        }
        if points[0].0 != Wad::ZERO || points[points.len() - 1].0 != Wad::ONE {
            return Err(CurveError::InvalidParameters(
                "reward curve must span utilization 0 to 1".to_string(),
            ));
        }
        for pair in points.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(CurveError::InvalidParameters(format!(
                    "utilization breakpoints must increase: {} then {}",
                    pair[0].0, pair[1].0
                )));
            }
        }
        if let Some((u, r)) = points.iter().find(|(_, r)| *r > Wad::ONE) {
            return Err(CurveError::InvalidParameters(format!(
                "reward share {} at utilization {} exceeds 1",
                r, u
            )));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(Wad, Wad)] {
        &self.points
    }

    /// Linear interpolation between the breakpoints around `u`, rounded down.
    pub fn reward_share_at(&self, u: Wad) -> Result<Wad, MathError> {
        let u = u.clamp_to(Wad::ZERO, Wad::ONE);
        let segment = self
            .points
            .windows(2)
            .find(|pair| u <= pair[1].0)
            .ok_or(MathError::Overflow("reward curve lookup"))?;
        let (u0, r0) = segment[0];
        let (u1, r1) = segment[1];

        let progress = u.inner() - u0.inner();
        let run = u1.inner() - u0.inner();
        let share = if r1 >= r0 {
            let step = mul_div(r1.inner() - r0.inner(), progress, run, WAD_DECIMALS, Rounding::Floor)?;
            r0.inner() + step
        } else {
            let step = mul_div(r0.inner() - r1.inner(), progress, run, WAD_DECIMALS, Rounding::Ceil)?;
            r0.inner() - step
        };
        Wad::from_decimal(share, Rounding::Floor)
    }

    pub fn reward_share(&self, ctx: &CurveContext) -> Result<Wad, MathError> {
        self.reward_share_at(ctx.utilization()?)
    }

    /// Portion of `budget` paid at the context's utilization.
    pub fn reward_for(&self, budget: Nav, ctx: &CurveContext) -> Result<Nav, MathError> {
        budget.mul_wad(self.reward_share(ctx)?, Rounding::Floor)
    }
}
