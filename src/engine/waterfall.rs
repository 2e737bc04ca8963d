//! Coverage-capped junior absorption of senior shortfall.

use crate::domain::{MathError, Nav, Rounding, Wad};
use serde::{Deserialize, Serialize};

/// Inputs to one waterfall evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossWaterfall {
    /// Senior principal P.
    pub senior_principal: Nav,
    /// Senior NAV N after the loss.
    pub senior_nav: Nav,
    /// Coverage ratio c.
    pub coverage_ratio: Wad,
    /// Junior capital K still available to cover.
    pub junior_capacity: Nav,
    /// Coverage junior already extended against this principal.
    pub already_absorbed: Nav,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaterfallOutcome {
    pub shortfall: Nav,
    pub commitment: Nav,
    /// Commitment left after earlier absorption of the same shortfall.
    pub remaining_commitment: Nav,
    pub jt_absorbed: Nav,
    pub st_uncovered: Nav,
}

impl LossWaterfall {
    /// Junior capacity: `min(jt_effective, jt_raw - jt_coverage_il)`.
    pub fn junior_capacity(jt_effective_nav: Nav, jt_raw_nav: Nav, jt_coverage_il: Nav) -> Nav {
        jt_effective_nav.min(jt_raw_nav.saturating_sub(jt_coverage_il))
    }

    /// `ceil(P * c)`.
    pub fn commitment(&self) -> Result<Nav, MathError> {
        self.senior_principal
            .mul_wad(self.coverage_ratio, Rounding::Ceil)
    }

    /// Split the shortfall. Junior's total absorption against one principal
    /// never exceeds the commitment, however the loss is sliced.
    pub fn run(&self) -> Result<WaterfallOutcome, MathError> {
        let shortfall = self.senior_principal.saturating_sub(self.senior_nav);
        if shortfall.is_zero() {
            return Ok(WaterfallOutcome::default());
        }
        let commitment = self.commitment()?;
        let remaining_commitment = commitment.saturating_sub(self.already_absorbed);
        let jt_absorbed = shortfall
            .min(remaining_commitment)
            .min(self.junior_capacity);
        let st_uncovered = shortfall.checked_sub(jt_absorbed)?;
        Ok(WaterfallOutcome {
            shortfall,
            commitment,
            remaining_commitment,
            jt_absorbed,
            st_uncovered,
        })
    }
}
