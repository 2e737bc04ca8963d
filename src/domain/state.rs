//! Synchronized accounting snapshot and derived claim views.

use super::{MarketState, MathError, Nav, Rounding, Timestamp, TrancheKind, TrancheUnits, Wad};
use serde::{Deserialize, Serialize};

/// Per-market accounting state re-derived on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedAccountingState {
    pub st_raw_nav: Nav,
    pub jt_raw_nav: Nav,
    pub st_effective_nav: Nav,
    pub jt_effective_nav: Nav,
    /// Senior loss junior could not cover, tracked until written off.
    pub st_impermanent_loss: Nav,
    /// Coverage junior has extended to senior, recouped from senior yield.
    pub jt_coverage_impermanent_loss: Nav,
    pub st_protocol_fee_accrued: Nav,
    pub jt_protocol_fee_accrued: Nav,
    pub utilization: Wad,
    pub ltv: Wad,
    /// Junior's share of senior yield from the last curve evaluation.
    pub jt_yield_share: Wad,
    pub market_state: MarketState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_term_ends_at: Option<Timestamp>,
    pub last_sync: Timestamp,
    pub dust_tolerance: Nav,
}

impl SyncedAccountingState {
    pub fn new(now: Timestamp, dust_tolerance: Nav) -> Self {
        Self {
            st_raw_nav: Nav::ZERO,
            jt_raw_nav: Nav::ZERO,
            st_effective_nav: Nav::ZERO,
            jt_effective_nav: Nav::ZERO,
            st_impermanent_loss: Nav::ZERO,
            jt_coverage_impermanent_loss: Nav::ZERO,
            st_protocol_fee_accrued: Nav::ZERO,
            jt_protocol_fee_accrued: Nav::ZERO,
            utilization: Wad::ZERO,
            ltv: Wad::ZERO,
            jt_yield_share: Wad::ZERO,
            market_state: MarketState::Perpetual,
            fixed_term_ends_at: None,
            last_sync: now,
            dust_tolerance,
        }
    }

    pub fn raw_nav(&self, tranche: TrancheKind) -> Nav {
        match tranche {
            TrancheKind::Senior => self.st_raw_nav,
            TrancheKind::Junior => self.jt_raw_nav,
        }
    }

    pub fn effective_nav(&self, tranche: TrancheKind) -> Nav {
        match tranche {
            TrancheKind::Senior => self.st_effective_nav,
            TrancheKind::Junior => self.jt_effective_nav,
        }
    }

    pub fn fee_accrued(&self, tranche: TrancheKind) -> Nav {
        match tranche {
            TrancheKind::Senior => self.st_protocol_fee_accrued,
            TrancheKind::Junior => self.jt_protocol_fee_accrued,
        }
    }

    pub fn total_raw_nav(&self) -> Result<Nav, MathError> {
        self.st_raw_nav.checked_add(self.jt_raw_nav)
    }

    /// Effective NAVs plus unclaimed fees.
    pub fn total_claims(&self) -> Result<Nav, MathError> {
        self.st_effective_nav
            .checked_add(self.jt_effective_nav)?
            .checked_add(self.st_protocol_fee_accrued)?
            .checked_add(self.jt_protocol_fee_accrued)
    }

    /// Distance between raw holdings and total claims.
    pub fn conservation_gap(&self) -> Result<Nav, MathError> {
        Ok(self.total_raw_nav()?.abs_diff(self.total_claims()?))
    }

    pub fn is_fixed_term(&self) -> bool {
        self.market_state == MarketState::FixedTerm
    }
}

/// A tranche's effective NAV split across the two venue positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetClaims {
    pub st_assets: Nav,
    pub jt_assets: Nav,
    pub nav: Nav,
}

impl AssetClaims {
    pub fn new(st_assets: Nav, jt_assets: Nav) -> Result<Self, MathError> {
        Ok(Self {
            st_assets,
            jt_assets,
            nav: st_assets.checked_add(jt_assets)?,
        })
    }

    /// Legs paying out `value` of this claim, each rounded down.
    pub fn pro_rata(&self, value: Nav) -> Result<AssetClaims, MathError> {
        if self.nav.is_zero() || value.is_zero() {
            return Ok(AssetClaims::default());
        }
        let value = value.min(self.nav);
        let st_assets = value.mul_div(self.st_assets, self.nav, Rounding::Floor)?;
        let jt_assets = value.mul_div(self.jt_assets, self.nav, Rounding::Floor)?;
        AssetClaims::new(st_assets, jt_assets)
    }

    pub fn leg(&self, position: TrancheKind) -> Nav {
        match position {
            TrancheKind::Senior => self.st_assets,
            TrancheKind::Junior => self.jt_assets,
        }
    }
}

/// Result of a read-only sync simulation for one tranche.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPreview {
    pub state: SyncedAccountingState,
    pub claims: AssetClaims,
    /// Supply including fee shares the sync would mint.
    pub total_shares: TrancheUnits,
}
