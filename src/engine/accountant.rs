//! Accounting synchronizer: the single writer of `SyncedAccountingState`.
//!
//! Every sync works on the raw NAV delta of each venue position since the
//! previous checkpoint:
//!
//! - Junior position: gains pay the junior fee and accrue to junior; losses
//!   write down junior, then senior (as senior impermanent loss), then fees.
//! - Senior position: losses run the [`LossWaterfall`] against the principal
//!   in force when the shortfall began, so junior's coverage across several
//!   syncs stays within one commitment; gains pay the senior fee on the gross
//!   delta, repay the coverage accumulator to junior, and the yield curve
//!   splits the rest.
//!
//! Any outstanding senior impermanent loss keeps the market in a fixed term
//! until expiry writes it off.
//!
//! The yield curve is evaluated on every sync so adaptive curves integrate
//! over every interval. Utilization, LTV and the solvency state machine are
//! then re-derived and the conservation invariants checked. A failed check
//! halts the synchronizer.

use super::waterfall::LossWaterfall;
use super::yield_curve::{utilization, CurveContext, YieldCurve};
use crate::domain::{
    mul_div, Address, AssetClaims, MarketId, MarketState, MathError, Nav, Rounding,
    SyncedAccountingState, Timestamp, TrancheKind, Wad,
};
use crate::error::MarketError;
use crate::venue::InvestmentVenue;
use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};

/// Governance parameters for junior coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoveragePolicy {
    pub coverage_ratio: Wad,
    pub beta: Wad,
    pub ltv_ceiling: Wad,
    pub fixed_term_duration_secs: u64,
}

impl CoveragePolicy {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.coverage_ratio.is_zero() || self.coverage_ratio > Wad::ONE {
            return Err(MarketError::Validation(format!(
                "coverage ratio must be in (0, 1], got {}",
                self.coverage_ratio
            )));
        }
        if self.beta > Wad::ONE {
            return Err(MarketError::Validation(format!(
                "beta must be in [0, 1], got {}",
                self.beta
            )));
        }
        if self.ltv_ceiling.is_zero() {
            return Err(MarketError::Validation(
                "LTV ceiling must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Protocol fee rates, as fractions of positive raw NAV deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePolicy {
    pub st_protocol_fee: Wad,
    pub jt_protocol_fee: Wad,
    pub recipient: Address,
}

impl FeePolicy {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.st_protocol_fee > Wad::ONE || self.jt_protocol_fee > Wad::ONE {
            return Err(MarketError::Validation(format!(
                "protocol fees must be in [0, 1], got senior {} junior {}",
                self.st_protocol_fee, self.jt_protocol_fee
            )));
        }
        Ok(())
    }

    pub fn rate(&self, tranche: TrancheKind) -> Wad {
        match tranche {
            TrancheKind::Senior => self.st_protocol_fee,
            TrancheKind::Junior => self.jt_protocol_fee,
        }
    }
}

/// Write `loss` down against `target`, returning what `target` could not absorb.
fn absorb(target: &mut Nav, loss: Nav) -> Nav {
    let taken = (*target).min(loss);
    *target = target.saturating_sub(taken);
    loss.saturating_sub(taken)
}

/// `ceil((st_effective + st_il) / jt_effective)`.
pub fn loan_to_value(state: &SyncedAccountingState) -> Result<Wad, MathError> {
    let exposure = state
        .st_effective_nav
        .checked_add(state.st_impermanent_loss)?;
    if state.jt_effective_nav.is_zero() {
        return Ok(if exposure.is_zero() { Wad::ZERO } else { Wad::MAX });
    }
    Wad::ratio(
        exposure.inner(),
        state.jt_effective_nav.inner(),
        Rounding::Ceil,
    )
}

#[derive(Debug, Clone)]
pub struct AccountingSynchronizer {
    market: MarketId,
    state: SyncedAccountingState,
    coverage: CoveragePolicy,
    fees: FeePolicy,
    curve: Box<dyn YieldCurve>,
    halted: Option<String>,
}

impl AccountingSynchronizer {
    pub fn new(
        market: MarketId,
        coverage: CoveragePolicy,
        fees: FeePolicy,
        curve: Box<dyn YieldCurve>,
        dust_tolerance: Nav,
        now: Timestamp,
    ) -> Result<Self, MarketError> {
        coverage.validate()?;
        fees.validate()?;
        Ok(Self {
            market,
            state: SyncedAccountingState::new(now, dust_tolerance),
            coverage,
            fees,
            curve,
            halted: None,
        })
    }

    pub fn state(&self) -> &SyncedAccountingState {
        &self.state
    }

    pub fn coverage(&self) -> &CoveragePolicy {
        &self.coverage
    }

    pub fn fees(&self) -> &FeePolicy {
        &self.fees
    }

    pub fn curve(&self) -> &dyn YieldCurve {
        self.curve.as_ref()
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(market = %self.market, reason = %reason, "Market halted");
        self.halted = Some(reason);
    }

    pub fn ensure_live(&self) -> Result<(), MarketError> {
        match &self.halted {
            Some(reason) => Err(MarketError::InvariantViolation(format!(
                "market halted: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    pub fn set_coverage_policy(&mut self, coverage: CoveragePolicy) -> Result<(), MarketError> {
        coverage.validate()?;
        tracing::info!(market = %self.market, from = ?self.coverage, to = ?coverage, "Coverage policy updated");
        self.coverage = coverage;
        Ok(())
    }

    pub fn set_fee_policy(&mut self, fees: FeePolicy) -> Result<(), MarketError> {
        fees.validate()?;
        tracing::info!(market = %self.market, from = ?self.fees, to = ?fees, "Fee policy updated");
        self.fees = fees;
        Ok(())
    }

    pub fn set_dust_tolerance(&mut self, dust_tolerance: Nav) {
        tracing::info!(
            market = %self.market,
            from = %self.state.dust_tolerance,
            to = %dust_tolerance,
            "Dust tolerance updated"
        );
        self.state.dust_tolerance = dust_tolerance;
    }

    /// Context the yield and reward curves are evaluated against.
    pub fn curve_context(&self, now: Timestamp) -> CurveContext {
        CurveContext {
            st_raw_nav: self.state.st_raw_nav,
            jt_raw_nav: self.state.jt_raw_nav,
            beta: self.coverage.beta,
            coverage_ratio: self.coverage.coverage_ratio,
            jt_effective_nav: self.state.jt_effective_nav,
            market_state: self.state.market_state,
            now,
        }
    }

    /// Re-derive the accounting state from fresh venue NAVs.
    ///
    /// Nothing is mutated if the venue read or any arithmetic fails. An
    /// invariant failure halts the synchronizer and leaves the last good
    /// state in place.
    pub fn sync(
        &mut self,
        venue: &dyn InvestmentVenue,
        now: Timestamp,
    ) -> Result<SyncedAccountingState, MarketError> {
        self.ensure_live()?;
        let st_raw = venue.raw_nav(TrancheKind::Senior).map_err(|e| {
            tracing::warn!(market = %self.market, error = %e, "Senior NAV read failed");
            e
        })?;
        let jt_raw = venue.raw_nav(TrancheKind::Junior).map_err(|e| {
            tracing::warn!(market = %self.market, error = %e, "Junior NAV read failed");
            e
        })?;

        let mut next = self.state.clone();
        let mut curve = self.curve.clone();
        self.apply_junior_delta(&mut next, jt_raw)?;

        let ctx = CurveContext {
            st_raw_nav: st_raw,
            jt_raw_nav: next.jt_raw_nav,
            beta: self.coverage.beta,
            coverage_ratio: self.coverage.coverage_ratio,
            jt_effective_nav: next.jt_effective_nav,
            market_state: next.market_state,
            now,
        };
        let jt_share = curve.distribute(&ctx)?;
        self.apply_senior_delta(&mut next, st_raw, jt_share)?;

        next.jt_yield_share = jt_share;
        next.last_sync = now;
        self.refresh_ratios(&mut next)?;
        self.evaluate_transition(&mut next, now)?;

        if let Err(violation) = self.check_invariants(&self.state, &next) {
            self.halt(violation.clone());
            return Err(MarketError::InvariantViolation(violation));
        }

        tracing::debug!(
            market = %self.market,
            st_raw = %next.st_raw_nav,
            jt_raw = %next.jt_raw_nav,
            st_effective = %next.st_effective_nav,
            jt_effective = %next.jt_effective_nav,
            utilization = %next.utilization,
            ltv = %next.ltv,
            jt_share = %next.jt_yield_share,
            state = ?next.market_state,
            "Synced accounting state"
        );

        self.state = next;
        self.curve = curve;
        Ok(self.state.clone())
    }

    /// Sync on a copy; nothing is persisted.
    pub fn preview(
        &self,
        venue: &dyn InvestmentVenue,
        now: Timestamp,
    ) -> Result<SyncedAccountingState, MarketError> {
        let mut scratch = self.clone();
        scratch.sync(venue, now)
    }

    fn apply_junior_delta(
        &self,
        state: &mut SyncedAccountingState,
        jt_raw: Nav,
    ) -> Result<(), MarketError> {
        let previous = state.jt_raw_nav;
        if jt_raw >= previous {
            let gain = jt_raw.checked_sub(previous)?;
            let fee = gain.mul_wad(self.fees.jt_protocol_fee, Rounding::Floor)?;
            state.jt_protocol_fee_accrued = state.jt_protocol_fee_accrued.checked_add(fee)?;
            state.jt_effective_nav = state
                .jt_effective_nav
                .checked_add(gain.checked_sub(fee)?)?;
        } else {
            let loss = previous.checked_sub(jt_raw)?;
            let overflow = absorb(&mut state.jt_effective_nav, loss);
            if !overflow.is_zero() {
                let before = state.st_effective_nav;
                let overflow = absorb(&mut state.st_effective_nav, overflow);
                let senior_hit = before.checked_sub(state.st_effective_nav)?;
                state.st_impermanent_loss = state.st_impermanent_loss.checked_add(senior_hit)?;
                let overflow = absorb(&mut state.jt_protocol_fee_accrued, overflow);
                let overflow = absorb(&mut state.st_protocol_fee_accrued, overflow);
                if !overflow.is_zero() {
                    tracing::warn!(market = %self.market, unabsorbed = %overflow, "Junior loss exceeds all claims");
                }
            }
        }
        state.jt_raw_nav = jt_raw;
        state.jt_coverage_impermanent_loss = state.jt_coverage_impermanent_loss.min(jt_raw);
        Ok(())
    }

    fn apply_senior_delta(
        &self,
        state: &mut SyncedAccountingState,
        st_raw: Nav,
        jt_share: Wad,
    ) -> Result<(), MarketError> {
        let previous = state.st_raw_nav;
        if st_raw >= previous {
            let gain = st_raw.checked_sub(previous)?;
            let fee = gain.mul_wad(self.fees.st_protocol_fee, Rounding::Floor)?;
            state.st_protocol_fee_accrued = state.st_protocol_fee_accrued.checked_add(fee)?;
            let net = gain.checked_sub(fee)?;

            let repaid = net.min(state.jt_coverage_impermanent_loss);
            state.jt_coverage_impermanent_loss =
                state.jt_coverage_impermanent_loss.checked_sub(repaid)?;
            state.jt_effective_nav = state.jt_effective_nav.checked_add(repaid)?;

            let remainder = net.checked_sub(repaid)?;
            let to_junior = remainder.mul_wad(jt_share, Rounding::Floor)?;
            state.jt_effective_nav = state.jt_effective_nav.checked_add(to_junior)?;
            state.st_effective_nav = state
                .st_effective_nav
                .checked_add(remainder.checked_sub(to_junior)?)?;
        } else {
            let loss = previous.checked_sub(st_raw)?;
            let principal = state.st_effective_nav;
            // The commitment is sized on the principal in force when the
            // shortfall began, net of coverage junior has already extended.
            let shortfall_principal = principal.checked_add(state.st_impermanent_loss)?;
            let outcome = LossWaterfall {
                senior_principal: shortfall_principal,
                senior_nav: shortfall_principal.saturating_sub(loss.min(principal)),
                coverage_ratio: self.coverage.coverage_ratio,
                junior_capacity: LossWaterfall::junior_capacity(
                    state.jt_effective_nav,
                    state.jt_raw_nav,
                    state.jt_coverage_impermanent_loss,
                ),
                already_absorbed: state.jt_coverage_impermanent_loss,
            }
            .run()?;

            state.jt_effective_nav = state.jt_effective_nav.checked_sub(outcome.jt_absorbed)?;
            state.jt_coverage_impermanent_loss = state
                .jt_coverage_impermanent_loss
                .checked_add(outcome.jt_absorbed)?;
            state.st_effective_nav = state.st_effective_nav.checked_sub(outcome.st_uncovered)?;
            state.st_impermanent_loss = state
                .st_impermanent_loss
                .checked_add(outcome.st_uncovered)?;

            // Loss beyond senior principal falls on junior's claim on the senior position.
            let beyond = loss.saturating_sub(principal);
            if !beyond.is_zero() {
                let overflow = absorb(&mut state.jt_effective_nav, beyond);
                let overflow = absorb(&mut state.st_protocol_fee_accrued, overflow);
                let overflow = absorb(&mut state.jt_protocol_fee_accrued, overflow);
                if !overflow.is_zero() {
                    tracing::warn!(market = %self.market, unabsorbed = %overflow, "Senior loss exceeds all claims");
                }
            }

            if !outcome.shortfall.is_zero() {
                tracing::debug!(
                    market = %self.market,
                    shortfall = %outcome.shortfall,
                    commitment = %outcome.commitment,
                    jt_absorbed = %outcome.jt_absorbed,
                    st_uncovered = %outcome.st_uncovered,
                    "Ran loss waterfall"
                );
            }
        }
        state.st_raw_nav = st_raw;
        Ok(())
    }

    fn refresh_ratios(&self, state: &mut SyncedAccountingState) -> Result<(), MathError> {
        state.utilization = utilization(
            state.st_raw_nav,
            state.jt_raw_nav,
            self.coverage.beta,
            self.coverage.coverage_ratio,
            state.jt_effective_nav,
        )?;
        state.ltv = loan_to_value(state)?;
        Ok(())
    }

    fn evaluate_transition(
        &self,
        state: &mut SyncedAccountingState,
        now: Timestamp,
    ) -> Result<(), MathError> {
        let dust = state.dust_tolerance;
        let ceiling = self.coverage.ltv_ceiling;
        match state.market_state {
            MarketState::Perpetual => {
                if state.jt_coverage_impermanent_loss > dust
                    || !state.st_impermanent_loss.is_zero()
                    || state.ltv >= ceiling
                {
                    self.enter_fixed_term(state, now);
                }
            }
            MarketState::FixedTerm => {
                let expired = state
                    .fixed_term_ends_at
                    .map(|ends_at| now >= ends_at)
                    .unwrap_or(true);
                if expired {
                    let forgiven_coverage = state.jt_coverage_impermanent_loss;
                    let forgiven_senior = state.st_impermanent_loss;
                    self.return_to_perpetual(state)?;
                    tracing::info!(
                        market = %self.market,
                        forgiven_coverage = %forgiven_coverage,
                        forgiven_senior = %forgiven_senior,
                        "Fixed term expired"
                    );
                    if state.ltv >= ceiling {
                        self.enter_fixed_term(state, now);
                    }
                } else if state.jt_coverage_impermanent_loss <= dust
                    && state.st_impermanent_loss.is_zero()
                    && state.ltv < ceiling
                {
                    self.return_to_perpetual(state)?;
                    tracing::info!(market = %self.market, "Coverage restored before expiry");
                }
            }
        }
        Ok(())
    }

    fn enter_fixed_term(&self, state: &mut SyncedAccountingState, now: Timestamp) {
        let ends_at = now.saturating_add(self.coverage.fixed_term_duration_secs);
        tracing::info!(
            market = %self.market,
            from = ?state.market_state,
            to = ?MarketState::FixedTerm,
            coverage_il = %state.jt_coverage_impermanent_loss,
            ltv = %state.ltv,
            ends_at = %ends_at,
            "Market state transition"
        );
        state.market_state = MarketState::FixedTerm;
        state.fixed_term_ends_at = Some(ends_at);
    }

    fn return_to_perpetual(&self, state: &mut SyncedAccountingState) -> Result<(), MathError> {
        tracing::info!(
            market = %self.market,
            from = ?state.market_state,
            to = ?MarketState::Perpetual,
            "Market state transition"
        );
        state.market_state = MarketState::Perpetual;
        state.fixed_term_ends_at = None;
        state.jt_coverage_impermanent_loss = Nav::ZERO;
        state.st_impermanent_loss = Nav::ZERO;
        state.ltv = loan_to_value(state)?;
        Ok(())
    }

    fn check_invariants(
        &self,
        previous: &SyncedAccountingState,
        next: &SyncedAccountingState,
    ) -> Result<(), String> {
        let dust = next.dust_tolerance;
        let gap = next.conservation_gap().map_err(|e| e.to_string())?;
        if gap > dust {
            return Err(format!(
                "conservation gap {} exceeds dust {} (raw {} + {}, claims {} + {} + fees {} + {})",
                gap,
                dust,
                next.st_raw_nav,
                next.jt_raw_nav,
                next.st_effective_nav,
                next.jt_effective_nav,
                next.st_protocol_fee_accrued,
                next.jt_protocol_fee_accrued
            ));
        }
        let il_bound = next.jt_raw_nav.checked_add(dust).map_err(|e| e.to_string())?;
        if next.jt_coverage_impermanent_loss > il_bound {
            return Err(format!(
                "coverage impermanent loss {} exceeds junior raw NAV {}",
                next.jt_coverage_impermanent_loss, next.jt_raw_nav
            ));
        }
        let same_term = previous.is_fixed_term()
            && next.is_fixed_term()
            && previous.fixed_term_ends_at == next.fixed_term_ends_at;
        if same_term && next.st_impermanent_loss < previous.st_impermanent_loss {
            return Err(format!(
                "senior impermanent loss decreased from {} to {} during fixed term",
                previous.st_impermanent_loss, next.st_impermanent_loss
            ));
        }
        if next.ltv >= self.coverage.ltv_ceiling && !next.is_fixed_term() {
            return Err(format!(
                "LTV {} at or above ceiling {} outside fixed term",
                next.ltv, self.coverage.ltv_ceiling
            ));
        }
        Ok(())
    }

    /// Record assets that just entered the tranche's venue position.
    pub fn record_deposit(&mut self, tranche: TrancheKind, assets: Nav) -> Result<(), MathError> {
        match tranche {
            TrancheKind::Senior => {
                self.state.st_raw_nav = self.state.st_raw_nav.checked_add(assets)?;
                self.state.st_effective_nav = self.state.st_effective_nav.checked_add(assets)?;
            }
            TrancheKind::Junior => {
                self.state.jt_raw_nav = self.state.jt_raw_nav.checked_add(assets)?;
                self.state.jt_effective_nav = self.state.jt_effective_nav.checked_add(assets)?;
            }
        }
        Ok(())
    }

    /// Record a payout of `paid` out of the tranche's claims.
    pub fn record_withdrawal(
        &mut self,
        tranche: TrancheKind,
        paid: &AssetClaims,
    ) -> Result<(), MathError> {
        let state = &mut self.state;
        match tranche {
            TrancheKind::Senior => {
                state.st_effective_nav = state.st_effective_nav.checked_sub(paid.nav)?;
            }
            TrancheKind::Junior => {
                state.jt_effective_nav = state.jt_effective_nav.checked_sub(paid.nav)?;
            }
        }
        state.st_raw_nav = state.st_raw_nav.checked_sub(paid.st_assets)?;
        state.jt_raw_nav = state.jt_raw_nav.checked_sub(paid.jt_assets)?;
        state.jt_coverage_impermanent_loss = state.jt_coverage_impermanent_loss.min(state.jt_raw_nav);
        Ok(())
    }

    /// Move the tranche's accrued fee into its effective NAV, returning the amount.
    pub fn realize_fee(&mut self, tranche: TrancheKind) -> Result<Nav, MathError> {
        let state = &mut self.state;
        let fee = match tranche {
            TrancheKind::Senior => std::mem::take(&mut state.st_protocol_fee_accrued),
            TrancheKind::Junior => std::mem::take(&mut state.jt_protocol_fee_accrued),
        };
        match tranche {
            TrancheKind::Senior => {
                state.st_effective_nav = state.st_effective_nav.checked_add(fee)?;
            }
            TrancheKind::Junior => {
                state.jt_effective_nav = state.jt_effective_nav.checked_add(fee)?;
            }
        }
        Ok(fee)
    }

    /// Split of a tranche's effective NAV across the two venue positions.
    ///
    /// Senior claims the senior position first; whatever junior covered sits
    /// in the junior position. Junior claims what is left of its own
    /// position, and its share of senior yield sits in the senior position.
    pub fn claims(&self, tranche: TrancheKind) -> Result<AssetClaims, MathError> {
        let s = &self.state;
        let st_free = s.st_raw_nav.saturating_sub(s.st_protocol_fee_accrued);
        let st_on_st = s.st_effective_nav.min(st_free);
        let st_on_jt = s.st_effective_nav.checked_sub(st_on_st)?;
        match tranche {
            TrancheKind::Senior => AssetClaims::new(st_on_st, st_on_jt),
            TrancheKind::Junior => {
                let jt_free = s
                    .jt_raw_nav
                    .saturating_sub(s.jt_protocol_fee_accrued)
                    .saturating_sub(st_on_jt);
                let jt_on_jt = s.jt_effective_nav.min(jt_free);
                let jt_on_st = s.jt_effective_nav.checked_sub(jt_on_jt)?;
                AssetClaims::new(jt_on_st, jt_on_jt)
            }
        }
    }

    /// Largest senior deposit keeping utilization at or below 1 and LTV
    /// below the ceiling. Zero while in a fixed term.
    pub fn max_senior_deposit(&self) -> Result<Nav, MathError> {
        let s = &self.state;
        if s.is_fixed_term() || s.jt_effective_nav.is_zero() {
            return Ok(Nav::ZERO);
        }
        let coverable = Nav::from_decimal(
            mul_div(
                s.jt_effective_nav.inner(),
                RustDecimal::ONE,
                self.coverage.coverage_ratio.inner(),
                0,
                Rounding::Floor,
            )?,
            Rounding::Floor,
        )?;
        let exposure = s
            .st_raw_nav
            .checked_add(s.jt_raw_nav.mul_wad(self.coverage.beta, Rounding::Ceil)?)?;
        let by_utilization = coverable.saturating_sub(exposure);

        let ltv_room = s
            .jt_effective_nav
            .mul_wad(self.coverage.ltv_ceiling, Rounding::Floor)?;
        let by_ltv = ltv_room
            .saturating_sub(s.st_effective_nav)
            .saturating_sub(s.st_impermanent_loss)
            .saturating_sub(Nav::new(1));

        Ok(by_utilization.min(by_ltv))
    }

    /// Largest junior exit value keeping senior covered and LTV below the
    /// ceiling. Zero while in a fixed term.
    ///
    /// Junior raw NAV is assumed unchanged by the exit, which only
    /// overstates the remaining requirement when beta > 0.
    pub fn max_junior_withdrawal(&self) -> Result<Nav, MathError> {
        let s = &self.state;
        if s.is_fixed_term() {
            return Ok(Nav::ZERO);
        }
        let required = s
            .st_raw_nav
            .checked_add(s.jt_raw_nav.mul_wad(self.coverage.beta, Rounding::Ceil)?)?
            .mul_wad(self.coverage.coverage_ratio, Rounding::Ceil)?;
        let by_coverage = s.jt_effective_nav.saturating_sub(required);

        let exposure = s
            .st_effective_nav
            .checked_add(s.st_impermanent_loss)?;
        let by_ltv = if exposure.is_zero() {
            s.jt_effective_nav
        } else {
            let min_junior = Nav::from_decimal(
                mul_div(
                    exposure.inner(),
                    RustDecimal::ONE,
                    self.coverage.ltv_ceiling.inner(),
                    0,
                    Rounding::Floor,
                )?,
                Rounding::Floor,
            )?;
            s.jt_effective_nav
                .saturating_sub(min_junior)
                .saturating_sub(Nav::new(1))
        };
        Ok(by_coverage.min(by_ltv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::yield_curve::{StaticCurveParams, StaticYieldCurve};
    use crate::venue::MockVenue;
    use rust_decimal_macros::dec;

    fn w(s: &str) -> Wad {
        s.parse().unwrap()
    }

    fn coverage() -> CoveragePolicy {
        CoveragePolicy {
            coverage_ratio: w("0.2"),
            beta: Wad::ZERO,
            ltv_ceiling: w("10"),
            fixed_term_duration_secs: 1000,
        }
    }

    fn fees(st: &str, jt: &str) -> FeePolicy {
        FeePolicy {
            st_protocol_fee: w(st),
            jt_protocol_fee: w(jt),
            recipient: Address::new("treasury"),
        }
    }

    fn flat_curve(share: &str) -> Box<dyn YieldCurve> {
        Box::new(
            StaticYieldCurve::new(StaticCurveParams {
                zero_util_share: w(share),
                target_utilization: w("0.5"),
                target_share: w(share),
                full_util_share: w(share),
            })
            .unwrap(),
        )
    }

    /// Senior 1000, junior 200, synced at t = 0.
    fn funded(st_fee: &str, share: &str) -> (AccountingSynchronizer, MockVenue) {
        let venue = MockVenue::new();
        let mut acct = AccountingSynchronizer::new(
            MarketId::generate(),
            coverage(),
            fees(st_fee, "0"),
            flat_curve(share),
            Nav::new(1),
            Timestamp::new(0),
        )
        .unwrap();
        for (tranche, amount) in [(TrancheKind::Junior, 200), (TrancheKind::Senior, 1000)] {
            venue.deposit(tranche, Nav::new(amount)).unwrap();
            acct.record_deposit(tranche, Nav::new(amount)).unwrap();
        }
        acct.sync(&venue, Timestamp::new(0)).unwrap();
        (acct, venue)
    }

    #[test]
    fn test_senior_yield_split_after_fee() {
        let (mut acct, venue) = funded("0.1", "0.25");
        venue.accrue(TrancheKind::Senior, dec!(100)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(10)).unwrap();
        // fee 10, net 90, junior floor(90 * 0.25) = 22
        assert_eq!(state.st_protocol_fee_accrued, Nav::new(10));
        assert_eq!(state.jt_effective_nav, Nav::new(222));
        assert_eq!(state.st_effective_nav, Nav::new(1068));
        assert_eq!(state.conservation_gap().unwrap(), Nav::ZERO);
        assert_eq!(state.jt_yield_share, w("0.25"));
    }

    #[test]
    fn test_scenario_c_senior_loss_covered_by_junior() {
        let (mut acct, venue) = funded("0", "0");
        venue.accrue(TrancheKind::Senior, dec!(-50)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(10)).unwrap();
        assert_eq!(state.st_effective_nav, Nav::new(1000));
        assert_eq!(state.jt_effective_nav, Nav::new(150));
        assert_eq!(state.jt_coverage_impermanent_loss, Nav::new(50));
        assert_eq!(state.market_state, MarketState::FixedTerm);
        assert_eq!(state.fixed_term_ends_at, Some(Timestamp::new(1010)));
        assert_eq!(state.conservation_gap().unwrap(), Nav::ZERO);

        let claims = acct.claims(TrancheKind::Senior).unwrap();
        assert_eq!(claims.st_assets, Nav::new(950));
        assert_eq!(claims.jt_assets, Nav::new(50));
        let claims = acct.claims(TrancheKind::Junior).unwrap();
        assert_eq!(claims.jt_assets, Nav::new(150));
        assert_eq!(claims.st_assets, Nav::ZERO);
    }

    #[test]
    fn test_loss_beyond_commitment_is_senior_impermanent_loss() {
        let (mut acct, venue) = funded("0", "0");
        venue.accrue(TrancheKind::Senior, dec!(-300)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(10)).unwrap();
        assert_eq!(state.jt_coverage_impermanent_loss, Nav::new(200));
        assert_eq!(state.jt_effective_nav, Nav::ZERO);
        assert_eq!(state.st_effective_nav, Nav::new(900));
        assert_eq!(state.st_impermanent_loss, Nav::new(100));
        assert_eq!(state.ltv, Wad::MAX);
        assert!(state.is_fixed_term());
    }

    #[test]
    fn test_coverage_repaid_then_natural_restore() {
        let (mut acct, venue) = funded("0", "0");
        venue.accrue(TrancheKind::Senior, dec!(-50)).unwrap();
        acct.sync(&venue, Timestamp::new(10)).unwrap();

        venue.accrue(TrancheKind::Senior, dec!(80)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(20)).unwrap();
        assert_eq!(state.jt_coverage_impermanent_loss, Nav::ZERO);
        assert_eq!(state.jt_effective_nav, Nav::new(200));
        assert_eq!(state.st_effective_nav, Nav::new(1030));
        assert_eq!(state.market_state, MarketState::Perpetual);
        assert_eq!(state.fixed_term_ends_at, None);
    }

    #[test]
    fn test_fixed_term_expiry_forgives_shortfall() {
        let (mut acct, venue) = funded("0", "0");
        venue.accrue(TrancheKind::Senior, dec!(-50)).unwrap();
        acct.sync(&venue, Timestamp::new(10)).unwrap();

        let state = acct.sync(&venue, Timestamp::new(500)).unwrap();
        assert!(state.is_fixed_term());

        let state = acct.sync(&venue, Timestamp::new(1010)).unwrap();
        assert_eq!(state.market_state, MarketState::Perpetual);
        assert_eq!(state.jt_coverage_impermanent_loss, Nav::ZERO);
        assert_eq!(state.st_impermanent_loss, Nav::ZERO);

        // Later senior yield is no longer routed to junior as repayment.
        venue.accrue(TrancheKind::Senior, dec!(50)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(1020)).unwrap();
        assert_eq!(state.jt_effective_nav, Nav::new(150));
        assert_eq!(state.st_effective_nav, Nav::new(1050));
    }

    #[test]
    fn test_ltv_ceiling_forces_fixed_term() {
        let (mut acct, venue) = funded("0", "0");
        let mut policy = *acct.coverage();
        policy.ltv_ceiling = w("5");
        acct.set_coverage_policy(policy).unwrap();
        let state = acct.sync(&venue, Timestamp::new(5)).unwrap();
        assert_eq!(state.ltv, w("5"));
        assert!(state.is_fixed_term());

        // Expiry re-enters a new term while LTV stays at the ceiling.
        let state = acct.sync(&venue, Timestamp::new(1005)).unwrap();
        assert!(state.is_fixed_term());
        assert_eq!(state.fixed_term_ends_at, Some(Timestamp::new(2005)));
    }

    #[test]
    fn test_junior_loss_overflows_into_senior() {
        let (mut acct, venue) = funded("0", "0");
        // Give senior a 50 claim on the junior position first.
        venue.accrue(TrancheKind::Senior, dec!(-50)).unwrap();
        acct.sync(&venue, Timestamp::new(10)).unwrap();

        venue.accrue(TrancheKind::Junior, dec!(-180)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(20)).unwrap();
        assert_eq!(state.jt_effective_nav, Nav::ZERO);
        assert_eq!(state.st_effective_nav, Nav::new(970));
        assert_eq!(state.st_impermanent_loss, Nav::new(30));
        assert_eq!(state.jt_coverage_impermanent_loss, Nav::new(20));
        assert_eq!(state.conservation_gap().unwrap(), Nav::ZERO);
    }

    #[test]
    fn test_senior_impermanent_loss_starts_fixed_term() {
        let venue = MockVenue::new();
        let mut acct = AccountingSynchronizer::new(
            MarketId::generate(),
            coverage(),
            fees("0", "1"),
            flat_curve("0.5"),
            Nav::new(1),
            Timestamp::new(0),
        )
        .unwrap();
        for (tranche, amount) in [(TrancheKind::Junior, 200), (TrancheKind::Senior, 1000)] {
            venue.deposit(tranche, Nav::new(amount)).unwrap();
            acct.record_deposit(tranche, Nav::new(amount)).unwrap();
        }
        // All junior yield goes to fees, leaving raw above effective.
        venue.accrue(TrancheKind::Junior, dec!(100)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(0)).unwrap();
        assert_eq!(state.jt_protocol_fee_accrued, Nav::new(100));
        assert_eq!(state.market_state, MarketState::Perpetual);

        // Junior loss spills 50 onto senior; senior yield in the same sync
        // rebuilds junior so LTV stays well under the ceiling.
        venue.accrue(TrancheKind::Junior, dec!(-250)).unwrap();
        venue.accrue(TrancheKind::Senior, dec!(400)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(10)).unwrap();
        assert_eq!(state.st_impermanent_loss, Nav::new(50));
        assert_eq!(state.st_effective_nav, Nav::new(1150));
        assert_eq!(state.jt_effective_nav, Nav::new(200));
        assert_eq!(state.ltv, w("6"));
        assert_eq!(state.jt_coverage_impermanent_loss, Nav::ZERO);
        assert_eq!(state.market_state, MarketState::FixedTerm);
        assert_eq!(state.fixed_term_ends_at, Some(Timestamp::new(1010)));

        let state = acct.sync(&venue, Timestamp::new(500)).unwrap();
        assert!(state.is_fixed_term());

        let state = acct.sync(&venue, Timestamp::new(1010)).unwrap();
        assert_eq!(state.market_state, MarketState::Perpetual);
        assert_eq!(state.st_impermanent_loss, Nav::ZERO);
        assert_eq!(state.ltv, w("5.75"));
    }

    #[test]
    fn test_sliced_senior_loss_matches_single_loss() {
        let (mut sliced, sliced_venue) = funded("0", "0");
        sliced_venue.accrue(TrancheKind::Senior, dec!(-120)).unwrap();
        sliced.sync(&sliced_venue, Timestamp::new(10)).unwrap();
        sliced_venue.accrue(TrancheKind::Senior, dec!(-120)).unwrap();
        let sliced = sliced.sync(&sliced_venue, Timestamp::new(20)).unwrap();

        let (mut single, single_venue) = funded("0", "0");
        single_venue.accrue(TrancheKind::Senior, dec!(-240)).unwrap();
        let single = single.sync(&single_venue, Timestamp::new(20)).unwrap();

        assert_eq!(sliced.jt_coverage_impermanent_loss, Nav::new(200));
        assert_eq!(sliced.st_impermanent_loss, Nav::new(40));
        assert_eq!(sliced.st_effective_nav, Nav::new(960));
        assert_eq!(sliced.jt_effective_nav, Nav::ZERO);
        for (a, b) in [
            (sliced.jt_coverage_impermanent_loss, single.jt_coverage_impermanent_loss),
            (sliced.st_impermanent_loss, single.st_impermanent_loss),
            (sliced.st_effective_nav, single.st_effective_nav),
            (sliced.jt_effective_nav, single.jt_effective_nav),
        ] {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_junior_gain_pays_junior_fee() {
        let venue = MockVenue::new();
        let mut acct = AccountingSynchronizer::new(
            MarketId::generate(),
            coverage(),
            fees("0", "0.5"),
            flat_curve("0"),
            Nav::new(1),
            Timestamp::new(0),
        )
        .unwrap();
        venue.deposit(TrancheKind::Junior, Nav::new(100)).unwrap();
        acct.record_deposit(TrancheKind::Junior, Nav::new(100)).unwrap();
        venue.accrue(TrancheKind::Junior, dec!(11)).unwrap();
        let state = acct.sync(&venue, Timestamp::new(1)).unwrap();
        assert_eq!(state.jt_protocol_fee_accrued, Nav::new(5));
        assert_eq!(state.jt_effective_nav, Nav::new(106));

        let fee = acct.realize_fee(TrancheKind::Junior).unwrap();
        assert_eq!(fee, Nav::new(5));
        assert_eq!(acct.state().jt_effective_nav, Nav::new(111));
        assert_eq!(acct.state().jt_protocol_fee_accrued, Nav::ZERO);
    }

    #[test]
    fn test_venue_failure_leaves_state_untouched() {
        let (mut acct, venue) = funded("0", "0");
        let before = acct.state().clone();
        venue.accrue(TrancheKind::Senior, dec!(10)).unwrap();
        venue.set_fail_reads(true);
        let err = acct.sync(&venue, Timestamp::new(10)).unwrap_err();
        assert!(matches!(err, MarketError::Venue(_)));
        assert_eq!(acct.state(), &before);
    }

    #[test]
    fn test_preview_does_not_persist() {
        let (acct, venue) = funded("0", "0.5");
        venue.accrue(TrancheKind::Senior, dec!(100)).unwrap();
        let preview = acct.preview(&venue, Timestamp::new(10)).unwrap();
        assert_eq!(preview.jt_effective_nav, Nav::new(250));
        assert_eq!(acct.state().jt_effective_nav, Nav::new(200));
    }

    #[test]
    fn test_conservation_failure_halts() {
        let (mut acct, venue) = funded("0", "0");
        // Corrupt the books behind the synchronizer's back.
        acct.state.st_effective_nav = Nav::new(2000);
        let err = acct.sync(&venue, Timestamp::new(10)).unwrap_err();
        assert!(matches!(err, MarketError::InvariantViolation(_)));
        assert!(acct.halted().is_some());
        let err = acct.sync(&venue, Timestamp::new(20)).unwrap_err();
        assert!(matches!(err, MarketError::InvariantViolation(_)));
    }

    #[test]
    fn test_capacity_limits() {
        let (mut acct, _venue) = funded("0", "0");
        // 200 / 0.2 = 1000 coverable, 1000 already deployed.
        assert_eq!(acct.max_senior_deposit().unwrap(), Nav::ZERO);
        // Required coverage 200 of 200 junior.
        assert_eq!(acct.max_junior_withdrawal().unwrap(), Nav::ZERO);

        acct.record_deposit(TrancheKind::Junior, Nav::new(100)).unwrap();
        assert_eq!(acct.max_senior_deposit().unwrap(), Nav::new(500));
        assert_eq!(acct.max_junior_withdrawal().unwrap(), Nav::new(100));
    }

    #[test]
    fn test_ltv_capacity_bound() {
        let (mut acct, _venue) = funded("0", "0");
        let mut policy = *acct.coverage();
        policy.ltv_ceiling = w("6");
        policy.coverage_ratio = w("0.1");
        acct.set_coverage_policy(policy).unwrap();
        // Utilization allows 1000 more, LTV allows 1200 - 1000 - 1.
        assert_eq!(acct.max_senior_deposit().unwrap(), Nav::new(199));
        // Junior must keep more than 1000 / 6.
        assert_eq!(acct.max_junior_withdrawal().unwrap(), Nav::new(33));
    }

    #[test]
    fn test_loan_to_value_edges() {
        let mut state = SyncedAccountingState::new(Timestamp::new(0), Nav::new(1));
        assert_eq!(loan_to_value(&state).unwrap(), Wad::ZERO);
        state.st_effective_nav = Nav::new(1);
        assert_eq!(loan_to_value(&state).unwrap(), Wad::MAX);
        state.jt_effective_nav = Nav::new(3);
        assert_eq!(loan_to_value(&state).unwrap(), w("0.333333333333333334"));
    }
}
