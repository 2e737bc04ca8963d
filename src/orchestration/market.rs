//! Market: composition root and every public entry point.
//!
//! Each mutating entry point runs as a transaction over a copy of the book:
//! pre-op sync, fee share minting, the operation itself, post-op sync. The
//! copy replaces the live book only when the transaction completes. Venue
//! writes happen last inside an operation; once the venue has moved funds
//! the operation's effect is kept even if the post-op sync fails, and the
//! next sync reconciles.

use crate::domain::{
    convert_to_nav, convert_to_units, Address, AssetClaims, Clock, MarketId, Nav, Rounding,
    SyncPreview, SyncedAccountingState, Timestamp, TrancheKind, TrancheUnits, Wad,
};
use crate::engine::{
    AccountingSynchronizer, CoveragePolicy, FeePolicy, RedemptionDelayKernel, RedemptionRequest,
    RewardCurve, TrancheShareLedger, YieldCurve,
};
use crate::error::MarketError;
use crate::venue::InvestmentVenue;
use std::sync::Arc;

/// Governance parameters a market starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketParams {
    pub coverage: CoveragePolicy,
    pub fees: FeePolicy,
    pub dust_tolerance: Nav,
    pub redemption_delay_secs: u64,
}

#[derive(Debug, Clone)]
struct Book {
    accountant: AccountingSynchronizer,
    senior: TrancheShareLedger,
    junior: TrancheShareLedger,
    redemptions: RedemptionDelayKernel,
}

impl Book {
    fn ledger(&self, tranche: TrancheKind) -> &TrancheShareLedger {
        match tranche {
            TrancheKind::Senior => &self.senior,
            TrancheKind::Junior => &self.junior,
        }
    }

    fn ledger_mut(&mut self, tranche: TrancheKind) -> &mut TrancheShareLedger {
        match tranche {
            TrancheKind::Senior => &mut self.senior,
            TrancheKind::Junior => &mut self.junior,
        }
    }

    fn to_units(
        &self,
        tranche: TrancheKind,
        assets: Nav,
        rounding: Rounding,
    ) -> Result<TrancheUnits, MarketError> {
        Ok(convert_to_units(
            assets,
            self.ledger(tranche).total_supply(),
            self.accountant.state().effective_nav(tranche),
            rounding,
        )?)
    }

    fn to_nav(
        &self,
        tranche: TrancheKind,
        shares: TrancheUnits,
        rounding: Rounding,
    ) -> Result<Nav, MarketError> {
        Ok(convert_to_nav(
            shares,
            self.ledger(tranche).total_supply(),
            self.accountant.state().effective_nav(tranche),
            rounding,
        )?)
    }

    /// Largest deposit the accounting and the venue accept right now.
    fn max_deposit(
        &self,
        venue: &dyn InvestmentVenue,
        tranche: TrancheKind,
    ) -> Result<Nav, MarketError> {
        let venue_cap = venue.max_deposit(tranche)?;
        Ok(match tranche {
            TrancheKind::Senior => self.accountant.max_senior_deposit()?.min(venue_cap),
            TrancheKind::Junior => venue_cap,
        })
    }

    /// Largest exit value, bounded by coverage rules and venue liquidity per leg.
    fn max_exit_value(
        &self,
        venue: &dyn InvestmentVenue,
        tranche: TrancheKind,
    ) -> Result<Nav, MarketError> {
        let claims = self.accountant.claims(tranche)?;
        let mut bound = match tranche {
            TrancheKind::Senior => claims.nav,
            TrancheKind::Junior => self.accountant.max_junior_withdrawal()?.min(claims.nav),
        };
        for position in [TrancheKind::Senior, TrancheKind::Junior] {
            let leg = claims.leg(position);
            if leg.is_zero() {
                continue;
            }
            let liquidity = venue.max_withdraw(position)?;
            if liquidity < leg {
                bound = bound.min(liquidity.mul_div(claims.nav, leg, Rounding::Floor)?);
            }
        }
        Ok(bound)
    }
}

/// Staged copy of the book plus what it needs to talk to the venue.
struct Tx {
    market: MarketId,
    venue: Arc<dyn InvestmentVenue>,
    now: Timestamp,
    book: Book,
    wrote_venue: bool,
}

impl Tx {
    fn sync_and_mint_fees(&mut self) -> Result<(), MarketError> {
        self.book.accountant.sync(self.venue.as_ref(), self.now)?;
        self.mint_fee_shares(TrancheKind::Senior)?;
        self.mint_fee_shares(TrancheKind::Junior)
    }

    /// Mint accrued fees to the fee recipient at the pre-fee share price.
    ///
    /// A fee worth less than one share stays accrued until it grows.
    fn mint_fee_shares(&mut self, tranche: TrancheKind) -> Result<(), MarketError> {
        let state = self.book.accountant.state();
        let fee = state.fee_accrued(tranche);
        if fee.is_zero() {
            return Ok(());
        }
        let nav = state.effective_nav(tranche);
        let supply = self.book.ledger(tranche).total_supply();
        if !supply.is_zero() && nav.is_zero() {
            return Ok(());
        }
        let shares = convert_to_units(fee, supply, nav, Rounding::Floor)?;
        if shares.is_zero() {
            return Ok(());
        }
        let recipient = self.book.accountant.fees().recipient.clone();
        self.book.ledger_mut(tranche).mint(&recipient, shares, fee)?;
        self.book.accountant.realize_fee(tranche)?;
        tracing::debug!(
            market = %self.market,
            tranche = %tranche,
            fee = %fee,
            shares = %shares,
            recipient = %recipient,
            "Minted protocol fee shares"
        );
        Ok(())
    }

    /// Burn `shares` from `holder` and pay `value` of the tranche's claims to `receiver`.
    fn exit(
        &mut self,
        tranche: TrancheKind,
        holder: &Address,
        shares: TrancheUnits,
        value: Nav,
        receiver: &Address,
    ) -> Result<AssetClaims, MarketError> {
        let bound = self.book.max_exit_value(self.venue.as_ref(), tranche)?;
        if value > bound {
            return Err(MarketError::exceeds(
                &format!("{} exit", tranche),
                value,
                bound,
            ));
        }
        let paid = self.book.accountant.claims(tranche)?.pro_rata(value)?;
        self.book.ledger_mut(tranche).burn(holder, shares)?;
        self.book.accountant.record_withdrawal(tranche, &paid)?;
        self.pay(&paid, receiver)?;
        Ok(paid)
    }

    fn pay(&mut self, paid: &AssetClaims, receiver: &Address) -> Result<(), MarketError> {
        for position in [TrancheKind::Senior, TrancheKind::Junior] {
            let amount = paid.leg(position);
            if amount.is_zero() {
                continue;
            }
            self.venue.withdraw(position, amount, receiver)?;
            self.wrote_venue = true;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Market {
    id: MarketId,
    venue: Arc<dyn InvestmentVenue>,
    clock: Arc<dyn Clock>,
    reward_curve: RewardCurve,
    book: Book,
}

impl Market {
    pub fn new(
        params: MarketParams,
        yield_curve: Box<dyn YieldCurve>,
        reward_curve: RewardCurve,
        venue: Arc<dyn InvestmentVenue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MarketError> {
        let id = MarketId::generate();
        let accountant = AccountingSynchronizer::new(
            id,
            params.coverage,
            params.fees,
            yield_curve,
            params.dust_tolerance,
            clock.now(),
        )?;
        tracing::info!(
            market = %id,
            curve = accountant.curve().name(),
            coverage_ratio = %params.coverage.coverage_ratio,
            ltv_ceiling = %params.coverage.ltv_ceiling,
            "Market created"
        );
        Ok(Self {
            id,
            venue,
            clock,
            reward_curve,
            book: Book {
                accountant,
                senior: TrancheShareLedger::new(),
                junior: TrancheShareLedger::new(),
                redemptions: RedemptionDelayKernel::new(params.redemption_delay_secs),
            },
        })
    }

    pub fn id(&self) -> MarketId {
        self.id
    }

    fn begin(&self) -> Result<Tx, MarketError> {
        self.book.accountant.ensure_live()?;
        Ok(Tx {
            market: self.id,
            venue: Arc::clone(&self.venue),
            now: self.clock.now(),
            book: self.book.clone(),
            wrote_venue: false,
        })
    }

    /// Drop a failed transaction, halting the live book on invariant failure.
    fn abort(&mut self, op: &'static str, err: MarketError) -> MarketError {
        if let MarketError::InvariantViolation(reason) = &err {
            if self.book.accountant.halted().is_none() {
                self.book.accountant.halt(reason.clone());
            }
        }
        if err.is_retryable() {
            tracing::debug!(market = %self.id, op, error = %err, "Operation rejected");
        } else {
            tracing::warn!(market = %self.id, op, error = %err, "Operation aborted");
        }
        err
    }

    fn transact<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Tx) -> Result<T, MarketError>,
    ) -> Result<T, MarketError> {
        let mut tx = self.begin()?;
        if let Err(err) = tx.sync_and_mint_fees() {
            return Err(self.abort(op, err));
        }

        let output = match f(&mut tx) {
            Ok(output) => output,
            Err(err) if tx.wrote_venue => {
                tracing::warn!(
                    market = %self.id,
                    op,
                    error = %err,
                    "Operation failed after venue write; keeping recorded effect"
                );
                self.book = tx.book;
                return Err(err);
            }
            Err(err) => return Err(self.abort(op, err)),
        };

        match tx.sync_and_mint_fees() {
            Ok(()) => {
                self.book = tx.book;
                Ok(output)
            }
            Err(err) if tx.wrote_venue => {
                tracing::warn!(
                    market = %self.id,
                    op,
                    error = %err,
                    "Post-op sync failed after venue write; deferring to next sync"
                );
                let halted = matches!(err, MarketError::InvariantViolation(_));
                self.book = tx.book;
                if halted {
                    Err(err)
                } else {
                    Ok(output)
                }
            }
            Err(err) => Err(self.abort(op, err)),
        }
    }

    // ---------------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------------

    /// Deposit `assets` into a tranche, minting shares to `receiver`.
    pub fn deposit(
        &mut self,
        tranche: TrancheKind,
        assets: Nav,
        receiver: &Address,
    ) -> Result<TrancheUnits, MarketError> {
        reject_zero("deposit", assets.is_zero())?;
        reject_escrow(receiver)?;
        let shares = self.transact("deposit", |tx| {
            let bound = tx.book.max_deposit(tx.venue.as_ref(), tranche)?;
            if assets > bound {
                return Err(MarketError::exceeds(
                    &format!("{} deposit", tranche),
                    assets,
                    bound,
                ));
            }
            let shares = tx.book.to_units(tranche, assets, Rounding::Floor)?;
            reject_zero("deposit share amount", shares.is_zero())?;
            tx.book.ledger_mut(tranche).mint(receiver, shares, assets)?;
            tx.book.accountant.record_deposit(tranche, assets)?;
            tx.venue.deposit(tranche, assets)?;
            tx.wrote_venue = true;
            Ok(shares)
        })?;
        tracing::info!(market = %self.id, tranche = %tranche, assets = %assets, shares = %shares, receiver = %receiver, "Deposit");
        Ok(shares)
    }

    /// Burn senior `shares` from `owner`, paying their value to `receiver`.
    ///
    /// Junior exits go through [`Market::request_redeem`].
    pub fn redeem(
        &mut self,
        tranche: TrancheKind,
        shares: TrancheUnits,
        receiver: &Address,
        owner: &Address,
    ) -> Result<Nav, MarketError> {
        reject_junior(tranche)?;
        reject_zero("redeem", shares.is_zero())?;
        let paid = self.transact("redeem", |tx| {
            let value = tx.book.to_nav(tranche, shares, Rounding::Floor)?;
            tx.exit(tranche, owner, shares, value, receiver)
        })?;
        tracing::info!(market = %self.id, tranche = %tranche, shares = %shares, paid = %paid.nav, receiver = %receiver, "Redeem");
        Ok(paid.nav)
    }

    /// Pay `assets` of senior value to `receiver`, burning the shares it costs `owner`.
    ///
    /// Each venue leg is rounded down, so the receiver may get up to one
    /// base unit per leg less than requested. Shares are rounded up.
    pub fn withdraw(
        &mut self,
        tranche: TrancheKind,
        assets: Nav,
        receiver: &Address,
        owner: &Address,
    ) -> Result<TrancheUnits, MarketError> {
        reject_junior(tranche)?;
        reject_zero("withdraw", assets.is_zero())?;
        let shares = self.transact("withdraw", |tx| {
            let shares = tx.book.to_units(tranche, assets, Rounding::Ceil)?;
            tx.exit(tranche, owner, shares, assets, receiver)?;
            Ok(shares)
        })?;
        tracing::info!(market = %self.id, tranche = %tranche, assets = %assets, shares = %shares, receiver = %receiver, "Withdraw");
        Ok(shares)
    }

    pub fn transfer(
        &mut self,
        tranche: TrancheKind,
        from: &Address,
        to: &Address,
        shares: TrancheUnits,
    ) -> Result<Nav, MarketError> {
        reject_escrow(from)?;
        reject_escrow(to)?;
        self.transact("transfer", |tx| {
            Ok(tx.book.ledger_mut(tranche).transfer(from, to, shares)?)
        })
    }

    /// Queue junior `shares` of `owner` for redemption under `controller`.
    pub fn request_redeem(
        &mut self,
        shares: TrancheUnits,
        controller: &Address,
        owner: &Address,
    ) -> Result<RedemptionRequest, MarketError> {
        reject_zero("redemption request", shares.is_zero())?;
        reject_escrow(controller)?;
        let request = self.transact("request_redeem", |tx| {
            let value = tx.book.to_nav(TrancheKind::Junior, shares, Rounding::Floor)?;
            let request = tx
                .book
                .redemptions
                .request_redeem(controller, shares, value, tx.now)?
                .clone();
            tx.book
                .junior
                .transfer(owner, &Address::escrow_for(controller), shares)?;
            Ok(request)
        })?;
        tracing::info!(
            market = %self.id,
            controller = %controller,
            shares = %shares,
            total_shares = %request.total_shares_to_redeem,
            allowed_at = %request.redemption_allowed_at,
            "Redemption requested"
        );
        Ok(request)
    }

    /// Redeem matured junior `shares`, paying the lesser of their current
    /// value and their value when requested.
    pub fn claim_redeem(
        &mut self,
        controller: &Address,
        shares: TrancheUnits,
        receiver: &Address,
    ) -> Result<Nav, MarketError> {
        let paid = self.transact("claim_redeem", |tx| {
            let claim = tx.book.redemptions.claim(controller, shares, tx.now)?;
            let current = tx.book.to_nav(TrancheKind::Junior, shares, Rounding::Floor)?;
            let payout = current.min(claim.locked_value);
            tx.exit(
                TrancheKind::Junior,
                &Address::escrow_for(controller),
                shares,
                payout,
                receiver,
            )
        })?;
        tracing::info!(market = %self.id, controller = %controller, shares = %shares, paid = %paid.nav, receiver = %receiver, "Redemption claimed");
        Ok(paid.nav)
    }

    pub fn cancel_redeem_request(&mut self, controller: &Address) -> Result<(), MarketError> {
        let shares = self.transact("cancel_redeem_request", |tx| {
            Ok(tx.book.redemptions.cancel(controller)?)
        })?;
        tracing::info!(market = %self.id, controller = %controller, shares = %shares, "Redemption canceled");
        Ok(())
    }

    /// Return the shares of a canceled request to `receiver`.
    pub fn claim_cancel_redeem_request(
        &mut self,
        controller: &Address,
        receiver: &Address,
    ) -> Result<TrancheUnits, MarketError> {
        reject_escrow(receiver)?;
        let shares = self.transact("claim_cancel_redeem_request", |tx| {
            let shares = tx.book.redemptions.claim_cancel(controller)?;
            tx.book
                .junior
                .transfer(&Address::escrow_for(controller), receiver, shares)?;
            Ok(shares)
        })?;
        tracing::info!(market = %self.id, controller = %controller, shares = %shares, receiver = %receiver, "Canceled redemption claimed");
        Ok(shares)
    }

    /// Sync accounting against the venue and mint accrued fees.
    pub fn sync(&mut self) -> Result<SyncedAccountingState, MarketError> {
        let mut tx = self.begin()?;
        if let Err(err) = tx.sync_and_mint_fees() {
            return Err(self.abort("sync", err));
        }
        self.book = tx.book;
        Ok(self.state().clone())
    }

    /// Simulate a sync (including fee minting) without persisting anything.
    pub fn preview_sync(&self, tranche: TrancheKind) -> Result<SyncPreview, MarketError> {
        let mut tx = self.begin()?;
        tx.sync_and_mint_fees()?;
        Ok(SyncPreview {
            state: tx.book.accountant.state().clone(),
            claims: tx.book.accountant.claims(tranche)?,
            total_shares: tx.book.ledger(tranche).total_supply(),
        })
    }

    // ---------------------------------------------------------------------
    // Admin surface
    // ---------------------------------------------------------------------

    fn update_coverage(
        &mut self,
        op: &'static str,
        apply: impl FnOnce(&mut CoveragePolicy),
    ) -> Result<(), MarketError> {
        self.transact(op, |tx| {
            let mut policy = *tx.book.accountant.coverage();
            apply(&mut policy);
            tx.book.accountant.set_coverage_policy(policy)
        })
    }

    pub fn set_coverage_ratio(&mut self, coverage_ratio: Wad) -> Result<(), MarketError> {
        self.update_coverage("set_coverage_ratio", |p| p.coverage_ratio = coverage_ratio)
    }

    pub fn set_beta(&mut self, beta: Wad) -> Result<(), MarketError> {
        self.update_coverage("set_beta", |p| p.beta = beta)
    }

    pub fn set_ltv_ceiling(&mut self, ltv_ceiling: Wad) -> Result<(), MarketError> {
        self.update_coverage("set_ltv_ceiling", |p| p.ltv_ceiling = ltv_ceiling)
    }

    /// Applies to terms started after the change.
    pub fn set_fixed_term_duration(&mut self, secs: u64) -> Result<(), MarketError> {
        self.update_coverage("set_fixed_term_duration", |p| {
            p.fixed_term_duration_secs = secs
        })
    }

    pub fn set_dust_tolerance(&mut self, dust_tolerance: Nav) -> Result<(), MarketError> {
        self.transact("set_dust_tolerance", |tx| {
            tx.book.accountant.set_dust_tolerance(dust_tolerance);
            Ok(())
        })
    }

    /// Applies to requests made after the change; maturities never move earlier.
    pub fn set_redemption_delay(&mut self, delay_secs: u64) -> Result<(), MarketError> {
        let market = self.id;
        self.transact("set_redemption_delay", |tx| {
            tracing::info!(
                market = %market,
                from = tx.book.redemptions.delay_secs(),
                to = delay_secs,
                "Redemption delay updated"
            );
            tx.book.redemptions.set_delay(delay_secs);
            Ok(())
        })
    }

    pub fn set_fee_policy(&mut self, fees: FeePolicy) -> Result<(), MarketError> {
        self.transact("set_fee_policy", |tx| tx.book.accountant.set_fee_policy(fees))
    }

    // ---------------------------------------------------------------------
    // Queries (against the last synced state)
    // ---------------------------------------------------------------------

    pub fn state(&self) -> &SyncedAccountingState {
        self.book.accountant.state()
    }

    pub fn coverage_policy(&self) -> &CoveragePolicy {
        self.book.accountant.coverage()
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        self.book.accountant.fees()
    }

    pub fn redemption_delay_secs(&self) -> u64 {
        self.book.redemptions.delay_secs()
    }

    pub fn is_halted(&self) -> bool {
        self.book.accountant.halted().is_some()
    }

    pub fn curve_name(&self) -> &'static str {
        self.book.accountant.curve().name()
    }

    pub fn balance_of(&self, tranche: TrancheKind, holder: &Address) -> TrancheUnits {
        self.book.ledger(tranche).balance_of(holder)
    }

    pub fn cost_basis_of(&self, tranche: TrancheKind, holder: &Address) -> Nav {
        self.book.ledger(tranche).cost_basis_of(holder)
    }

    pub fn total_supply(&self, tranche: TrancheKind) -> TrancheUnits {
        self.book.ledger(tranche).total_supply()
    }

    /// Tranche effective NAV.
    pub fn total_assets(&self, tranche: TrancheKind) -> Nav {
        self.state().effective_nav(tranche)
    }

    pub fn total_liabilities(&self, tranche: TrancheKind) -> Nav {
        self.book
            .ledger(tranche)
            .total_liabilities(self.total_assets(tranche))
    }

    pub fn claims(&self, tranche: TrancheKind) -> Result<AssetClaims, MarketError> {
        Ok(self.book.accountant.claims(tranche)?)
    }

    pub fn convert_to_shares(
        &self,
        tranche: TrancheKind,
        assets: Nav,
    ) -> Result<TrancheUnits, MarketError> {
        self.book.to_units(tranche, assets, Rounding::Floor)
    }

    pub fn convert_to_assets(
        &self,
        tranche: TrancheKind,
        shares: TrancheUnits,
    ) -> Result<Nav, MarketError> {
        self.book.to_nav(tranche, shares, Rounding::Floor)
    }

    pub fn max_deposit(&self, tranche: TrancheKind) -> Result<Nav, MarketError> {
        if self.is_halted() {
            return Ok(Nav::ZERO);
        }
        self.book.max_deposit(self.venue.as_ref(), tranche)
    }

    /// Senior: shares `owner` can redeem now. Junior: claimable shares of
    /// the controller `owner` the market can currently pay out.
    pub fn max_redeem(
        &self,
        tranche: TrancheKind,
        owner: &Address,
    ) -> Result<TrancheUnits, MarketError> {
        if self.is_halted() {
            return Ok(TrancheUnits::ZERO);
        }
        let held = match tranche {
            TrancheKind::Senior => self.balance_of(tranche, owner),
            TrancheKind::Junior => self.claimable_redeem_request(owner),
        };
        let bound = self.book.max_exit_value(self.venue.as_ref(), tranche)?;
        let payable = self.book.to_units(tranche, bound, Rounding::Floor)?;
        Ok(held.min(payable))
    }

    pub fn redemption_request(&self, controller: &Address) -> Option<&RedemptionRequest> {
        self.book.redemptions.request(controller)
    }

    pub fn pending_redeem_request(&self, controller: &Address) -> TrancheUnits {
        self.book.redemptions.pending(controller, self.clock.now())
    }

    pub fn claimable_redeem_request(&self, controller: &Address) -> TrancheUnits {
        self.book.redemptions.claimable(controller, self.clock.now())
    }

    pub fn pending_cancel_redeem_request(&self, controller: &Address) -> bool {
        self.book.redemptions.pending_cancel(controller)
    }

    pub fn claimable_cancel_redeem_request(&self, controller: &Address) -> TrancheUnits {
        self.book.redemptions.claimable_cancel(controller)
    }

    pub fn reward_curve(&self) -> &RewardCurve {
        &self.reward_curve
    }

    pub fn reward_share(&self) -> Result<Wad, MarketError> {
        let ctx = self.book.accountant.curve_context(self.clock.now());
        Ok(self.reward_curve.reward_share(&ctx)?)
    }

    pub fn reward_for(&self, budget: Nav) -> Result<Nav, MarketError> {
        let ctx = self.book.accountant.curve_context(self.clock.now());
        Ok(self.reward_curve.reward_for(budget, &ctx)?)
    }

    /// Junior share of senior yield at the current curve position.
    pub fn quote_yield_share(&self) -> Result<Wad, MarketError> {
        let ctx = self.book.accountant.curve_context(self.clock.now());
        Ok(self.book.accountant.curve().quote(&ctx)?)
    }
}

fn reject_zero(what: &str, is_zero: bool) -> Result<(), MarketError> {
    if is_zero {
        return Err(MarketError::Validation(format!("{} amount must be positive", what)));
    }
    Ok(())
}

fn reject_junior(tranche: TrancheKind) -> Result<(), MarketError> {
    if tranche == TrancheKind::Junior {
        return Err(MarketError::Validation(
            "junior exits go through request_redeem and claim_redeem".to_string(),
        ));
    }
    Ok(())
}

fn reject_escrow(address: &Address) -> Result<(), MarketError> {
    if address.is_escrow() {
        return Err(MarketError::Validation(format!(
            "{} is a reserved escrow address",
            address
        )));
    }
    Ok(())
}
