//! Per-tranche share balances and cost basis.
//!
//! Cost basis is the NAV a holder paid in. Redemptions and transfers move
//! basis proportionally to shares, rounded down against the pool:
//! `floor(basis * shares / balance)`.

use crate::domain::{mul_div, Address, MathError, Nav, Rounding, TrancheUnits};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("{holder} holds {available} shares, cannot move {requested}")]
    InsufficientBalance {
        holder: Address,
        requested: TrancheUnits,
        available: TrancheUnits,
    },
    #[error(transparent)]
    Math(#[from] MathError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrancheShareLedger {
    total_supply: TrancheUnits,
    balances: BTreeMap<Address, TrancheUnits>,
    cost_basis: BTreeMap<Address, Nav>,
    total_cost_basis: Nav,
}

impl TrancheShareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_supply(&self) -> TrancheUnits {
        self.total_supply
    }

    pub fn total_cost_basis(&self) -> Nav {
        self.total_cost_basis
    }

    pub fn balance_of(&self, holder: &Address) -> TrancheUnits {
        self.balances.get(holder).copied().unwrap_or_default()
    }

    pub fn cost_basis_of(&self, holder: &Address) -> Nav {
        self.cost_basis.get(holder).copied().unwrap_or_default()
    }

    /// Holders with a non-zero balance, in address order.
    pub fn holders(&self) -> impl Iterator<Item = (&Address, TrancheUnits)> {
        self.balances.iter().map(|(holder, shares)| (holder, *shares))
    }

    /// Conservative valuation of redeemable claims: `max(total_cost_basis, total_assets)`.
    pub fn total_liabilities(&self, total_assets: Nav) -> Nav {
        self.total_cost_basis.max(total_assets)
    }

    /// Issue `shares` to `holder` who paid `basis`.
    pub fn mint(
        &mut self,
        holder: &Address,
        shares: TrancheUnits,
        basis: Nav,
    ) -> Result<(), LedgerError> {
        let total_supply = self.total_supply.checked_add(shares)?;
        let total_cost_basis = self.total_cost_basis.checked_add(basis)?;
        let balance = self.balance_of(holder).checked_add(shares)?;
        let holder_basis = self.cost_basis_of(holder).checked_add(basis)?;

        self.total_supply = total_supply;
        self.total_cost_basis = total_cost_basis;
        self.set_position(holder, balance, holder_basis);
        Ok(())
    }

    /// Burn `shares` from `holder`, returning the cost basis removed.
    pub fn burn(&mut self, holder: &Address, shares: TrancheUnits) -> Result<Nav, LedgerError> {
        let (balance, basis_removed) = self.basis_for(holder, shares)?;
        let total_supply = self.total_supply.checked_sub(shares)?;
        let total_cost_basis = self.total_cost_basis.checked_sub(basis_removed)?;
        let holder_basis = self.cost_basis_of(holder).checked_sub(basis_removed)?;

        self.total_supply = total_supply;
        self.total_cost_basis = total_cost_basis;
        self.set_position(holder, balance.checked_sub(shares)?, holder_basis);
        Ok(basis_removed)
    }

    /// Move `shares` and their proportional basis from `from` to `to`.
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        shares: TrancheUnits,
    ) -> Result<Nav, LedgerError> {
        let (balance, basis_moved) = self.basis_for(from, shares)?;
        if from == to {
            return Ok(basis_moved);
        }
        let from_basis = self.cost_basis_of(from).checked_sub(basis_moved)?;
        let to_balance = self.balance_of(to).checked_add(shares)?;
        let to_basis = self.cost_basis_of(to).checked_add(basis_moved)?;

        self.set_position(from, balance.checked_sub(shares)?, from_basis);
        self.set_position(to, to_balance, to_basis);
        Ok(basis_moved)
    }

    /// Sender's pre-move balance and the basis attached to `shares` of it.
    fn basis_for(
        &self,
        holder: &Address,
        shares: TrancheUnits,
    ) -> Result<(TrancheUnits, Nav), LedgerError> {
        let balance = self.balance_of(holder);
        if shares > balance {
            return Err(LedgerError::InsufficientBalance {
                holder: holder.clone(),
                requested: shares,
                available: balance,
            });
        }
        if shares.is_zero() {
            return Ok((balance, Nav::ZERO));
        }
        let basis = self.cost_basis_of(holder);
        let moved = mul_div(basis.inner(), shares.inner(), balance.inner(), 0, Rounding::Floor)?;
        let moved = Nav::from_decimal(moved, Rounding::Floor)?;
        Ok((balance, moved))
    }

    fn set_position(&mut self, holder: &Address, balance: TrancheUnits, basis: Nav) {
        if balance.is_zero() {
            self.balances.remove(holder);
        } else {
            self.balances.insert(holder.clone(), balance);
        }
        if basis.is_zero() {
            self.cost_basis.remove(holder);
        } else {
            self.cost_basis.insert(holder.clone(), basis);
        }
    }

    /// Σ per-holder basis. Equals `total_cost_basis` unless the ledger is corrupt.
    pub fn summed_cost_basis(&self) -> Result<Nav, MathError> {
        self.cost_basis
            .values()
            .try_fold(Nav::ZERO, |acc, basis| acc.checked_add(*basis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s)
    }

    #[test]
    fn test_mint_tracks_basis() {
        let mut ledger = TrancheShareLedger::new();
        ledger.mint(&addr("alice"), TrancheUnits::new(100), Nav::new(100)).unwrap();
        ledger.mint(&addr("bob"), TrancheUnits::new(50), Nav::new(60)).unwrap();
        assert_eq!(ledger.total_supply(), TrancheUnits::new(150));
        assert_eq!(ledger.total_cost_basis(), Nav::new(160));
        assert_eq!(ledger.cost_basis_of(&addr("bob")), Nav::new(60));
        assert_eq!(ledger.summed_cost_basis().unwrap(), ledger.total_cost_basis());
    }

    #[test]
    fn test_burn_removes_floor_basis() {
        let mut ledger = TrancheShareLedger::new();
        ledger.mint(&addr("alice"), TrancheUnits::new(3), Nav::new(10)).unwrap();
        let removed = ledger.burn(&addr("alice"), TrancheUnits::new(1)).unwrap();
        assert_eq!(removed, Nav::new(3));
        assert_eq!(ledger.cost_basis_of(&addr("alice")), Nav::new(7));
        assert_eq!(ledger.total_cost_basis(), Nav::new(7));

        let removed = ledger.burn(&addr("alice"), TrancheUnits::new(2)).unwrap();
        assert_eq!(removed, Nav::new(7));
        assert_eq!(ledger.total_supply(), TrancheUnits::ZERO);
        assert_eq!(ledger.total_cost_basis(), Nav::ZERO);
    }

    #[test]
    fn test_burn_rejects_excess() {
        let mut ledger = TrancheShareLedger::new();
        ledger.mint(&addr("alice"), TrancheUnits::new(10), Nav::new(10)).unwrap();
        let err = ledger.burn(&addr("alice"), TrancheUnits::new(11)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance_of(&addr("alice")), TrancheUnits::new(10));
    }

    #[test]
    fn test_transfer_moves_proportional_basis() {
        let mut ledger = TrancheShareLedger::new();
        ledger.mint(&addr("alice"), TrancheUnits::new(3), Nav::new(10)).unwrap();
        let moved = ledger
            .transfer(&addr("alice"), &addr("bob"), TrancheUnits::new(2))
            .unwrap();
        assert_eq!(moved, Nav::new(6));
        assert_eq!(ledger.cost_basis_of(&addr("alice")), Nav::new(4));
        assert_eq!(ledger.cost_basis_of(&addr("bob")), Nav::new(6));
        assert_eq!(ledger.total_supply(), TrancheUnits::new(3));
        assert_eq!(ledger.summed_cost_basis().unwrap(), ledger.total_cost_basis());
    }

    #[test]
    fn test_self_transfer_is_noop() {
        let mut ledger = TrancheShareLedger::new();
        ledger.mint(&addr("alice"), TrancheUnits::new(5), Nav::new(5)).unwrap();
        ledger
            .transfer(&addr("alice"), &addr("alice"), TrancheUnits::new(5))
            .unwrap();
        assert_eq!(ledger.balance_of(&addr("alice")), TrancheUnits::new(5));
        assert_eq!(ledger.cost_basis_of(&addr("alice")), Nav::new(5));
    }

    #[test]
    fn test_total_liabilities_is_conservative() {
        let mut ledger = TrancheShareLedger::new();
        ledger.mint(&addr("alice"), TrancheUnits::new(100), Nav::new(100)).unwrap();
        assert_eq!(ledger.total_liabilities(Nav::new(80)), Nav::new(100));
        assert_eq!(ledger.total_liabilities(Nav::new(120)), Nav::new(120));
    }
}
