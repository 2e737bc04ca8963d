//! In-memory venue for tests and replays.

use super::{InvestmentVenue, VenueError};
use crate::domain::{Address, MathError, Nav, Rounding, TrancheKind};
use rust_decimal::Decimal as RustDecimal;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockVenueState {
    senior: Nav,
    junior: Nav,
    deposit_caps: BTreeMap<TrancheKind, Nav>,
    withdraw_caps: BTreeMap<TrancheKind, Nav>,
    fail_reads: bool,
    fail_writes: bool,
    payouts: BTreeMap<Address, Nav>,
}

impl MockVenueState {
    fn position_mut(&mut self, tranche: TrancheKind) -> &mut Nav {
        match tranche {
            TrancheKind::Senior => &mut self.senior,
            TrancheKind::Junior => &mut self.junior,
        }
    }

    fn position(&self, tranche: TrancheKind) -> Nav {
        match tranche {
            TrancheKind::Senior => self.senior,
            TrancheKind::Junior => self.junior,
        }
    }
}

/// Venue holding two positions in memory, with yield/loss and failure injection.
#[derive(Debug, Default)]
pub struct MockVenue {
    inner: Mutex<MockVenueState>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap deposits into a position.
    pub fn with_deposit_cap(self, tranche: TrancheKind, cap: Nav) -> Self {
        self.lock().deposit_caps.insert(tranche, cap);
        self
    }

    /// Cap withdrawals from a position.
    pub fn with_withdraw_cap(self, tranche: TrancheKind, cap: Nav) -> Self {
        self.lock().withdraw_caps.insert(tranche, cap);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockVenueState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a signed yield (positive) or loss (negative) to a position.
    ///
    /// Losses larger than the position wipe it out.
    pub fn accrue(&self, tranche: TrancheKind, delta: RustDecimal) -> Result<(), MathError> {
        let mut state = self.lock();
        let position = state.position_mut(tranche);
        let change = Nav::from_decimal(delta.abs(), Rounding::Floor)?;
        *position = if delta.is_sign_negative() {
            position.saturating_sub(change)
        } else {
            position.checked_add(change)?
        };
        Ok(())
    }

    pub fn set_raw_nav(&self, tranche: TrancheKind, nav: Nav) {
        *self.lock().position_mut(tranche) = nav;
    }

    pub fn position(&self, tranche: TrancheKind) -> Nav {
        self.lock().position(tranche)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Total paid out to `receiver` so far.
    pub fn paid_to(&self, receiver: &Address) -> Nav {
        self.lock()
            .payouts
            .get(receiver)
            .copied()
            .unwrap_or(Nav::ZERO)
    }
}

impl InvestmentVenue for MockVenue {
    fn raw_nav(&self, tranche: TrancheKind) -> Result<Nav, VenueError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(VenueError::Unavailable("mock read failure".to_string()));
        }
        Ok(state.position(tranche))
    }

    fn deposit(&self, tranche: TrancheKind, assets: Nav) -> Result<(), VenueError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(VenueError::Rejected {
                operation: "deposit".to_string(),
                reason: "mock write failure".to_string(),
            });
        }
        let position = state.position_mut(tranche);
        *position = position
            .checked_add(assets)
            .map_err(|e| VenueError::Rejected {
                operation: "deposit".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn withdraw(
        &self,
        tranche: TrancheKind,
        assets: Nav,
        receiver: &Address,
    ) -> Result<(), VenueError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(VenueError::Rejected {
                operation: "withdraw".to_string(),
                reason: "mock write failure".to_string(),
            });
        }
        let available = state.position(tranche);
        let remaining = available
            .checked_sub(assets)
            .map_err(|_| VenueError::InsufficientLiquidity {
                requested: assets,
                available,
            })?;
        *state.position_mut(tranche) = remaining;
        let paid = state.payouts.entry(receiver.clone()).or_default();
        *paid = paid.checked_add(assets).map_err(|e| VenueError::Rejected {
            operation: "withdraw".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn max_deposit(&self, tranche: TrancheKind) -> Result<Nav, VenueError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(VenueError::Unavailable("mock read failure".to_string()));
        }
        Ok(state
            .deposit_caps
            .get(&tranche)
            .copied()
            .unwrap_or(Nav::new(u64::MAX)))
    }

    fn max_withdraw(&self, tranche: TrancheKind) -> Result<Nav, VenueError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(VenueError::Unavailable("mock read failure".to_string()));
        }
        let position = state.position(tranche);
        Ok(state
            .withdraw_caps
            .get(&tranche)
            .map(|cap| (*cap).min(position))
            .unwrap_or(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mock_venue_deposit_and_accrue() {
        let venue = MockVenue::new();
        venue.deposit(TrancheKind::Senior, Nav::new(1000)).unwrap();
        venue.accrue(TrancheKind::Senior, dec!(25)).unwrap();
        assert_eq!(venue.raw_nav(TrancheKind::Senior).unwrap(), Nav::new(1025));
        venue.accrue(TrancheKind::Senior, dec!(-2000)).unwrap();
        assert_eq!(venue.raw_nav(TrancheKind::Senior).unwrap(), Nav::ZERO);
    }

    #[test]
    fn test_mock_venue_withdraw_tracks_payouts() {
        let venue = MockVenue::new();
        let bob = Address::new("bob");
        venue.deposit(TrancheKind::Junior, Nav::new(300)).unwrap();
        venue.withdraw(TrancheKind::Junior, Nav::new(120), &bob).unwrap();
        assert_eq!(venue.paid_to(&bob), Nav::new(120));
        assert_eq!(venue.position(TrancheKind::Junior), Nav::new(180));

        let err = venue
            .withdraw(TrancheKind::Junior, Nav::new(500), &bob)
            .unwrap_err();
        assert!(matches!(err, VenueError::InsufficientLiquidity { .. }));
    }

    #[test]
    fn test_mock_venue_failure_injection() {
        let venue = MockVenue::new();
        venue.set_fail_reads(true);
        assert!(venue.raw_nav(TrancheKind::Senior).is_err());
        venue.set_fail_reads(false);
        venue.set_fail_writes(true);
        assert!(venue.deposit(TrancheKind::Senior, Nav::new(1)).is_err());
    }

    #[test]
    fn test_mock_venue_caps() {
        let venue = MockVenue::new()
            .with_deposit_cap(TrancheKind::Senior, Nav::new(50))
            .with_withdraw_cap(TrancheKind::Junior, Nav::new(10));
        venue.deposit(TrancheKind::Junior, Nav::new(100)).unwrap();
        assert_eq!(venue.max_deposit(TrancheKind::Senior).unwrap(), Nav::new(50));
        assert_eq!(venue.max_withdraw(TrancheKind::Junior).unwrap(), Nav::new(10));
        assert_eq!(venue.max_withdraw(TrancheKind::Senior).unwrap(), Nav::ZERO);
    }
}
