//! Investment venue abstraction: the external yield source behind both tranches.

use crate::domain::{Address, Nav, TrancheKind};
use std::fmt;
use thiserror::Error;

pub mod mock;

pub use mock::MockVenue;

/// Capability interface over the yield-bearing venue.
///
/// The venue keeps one position per tranche. All calls are synchronous and
/// fallible; a failed read aborts the sync that issued it.
pub trait InvestmentVenue: Send + Sync + fmt::Debug {
    /// Current value of the tranche's position.
    fn raw_nav(&self, tranche: TrancheKind) -> Result<Nav, VenueError>;

    /// Move `assets` into the tranche's position.
    fn deposit(&self, tranche: TrancheKind, assets: Nav) -> Result<(), VenueError>;

    /// Pay `assets` out of the tranche's position to `receiver`.
    fn withdraw(
        &self,
        tranche: TrancheKind,
        assets: Nav,
        receiver: &Address,
    ) -> Result<(), VenueError>;

    /// Largest deposit the venue accepts right now.
    fn max_deposit(&self, tranche: TrancheKind) -> Result<Nav, VenueError>;

    /// Largest withdrawal the venue can serve right now.
    fn max_withdraw(&self, tranche: TrancheKind) -> Result<Nav, VenueError>;
}

/// Error type for venue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    /// Venue could not be reached or refused to answer.
    #[error("venue unavailable: {0}")]
    Unavailable(String),
    /// Venue rejected a deposit or withdrawal.
    #[error("venue rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },
    /// Not enough liquidity to serve a withdrawal.
    #[error("insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: Nav, available: Nav },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_error_display() {
        let err = VenueError::Unavailable("connection timeout".to_string());
        assert_eq!(err.to_string(), "venue unavailable: connection timeout");

        let err = VenueError::Rejected {
            operation: "deposit".to_string(),
            reason: "paused".to_string(),
        };
        assert_eq!(err.to_string(), "venue rejected deposit: paused");

        let err = VenueError::InsufficientLiquidity {
            requested: Nav::new(10),
            available: Nav::new(3),
        };
        assert_eq!(
            err.to_string(),
            "insufficient liquidity: requested 10, available 3"
        );
    }
}
