use crate::domain::MathError;
use crate::engine::{LedgerError, RedemptionError};
use crate::venue::VenueError;
use thiserror::Error;

/// Errors surfaced by market entry points.
///
/// Only `Validation` and `StateConflict` can be fixed by resubmitting with
/// corrected input. `InvariantViolation` halts the market for good.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Venue error: {0}")]
    Venue(#[from] VenueError),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Arithmetic error: {0}")]
    Math(#[from] MathError),
}

impl MarketError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::Validation(_) | MarketError::StateConflict(_)
        )
    }

    pub(crate) fn exceeds(
        what: &str,
        requested: impl std::fmt::Display,
        bound: impl std::fmt::Display,
    ) -> Self {
        MarketError::Validation(format!("{} {} exceeds bound {}", what, requested, bound))
    }
}

impl From<LedgerError> for MarketError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Math(e) => MarketError::Math(e),
            other => MarketError::Validation(other.to_string()),
        }
    }
}

impl From<RedemptionError> for MarketError {
    fn from(err: RedemptionError) -> Self {
        match err {
            RedemptionError::Math(e) => MarketError::Math(e),
            RedemptionError::ExceedsClaimable { .. } => MarketError::Validation(err.to_string()),
            other => MarketError::StateConflict(other.to_string()),
        }
    }
}
