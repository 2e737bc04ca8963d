//! Delayed, cancelable junior redemptions keyed by controller.
//!
//! ```text
//! NONE -request-> PENDING -(delay)-> CLAIMABLE -claim-> NONE
//! PENDING | CLAIMABLE -cancel-> CANCELED -claim_cancel-> NONE
//! ```
//!
//! The kernel only tracks request state. Share escrow and payouts are the
//! market's job.

use crate::domain::{mul_div, Address, MathError, Nav, Rounding, Timestamp, TrancheUnits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    #[error("no redemption request for {0}")]
    NoRequest(Address),
    #[error("redemption request for {0} is canceled")]
    Canceled(Address),
    #[error("redemption request for {0} is not canceled")]
    NotCanceled(Address),
    #[error("{requested} shares requested but only {claimable} claimable")]
    ExceedsClaimable {
        requested: TrancheUnits,
        claimable: TrancheUnits,
    },
    #[error(transparent)]
    Math(#[from] MathError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequest {
    pub total_shares_to_redeem: TrancheUnits,
    /// NAV of the requested shares when they were requested; caps the payout.
    pub redemption_value_at_request: Nav,
    pub redemption_allowed_at: Timestamp,
    pub is_canceled: bool,
}

/// Shares released by a claim and the locked-in value they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedemptionClaim {
    pub shares: TrancheUnits,
    pub locked_value: Nav,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedemptionDelayKernel {
    delay_secs: u64,
    requests: BTreeMap<Address, RedemptionRequest>,
}

impl RedemptionDelayKernel {
    pub fn new(delay_secs: u64) -> Self {
        Self {
            delay_secs,
            requests: BTreeMap::new(),
        }
    }

    pub fn delay_secs(&self) -> u64 {
        self.delay_secs
    }

    /// Applies to requests made from now on; existing maturities are kept.
    pub fn set_delay(&mut self, delay_secs: u64) {
        self.delay_secs = delay_secs;
    }

    pub fn request(&self, controller: &Address) -> Option<&RedemptionRequest> {
        self.requests.get(controller)
    }

    pub fn requests(&self) -> impl Iterator<Item = (&Address, &RedemptionRequest)> {
        self.requests.iter()
    }

    /// Add `shares` worth `value` to the controller's request.
    ///
    /// Maturity moves to `now + delay` on every call and never moves earlier.
    pub fn request_redeem(
        &mut self,
        controller: &Address,
        shares: TrancheUnits,
        value: Nav,
        now: Timestamp,
    ) -> Result<&RedemptionRequest, RedemptionError> {
        let maturity = now.saturating_add(self.delay_secs);
        let updated = match self.requests.get(controller) {
            Some(existing) if existing.is_canceled => {
                return Err(RedemptionError::Canceled(controller.clone()));
            }
            Some(existing) => RedemptionRequest {
                total_shares_to_redeem: existing.total_shares_to_redeem.checked_add(shares)?,
                redemption_value_at_request: existing
                    .redemption_value_at_request
                    .checked_add(value)?,
                redemption_allowed_at: existing.redemption_allowed_at.max(maturity),
                is_canceled: false,
            },
            None => RedemptionRequest {
                total_shares_to_redeem: shares,
                redemption_value_at_request: value,
                redemption_allowed_at: maturity,
                is_canceled: false,
            },
        };
        self.requests.insert(controller.clone(), updated);
        self.requests
            .get(controller)
            .ok_or_else(|| RedemptionError::NoRequest(controller.clone()))
    }

    /// Shares requested but not yet mature.
    pub fn pending(&self, controller: &Address, now: Timestamp) -> TrancheUnits {
        match self.requests.get(controller) {
            Some(r) if !r.is_canceled && now < r.redemption_allowed_at => r.total_shares_to_redeem,
            _ => TrancheUnits::ZERO,
        }
    }

    /// Shares whose delay has elapsed.
    pub fn claimable(&self, controller: &Address, now: Timestamp) -> TrancheUnits {
        match self.requests.get(controller) {
            Some(r) if !r.is_canceled && now >= r.redemption_allowed_at => r.total_shares_to_redeem,
            _ => TrancheUnits::ZERO,
        }
    }

    /// Release `shares` of a matured request with their pro-rata locked value.
    pub fn claim(
        &mut self,
        controller: &Address,
        shares: TrancheUnits,
        now: Timestamp,
    ) -> Result<RedemptionClaim, RedemptionError> {
        let request = self
            .requests
            .get(controller)
            .ok_or_else(|| RedemptionError::NoRequest(controller.clone()))?;
        if request.is_canceled {
            return Err(RedemptionError::Canceled(controller.clone()));
        }
        let claimable = self.claimable(controller, now);
        if shares.is_zero() || shares > claimable {
            return Err(RedemptionError::ExceedsClaimable {
                requested: shares,
                claimable,
            });
        }

        let locked_value = Nav::from_decimal(
            mul_div(
                request.redemption_value_at_request.inner(),
                shares.inner(),
                request.total_shares_to_redeem.inner(),
                0,
                Rounding::Floor,
            )?,
            Rounding::Floor,
        )?;
        let remaining_shares = request.total_shares_to_redeem.checked_sub(shares)?;
        let remaining_value = request
            .redemption_value_at_request
            .checked_sub(locked_value)?;

        if remaining_shares.is_zero() {
            self.requests.remove(controller);
        } else if let Some(request) = self.requests.get_mut(controller) {
            request.total_shares_to_redeem = remaining_shares;
            request.redemption_value_at_request = remaining_value;
        }
        Ok(RedemptionClaim {
            shares,
            locked_value,
        })
    }

    pub fn cancel(&mut self, controller: &Address) -> Result<TrancheUnits, RedemptionError> {
        let request = self
            .requests
            .get_mut(controller)
            .ok_or_else(|| RedemptionError::NoRequest(controller.clone()))?;
        if request.is_canceled {
            return Err(RedemptionError::Canceled(controller.clone()));
        }
        request.is_canceled = true;
        Ok(request.total_shares_to_redeem)
    }

    /// Cancellation is instantaneous, so nothing is ever pending.
    pub fn pending_cancel(&self, _controller: &Address) -> bool {
        false
    }

    pub fn claimable_cancel(&self, controller: &Address) -> TrancheUnits {
        match self.requests.get(controller) {
            Some(r) if r.is_canceled => r.total_shares_to_redeem,
            _ => TrancheUnits::ZERO,
        }
    }

    /// Close a canceled request, returning the shares to hand back.
    pub fn claim_cancel(&mut self, controller: &Address) -> Result<TrancheUnits, RedemptionError> {
        match self.requests.get(controller) {
            Some(r) if r.is_canceled => {}
            Some(_) => return Err(RedemptionError::NotCanceled(controller.clone())),
            None => return Err(RedemptionError::NoRequest(controller.clone())),
        }
        let request = self
            .requests
            .remove(controller)
            .ok_or_else(|| RedemptionError::NoRequest(controller.clone()))?;
        Ok(request.total_shares_to_redeem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::new("alice")
    }

    #[test]
    fn test_scenario_d_repeat_request_extends_maturity() {
        let mut kernel = RedemptionDelayKernel::new(1000);
        kernel
            .request_redeem(&alice(), TrancheUnits::new(100), Nav::new(100), Timestamp::new(0))
            .unwrap();
        let request = kernel
            .request_redeem(&alice(), TrancheUnits::new(50), Nav::new(50), Timestamp::new(500))
            .unwrap();
        assert_eq!(request.total_shares_to_redeem, TrancheUnits::new(150));
        assert_eq!(request.redemption_allowed_at, Timestamp::new(1500));
        assert_eq!(request.redemption_value_at_request, Nav::new(150));
    }

    #[test]
    fn test_maturity_never_shortens() {
        let mut kernel = RedemptionDelayKernel::new(1000);
        kernel
            .request_redeem(&alice(), TrancheUnits::new(10), Nav::new(10), Timestamp::new(0))
            .unwrap();
        kernel.set_delay(10);
        let request = kernel
            .request_redeem(&alice(), TrancheUnits::new(10), Nav::new(10), Timestamp::new(100))
            .unwrap();
        assert_eq!(request.redemption_allowed_at, Timestamp::new(1000));
    }

    #[test]
    fn test_pending_then_claimable() {
        let mut kernel = RedemptionDelayKernel::new(1000);
        kernel
            .request_redeem(&alice(), TrancheUnits::new(100), Nav::new(100), Timestamp::new(0))
            .unwrap();
        assert_eq!(kernel.pending(&alice(), Timestamp::new(999)), TrancheUnits::new(100));
        assert_eq!(kernel.claimable(&alice(), Timestamp::new(999)), TrancheUnits::ZERO);
        assert_eq!(kernel.pending(&alice(), Timestamp::new(1000)), TrancheUnits::ZERO);
        assert_eq!(kernel.claimable(&alice(), Timestamp::new(1000)), TrancheUnits::new(100));
    }

    #[test]
    fn test_claim_before_maturity_fails() {
        let mut kernel = RedemptionDelayKernel::new(1000);
        kernel
            .request_redeem(&alice(), TrancheUnits::new(100), Nav::new(100), Timestamp::new(0))
            .unwrap();
        let err = kernel
            .claim(&alice(), TrancheUnits::new(1), Timestamp::new(10))
            .unwrap_err();
        assert!(matches!(err, RedemptionError::ExceedsClaimable { .. }));
    }

    #[test]
    fn test_partial_claim_locks_pro_rata_value() {
        let mut kernel = RedemptionDelayKernel::new(10);
        kernel
            .request_redeem(&alice(), TrancheUnits::new(3), Nav::new(10), Timestamp::new(0))
            .unwrap();
        let claim = kernel
            .claim(&alice(), TrancheUnits::new(1), Timestamp::new(10))
            .unwrap();
        assert_eq!(claim.locked_value, Nav::new(3));
        let left = kernel.request(&alice()).unwrap();
        assert_eq!(left.total_shares_to_redeem, TrancheUnits::new(2));
        assert_eq!(left.redemption_value_at_request, Nav::new(7));

        let claim = kernel
            .claim(&alice(), TrancheUnits::new(2), Timestamp::new(10))
            .unwrap();
        assert_eq!(claim.locked_value, Nav::new(7));
        assert!(kernel.request(&alice()).is_none());
    }

    #[test]
    fn test_cancellation_exclusivity() {
        let mut kernel = RedemptionDelayKernel::new(100);
        let now = Timestamp::new(0);
        assert!(matches!(
            kernel.claim_cancel(&alice()),
            Err(RedemptionError::NoRequest(_))
        ));
        kernel
            .request_redeem(&alice(), TrancheUnits::new(40), Nav::new(40), now)
            .unwrap();
        assert!(matches!(
            kernel.claim_cancel(&alice()),
            Err(RedemptionError::NotCanceled(_))
        ));

        assert_eq!(kernel.cancel(&alice()).unwrap(), TrancheUnits::new(40));
        assert!(matches!(kernel.cancel(&alice()), Err(RedemptionError::Canceled(_))));
        assert!(matches!(
            kernel.request_redeem(&alice(), TrancheUnits::new(1), Nav::new(1), now),
            Err(RedemptionError::Canceled(_))
        ));
        assert_eq!(kernel.pending(&alice(), now), TrancheUnits::ZERO);
        assert_eq!(kernel.claimable_cancel(&alice()), TrancheUnits::new(40));
        assert!(!kernel.pending_cancel(&alice()));

        assert_eq!(kernel.claim_cancel(&alice()).unwrap(), TrancheUnits::new(40));
        assert!(kernel.request(&alice()).is_none());
        kernel
            .request_redeem(&alice(), TrancheUnits::new(1), Nav::new(1), now)
            .unwrap();
    }

    #[test]
    fn test_cancel_without_request_fails() {
        let mut kernel = RedemptionDelayKernel::new(100);
        assert!(matches!(kernel.cancel(&alice()), Err(RedemptionError::NoRequest(_))));
    }
}
