//! Pure accounting computation: curves, waterfall, ledgers, redemption
//! queue and the synchronizer that ties them together.

pub mod accountant;
pub mod adaptive_curve;
pub mod ledger;
pub mod redemption;
pub mod reward_curve;
pub mod waterfall;
pub mod yield_curve;

pub use accountant::{loan_to_value, AccountingSynchronizer, CoveragePolicy, FeePolicy};
pub use adaptive_curve::{AdaptiveCurveParams, AdaptiveYieldCurve};
pub use ledger::{LedgerError, TrancheShareLedger};
pub use redemption::{RedemptionClaim, RedemptionDelayKernel, RedemptionError, RedemptionRequest};
pub use reward_curve::RewardCurve;
pub use waterfall::{LossWaterfall, WaterfallOutcome};
pub use yield_curve::{
    utilization, CurveContext, CurveError, StaticCurveParams, StaticYieldCurve, YieldCurve,
};
