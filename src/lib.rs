pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod replay;
pub mod venue;

pub use config::{ConfigError, MarketConfig};
pub use domain::{
    Address, AssetClaims, Clock, ManualClock, MarketId, MarketState, MathError, Nav, Rounding,
    SyncPreview, SyncedAccountingState, SystemClock, Timestamp, TrancheKind, TrancheUnits, Wad,
};
pub use engine::{
    AdaptiveCurveParams, AdaptiveYieldCurve, CoveragePolicy, FeePolicy, RedemptionRequest,
    RewardCurve, StaticCurveParams, StaticYieldCurve, YieldCurve,
};
pub use error::MarketError;
pub use orchestration::{Market, MarketParams};
pub use replay::{Replay, ReplayError};
pub use venue::{InvestmentVenue, MockVenue, VenueError};
