//! Domain types for the tranche engine.
//!
//! This module provides:
//! - Fixed-point value domains (`Nav`, `TrancheUnits`, `Wad`) with explicit rounding
//! - Domain primitives: Timestamp, Address, MarketId, TrancheKind, MarketState
//! - The synchronized accounting snapshot and claim views
//! - Clock abstraction

pub mod clock;
pub mod primitives;
pub mod state;
pub mod units;

pub use clock::{Clock, ManualClock, SystemClock};
pub use primitives::{Address, MarketId, MarketState, Timestamp, TrancheKind};
pub use state::{AssetClaims, SyncPreview, SyncedAccountingState};
pub use units::{
    convert_to_nav, convert_to_units, mul_div, MathError, Nav, Rounding, TrancheUnits, Wad,
    WAD_DECIMALS,
};
