//! Domain primitives: Timestamp, Address, MarketId, TrancheKind, MarketState.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time in whole seconds since Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn new(secs: u64) -> Self {
        Timestamp(secs)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp().max(0) as u64)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, secs: u64) -> Self {
        Timestamp(self.0.saturating_add(secs))
    }

    /// Seconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn seconds_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Holder / controller / receiver identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

const ESCROW_PREFIX: &str = "escrow:";

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Address(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ledger holder that keeps a controller's shares while a redemption is open.
    pub fn escrow_for(controller: &Address) -> Self {
        Address(format!("{}{}", ESCROW_PREFIX, controller.0))
    }

    pub fn is_escrow(&self) -> bool {
        self.0.starts_with(ESCROW_PREFIX)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable market identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketId(pub Uuid);

impl MarketId {
    pub fn generate() -> Self {
        MarketId(Uuid::new_v4())
    }
}

impl std::fmt::Display for MarketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Claim class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrancheKind {
    /// Protected tranche.
    Senior,
    /// First-loss tranche providing coverage.
    Junior,
}

impl TrancheKind {
    pub fn other(&self) -> TrancheKind {
        match self {
            TrancheKind::Senior => TrancheKind::Junior,
            TrancheKind::Junior => TrancheKind::Senior,
        }
    }
}

impl std::fmt::Display for TrancheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrancheKind::Senior => write!(f, "senior"),
            TrancheKind::Junior => write!(f, "junior"),
        }
    }
}

/// Solvency state of a market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketState {
    #[default]
    Perpetual,
    /// Entered when junior coverage cannot currently make senior whole.
    FixedTerm,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tranche_serialization() {
        let json = serde_json::to_string(&TrancheKind::Senior).unwrap();
        assert_eq!(json, "\"senior\"");
        let back: TrancheKind = serde_json::from_str("\"junior\"").unwrap();
        assert_eq!(back, TrancheKind::Junior);
    }

    #[test]
    fn test_market_state_serialization() {
        let json = serde_json::to_string(&MarketState::FixedTerm).unwrap();
        assert_eq!(json, "\"FIXED_TERM\"");
    }

    #[test]
    fn test_escrow_address() {
        let alice = Address::new("alice");
        let escrow = Address::escrow_for(&alice);
        assert_eq!(escrow.as_str(), "escrow:alice");
        assert!(escrow.is_escrow());
        assert!(!alice.is_escrow());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1000);
        assert_eq!(t.saturating_add(500), Timestamp::new(1500));
        assert_eq!(Timestamp::new(1500).seconds_since(t), 500);
        assert_eq!(t.seconds_since(Timestamp::new(1500)), 0);
    }
}
