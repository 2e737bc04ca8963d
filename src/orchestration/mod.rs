//! Market orchestration: wires the accounting engine, share ledgers,
//! redemption queue and venue behind one entry-point surface.

pub mod market;

pub use market::{Market, MarketParams};
