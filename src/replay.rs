//! Deterministic replay of a CSV event log against an in-memory venue.
//!
//! Each row advances a [`ManualClock`] to the row's time and then applies one
//! action to the market. One JSON line per row records the outcome and the
//! resulting accounting state. A failing row is recorded and the replay
//! continues.

use crate::config::MarketConfig;
use crate::domain::{
    Address, Clock, ManualClock, MathError, Nav, SyncedAccountingState, Timestamp,
    TrancheKind, TrancheUnits,
};
use crate::error::MarketError;
use crate::orchestration::Market;
use crate::venue::MockVenue;
use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error(transparent)]
    Math(#[from] MathError),
    #[error("{action:?} needs a {field} column")]
    MissingField {
        action: ReplayAction,
        field: &'static str,
    },
    #[error("event time {time} is before the clock at {now}")]
    TimeReversal { time: u64, now: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayAction {
    Deposit,
    Redeem,
    Withdraw,
    Transfer,
    RequestRedeem,
    ClaimRedeem,
    CancelRedeem,
    ClaimCancel,
    /// Signed yield or loss on a venue position.
    Accrue,
    Sync,
}

/// One CSV row: `time,action,tranche,actor,counterparty,amount`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayEvent {
    pub time: u64,
    pub action: ReplayAction,
    pub tranche: Option<TrancheKind>,
    pub actor: Option<String>,
    pub counterparty: Option<String>,
    pub amount: Option<String>,
}

impl ReplayEvent {
    fn tranche(&self) -> Result<TrancheKind, ReplayError> {
        self.tranche.ok_or(ReplayError::MissingField {
            action: self.action,
            field: "tranche",
        })
    }

    fn actor(&self) -> Result<Address, ReplayError> {
        self.actor
            .as_deref()
            .map(Address::new)
            .ok_or(ReplayError::MissingField {
                action: self.action,
                field: "actor",
            })
    }

    /// Counterparty, defaulting to the actor.
    fn counterparty(&self) -> Result<Address, ReplayError> {
        match self.counterparty.as_deref() {
            Some(counterparty) => Ok(Address::new(counterparty)),
            None => self.actor(),
        }
    }

    fn amount<T>(&self) -> Result<T, ReplayError>
    where
        T: FromStr<Err = MathError>,
    {
        let raw = self.amount.as_deref().ok_or(ReplayError::MissingField {
            action: self.action,
            field: "amount",
        })?;
        Ok(raw.parse::<T>()?)
    }

    fn signed_amount(&self) -> Result<RustDecimal, ReplayError> {
        let raw = self.amount.as_deref().ok_or(ReplayError::MissingField {
            action: self.action,
            field: "amount",
        })?;
        RustDecimal::from_str(raw.trim())
            .map_err(|e| ReplayError::Math(MathError::Parse(e.to_string())))
    }
}

/// Outcome of one replayed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStep {
    pub step: usize,
    pub time: u64,
    pub action: ReplayAction,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: SyncedAccountingState,
    pub senior_supply: TrancheUnits,
    pub junior_supply: TrancheUnits,
}

#[derive(Debug)]
pub struct Replay {
    market: Market,
    venue: Arc<MockVenue>,
    clock: Arc<ManualClock>,
}

impl Replay {
    pub fn new(config: &MarketConfig) -> Result<Self, ReplayError> {
        let venue = Arc::new(MockVenue::new());
        let clock = Arc::new(ManualClock::new(Timestamp::new(0)));
        let market = config.build_market(venue.clone(), clock.clone())?;
        Ok(Self {
            market,
            venue,
            clock,
        })
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn venue(&self) -> &MockVenue {
        &self.venue
    }

    /// Replay every row of `input`, writing one JSON line per row to `output`.
    pub fn run<R: Read, W: Write>(
        &mut self,
        input: R,
        mut output: W,
    ) -> Result<Vec<ReplayStep>, ReplayError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(input);
        let mut steps = Vec::new();
        for (index, row) in reader.deserialize::<ReplayEvent>().enumerate() {
            let event = row?;
            let step = self.apply(index, &event);
            serde_json::to_writer(&mut output, &step)?;
            writeln!(output)?;
            steps.push(step);
        }
        output.flush()?;
        tracing::info!(
            market = %self.market.id(),
            steps = steps.len(),
            failed = steps.iter().filter(|s| !s.ok).count(),
            "Replay finished"
        );
        Ok(steps)
    }

    pub fn apply(&mut self, index: usize, event: &ReplayEvent) -> ReplayStep {
        let outcome = self.execute(event);
        if let Err(err) = &outcome {
            tracing::debug!(step = index, action = ?event.action, error = %err, "Replay step failed");
        }
        ReplayStep {
            step: index,
            time: event.time,
            action: event.action,
            ok: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            result: outcome.ok(),
            state: self.market.state().clone(),
            senior_supply: self.market.total_supply(TrancheKind::Senior),
            junior_supply: self.market.total_supply(TrancheKind::Junior),
        }
    }

    fn execute(&mut self, event: &ReplayEvent) -> Result<String, ReplayError> {
        let now = self.clock.now().as_secs();
        if event.time < now {
            return Err(ReplayError::TimeReversal {
                time: event.time,
                now,
            });
        }
        self.clock.set(Timestamp::new(event.time));

        let market = &mut self.market;
        Ok(match event.action {
            ReplayAction::Deposit => market
                .deposit(event.tranche()?, event.amount::<Nav>()?, &event.actor()?)?
                .to_string(),
            ReplayAction::Redeem => market
                .redeem(
                    event.tranche()?,
                    event.amount::<TrancheUnits>()?,
                    &event.counterparty()?,
                    &event.actor()?,
                )?
                .to_string(),
            ReplayAction::Withdraw => market
                .withdraw(
                    event.tranche()?,
                    event.amount::<Nav>()?,
                    &event.counterparty()?,
                    &event.actor()?,
                )?
                .to_string(),
            ReplayAction::Transfer => {
                let counterparty = event.counterparty.as_deref().map(Address::new).ok_or(
                    ReplayError::MissingField {
                        action: event.action,
                        field: "counterparty",
                    },
                )?;
                market
                    .transfer(
                        event.tranche()?,
                        &event.actor()?,
                        &counterparty,
                        event.amount::<TrancheUnits>()?,
                    )?
                    .to_string()
            }
            ReplayAction::RequestRedeem => {
                let actor = event.actor()?;
                let request =
                    market.request_redeem(event.amount::<TrancheUnits>()?, &actor, &actor)?;
                serde_json::to_string(&request)?
            }
            ReplayAction::ClaimRedeem => market
                .claim_redeem(
                    &event.actor()?,
                    event.amount::<TrancheUnits>()?,
                    &event.counterparty()?,
                )?
                .to_string(),
            ReplayAction::CancelRedeem => {
                market.cancel_redeem_request(&event.actor()?)?;
                "canceled".to_string()
            }
            ReplayAction::ClaimCancel => market
                .claim_cancel_redeem_request(&event.actor()?, &event.counterparty()?)?
                .to_string(),
            ReplayAction::Accrue => {
                let tranche = event.tranche()?;
                self.venue.accrue(tranche, event.signed_amount()?)?;
                self.venue.position(tranche).to_string()
            }
            ReplayAction::Sync => {
                let state = market.sync()?;
                format!("{:?}", state.market_state)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> MarketConfig {
        let mut env = HashMap::new();
        env.insert("FEE_RECIPIENT".to_string(), "treasury".to_string());
        env.insert("ST_PROTOCOL_FEE".to_string(), "0".to_string());
        env.insert("REDEMPTION_DELAY_SECS".to_string(), "100".to_string());
        MarketConfig::from_env_map(env).unwrap()
    }

    #[test]
    fn test_replay_records_failures_and_continues() {
        let csv = "\
time,action,tranche,actor,counterparty,amount
0,deposit,senior,alice,,100
1,deposit,junior,bob,,100
2,deposit,senior,alice,,300
3,accrue,senior,,,30
4,sync,,,,
";
        let mut replay = Replay::new(&config()).unwrap();
        let mut out = Vec::new();
        let steps = replay.run(csv.as_bytes(), &mut out).unwrap();

        assert_eq!(steps.len(), 5);
        assert!(!steps[0].ok, "senior deposit without junior must fail");
        assert!(steps[1].ok);
        assert!(steps[2].ok);
        assert_eq!(steps[2].result.as_deref(), Some("300"));
        assert_eq!(steps[3].result.as_deref(), Some("330"));
        assert!(steps[4].ok);
        assert_eq!(
            steps[4].state.total_claims().unwrap(),
            steps[4].state.total_raw_nav().unwrap()
        );

        let lines: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        assert_eq!(lines.len(), 5);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["ok"], false);
        assert!(first["error"].as_str().unwrap().contains("Validation"));
    }

    #[test]
    fn test_missing_column_is_a_step_error() {
        let csv = "time,action,tranche,actor,counterparty,amount\n0,deposit,,alice,,100\n";
        let mut replay = Replay::new(&config()).unwrap();
        let steps = replay.run(csv.as_bytes(), std::io::sink()).unwrap();
        assert_eq!(
            steps[0].error.as_deref(),
            Some("Deposit needs a tranche column")
        );
    }

    #[test]
    fn test_time_cannot_go_backwards() {
        let csv = "time,action,tranche,actor,counterparty,amount\n10,sync,,,,\n5,sync,,,,\n";
        let mut replay = Replay::new(&config()).unwrap();
        let steps = replay.run(csv.as_bytes(), std::io::sink()).unwrap();
        assert!(steps[0].ok);
        assert!(!steps[1].ok);
    }

    #[test]
    fn test_unknown_action_aborts_replay() {
        let csv = "time,action,tranche,actor,counterparty,amount\n0,explode,,,,\n";
        let mut replay = Replay::new(&config()).unwrap();
        let err = replay.run(csv.as_bytes(), std::io::sink()).unwrap_err();
        assert!(matches!(err, ReplayError::Csv(_)));
    }

    #[test]
    fn test_junior_yield_reprices_shares() {
        let csv = "\
time,action,tranche,actor,counterparty,amount
0,deposit,junior,bob,,100
1,accrue,junior,,,50
2,sync,,,,
";
        let mut replay = Replay::new(&config()).unwrap();
        replay.run(csv.as_bytes(), std::io::sink()).unwrap();
        let value = replay
            .market()
            .convert_to_assets(TrancheKind::Junior, TrancheUnits::new(10))
            .unwrap();
        assert_eq!(value, Nav::new(15));
    }
}
