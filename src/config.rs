use crate::domain::{Address, Clock, Nav, Wad};
use crate::engine::{
    AdaptiveCurveParams, AdaptiveYieldCurve, CoveragePolicy, FeePolicy, RewardCurve,
    StaticCurveParams, StaticYieldCurve, YieldCurve,
};
use crate::error::MarketError;
use crate::orchestration::{Market, MarketParams};
use crate::venue::InvestmentVenue;
use rust_decimal::Decimal as RustDecimal;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub coverage: CoveragePolicy,
    pub fees: FeePolicy,
    pub dust_tolerance: Nav,
    pub redemption_delay_secs: u64,
    pub yield_curve: Box<dyn YieldCurve>,
    pub reward_curve: RewardCurve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldCurveKind {
    Static,
    Adaptive,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl MarketConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let recipient = env_map
            .get("FEE_RECIPIENT")
            .filter(|s| !s.trim().is_empty())
            .map(|s| Address::new(s.trim()))
            .ok_or_else(|| ConfigError::MissingEnv("FEE_RECIPIENT".to_string()))?;
        if recipient.is_escrow() {
            return Err(ConfigError::InvalidValue(
                "FEE_RECIPIENT".to_string(),
                "must not be an escrow address".to_string(),
            ));
        }

        let coverage_ratio: Wad = parse_or(&env_map, "COVERAGE_RATIO", "0.2")?;
        ensure(
            "COVERAGE_RATIO",
            !coverage_ratio.is_zero() && coverage_ratio <= Wad::ONE,
            "must be in (0, 1]",
        )?;
        let beta: Wad = parse_or(&env_map, "BETA", "0")?;
        ensure("BETA", beta <= Wad::ONE, "must be in [0, 1]")?;
        let ltv_ceiling: Wad = parse_or(&env_map, "LTV_CEILING", "10")?;
        ensure("LTV_CEILING", !ltv_ceiling.is_zero(), "must be positive")?;
        let fixed_term_duration_secs: u64 =
            parse_or(&env_map, "FIXED_TERM_DURATION_SECS", "604800")?;

        let dust_tolerance: Nav = parse_or(&env_map, "DUST_TOLERANCE", "1")?;
        let redemption_delay_secs: u64 = parse_or(&env_map, "REDEMPTION_DELAY_SECS", "86400")?;

        let st_protocol_fee: Wad = parse_or(&env_map, "ST_PROTOCOL_FEE", "0.1")?;
        ensure("ST_PROTOCOL_FEE", st_protocol_fee <= Wad::ONE, "must be in [0, 1]")?;
        let jt_protocol_fee: Wad = parse_or(&env_map, "JT_PROTOCOL_FEE", "0")?;
        ensure("JT_PROTOCOL_FEE", jt_protocol_fee <= Wad::ONE, "must be in [0, 1]")?;

        let yield_curve = build_yield_curve(&env_map)?;

        let reward_curve = parse_reward_curve(
            env_map
                .get("REWARD_CURVE")
                .map(|s| s.as_str())
                .unwrap_or("0:0,0.9:0.5,1:1"),
        )?;

        Ok(MarketConfig {
            coverage: CoveragePolicy {
                coverage_ratio,
                beta,
                ltv_ceiling,
                fixed_term_duration_secs,
            },
            fees: FeePolicy {
                st_protocol_fee,
                jt_protocol_fee,
                recipient,
            },
            dust_tolerance,
            redemption_delay_secs,
            yield_curve,
            reward_curve,
        })
    }

    pub fn market_params(&self) -> MarketParams {
        MarketParams {
            coverage: self.coverage,
            fees: self.fees.clone(),
            dust_tolerance: self.dust_tolerance,
            redemption_delay_secs: self.redemption_delay_secs,
        }
    }

    pub fn build_market(
        &self,
        venue: Arc<dyn InvestmentVenue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Market, MarketError> {
        Market::new(
            self.market_params(),
            self.yield_curve.clone(),
            self.reward_curve.clone(),
            venue,
            clock,
        )
    }
}

fn parse_or<T>(env_map: &HashMap<String, String>, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = env_map.get(key).map(|s| s.as_str()).unwrap_or(default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

fn ensure(key: &str, ok: bool, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(key.to_string(), reason.to_string()))
    }
}

fn build_yield_curve(
    env_map: &HashMap<String, String>,
) -> Result<Box<dyn YieldCurve>, ConfigError> {
    let kind = match env_map
        .get("YIELD_CURVE")
        .map(|s| s.as_str())
        .unwrap_or("static")
    {
        "static" => YieldCurveKind::Static,
        "adaptive" => YieldCurveKind::Adaptive,
        other => {
            return Err(ConfigError::InvalidValue(
                "YIELD_CURVE".to_string(),
                format!("must be static or adaptive, got {}", other),
            ))
        }
    };

    let target_utilization: Wad = parse_or(env_map, "CURVE_TARGET_UTILIZATION", "0.9")?;
    let target_share: Wad = parse_or(env_map, "CURVE_TARGET_SHARE", "0.225")?;
    let invalid = |e: crate::engine::CurveError| {
        ConfigError::InvalidValue("YIELD_CURVE".to_string(), e.to_string())
    };

    Ok(match kind {
        YieldCurveKind::Static => {
            let params = StaticCurveParams {
                zero_util_share: parse_or(env_map, "CURVE_ZERO_SHARE", "0")?,
                target_utilization,
                target_share,
                full_util_share: parse_or(env_map, "CURVE_FULL_SHARE", "1")?,
            };
            Box::new(StaticYieldCurve::new(params).map_err(invalid)?)
        }
        YieldCurveKind::Adaptive => {
            let params = AdaptiveCurveParams {
                target_utilization,
                initial_share_at_target: target_share,
                min_share_at_target: parse_or(env_map, "CURVE_MIN_TARGET_SHARE", "0.01")?,
                steepness: parse_or::<RustDecimal>(env_map, "CURVE_STEEPNESS", "4")?,
                adjustment_speed: parse_or::<RustDecimal>(
                    env_map,
                    "CURVE_ADJUSTMENT_SPEED",
                    "0.0000015",
                )?,
            };
            Box::new(AdaptiveYieldCurve::new(params).map_err(invalid)?)
        }
    })
}

/// Parse `u:r` breakpoints separated by commas, e.g. `0:0,0.9:0.5,1:1`.
pub fn parse_reward_curve(raw: &str) -> Result<RewardCurve, ConfigError> {
    let invalid =
        |reason: String| ConfigError::InvalidValue("REWARD_CURVE".to_string(), reason);
    let points = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (u, r) = pair
                .split_once(':')
                .ok_or_else(|| invalid(format!("expected u:r, got {}", pair)))?;
            let u = u.trim().parse::<Wad>().map_err(|e| invalid(e.to_string()))?;
            let r = r.trim().parse::<Wad>().map_err(|e| invalid(e.to_string()))?;
            Ok((u, r))
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;
    RewardCurve::new(points).map_err(|e| invalid(e.to_string()))
}
