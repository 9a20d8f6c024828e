//! Position records and portfolio risk types
//!
//! Positions are keyed by (symbol, side); a pair holds at most one live
//! position. Volume only grows on opening fills and only shrinks on closing
//! fills; at zero the position is archived with its final metrics.

use crate::core::{Offset, PositionSide};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Key of the live-position book.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
        }
    }
}

/// One constituent fill of a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub price: Decimal,
    pub volume: u64,
    pub offset: Offset,
    pub executed_at: DateTime<Utc>,
}

/// A mark-to-market sample kept when the move exceeds the noise threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

/// A live position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Lots held; strictly positive while live
    pub volume: u64,
    /// Volume-weighted average entry price
    pub avg_cost: Decimal,
    pub last_price: Decimal,
    pub float_pnl: Decimal,
    /// Accumulates on closing fills only
    pub realized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Strategy that opened the position, when attributable
    pub strategy_id: Option<String>,
    pub fills: Vec<FillRecord>,
    /// Bounded mark-to-market history ring
    pub price_history: VecDeque<PricePoint>,
}

impl Position {
    pub fn open(
        symbol: impl Into<String>,
        side: PositionSide,
        strategy_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.into(),
            side,
            volume: 0,
            avg_cost: Decimal::ZERO,
            last_price: Decimal::ZERO,
            float_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            opened_at: now,
            updated_at: now,
            strategy_id,
            fills: Vec::new(),
            price_history: VecDeque::new(),
        }
    }

    /// Market value at the last mark price.
    pub fn market_value(&self) -> Decimal {
        self.last_price * Decimal::from(self.volume)
    }

    /// Floating P&L for a given mark price, by side.
    pub fn unrealized_at(&self, price: Decimal) -> Decimal {
        let volume = Decimal::from(self.volume);
        match self.side {
            PositionSide::Long => (price - self.avg_cost) * volume,
            PositionSide::Short => (self.avg_cost - price) * volume,
        }
    }
}

/// An archived (fully closed) position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub realized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub strategy_id: Option<String>,
    pub fills: Vec<FillRecord>,
}

/// Portfolio-level risk limits, re-evaluated continuously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Absolute exposure / account balance
    pub max_leverage: f64,
    /// Largest single position value / total value, 0..=1
    pub max_concentration: f64,
    /// Ceiling on any single position's market value
    pub max_position_value: Decimal,
    /// Ceiling on the parametric VaR estimate
    pub max_var: Decimal,
    /// Per-symbol volume ceilings
    #[serde(default)]
    pub per_symbol_volume: HashMap<String, u64>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_leverage: 5.0,
            max_concentration: 0.5,
            max_position_value: Decimal::from(10_000_000u64),
            max_var: Decimal::from(1_000_000u64),
            per_symbol_volume: HashMap::new(),
        }
    }
}

impl RiskLimits {
    /// Named-limit setter backing `set_risk_limit`. Returns false for an
    /// unknown name.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            "max_leverage" => self.max_leverage = value,
            "max_concentration" => self.max_concentration = value,
            "max_position_value" => {
                self.max_position_value =
                    Decimal::from_f64_retain(value).unwrap_or(self.max_position_value)
            }
            "max_var" => {
                self.max_var = Decimal::from_f64_retain(value).unwrap_or(self.max_var)
            }
            _ => return false,
        }
        true
    }
}

/// Class of a recorded limit violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    Leverage,
    Concentration,
    PositionValue,
    Var,
    SymbolSize,
}

/// One recorded limit violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBreach {
    pub kind: BreachKind,
    pub detail: String,
    pub value: f64,
    pub limit: f64,
    pub at: DateTime<Utc>,
}

/// Portfolio aggregates computed by the risk-limit sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioStats {
    pub total_long_value: Decimal,
    pub total_short_value: Decimal,
    pub net_exposure: Decimal,
    pub abs_exposure: Decimal,
    pub max_single_value: Decimal,
    /// max single value / total value, 0 when flat
    pub concentration: f64,
    /// abs exposure / account balance, 0 when balance unknown
    pub leverage: f64,
    /// 1.65 x volatility x |net exposure|
    pub var_estimate: Decimal,
    pub live_positions: usize,
}

impl PortfolioStats {
    pub fn concentration_of(max_single: Decimal, total: Decimal) -> f64 {
        if total.is_zero() {
            0.0
        } else {
            (max_single / total).to_f64().unwrap_or(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_unrealized_by_side() {
        let mut long = Position::open("rb2405", PositionSide::Long, None);
        long.volume = 2;
        long.avg_cost = dec!(3500);
        assert_eq!(long.unrealized_at(dec!(3510)), dec!(20));

        let mut short = Position::open("rb2405", PositionSide::Short, None);
        short.volume = 2;
        short.avg_cost = dec!(3500);
        assert_eq!(short.unrealized_at(dec!(3510)), dec!(-20));
    }

    #[test]
    fn test_limit_setter_by_name() {
        let mut limits = RiskLimits::default();
        assert!(limits.set("max_leverage", 2.5));
        assert_eq!(limits.max_leverage, 2.5);
        assert!(limits.set("max_var", 50_000.0));
        assert_eq!(limits.max_var, dec!(50000));
        assert!(!limits.set("no_such_limit", 1.0));
    }

    #[test]
    fn test_concentration_zero_when_flat() {
        assert_eq!(
            PortfolioStats::concentration_of(Decimal::ZERO, Decimal::ZERO),
            0.0
        );
        assert_eq!(
            PortfolioStats::concentration_of(dec!(50), dec!(100)),
            0.5
        );
    }
}
