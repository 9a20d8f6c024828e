//! Grid Strategy
//!
//! Mean-reversion ladder around an anchor price: buy one rung as price
//! falls through each level below the anchor, sell that rung back when it
//! recovers one step. Long-only.
//!
//! Parameters (strategy config `params`):
//! - `anchor`: grid center price; defaults to the first tick seen
//! - `step`: price distance between rungs (default 10)
//! - `rungs`: number of buy levels below the anchor (default 5)
//! - `volume`: lots per rung (default 1)

use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tarn_core::broker::MarketQuote;
use tarn_core::core::{Direction, Offset};
use tarn_core::strategy::{Strategy, StrategyContext};
use tracing::{debug, info};

/// What the grid wants to do at a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridAction {
    /// Buy the rung at this level index (1 = first below anchor)
    Buy(u32),
    /// Sell back the rung at this level index
    Sell(u32),
}

pub struct Grid {
    anchor: Option<Decimal>,
    step: Decimal,
    rungs: u32,
    volume: u64,
    /// Rung indexes currently held
    held: BTreeSet<u32>,
}

impl Grid {
    pub fn new(params: &serde_json::Value) -> anyhow::Result<Box<dyn Strategy>> {
        let anchor = params
            .get("anchor")
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64_retain);
        let step = params
            .get("step")
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64_retain)
            .unwrap_or(Decimal::TEN);
        let rungs = params.get("rungs").and_then(|v| v.as_u64()).unwrap_or(5) as u32;
        let volume = params.get("volume").and_then(|v| v.as_u64()).unwrap_or(1);
        if step <= Decimal::ZERO || rungs == 0 {
            anyhow::bail!("grid requires positive step and at least one rung");
        }
        Ok(Box::new(Self {
            anchor,
            step,
            rungs,
            volume,
            held: BTreeSet::new(),
        }))
    }

    /// Rung index the price sits at or below; 0 means above the first rung.
    fn level_at(&self, anchor: Decimal, price: Decimal) -> u32 {
        if price >= anchor {
            return 0;
        }
        use rust_decimal::prelude::ToPrimitive;
        let depth = (anchor - price) / self.step;
        let level = depth.trunc().to_u32().unwrap_or(u32::MAX);
        level.min(self.rungs)
    }

    /// Pure decision: one action per observation at most.
    fn decide(&mut self, price: Decimal) -> Option<GridAction> {
        let anchor = *self.anchor.get_or_insert(price);
        let level = self.level_at(anchor, price);

        // Deepest unheld rung at or above the current level buys first
        let buy_candidate = (1..=level).find(|rung| !self.held.contains(rung));
        if let Some(rung) = buy_candidate {
            self.held.insert(rung);
            return Some(GridAction::Buy(rung));
        }

        // A held rung whose recovery price has been reached sells back
        let sell_candidate = self
            .held
            .iter()
            .copied()
            .find(|rung| level < *rung);
        if let Some(rung) = sell_candidate {
            self.held.remove(&rung);
            return Some(GridAction::Sell(rung));
        }
        None
    }

    fn rung_price(&self, rung: u32) -> Option<Decimal> {
        Some(self.anchor? - self.step * Decimal::from(rung))
    }
}

impl Strategy for Grid {
    fn on_tick(&mut self, ctx: &StrategyContext, quote: &MarketQuote) -> anyhow::Result<()> {
        let Some(action) = self.decide(quote.last_price) else {
            return Ok(());
        };

        match action {
            GridAction::Buy(rung) => {
                let price = self.rung_price(rung).unwrap_or(quote.last_price);
                info!(
                    strategy_id = %ctx.strategy_id,
                    symbol = %quote.symbol,
                    rung,
                    %price,
                    "grid buy"
                );
                ctx.submit_limit(&quote.symbol, Direction::Buy, Offset::Open, price, self.volume)?;
            }
            GridAction::Sell(rung) => {
                debug!(strategy_id = %ctx.strategy_id, rung, "grid sell-back");
                ctx.submit_limit(
                    &quote.symbol,
                    Direction::Sell,
                    Offset::Close,
                    quote.last_price,
                    self.volume,
                )?;
            }
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        self.held.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn grid(anchor: Decimal, step: Decimal, rungs: u32) -> Grid {
        Grid {
            anchor: Some(anchor),
            step,
            rungs,
            volume: 1,
            held: BTreeSet::new(),
        }
    }

    #[test]
    fn test_no_action_at_or_above_anchor() {
        let mut g = grid(dec!(3500), dec!(10), 5);
        assert_eq!(g.decide(dec!(3500)), None);
        assert_eq!(g.decide(dec!(3600)), None);
    }

    #[test]
    fn test_buys_rungs_on_the_way_down() {
        let mut g = grid(dec!(3500), dec!(10), 5);
        assert_eq!(g.decide(dec!(3489)), Some(GridAction::Buy(1)));
        // Same level: nothing new to buy
        assert_eq!(g.decide(dec!(3488)), None);
        // Two levels down in one move buys the shallowest unheld rung first
        assert_eq!(g.decide(dec!(3465)), Some(GridAction::Buy(2)));
        assert_eq!(g.decide(dec!(3465)), Some(GridAction::Buy(3)));
        assert_eq!(g.decide(dec!(3465)), None);
    }

    #[test]
    fn test_sells_back_on_recovery() {
        let mut g = grid(dec!(3500), dec!(10), 5);
        g.decide(dec!(3489)); // buy rung 1
        assert_eq!(g.decide(dec!(3500)), Some(GridAction::Sell(1)));
        assert_eq!(g.decide(dec!(3500)), None);
    }

    #[test]
    fn test_depth_capped_at_rung_count() {
        let mut g = grid(dec!(3500), dec!(10), 2);
        assert_eq!(g.decide(dec!(3400)), Some(GridAction::Buy(1)));
        assert_eq!(g.decide(dec!(3400)), Some(GridAction::Buy(2)));
        // Only two rungs configured
        assert_eq!(g.decide(dec!(3400)), None);
    }

    #[test]
    fn test_anchor_defaults_to_first_price() {
        let mut g = Grid {
            anchor: None,
            step: dec!(10),
            rungs: 3,
            volume: 1,
            held: BTreeSet::new(),
        };
        assert_eq!(g.decide(dec!(3500)), None);
        assert_eq!(g.anchor, Some(dec!(3500)));
        assert_eq!(g.decide(dec!(3489)), Some(GridAction::Buy(1)));
    }

    #[test]
    fn test_params_validation() {
        assert!(Grid::new(&serde_json::json!({"step": -1.0})).is_err());
        assert!(Grid::new(&serde_json::json!({"rungs": 0})).is_err());
        assert!(Grid::new(&serde_json::json!({})).is_ok());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Over any price walk the ladder never holds more rungs than
            // configured, and buys/sells stay balanced within that bound.
            #[test]
            fn held_rungs_stay_bounded(prices in prop::collection::vec(3300u32..3700, 1..200)) {
                let mut g = grid(dec!(3500), dec!(10), 5);
                let mut bought = 0i64;
                let mut sold = 0i64;

                for price in prices {
                    match g.decide(Decimal::from(price)) {
                        Some(GridAction::Buy(rung)) => {
                            bought += 1;
                            prop_assert!(rung >= 1 && rung <= 5);
                        }
                        Some(GridAction::Sell(rung)) => {
                            sold += 1;
                            prop_assert!(rung >= 1 && rung <= 5);
                        }
                        None => {}
                    }
                    let held = g.held.len() as i64;
                    prop_assert!(held <= 5);
                    prop_assert_eq!(bought - sold, held);
                }
            }
        }
    }
}
