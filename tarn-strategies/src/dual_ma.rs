//! Dual Moving Average Strategy
//!
//! Classic trend follower on bar closes:
//!
//! ```text
//!   fast SMA crosses above slow SMA  →  close short, open long
//!   fast SMA crosses below slow SMA  →  close long,  open short
//! ```
//!
//! Parameters (strategy config `params`):
//! - `fast`: fast window length (default 5)
//! - `slow`: slow window length (default 20)
//! - `volume`: lots per entry (default 1)

use rust_decimal::Decimal;
use std::collections::VecDeque;
use tarn_core::core::{Direction, Offset, PositionSide};
use tarn_core::strategy::{Bar, Strategy, StrategyContext};
use tracing::info;

/// Which way the fast average just crossed the slow one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cross {
    /// Fast rose above slow
    Golden,
    /// Fast fell below slow
    Death,
}

pub struct DualMa {
    fast: usize,
    slow: usize,
    volume: u64,
    closes: VecDeque<Decimal>,
    /// Sign of (fast SMA - slow SMA) at the previous bar
    prev_above: Option<bool>,
}

impl DualMa {
    pub fn new(params: &serde_json::Value) -> anyhow::Result<Box<dyn Strategy>> {
        let fast = params.get("fast").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let slow = params.get("slow").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let volume = params.get("volume").and_then(|v| v.as_u64()).unwrap_or(1);
        if fast == 0 || slow == 0 || fast >= slow {
            anyhow::bail!("dual_ma requires 0 < fast < slow, got {}/{}", fast, slow);
        }
        Ok(Box::new(Self {
            fast,
            slow,
            volume,
            closes: VecDeque::new(),
            prev_above: None,
        }))
    }

    fn sma(&self, window: usize) -> Option<Decimal> {
        if self.closes.len() < window {
            return None;
        }
        let sum: Decimal = self.closes.iter().rev().take(window).copied().sum();
        Some(sum / Decimal::from(window as u64))
    }

    /// Feed one close; detect a crossover once both windows are warm.
    fn observe(&mut self, close: Decimal) -> Option<Cross> {
        self.closes.push_back(close);
        while self.closes.len() > self.slow {
            self.closes.pop_front();
        }

        let fast = self.sma(self.fast)?;
        let slow = self.sma(self.slow)?;
        let above = fast > slow;

        let cross = match self.prev_above {
            Some(prev) if !prev && above => Some(Cross::Golden),
            Some(prev) if prev && !above => Some(Cross::Death),
            _ => None,
        };
        self.prev_above = Some(above);
        cross
    }
}

impl Strategy for DualMa {
    fn on_bar(&mut self, ctx: &StrategyContext, bar: &Bar) -> anyhow::Result<()> {
        let Some(cross) = self.observe(bar.close) else {
            return Ok(());
        };
        info!(
            strategy_id = %ctx.strategy_id,
            symbol = %bar.symbol,
            ?cross,
            close = %bar.close,
            "moving-average crossover"
        );

        let (close_side, entry_direction) = match cross {
            Cross::Golden => (PositionSide::Short, Direction::Buy),
            Cross::Death => (PositionSide::Long, Direction::Sell),
        };

        // Flatten the opposing book first, then enter
        if let Some(position) = ctx.positions.get_position(&bar.symbol, close_side) {
            if position.volume > 0 {
                ctx.submit_limit(
                    &bar.symbol,
                    entry_direction,
                    Offset::Close,
                    bar.close,
                    position.volume,
                )?;
            }
        }
        ctx.submit_limit(
            &bar.symbol,
            entry_direction,
            Offset::Open,
            bar.close,
            self.volume,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn dual_ma(fast: usize, slow: usize) -> DualMa {
        DualMa {
            fast,
            slow,
            volume: 1,
            closes: VecDeque::new(),
            prev_above: None,
        }
    }

    #[test]
    fn test_no_signal_while_warming_up() {
        let mut s = dual_ma(2, 4);
        assert_eq!(s.observe(dec!(100)), None);
        assert_eq!(s.observe(dec!(101)), None);
        assert_eq!(s.observe(dec!(102)), None);
    }

    #[test]
    fn test_golden_cross_after_downtrend() {
        let mut s = dual_ma(2, 4);
        // Downtrend: fast below slow
        for price in [100, 98, 96, 94, 92] {
            s.observe(Decimal::from(price));
        }
        assert_eq!(s.prev_above, Some(false));
        // Sharp rally flips fast above slow
        s.observe(dec!(100));
        let cross = s.observe(dec!(108));
        assert_eq!(cross, Some(Cross::Golden));
    }

    #[test]
    fn test_death_cross_after_uptrend() {
        let mut s = dual_ma(2, 4);
        for price in [92, 94, 96, 98, 100] {
            s.observe(Decimal::from(price));
        }
        assert_eq!(s.prev_above, Some(true));
        s.observe(dec!(92));
        let cross = s.observe(dec!(84));
        assert_eq!(cross, Some(Cross::Death));
    }

    #[test]
    fn test_no_repeat_signal_without_recross() {
        let mut s = dual_ma(2, 4);
        for price in [100, 98, 96, 94, 92] {
            s.observe(Decimal::from(price));
        }
        s.observe(dec!(100));
        assert!(s.observe(dec!(108)).is_some());
        // Continuing the trend produces no further signal
        assert_eq!(s.observe(dec!(110)), None);
        assert_eq!(s.observe(dec!(112)), None);
    }

    #[test]
    fn test_params_validation() {
        assert!(DualMa::new(&serde_json::json!({"fast": 10, "slow": 5})).is_err());
        assert!(DualMa::new(&serde_json::json!({"fast": 0})).is_err());
        assert!(DualMa::new(&serde_json::json!({})).is_ok());
    }
}
