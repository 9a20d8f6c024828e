//! Tarn Strategies - Built-in Strategy Implementations
//!
//! Strategies implement the callback contract from
//! [`tarn_core::strategy::Strategy`] and register constructors under class
//! names; strategy config files reference those names.
//!
//! ## Strategies
//! - `dual_ma`: double moving-average trend follower on bars
//! - `grid`: long-only mean-reversion ladder on ticks
//!
//! Decision logic is kept in pure methods on each strategy so the signal
//! paths are unit-testable without a wired control plane.

pub mod dual_ma;
pub mod grid;

pub use dual_ma::DualMa;
pub use grid::Grid;

use tarn_core::strategy::StrategyRegistry;

/// Register every built-in strategy class.
pub fn register_builtin(registry: &StrategyRegistry) {
    registry.register("dual_ma", DualMa::new);
    registry.register("grid", Grid::new);
}
