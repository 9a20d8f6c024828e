//! Position aggregation and portfolio risk limits
//!
//! [`PositionManager`] owns the live position book, derived purely from
//! executed fills, and enforces portfolio-level limits (leverage,
//! concentration, position value, VaR, per-symbol size) on a periodic
//! sweep.

pub mod manager;
pub mod types;

pub use manager::{
    BreachListener, PositionListener, PositionManager, PositionManagerConfig,
};
pub use types::{
    BreachKind, ClosedPosition, FillRecord, PortfolioStats, Position, PositionKey, PricePoint,
    RiskBreach, RiskLimits,
};
