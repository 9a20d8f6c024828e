//! Order lifecycle management
//!
//! [`OrderManager`] owns every order record and is the only writer of
//! order state. Fills are derived from cumulative volume deltas, so broker
//! re-delivery is idempotent. See [`manager`] for the tracking loop and
//! reconnection reconciliation.

pub mod manager;
pub mod types;

pub use manager::{OrderListener, OrderManager, OrderManagerConfig, TradeListener};
pub use types::{Order, OrderFilter, OrderManagerStats, OrderRequest, Trade};
