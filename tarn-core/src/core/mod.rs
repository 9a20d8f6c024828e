//! Core types shared across the control plane
//!
//! Identifiers, order/position enums and the domain error types. Everything
//! here is dependency-free with respect to the managers so it can be used
//! from any subsystem without cycles.

pub mod errors;
pub mod types;

pub use errors::{BrokerError, ConfigError, InvariantError, OrderError};
pub use types::{
    ClientOrderId, Direction, Offset, OrderStatus, OrderType, PositionSide, TraceId,
};
