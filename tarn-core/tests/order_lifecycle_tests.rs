//! End-to-end order lifecycle against the full stack
//!
//! Covers the happy-path limit buy, partial fill followed by a cancel, and
//! the lifecycle invariants (fills never exceed volume, terminal states
//! never transition, cancel-before-fill round-trips).

use rust_decimal_macros::dec;
use std::time::Duration;
use tarn_core::core::{Direction, Offset, OrderStatus, PositionSide};
use tarn_core::order::OrderRequest;
use tarn_core::testing::{wait_until, TradingHarness};

#[test]
fn test_happy_path_limit_buy() {
    let h = TradingHarness::new();
    h.start();

    let order = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(3500),
            2,
            "s1",
        ))
        .expect("risk passes and broker accepts");

    assert_eq!(order.status, OrderStatus::Submitted);
    let broker_id = order.order_id.clone().expect("broker id assigned");

    h.broker.report_fill(&broker_id, 2, dec!(3500));

    wait_until("order filled", Duration::from_secs(2), || {
        h.orders
            .get_order(order.client_order_id)
            .is_some_and(|o| o.status == OrderStatus::Filled)
    });

    let filled = h.orders.get_order(order.client_order_id).unwrap();
    assert_eq!(filled.filled_volume, 2);

    wait_until("position opened", Duration::from_secs(2), || {
        h.positions.get_position("rb2405", PositionSide::Long).is_some()
    });
    let position = h.positions.get_position("rb2405", PositionSide::Long).unwrap();
    assert_eq!(position.volume, 2);
    assert_eq!(position.avg_cost, dec!(3500));

    h.stop();
}

#[test]
fn test_partial_fill_then_cancel() {
    let h = TradingHarness::new();
    h.start();

    let order = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Sell,
            Offset::Open,
            dec!(3600),
            5,
            "s1",
        ))
        .unwrap();
    let broker_id = order.order_id.clone().unwrap();

    h.broker.report_fill(&broker_id, 3, dec!(3600));
    wait_until("partial fill", Duration::from_secs(2), || {
        h.orders
            .get_order(order.client_order_id)
            .is_some_and(|o| o.status == OrderStatus::PartialFilled)
    });

    h.orders.cancel_order(order.client_order_id).unwrap();
    wait_until("cancel confirmed", Duration::from_secs(2), || {
        h.orders
            .get_order(order.client_order_id)
            .is_some_and(|o| o.status == OrderStatus::Cancelled)
    });

    let cancelled = h.orders.get_order(order.client_order_id).unwrap();
    assert_eq!(cancelled.filled_volume, 3);

    wait_until("short position built", Duration::from_secs(2), || {
        h.positions
            .get_position("rb2405", PositionSide::Short)
            .is_some_and(|p| p.volume == 3)
    });
    let position = h.positions.get_position("rb2405", PositionSide::Short).unwrap();
    assert_eq!(position.avg_cost, dec!(3600));

    h.stop();
}

#[test]
fn test_cancel_before_fill_round_trip() {
    let h = TradingHarness::new();

    let order = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(3500),
            1,
            "s1",
        ))
        .unwrap();
    h.orders.cancel_order(order.client_order_id).unwrap();

    let final_order = h.orders.get_order(order.client_order_id).unwrap();
    assert_eq!(final_order.status, OrderStatus::Cancelled);
    assert_eq!(final_order.filled_volume, 0);
}

#[test]
fn test_filled_volume_never_exceeds_volume() {
    let h = TradingHarness::new();

    let order = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(3500),
            3,
            "s1",
        ))
        .unwrap();
    let broker_id = order.order_id.clone().unwrap();

    // The sim broker clamps; even hostile reports cannot overfill
    h.broker.report_fill(&broker_id, 100, dec!(3500));

    let tracked = h.orders.get_order(order.client_order_id).unwrap();
    assert!(tracked.filled_volume <= tracked.volume);
    assert_eq!(tracked.status, OrderStatus::Filled);
}

#[test]
fn test_terminal_state_never_transitions() {
    let h = TradingHarness::new();

    let order = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(3500),
            1,
            "s1",
        ))
        .unwrap();
    let broker_id = order.order_id.clone().unwrap();
    h.broker.report_fill(&broker_id, 1, dec!(3500));
    assert_eq!(
        h.orders.get_order(order.client_order_id).unwrap().status,
        OrderStatus::Filled
    );

    // A stray late status report must not move a terminal order
    h.broker.report_status(&broker_id, OrderStatus::Cancelled);
    assert_eq!(
        h.orders.get_order(order.client_order_id).unwrap().status,
        OrderStatus::Filled
    );
}

#[test]
fn test_zero_volume_rejected_without_broker_call() {
    let h = TradingHarness::new();
    let before = h.broker.order_count();
    let result = h.orders.create_order(OrderRequest::limit(
        "rb2405",
        Direction::Buy,
        Offset::Open,
        dec!(3500),
        0,
        "s1",
    ));
    assert!(result.is_err());
    assert_eq!(h.broker.order_count(), before);
}
