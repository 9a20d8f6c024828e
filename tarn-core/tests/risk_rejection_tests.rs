//! Pre-trade risk rejection through the full order path

use rust_decimal_macros::dec;
use tarn_core::core::{Direction, Offset, OrderError};
use tarn_core::order::OrderRequest;
use tarn_core::risk::{
    RiskAction, RiskLevel, RuleKindSpec, RuleMeta, RuleSpec, ThresholdMetric,
};
use tarn_core::testing::TradingHarness;

fn max_order_value_rule(threshold: f64) -> RuleSpec {
    RuleSpec {
        meta: RuleMeta::new(
            "max_order_value",
            "maximum order value",
            RiskLevel::High,
            RiskAction::Reject,
        ),
        kind: RuleKindSpec::FixedThreshold {
            metric: ThresholdMetric::OrderValue,
            threshold,
        },
    }
}

#[test]
fn test_risk_rejection_blocks_submission() {
    let h = TradingHarness::new();
    h.risk.add_rule(max_order_value_rule(100_000.0));

    // 3500 x 50 = 175,000 > 100,000
    let err = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(3500),
            50,
            "s1",
        ))
        .unwrap_err();

    match err {
        OrderError::RiskRejected { rule_id, .. } => assert_eq!(rule_id, "max_order_value"),
        other => panic!("expected risk rejection, got {other}"),
    }

    // No broker call was made and the trigger counter moved
    assert_eq!(h.broker.order_count(), 0);
    assert_eq!(
        h.risk.get_rule("max_order_value").unwrap().meta.trigger_count,
        1
    );
    assert_eq!(h.risk.rejection_counts()["max_order_value"], 1);
}

#[test]
fn test_order_below_threshold_passes() {
    let h = TradingHarness::new();
    h.risk.add_rule(max_order_value_rule(100_000.0));

    // 3500 x 2 = 7,000 passes
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
        .unwrap();
    assert!(order.order_id.is_some());
    assert_eq!(h.broker.order_count(), 1);
}

#[test]
fn test_critical_rule_halts_all_subsequent_orders() {
    let h = TradingHarness::new();
    let mut rule = max_order_value_rule(100.0);
    rule.meta.level = RiskLevel::Critical;
    rule.meta.rule_id = "critical_value".into();
    h.risk.add_rule(rule);

    let _ = h.orders.create_order(OrderRequest::limit(
        "rb2405",
        Direction::Buy,
        Offset::Open,
        dec!(3500),
        50,
        "s1",
    ));
    assert!(h.risk.is_emergency());

    // Even a tiny order is rejected while the latch holds
    let err = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(1),
            1,
            "s1",
        ))
        .unwrap_err();
    assert!(matches!(err, OrderError::RiskRejected { rule_id, .. } if rule_id == "emergency"));

    h.risk.reset();
    assert!(h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(1),
            1,
            "s1",
        ))
        .is_ok());
}

#[test]
fn test_insufficient_margin_rejected_locally() {
    let h = TradingHarness::new();
    h.broker.set_account(tarn_core::broker::AccountInfo {
        balance: dec!(1000),
        available: dec!(100),
        ..tarn_core::broker::AccountInfo::empty("sim-account")
    });
    h.account.refresh();

    // Margin at the 10% default rate: 3500 x 10 x 0.1 = 3,500 > 100
    let err = h
        .orders
        .create_order(OrderRequest::limit(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            dec!(3500),
            10,
            "s1",
        ))
        .unwrap_err();
    assert!(matches!(err, OrderError::AccountRejected { .. }));
    assert_eq!(h.broker.order_count(), 0);
}
