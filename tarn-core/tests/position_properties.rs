//! Property tests for position accounting
//!
//! Over arbitrary interleavings of opening and closing fills:
//! - volume equals opens minus matched closes
//! - volume never goes negative (closes clamp)
//! - realized P&L accumulates only on closes

use proptest::prelude::*;
use rust_decimal::Decimal;
use tarn_core::core::{Direction, Offset, PositionSide};
use tarn_core::testing::{make_trade, TradingHarness};

#[derive(Debug, Clone)]
enum FillOp {
    Open { price: u32, volume: u64 },
    Close { price: u32, volume: u64 },
}

fn fill_op() -> impl Strategy<Value = FillOp> {
    prop_oneof![
        (3000u32..4000, 1u64..10).prop_map(|(price, volume)| FillOp::Open { price, volume }),
        (3000u32..4000, 1u64..10).prop_map(|(price, volume)| FillOp::Close { price, volume }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn position_volume_matches_fill_ledger(ops in prop::collection::vec(fill_op(), 1..40)) {
        let h = TradingHarness::new();
        let mut expected: u64 = 0;

        for op in &ops {
            match op {
                FillOp::Open { price, volume } => {
                    h.positions.apply_fill(&make_trade(
                        "rb2405",
                        Direction::Buy,
                        Offset::Open,
                        Decimal::from(*price),
                        *volume,
                        "s1",
                    ));
                    expected += volume;
                }
                FillOp::Close { price, volume } => {
                    h.positions.apply_fill(&make_trade(
                        "rb2405",
                        Direction::Sell,
                        Offset::Close,
                        Decimal::from(*price),
                        *volume,
                        "s1",
                    ));
                    // Closes clamp to held volume
                    expected = expected.saturating_sub(*volume);
                }
            }

            match h.positions.get_position("rb2405", PositionSide::Long) {
                Some(position) => {
                    prop_assert_eq!(position.volume, expected);
                    prop_assert!(position.volume > 0);
                }
                None => prop_assert_eq!(expected, 0),
            }
        }
    }

    #[test]
    fn realized_pnl_only_moves_on_closes(
        open_price in 3000u32..4000,
        close_price in 3000u32..4000,
        volume in 1u64..20,
    ) {
        let h = TradingHarness::new();

        h.positions.apply_fill(&make_trade(
            "rb2405",
            Direction::Buy,
            Offset::Open,
            Decimal::from(open_price),
            volume,
            "s1",
        ));
        let after_open = h
            .positions
            .get_position("rb2405", PositionSide::Long)
            .unwrap();
        prop_assert_eq!(after_open.realized_pnl, Decimal::ZERO);

        h.positions.apply_fill(&make_trade(
            "rb2405",
            Direction::Sell,
            Offset::Close,
            Decimal::from(close_price),
            volume,
            "s1",
        ));

        // Fully closed: archived with the expected realized P&L
        prop_assert!(h.positions.get_position("rb2405", PositionSide::Long).is_none());
        let archived = h.positions.get_archived();
        prop_assert_eq!(archived.len(), 1);
        let expected = (Decimal::from(close_price) - Decimal::from(open_price))
            * Decimal::from(volume);
        prop_assert_eq!(archived[0].realized_pnl, expected);
    }
}
