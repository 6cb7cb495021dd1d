/*
[INPUT]:  Target quantity, current net position, top-of-book, activity flags
[OUTPUT]: Per-symbol decision: skip, direct market order, or TWAP start
[POS]:    Decision layer - pure reconciliation planning (no submission)
[UPDATE]: When the decision matrix or tolerance policy changes
*/

use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::LazyLock;

use umfutures_adapter::{BookTop, Side};

/// Positions smaller than this are dust and treated as flat.
static DUST: LazyLock<Decimal> =
    LazyLock::new(|| Decimal::from_str("0.000000001").expect("valid dust threshold"));

/// Planner knobs, a narrow view over the gateway config.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub tolerance_threshold: Decimal,
    pub relative_tolerance: Decimal,
    pub twap_min_slice_size: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    WithinTolerance,
    NoMarketData,
    ActiveOrders,
    ActiveTwap,
}

/// What to do about one symbol this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    Market {
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
        reference_price: Decimal,
    },
    Twap {
        signed_delta: Decimal,
        price_hint: Decimal,
    },
}

/// Acceptance band for a target: the absolute floor or a relative fraction
/// of the target quantity, whichever is larger.
pub fn dynamic_tolerance(config: &PlannerConfig, target: Decimal) -> Decimal {
    config
        .tolerance_threshold
        .max(target.abs() * config.relative_tolerance)
}

/// Single-position-mode reconciliation for one symbol. Previous-cycle
/// activity (open orders, running TWAP) defers the symbol rather than
/// stacking adjustments.
pub fn plan_symbol(
    config: &PlannerConfig,
    target: Decimal,
    current: Decimal,
    book: Option<&BookTop>,
    has_active_orders: bool,
    has_active_twap: bool,
) -> Decision {
    let delta = target - current;
    if delta.abs() <= dynamic_tolerance(config, target) {
        return Decision::Skip(SkipReason::WithinTolerance);
    }

    let Some(top) = book else {
        return Decision::Skip(SkipReason::NoMarketData);
    };

    if has_active_orders {
        return Decision::Skip(SkipReason::ActiveOrders);
    }
    if has_active_twap {
        return Decision::Skip(SkipReason::ActiveTwap);
    }

    if delta.abs() > config.twap_min_slice_size {
        let price_hint = if delta > Decimal::ZERO {
            top.ask_price
        } else {
            top.bid_price
        };
        return Decision::Twap {
            signed_delta: delta,
            price_hint,
        };
    }

    direct_order(target, current, top)
}

fn direct_order(target: Decimal, current: Decimal, top: &BookTop) -> Decision {
    let current_flat = current.abs() < *DUST;
    let target_flat = target.abs() < *DUST;

    let (side, quantity, reduce_only) = if current_flat {
        // Opening from flat
        if target > Decimal::ZERO {
            (Side::Buy, target, false)
        } else {
            (Side::Sell, target.abs(), false)
        }
    } else if target_flat {
        // Reducing to zero
        if current > Decimal::ZERO {
            (Side::Sell, current, true)
        } else {
            (Side::Buy, current.abs(), true)
        }
    } else if current.is_sign_positive() != target.is_sign_positive() {
        // Direction reversal: flatten and reverse in one shot
        if target < Decimal::ZERO {
            (Side::Sell, current + target.abs(), false)
        } else {
            (Side::Buy, current.abs() + target, false)
        }
    } else if current > Decimal::ZERO {
        // Long on both sides, adjust magnitude
        if target > current {
            (Side::Buy, target - current, false)
        } else {
            (Side::Sell, current - target, true)
        }
    } else {
        // Short on both sides, adjust magnitude
        if target.abs() > current.abs() {
            (Side::Sell, target.abs() - current.abs(), false)
        } else {
            (Side::Buy, current.abs() - target.abs(), true)
        }
    };

    let reference_price = match side {
        Side::Buy => top.ask_price,
        Side::Sell => top.bid_price,
    };

    Decision::Market {
        side,
        quantity,
        reduce_only,
        reference_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn config() -> PlannerConfig {
        PlannerConfig {
            tolerance_threshold: dec("0.000001"),
            relative_tolerance: dec("0.05"),
            twap_min_slice_size: dec("100"),
        }
    }

    fn top() -> BookTop {
        BookTop {
            symbol: "BTCUSDT".to_string(),
            bid_price: dec("99"),
            ask_price: dec("101"),
            bid_qty: dec("10"),
            ask_qty: dec("10"),
        }
    }

    fn market(decision: Decision) -> (Side, Decimal, bool, Decimal) {
        match decision {
            Decision::Market {
                side,
                quantity,
                reduce_only,
                reference_price,
            } => (side, quantity, reduce_only, reference_price),
            other => panic!("expected market order, got {other:?}"),
        }
    }

    #[test]
    fn within_tolerance_skips() {
        let decision = plan_symbol(&config(), dec("2.5"), dec("2.5"), Some(&top()), false, false);
        assert_eq!(decision, Decision::Skip(SkipReason::WithinTolerance));
    }

    #[test]
    fn relative_tolerance_widens_the_band() {
        // |delta| = 4, band = max(1e-6, 100 * 0.05) = 5
        let decision = plan_symbol(&config(), dec("100"), dec("96"), Some(&top()), false, false);
        assert_eq!(decision, Decision::Skip(SkipReason::WithinTolerance));

        // |delta| = 6 exceeds the band
        let decision = plan_symbol(&config(), dec("100"), dec("94"), Some(&top()), false, false);
        assert!(matches!(decision, Decision::Market { .. }));
    }

    #[test]
    fn missing_book_skips_with_warning_reason() {
        let decision = plan_symbol(&config(), dec("10"), dec("0"), None, false, false);
        assert_eq!(decision, Decision::Skip(SkipReason::NoMarketData));
    }

    #[test]
    fn active_orders_defer_the_symbol() {
        let decision = plan_symbol(&config(), dec("10"), dec("0"), Some(&top()), true, false);
        assert_eq!(decision, Decision::Skip(SkipReason::ActiveOrders));

        let decision = plan_symbol(&config(), dec("10"), dec("0"), Some(&top()), false, true);
        assert_eq!(decision, Decision::Skip(SkipReason::ActiveTwap));
    }

    #[test]
    fn large_delta_goes_through_twap() {
        let decision = plan_symbol(&config(), dec("1000"), dec("0"), Some(&top()), false, false);
        match decision {
            Decision::Twap {
                signed_delta,
                price_hint,
            } => {
                assert_eq!(signed_delta, dec("1000"));
                assert_eq!(price_hint, dec("101"));
            }
            other => panic!("expected twap, got {other:?}"),
        }
    }

    #[rstest]
    // Opening from flat
    #[case("0", "10", Side::Buy, "10", false)]
    #[case("0", "-10", Side::Sell, "10", false)]
    // Same-sign long adjustments
    #[case("5", "8", Side::Buy, "3", false)]
    #[case("8", "5", Side::Sell, "3", true)]
    // Same-sign short adjustments
    #[case("-5", "-8", Side::Sell, "3", false)]
    #[case("-8", "-5", Side::Buy, "3", true)]
    // Direction reversals, single shot
    #[case("50", "-30", Side::Sell, "80", false)]
    #[case("-30", "50", Side::Buy, "80", false)]
    // Reducing to zero
    #[case("7", "0", Side::Sell, "7", true)]
    #[case("-7", "0", Side::Buy, "7", true)]
    fn decision_matrix(
        #[case] current: &str,
        #[case] target: &str,
        #[case] side: Side,
        #[case] quantity: &str,
        #[case] reduce_only: bool,
    ) {
        let decision = plan_symbol(
            &config(),
            dec(target),
            dec(current),
            Some(&top()),
            false,
            false,
        );
        let (got_side, got_qty, got_ro, got_price) = market(decision);
        assert_eq!(got_side, side);
        assert_eq!(got_qty, dec(quantity));
        assert_eq!(got_ro, reduce_only);
        let expected_price = match side {
            Side::Buy => dec("101"),
            Side::Sell => dec("99"),
        };
        assert_eq!(got_price, expected_price);
    }

    #[test]
    fn dust_position_is_treated_as_flat() {
        let decision = plan_symbol(
            &config(),
            dec("10"),
            dec("0.0000000001"),
            Some(&top()),
            false,
            false,
        );
        let (side, quantity, reduce_only, _) = market(decision);
        assert_eq!(side, Side::Buy);
        assert_eq!(quantity, dec("10"));
        assert!(!reduce_only);
    }
}
