use nexus_orchestrator::{
    compute_estimate, progress_for, Amount, BridgeOperation, ChainId, NetworkConditions,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

const FRACTION_SCALE: u128 = 1_000_000_000_000_000_000;

fn amount_strategy() -> impl Strategy<Value = (u64, u64)> {
    // Up to 13 integer digits and 18 decimals.
    (0u64..10_000_000_000_000, 0u64..1_000_000_000_000_000_000)
}

fn render(int: u128, frac: u128) -> String {
    format!("{int}.{frac:018}")
}

proptest! {
    #[test]
    fn amount_sum_is_exact(parts in prop::collection::vec(amount_strategy(), 0..12)) {
        let int_sum: u128 = parts.iter().map(|(int, _)| u128::from(*int)).sum();
        let frac_sum: u128 = parts.iter().map(|(_, frac)| u128::from(*frac)).sum();
        let expected = Amount::parse(&render(
            int_sum + frac_sum / FRACTION_SCALE,
            frac_sum % FRACTION_SCALE,
        ))
        .unwrap();

        let total: Amount = parts
            .iter()
            .map(|(int, frac)| Amount::parse(&render(u128::from(*int), u128::from(*frac))).unwrap())
            .sum();
        prop_assert_eq!(total, expected);
    }

    #[test]
    fn progress_is_monotonic_and_bounded(expected in 1usize..20) {
        let mut last = 0;
        for completed in 0..=expected {
            let progress = progress_for(completed, expected);
            prop_assert!(progress >= last);
            prop_assert!(progress <= 100);
            prop_assert_eq!(progress == 100, completed == expected);
            last = progress;
        }
    }

    #[test]
    fn estimate_fee_and_received_amount_add_up(
        whole in 1u64..1_000_000,
        fee_bps in 0u32..500,
        liquidity in 1u64..1_000_000_000,
    ) {
        let op = BridgeOperation::new("USDC", &whole.to_string(), 137u64).unwrap();
        let conditions = NetworkConditions {
            gas_price: Decimal::new(2, 8),
            gas_limit: Decimal::from(150_000),
            bridge_fee_rate: Decimal::new(fee_bps as i64, 4),
            liquidity_depth: Decimal::from(liquidity),
            source_finality_secs: 12,
            settlement_secs: 30,
        };

        match compute_estimate(&op, ChainId::ETHEREUM, &conditions, Decimal::ONE) {
            Ok(estimate) => {
                prop_assert_eq!(
                    estimate.received_amount.clone() + estimate.bridge_fee.clone(),
                    op.amount.clone()
                );
                prop_assert!(estimate.slippage > Decimal::ZERO);
                prop_assert!(estimate.slippage < Decimal::ONE);
                prop_assert_eq!(estimate.estimated_time, Decimal::from(42));
            }
            Err(err) => prop_assert!(false, "unexpected error {err}"),
        }
    }
}
