//! Collateralization function shared by the ledger model and the coordinator's limit check

use ethers::types::U256;
use serde::Serialize;

const BPS_DENOMINATOR: u64 = 10_000;

/// Maximum borrow allowed against an amount of collateral.
///
/// `max_borrow(c) = c * price * ltv_bps / (10^price_decimals * 10_000)`, where `price` is the
/// value of one collateral token in borrow tokens scaled by `10^price_decimals`. Both tokens
/// use the same number of decimals, so base units carry through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollateralPolicy {
    pub price: U256,
    pub price_decimals: u32,
    pub ltv_bps: u32,
}

impl CollateralPolicy {
    pub fn new(price: U256, price_decimals: u32, ltv_bps: u32) -> Self {
        Self {
            price,
            price_decimals,
            ltv_bps,
        }
    }

    /// Largest amount a position with `collateral` may draw; rounds down
    pub fn max_borrow(&self, collateral: U256) -> U256 {
        let scale = U256::exp10(self.price_decimals as usize) * U256::from(BPS_DENOMINATOR);
        collateral
            .saturating_mul(self.price)
            .saturating_mul(U256::from(self.ltv_bps))
            / scale
    }
}

impl Default for CollateralPolicy {
    /// 2000 borrow tokens per collateral token, 8-decimal price, 70% LTV
    fn default() -> Self {
        Self::new(U256::from(200_000_000_000u64), 8, 7_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::utils::parse_units;

    #[test]
    fn test_max_borrow_for_scenario_deposit() {
        let policy = CollateralPolicy::default();
        let deposit: U256 = parse_units("0.0001", 18).unwrap().into();
        // 0.0001 * 2000 * 0.7 = 0.14
        let expected: U256 = parse_units("0.14", 18).unwrap().into();
        assert_eq!(policy.max_borrow(deposit), expected);
    }

    #[test]
    fn test_zero_collateral_allows_nothing() {
        assert_eq!(CollateralPolicy::default().max_borrow(U256::zero()), U256::zero());
    }

    #[test]
    fn test_rounds_down() {
        let policy = CollateralPolicy::new(U256::from(1u64), 0, 5_000);
        assert_eq!(policy.max_borrow(U256::from(3u64)), U256::from(1u64));
    }
}
