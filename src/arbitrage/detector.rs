//! Crossed-market detector
//!
//! For every token traded on at least two markets, reads each market's
//! reserves once, then looks for ordered pairs (buy A, sell B) where B
//! pays more base asset per token than A charges, by more than both
//! venues' fees combined. The trade size is chosen by ternary search over
//! the base input, bounded by policy and by both markets' liquidity.
//!
//! Profit as a function of input size is concave for constant-product
//! venues, so the search converges on the global optimum.

use crate::config::PolicyThresholds;
use crate::error::{with_timeout, Result};
use crate::market::{Market, MarketRegistry, Reserves};
use crate::types::{BlockState, CrossedMarketOpportunity};
use crate::utils::{fraction_to_ppm, to_display, PPM};
use alloy::primitives::{Address, U256};
use futures::future::join_all;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Iteration cap for the size search (each step keeps 2/3 of the range)
const MAX_SEARCH_ITERATIONS: usize = 200;

/// One market with the reserves read for this pass
struct Quoted {
    market: Arc<dyn Market>,
    reserves: Reserves,
    base_reserve: U256,
    token_reserve: U256,
}

pub struct CrossedMarketDetector {
    thresholds: PolicyThresholds,
    base_token: Address,
    read_timeout: Duration,
}

impl CrossedMarketDetector {
    pub fn new(thresholds: PolicyThresholds, base_token: Address, read_timeout: Duration) -> Self {
        Self {
            thresholds,
            base_token,
            read_timeout,
        }
    }

    pub fn thresholds(&self) -> &PolicyThresholds {
        &self.thresholds
    }

    /// Scan every tradable token in the registry.
    ///
    /// Returns opportunities ranked by profit (highest first), ties broken
    /// by lower combined price impact. A token whose reserves cannot be
    /// read is skipped for this pass.
    pub async fn evaluate_markets(
        &self,
        registry: &MarketRegistry,
        block: &BlockState,
    ) -> Vec<CrossedMarketOpportunity> {
        let gas_cost = U256::from(self.thresholds.gas_limit) * U256::from(block.base_fee_per_gas);
        let min_profit = self.thresholds.min_profit_threshold + gas_cost;

        let scans = registry.tokens().map(|token| {
            let markets = registry.markets_for(token);
            async move { (token, self.evaluate_token(token, markets, min_profit).await) }
        });

        let mut opportunities = Vec::new();
        for (token, result) in join_all(scans).await {
            match result {
                Ok(found) => opportunities.extend(found),
                Err(e) => warn!("Skipping token {} this block: {}", token, e),
            }
        }

        rank(&mut opportunities);

        if !opportunities.is_empty() {
            info!(
                "Block {}: {} crossed markets, best profit {} ETH",
                block.current_block,
                opportunities.len(),
                to_display(opportunities[0].profit, 18)
            );
        }
        opportunities
    }

    async fn evaluate_token(
        &self,
        token: Address,
        markets: Vec<Arc<dyn Market>>,
        min_profit: U256,
    ) -> Result<Vec<CrossedMarketOpportunity>> {
        let reads = join_all(
            markets
                .iter()
                .map(|m| with_timeout("reserve read", self.read_timeout, m.load_reserves())),
        )
        .await;

        let mut quoted = Vec::with_capacity(markets.len());
        for (market, reserves) in markets.into_iter().zip(reads) {
            let reserves = reserves?;
            let (Some(base_reserve), Some(token_reserve)) =
                (reserves.get(self.base_token), reserves.get(token))
            else {
                continue;
            };
            if base_reserve < self.thresholds.liquidity_floor {
                debug!(
                    "Skipping {} - base reserve {} below floor",
                    market.market_address(),
                    base_reserve
                );
                continue;
            }
            quoted.push(Quoted {
                market,
                reserves,
                base_reserve,
                token_reserve,
            });
        }

        if quoted.len() < 2 {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for buy in &quoted {
            for sell in &quoted {
                let same_market = buy.market.market_address() == sell.market.market_address();
                if same_market || !is_crossed(buy, sell) {
                    continue;
                }
                if let Some(opportunity) = self.best_trade(token, buy, sell) {
                    if opportunity.profit > min_profit {
                        debug!("Crossed market: {}", opportunity);
                        results.push(opportunity);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Optimal trade for buying `token` on `buy` and selling on `sell`
    fn best_trade(
        &self,
        token: Address,
        buy: &Quoted,
        sell: &Quoted,
    ) -> Option<CrossedMarketOpportunity> {
        let base = self.base_token;
        let round_trip = |amount_in: U256| -> U256 {
            let bought = buy
                .market
                .quote_tokens_out(&buy.reserves, base, token, amount_in);
            sell.market
                .quote_tokens_out(&sell.reserves, token, base, bought)
        };

        let upper = self
            .thresholds
            .max_trade_size
            .min(buy.base_reserve)
            .min(sell.base_reserve);
        let amount_in = ternary_search(U256::ZERO, upper, round_trip);

        let base_out = round_trip(amount_in);
        if base_out <= amount_in {
            return None;
        }

        let volume = buy
            .market
            .quote_tokens_out(&buy.reserves, base, token, amount_in);
        let price_impact = buy
            .market
            .quote_price_impact(&buy.reserves, base, token, amount_in)
            + sell
                .market
                .quote_price_impact(&sell.reserves, token, base, volume);

        Some(CrossedMarketOpportunity {
            token_address: token,
            buy_from_market: buy.market.market_address(),
            sell_to_market: sell.market.market_address(),
            volume,
            base_amount_in: amount_in,
            profit: base_out - amount_in,
            price_impact,
        })
    }
}

/// Selling on `sell` beats buying on `buy` by more than both fees:
/// `price_sell / price_buy > 1 + fee_buy + fee_sell`, with
/// `price = base_reserve / token_reserve`, compared without division.
fn is_crossed(buy: &Quoted, sell: &Quoted) -> bool {
    if buy.token_reserve.is_zero() || sell.token_reserve.is_zero() {
        return false;
    }
    let fees_ppm =
        fraction_to_ppm(buy.market.trading_fee()) + fraction_to_ppm(sell.market.trading_fee());

    let lhs = sell
        .base_reserve
        .saturating_mul(buy.token_reserve)
        .saturating_mul(U256::from(PPM));
    let rhs = buy
        .base_reserve
        .saturating_mul(sell.token_reserve)
        .saturating_mul(U256::from(PPM + fees_ppm));
    lhs > rhs
}

/// Input in `[lo, hi]` maximising `out(x) - x` for a concave profit curve
fn ternary_search(mut lo: U256, mut hi: U256, out: impl Fn(U256) -> U256) -> U256 {
    let two = U256::from(2);
    let three = U256::from(3);

    for _ in 0..MAX_SEARCH_ITERATIONS {
        if hi - lo <= two {
            break;
        }
        let third = (hi - lo) / three;
        let m1 = lo + third;
        let m2 = hi - third;
        // out(m1) - m1 < out(m2) - m2, rearranged to stay unsigned
        if out(m1) + m2 < out(m2) + m1 {
            lo = m1;
        } else {
            hi = m2;
        }
    }

    let mut best = lo;
    let mut candidate = lo;
    while candidate <= hi {
        if out(candidate) + best > out(best) + candidate {
            best = candidate;
        }
        candidate += U256::from(1);
    }
    best
}

/// Profit descending, then combined price impact ascending
fn rank(opportunities: &mut [CrossedMarketOpportunity]) {
    opportunities.sort_by(|a, b| match b.profit.cmp(&a.profit) {
        Ordering::Equal => a.price_impact.cmp(&b.price_impact),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::UniswapV2Pair;
    use crate::testing::{MockChain, TOKEN_A, TOKEN_B, WETH};
    use crate::types::Protocol;
    use crate::utils::ETHER;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    const UNI_A: Address = address!("0000000000000000000000000000000000000a01");
    const SUSHI_A: Address = address!("0000000000000000000000000000000000000a02");
    const UNI_B: Address = address!("0000000000000000000000000000000000000b01");
    const SUSHI_B: Address = address!("0000000000000000000000000000000000000b02");

    const GWEI: u128 = 1_000_000_000;

    fn eth(n: u64) -> U256 {
        ETHER * U256::from(n)
    }

    /// Pair with `tokens` of the token and `base` WETH (token0 = token)
    fn pair(
        chain: &Arc<MockChain>,
        address: Address,
        token: Address,
        tokens: U256,
        base: U256,
    ) -> Arc<dyn Market> {
        chain.set_reserves(address, tokens, base);
        Arc::new(
            UniswapV2Pair::new(address, token, WETH, token, Protocol::UniswapV2, chain.clone())
                .unwrap(),
        )
    }

    fn detector() -> CrossedMarketDetector {
        CrossedMarketDetector::new(PolicyThresholds::default(), WETH, Duration::from_secs(1))
    }

    fn block() -> BlockState {
        BlockState::new(17_000_000, 10 * GWEI)
    }

    #[tokio::test]
    async fn test_detects_crossed_pair() {
        let chain = Arc::new(MockChain::new());
        // Token is 10% more expensive on the second venue
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, eth(200_000), eth(100)),
            pair(&chain, SUSHI_A, TOKEN_A, eth(200_000), eth(110)),
        ]);

        let opportunities = detector().evaluate_markets(&registry, &block()).await;
        assert_eq!(opportunities.len(), 1);

        let opp = &opportunities[0];
        assert_eq!(opp.token_address, TOKEN_A);
        assert_eq!(opp.buy_from_market, UNI_A);
        assert_eq!(opp.sell_to_market, SUSHI_A);
        assert!(opp.profit > ETHER / U256::from(20));
        assert!(opp.base_amount_in > ETHER && opp.base_amount_in < eth(4));
        assert!(opp.volume > U256::ZERO);
        assert!(opp.price_impact > dec!(0.006));
    }

    #[tokio::test]
    async fn test_equal_prices_yield_nothing() {
        let chain = Arc::new(MockChain::new());
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, eth(200_000), eth(100)),
            pair(&chain, SUSHI_A, TOKEN_A, eth(400_000), eth(200)),
        ]);
        assert!(detector().evaluate_markets(&registry, &block()).await.is_empty());
    }

    #[tokio::test]
    async fn test_gap_inside_fees_yields_nothing() {
        let chain = Arc::new(MockChain::new());
        // 0.5% gap does not cover two 0.3% fees
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, eth(200_000), eth(1000)),
            pair(&chain, SUSHI_A, TOKEN_A, eth(200_000), eth(1005)),
        ]);
        assert!(detector().evaluate_markets(&registry, &block()).await.is_empty());
    }

    #[tokio::test]
    async fn test_liquidity_floor_filters_markets() {
        let chain = Arc::new(MockChain::new());
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, U256::from(100), U256::from(100)),
            pair(&chain, SUSHI_A, TOKEN_A, U256::from(100), U256::from(150)),
        ]);
        assert!(detector().evaluate_markets(&registry, &block()).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = MarketRegistry::default();
        assert!(detector().evaluate_markets(&registry, &block()).await.is_empty());
    }

    #[tokio::test]
    async fn test_high_gas_price_suppresses_marginal_opportunity() {
        let chain = Arc::new(MockChain::new());
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, eth(200_000), eth(100)),
            pair(&chain, SUSHI_A, TOKEN_A, eth(200_000), eth(110)),
        ]);
        // 250k gas at 10_000 gwei costs 2.5 ETH, far above the ~0.1 ETH edge
        let expensive = BlockState::new(17_000_000, 10_000 * GWEI);
        assert!(detector().evaluate_markets(&registry, &expensive).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_read_skips_only_that_token() {
        let chain = Arc::new(MockChain::new());
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, eth(200_000), eth(100)),
            pair(&chain, SUSHI_A, TOKEN_A, eth(200_000), eth(110)),
            pair(&chain, UNI_B, TOKEN_B, eth(200_000), eth(100)),
            pair(&chain, SUSHI_B, TOKEN_B, eth(200_000), eth(110)),
        ]);
        chain.fail_reserves(UNI_A);

        let opportunities = detector().evaluate_markets(&registry, &block()).await;
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].token_address, TOKEN_B);
    }

    #[tokio::test]
    async fn test_ranked_by_profit() {
        let chain = Arc::new(MockChain::new());
        let registry = MarketRegistry::new(vec![
            pair(&chain, UNI_A, TOKEN_A, eth(200_000), eth(100)),
            pair(&chain, SUSHI_A, TOKEN_A, eth(200_000), eth(110)),
            pair(&chain, UNI_B, TOKEN_B, eth(200_000), eth(100)),
            pair(&chain, SUSHI_B, TOKEN_B, eth(200_000), eth(120)),
        ]);

        let opportunities = detector().evaluate_markets(&registry, &block()).await;
        assert_eq!(opportunities.len(), 2);
        assert_eq!(opportunities[0].token_address, TOKEN_B);
        assert!(opportunities[0].profit >= opportunities[1].profit);
    }

    #[test]
    fn test_rank_ties_prefer_lower_impact() {
        let opp = |profit: u64, impact| CrossedMarketOpportunity {
            token_address: TOKEN_A,
            buy_from_market: UNI_A,
            sell_to_market: SUSHI_A,
            volume: U256::from(1),
            base_amount_in: U256::from(1),
            profit: U256::from(profit),
            price_impact: impact,
        };
        let mut opportunities = vec![opp(5, dec!(0.02)), opp(9, dec!(0.5)), opp(5, dec!(0.01))];
        rank(&mut opportunities);

        assert_eq!(opportunities[0].profit, U256::from(9));
        assert_eq!(opportunities[1].price_impact, dec!(0.01));
        assert_eq!(opportunities[2].price_impact, dec!(0.02));
    }

    #[test]
    fn test_ternary_search_finds_peak() {
        // Profit 100x - x^2/10 peaks at x = 500
        let out = |x: U256| {
            let x = x.to::<u64>();
            U256::from(101 * x - x * x / 10)
        };
        let best = ternary_search(U256::ZERO, U256::from(1000), out);
        let best = best.to::<u64>();
        assert!((495..=505).contains(&best), "peak found at {}", best);
    }
}
