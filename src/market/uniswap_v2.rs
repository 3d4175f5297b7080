//! Constant-product pairs (Uniswap V2 and forks)
//!
//! Quotes use the pair contract's own integer math:
//! `out = in * 997 * reserve_out / (reserve_in * 1000 + in * 997)`

use super::{Market, MarketInfo, Reserves};
use crate::chain::ChainClient;
use crate::contracts::IUniswapV2Pair;
use crate::error::{ArbError, Result};
use crate::types::{MarketCall, Protocol};
use crate::utils::PPM;
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;

const FEE_NUMERATOR: u64 = 997;
const FEE_DENOMINATOR: u64 = 1000;

/// Output amount for a swap, 0.3% fee included. Zero when any input is zero.
pub fn get_amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> U256 {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::ZERO;
    }

    let amount_in_with_fee = amount_in.saturating_mul(U256::from(FEE_NUMERATOR));
    let numerator = amount_in_with_fee.saturating_mul(reserve_out);
    let denominator = reserve_in
        .saturating_mul(U256::from(FEE_DENOMINATOR))
        .saturating_add(amount_in_with_fee);

    numerator / denominator
}

/// Price impact of a swap as a fraction of the spot price.
///
/// Measured as `1 - execution_price / spot_price`, so it includes the fee.
pub fn price_impact(amount_in: U256, reserve_in: U256, reserve_out: U256) -> Decimal {
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Decimal::ONE;
    }
    if amount_in.is_zero() {
        return Decimal::ZERO;
    }

    let amount_out = get_amount_out(amount_in, reserve_in, reserve_out);
    // execution / spot = (out / in) / (reserve_out / reserve_in)
    let ratio_ppm = amount_out
        .saturating_mul(reserve_in)
        .saturating_mul(U256::from(PPM))
        / amount_in.saturating_mul(reserve_out);
    let ratio_ppm = ratio_ppm.min(U256::from(PPM)).to::<u64>();

    Decimal::new((PPM - ratio_ppm) as i64, 6)
}

pub struct UniswapV2Pair {
    info: MarketInfo,
    token0: Address,
    token1: Address,
    chain: Arc<dyn ChainClient>,
}

impl UniswapV2Pair {
    pub fn new(
        pair: Address,
        token0: Address,
        token1: Address,
        token_address: Address,
        protocol: Protocol,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        let info = MarketInfo::new(pair, token_address, vec![token0, token1], protocol)?;
        Ok(Self {
            info,
            token0,
            token1,
            chain,
        })
    }

    fn reserves_for(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
    ) -> Option<(U256, U256)> {
        if token_in == token_out {
            return None;
        }
        Some((reserves.get(token_in)?, reserves.get(token_out)?))
    }
}

impl fmt::Debug for UniswapV2Pair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UniswapV2Pair")
            .field("address", &self.info.market_address)
            .field("protocol", &self.info.protocol)
            .field("token0", &self.token0)
            .field("token1", &self.token1)
            .finish()
    }
}

#[async_trait]
impl Market for UniswapV2Pair {
    fn info(&self) -> &MarketInfo {
        &self.info
    }

    async fn load_reserves(&self) -> Result<Reserves> {
        let (reserve0, reserve1) = self.chain.pair_reserves(self.info.market_address).await?;
        Ok(Reserves::new(vec![
            (self.token0, reserve0),
            (self.token1, reserve1),
        ]))
    }

    fn quote_tokens_out(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> U256 {
        match self.reserves_for(reserves, token_in, token_out) {
            Some((reserve_in, reserve_out)) => get_amount_out(amount_in, reserve_in, reserve_out),
            None => U256::ZERO,
        }
    }

    fn quote_price_impact(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Decimal {
        match self.reserves_for(reserves, token_in, token_out) {
            Some((reserve_in, reserve_out)) => price_impact(amount_in, reserve_in, reserve_out),
            None => Decimal::ONE,
        }
    }

    fn trading_fee(&self) -> Decimal {
        Decimal::new((FEE_DENOMINATOR - FEE_NUMERATOR) as i64, 3)
    }

    fn receive_directly(&self, token: Address) -> bool {
        token == self.token0 || token == self.token1
    }

    fn encode_sell(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        recipient: Address,
    ) -> Result<MarketCall> {
        for token in [token_in, token_out] {
            if token != self.token0 && token != self.token1 {
                return Err(ArbError::UnsupportedToken {
                    market: self.info.market_address,
                    token,
                });
            }
        }

        let amount_out = self.quote_tokens_out(reserves, token_in, token_out, amount_in);
        if amount_out.is_zero() {
            return Err(ArbError::ZeroOutput {
                market: self.info.market_address,
            });
        }

        let (amount0_out, amount1_out) = if token_out == self.token0 {
            (amount_out, U256::ZERO)
        } else {
            (U256::ZERO, amount_out)
        };

        let data = IUniswapV2Pair::swapCall {
            amount0Out: amount0_out,
            amount1Out: amount1_out,
            to: recipient,
            data: Bytes::new(),
        }
        .abi_encode();

        Ok(MarketCall {
            target: self.info.market_address,
            data: data.into(),
            amount_out,
            recipient,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockChain, TOKEN_A, WETH};
    use crate::utils::ETHER;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    const PAIR: Address = address!("A478c2975Ab1Ea89e8196811F51A7B7Ade33eB11");
    const EXECUTOR: Address = address!("00000000000000000000000000000000000000e1");

    fn pair(chain: Arc<MockChain>) -> UniswapV2Pair {
        UniswapV2Pair::new(PAIR, TOKEN_A, WETH, TOKEN_A, Protocol::UniswapV2, chain).unwrap()
    }

    #[test]
    fn test_get_amount_out() {
        let amount_in = ETHER; // 1 ETH
        let reserve_in = ETHER * U256::from(100); // 100 ETH
        let reserve_out = U256::from(200_000_000_000u64); // 200,000 USDC (6 decimals)

        let amount_out = get_amount_out(amount_in, reserve_in, reserve_out);

        // Should get approximately 1974 USDC (with fee and slippage)
        assert!(amount_out > U256::from(1_970_000_000u64));
        assert!(amount_out < U256::from(2_000_000_000u64));
    }

    #[test]
    fn test_get_amount_out_zero_inputs() {
        let hundred = U256::from(100);
        assert_eq!(get_amount_out(U256::ZERO, hundred, hundred), U256::ZERO);
        assert_eq!(get_amount_out(hundred, U256::ZERO, hundred), U256::ZERO);
        assert_eq!(get_amount_out(hundred, hundred, U256::ZERO), U256::ZERO);
    }

    #[test]
    fn test_price_impact() {
        let reserve_in = ETHER * U256::from(100);
        let reserve_out = U256::from(200_000_000_000u64);

        // 10% of the pool moves the price meaningfully
        let impact = price_impact(ETHER * U256::from(10), reserve_in, reserve_out);
        assert!(impact > dec!(0.05));
        assert!(impact < dec!(0.15));

        // Tiny trades only pay the fee
        let impact = price_impact(ETHER / U256::from(1000), reserve_in, reserve_out);
        assert!(impact >= dec!(0.003));
        assert!(impact < dec!(0.004));

        assert_eq!(price_impact(ETHER, U256::ZERO, reserve_out), Decimal::ONE);
    }

    #[tokio::test]
    async fn test_quotes_from_chain_reserves() {
        let chain = Arc::new(MockChain::new());
        chain.set_reserves(PAIR, ETHER * U256::from(1000), ETHER * U256::from(10));
        let market = pair(chain);

        assert_eq!(market.get_reserves(WETH).await.unwrap(), ETHER * U256::from(10));
        assert_eq!(market.get_balance(TOKEN_A).await.unwrap(), ETHER * U256::from(1000));

        let out = market.get_tokens_out(WETH, TOKEN_A, ETHER).await.unwrap();
        assert_eq!(
            out,
            get_amount_out(ETHER, ETHER * U256::from(10), ETHER * U256::from(1000))
        );
        assert!(market.get_price_impact(WETH, TOKEN_A, ETHER).await.unwrap() > dec!(0.003));
        assert_eq!(market.trading_fee(), dec!(0.003));
    }

    #[tokio::test]
    async fn test_sell_tokens_encodes_swap() {
        let chain = Arc::new(MockChain::new());
        chain.set_reserves(PAIR, ETHER * U256::from(1000), ETHER * U256::from(10));
        let market = pair(chain);

        let call = market.sell_tokens(WETH, TOKEN_A, ETHER, EXECUTOR).await.unwrap();
        assert_eq!(call.target, PAIR);
        assert_eq!(call.recipient, EXECUTOR);

        let decoded = IUniswapV2Pair::swapCall::abi_decode(&call.data).unwrap();
        // token0 is the output side
        assert_eq!(decoded.amount0Out, call.amount_out);
        assert_eq!(decoded.amount1Out, U256::ZERO);
        assert_eq!(decoded.to, EXECUTOR);
    }

    #[tokio::test]
    async fn test_sell_tokens_to_next_market_pays_next_pair() {
        let chain = Arc::new(MockChain::new());
        let next_pair = address!("397FF1542f962076d0BFE58eA045FfA2d347ACa0");
        chain.set_reserves(PAIR, ETHER * U256::from(1000), ETHER * U256::from(10));
        chain.set_reserves(next_pair, ETHER * U256::from(900), ETHER * U256::from(10));
        let first = pair(chain.clone());
        let next = UniswapV2Pair::new(
            next_pair,
            TOKEN_A,
            WETH,
            TOKEN_A,
            Protocol::SushiSwap,
            chain,
        )
        .unwrap();

        let call = first
            .sell_tokens_to_next_market(WETH, TOKEN_A, ETHER, &next, EXECUTOR)
            .await
            .unwrap();
        assert_eq!(call.recipient, next_pair);
    }

    #[tokio::test]
    async fn test_sell_unknown_token_fails() {
        let chain = Arc::new(MockChain::new());
        chain.set_reserves(PAIR, ETHER, ETHER);
        let market = pair(chain);

        let err = market
            .sell_tokens(Address::ZERO, TOKEN_A, ETHER, EXECUTOR)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbError::UnsupportedToken { .. }));
        assert!(market.get_reserves(Address::ZERO).await.is_err());
    }
}
