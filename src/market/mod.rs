//! Market abstraction
//!
//! A market is one AMM venue trading a token against the base asset. The
//! detector only talks to venues through the [`Market`] trait: read
//! reserves once, then quote many candidate sizes against that snapshot.
//!
//! Constant-product pairs (Uniswap V2 and its forks) live in
//! [`uniswap_v2`]. The [`registry`] groups markets by token and the
//! [`loader`] discovers them from factory contracts.

pub mod loader;
pub mod registry;
pub mod uniswap_v2;

pub use loader::{load_markets, FactoryConfig};
pub use registry::{MarketRegistry, MarketState, SharedRegistry};
pub use uniswap_v2::UniswapV2Pair;

use crate::error::{ArbError, Result};
use crate::types::{MarketCall, Protocol};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;

/// Static description of a market
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketInfo {
    pub market_address: Address,
    /// The non-base token this market is grouped under
    pub token_address: Address,
    pub tokens: Vec<Address>,
    pub protocol: Protocol,
}

impl MarketInfo {
    pub fn new(
        market_address: Address,
        token_address: Address,
        tokens: Vec<Address>,
        protocol: Protocol,
    ) -> Result<Self> {
        if !tokens.contains(&token_address) {
            return Err(ArbError::UnsupportedToken {
                market: market_address,
                token: token_address,
            });
        }
        Ok(Self {
            market_address,
            token_address,
            tokens,
            protocol,
        })
    }
}

/// Reserve snapshot of one market, keyed by token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reserves {
    balances: Vec<(Address, U256)>,
}

impl Reserves {
    pub fn new(balances: Vec<(Address, U256)>) -> Self {
        Self { balances }
    }

    pub fn get(&self, token: Address) -> Option<U256> {
        self.balances
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, balance)| *balance)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Address, U256)> {
        self.balances.iter()
    }
}

/// A tradable venue.
///
/// Implementors provide the snapshot read and the pure quoting/encoding
/// functions; the async convenience operations are derived from those.
#[async_trait]
pub trait Market: Send + Sync + fmt::Debug {
    fn info(&self) -> &MarketInfo;

    /// Read current reserves for every token of the market
    async fn load_reserves(&self) -> Result<Reserves>;

    /// Output for `amount_in` of `token_in` against a reserve snapshot.
    /// Zero when the trade is impossible.
    fn quote_tokens_out(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> U256;

    /// Relative price impact (0 to 1) of a trade against a reserve snapshot
    fn quote_price_impact(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Decimal;

    /// Fee charged on input, as a fraction
    fn trading_fee(&self) -> Decimal;

    /// Whether the market pulls input tokens from its own balance, so the
    /// previous hop can pay straight into it
    fn receive_directly(&self, token: Address) -> bool;

    /// Encode (without sending) a swap of `amount_in` that delivers output
    /// to `recipient`, quoted against `reserves`
    fn encode_sell(
        &self,
        reserves: &Reserves,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        recipient: Address,
    ) -> Result<MarketCall>;

    fn market_address(&self) -> Address {
        self.info().market_address
    }

    fn token_address(&self) -> Address {
        self.info().token_address
    }

    fn tokens(&self) -> &[Address] {
        &self.info().tokens
    }

    fn protocol(&self) -> Protocol {
        self.info().protocol
    }

    async fn get_reserves(&self, token: Address) -> Result<U256> {
        let reserves = self.load_reserves().await?;
        reserves.get(token).ok_or(ArbError::UnsupportedToken {
            market: self.market_address(),
            token,
        })
    }

    /// Token balance held by the market contract
    async fn get_balance(&self, token: Address) -> Result<U256> {
        self.get_reserves(token).await
    }

    async fn get_tokens_out(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<U256> {
        let reserves = self.load_reserves().await?;
        Ok(self.quote_tokens_out(&reserves, token_in, token_out, amount_in))
    }

    async fn get_price_impact(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<Decimal> {
        let reserves = self.load_reserves().await?;
        Ok(self.quote_price_impact(&reserves, token_in, token_out, amount_in))
    }

    async fn sell_tokens(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        recipient: Address,
    ) -> Result<MarketCall> {
        let reserves = self.load_reserves().await?;
        self.encode_sell(&reserves, token_in, token_out, amount_in, recipient)
    }

    /// Like [`Market::sell_tokens`], but sends the output straight into
    /// `next` when it can receive directly, otherwise to `fallback`
    async fn sell_tokens_to_next_market(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        next: &dyn Market,
        fallback: Address,
    ) -> Result<MarketCall> {
        let recipient = if next.receive_directly(token_out) {
            next.market_address()
        } else {
            fallback
        };
        self.sell_tokens(token_in, token_out, amount_in, recipient)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const WETH: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
    const TOKEN: Address = address!("6B175474E89094C44Da98b954EedeAC495271d0F");
    const PAIR: Address = address!("A478c2975Ab1Ea89e8196811F51A7B7Ade33eB11");

    #[test]
    fn test_market_info_requires_grouping_token() {
        let info = MarketInfo::new(PAIR, TOKEN, vec![TOKEN, WETH], Protocol::UniswapV2).unwrap();
        assert_eq!(info.token_address, TOKEN);

        let err = MarketInfo::new(PAIR, Address::ZERO, vec![TOKEN, WETH], Protocol::UniswapV2)
            .unwrap_err();
        assert!(matches!(err, ArbError::UnsupportedToken { .. }));
    }

    #[test]
    fn test_reserves_lookup() {
        let reserves = Reserves::new(vec![(TOKEN, U256::from(5)), (WETH, U256::from(7))]);
        assert_eq!(reserves.get(TOKEN), Some(U256::from(5)));
        assert_eq!(reserves.get(WETH), Some(U256::from(7)));
        assert_eq!(reserves.get(PAIR), None);
        assert_eq!(reserves.iter().count(), 2);
    }
}
