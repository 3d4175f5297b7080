// Core data structures shared by the detector, submitter and façade

use alloy::primitives::{Address, Bytes, B256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// AMM protocols we can quote and trade against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    UniswapV2,
    SushiSwap,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::UniswapV2 => write!(f, "UniswapV2"),
            Protocol::SushiSwap => write!(f, "SushiSwap"),
        }
    }
}

/// Chain head as seen by the block feed. Consumers only ever get copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockState {
    pub current_block: u64,
    pub base_fee_per_gas: u128,
}

impl BlockState {
    pub fn new(current_block: u64, base_fee_per_gas: u128) -> Self {
        Self {
            current_block,
            base_fee_per_gas,
        }
    }

    /// Upper bound for the next block's base fee (EIP-1559 allows +12.5% per block)
    pub fn next_base_fee(&self) -> u128 {
        self.base_fee_per_gas + self.base_fee_per_gas / 8 + 1
    }
}

/// Crossed market detected between two venues trading the same token.
///
/// Markets are referenced by address only; resolve them through the
/// registry snapshot at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossedMarketOpportunity {
    pub token_address: Address,
    pub buy_from_market: Address,
    pub sell_to_market: Address,
    /// Amount of the non-base token bought on `buy_from_market`
    pub volume: U256,
    /// Base asset spent on the buy leg
    pub base_amount_in: U256,
    /// Base asset gained after venue fees, before gas
    pub profit: U256,
    /// Sum of both legs' price impact
    pub price_impact: Decimal,
}

impl CrossedMarketOpportunity {
    /// Route key used to avoid racing the same pair of venues twice
    pub fn route(&self) -> (Address, Address) {
        (self.buy_from_market, self.sell_to_market)
    }
}

impl fmt::Display for CrossedMarketOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} | buy {} -> sell {} | in {} | volume {} | profit {}",
            self.token_address,
            self.buy_from_market,
            self.sell_to_market,
            self.base_amount_in,
            self.volume,
            self.profit
        )
    }
}

/// Unsigned call against a market contract, executed by the bundle executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketCall {
    pub target: Address,
    pub data: Bytes,
    /// Output the call is expected to deliver
    pub amount_out: U256,
    pub recipient: Address,
}

/// Unsigned transaction request aimed at the bundle executor contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// EIP-1559 gas terms for a bundle transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasTerms {
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Signed, RLP/2718-encoded transaction ready for the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}
