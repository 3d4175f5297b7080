//! Private transaction bundles
//!
//! A bundle is an ordered list of signed transactions that a relay either
//! includes atomically in `target_block` or drops. Bundles are immutable
//! once built; a retry builds a new one for the next block.

use crate::types::SignedTransaction;
use alloy::primitives::{Bytes, B256};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    transactions: Vec<SignedTransaction>,
    target_block: u64,
    attempt: u32,
    max_attempts: u32,
}

impl Bundle {
    pub fn builder(target_block: u64) -> BundleBuilder {
        BundleBuilder {
            transactions: Vec::new(),
            target_block,
            attempt: 1,
            max_attempts: 1,
        }
    }

    pub fn transactions(&self) -> &[SignedTransaction] {
        &self.transactions
    }

    pub fn tx_hashes(&self) -> Vec<B256> {
        self.transactions.iter().map(|tx| tx.hash).collect()
    }

    pub fn raw_transactions(&self) -> Vec<Bytes> {
        self.transactions.iter().map(|tx| tx.raw.clone()).collect()
    }

    pub fn target_block(&self) -> u64 {
        self.target_block
    }

    /// 1-based attempt number this bundle was built for
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Relay payload for `eth_sendBundle` / `eth_callBundle`
    pub fn to_relay_params(&self) -> RelayBundleParams {
        RelayBundleParams {
            txs: self.raw_transactions(),
            block_number: format!("0x{:x}", self.target_block),
            reverting_tx_hashes: Vec::new(),
        }
    }
}

pub struct BundleBuilder {
    transactions: Vec<SignedTransaction>,
    target_block: u64,
    attempt: u32,
    max_attempts: u32,
}

impl BundleBuilder {
    pub fn transaction(mut self, tx: SignedTransaction) -> Self {
        self.transactions.push(tx);
        self
    }

    pub fn attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    pub fn build(self) -> Bundle {
        Bundle {
            transactions: self.transactions,
            target_block: self.target_block,
            attempt: self.attempt,
            max_attempts: self.max_attempts.max(self.attempt),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayBundleParams {
    pub txs: Vec<Bytes>,
    pub block_number: String,
    pub reverting_tx_hashes: Vec<B256>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;

    fn tx(byte: u8) -> SignedTransaction {
        SignedTransaction {
            hash: B256::repeat_byte(byte),
            raw: Bytes::from(vec![byte; 4]),
        }
    }

    #[test]
    fn test_builder_keeps_order() {
        let bundle = Bundle::builder(17_000_001)
            .transaction(tx(1))
            .transaction(tx(2))
            .attempt(3, 10)
            .build();

        assert_eq!(bundle.target_block(), 17_000_001);
        assert_eq!(bundle.tx_hashes(), vec![B256::repeat_byte(1), B256::repeat_byte(2)]);
        assert_eq!(bundle.attempt(), 3);
        assert!(!bundle.is_last_attempt());
    }

    #[test]
    fn test_relay_params_shape() {
        let bundle = Bundle::builder(0x10).transaction(tx(0xab)).build();
        let json = serde_json::to_value(bundle.to_relay_params()).unwrap();

        assert_eq!(json["blockNumber"], "0x10");
        assert_eq!(json["txs"][0], "0xabababab");
        assert!(json["revertingTxHashes"].as_array().unwrap().is_empty());
        assert!(bundle.is_last_attempt());
        assert_ne!(
            bundle.tx_hashes()[0],
            b256!("0000000000000000000000000000000000000000000000000000000000000000")
        );
    }
}
