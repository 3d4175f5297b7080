//! In-memory chain and relay doubles for unit tests

use crate::arbitrage::bundle::Bundle;
use crate::block_feed::BlockFeed;
use crate::chain::ChainClient;
use crate::error::{ArbError, Result};
use crate::relay::{BundleHandle, BundleRelay, SimulationResult};
use crate::types::{BlockState, ExecutorCall, GasTerms, SignedTransaction};
use alloy::primitives::{address, keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOKEN_A: Address = address!("1f9840a85d5aF5bf1D1762F925BDADdC4201F984");
pub const TOKEN_B: Address = address!("6B175474E89094C44Da98b954EedeAC495271d0F");
pub const WETH: Address = crate::config::WETH_ADDRESS;

const SIGNER: Address = address!("00000000000000000000000000000000000000f1");

#[derive(Default)]
pub struct MockChain {
    block_number: AtomicU64,
    base_fee: AtomicU64,
    reserves: DashMap<Address, (U256, U256)>,
    failing_reserves: DashSet<Address>,
    failing_factories: AtomicBool,
    tokens: DashMap<Address, (Address, Address)>,
    factories: DashMap<Address, Vec<Address>>,
    gas_estimate: AtomicU64,
    fail_next_estimate: AtomicBool,
    estimates: AtomicU32,
    signed: AtomicU64,
    included: DashMap<B256, u64>,
}

impl MockChain {
    pub fn new() -> Self {
        let chain = Self::default();
        chain.gas_estimate.store(150_000, Ordering::SeqCst);
        chain.base_fee.store(10_000_000_000, Ordering::SeqCst);
        chain
    }

    pub fn set_reserves(&self, pair: Address, reserve0: U256, reserve1: U256) {
        self.failing_reserves.remove(&pair);
        self.reserves.insert(pair, (reserve0, reserve1));
    }

    /// Make reserve reads for `pair` fail with a transient error
    pub fn fail_reserves(&self, pair: Address) {
        self.failing_reserves.insert(pair);
    }

    pub fn add_factory_pair(
        &self,
        factory: Address,
        pair: Address,
        token0: Address,
        token1: Address,
    ) {
        self.factories.entry(factory).or_default().push(pair);
        self.tokens.insert(pair, (token0, token1));
    }

    /// Make every factory lookup fail, as when the node is down
    pub fn fail_factories(&self) {
        self.failing_factories.store(true, Ordering::SeqCst);
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.gas_estimate.store(gas, Ordering::SeqCst);
    }

    pub fn fail_first_estimate(&self) {
        self.fail_next_estimate.store(true, Ordering::SeqCst);
    }

    pub fn estimates(&self) -> u32 {
        self.estimates.load(Ordering::SeqCst)
    }

    pub fn mark_included(&self, tx_hash: B256, block: u64) {
        self.included.insert(tx_hash, block);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn signer_address(&self) -> Address {
        SIGNER
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn base_fee_per_gas(&self) -> Result<u128> {
        Ok(self.base_fee.load(Ordering::SeqCst) as u128)
    }

    async fn pair_reserves(&self, pair: Address) -> Result<(U256, U256)> {
        if self.failing_reserves.contains(&pair) {
            return Err(ArbError::Rpc(format!("reserves unavailable for {}", pair)));
        }
        self.reserves
            .get(&pair)
            .map(|r| *r)
            .ok_or_else(|| ArbError::Rpc(format!("unknown pair {}", pair)))
    }

    async fn pair_tokens(&self, pair: Address) -> Result<(Address, Address)> {
        self.tokens
            .get(&pair)
            .map(|t| *t)
            .ok_or_else(|| ArbError::Rpc(format!("unknown pair {}", pair)))
    }

    async fn factory_pair_count(&self, factory: Address) -> Result<u64> {
        if self.failing_factories.load(Ordering::SeqCst) {
            return Err(ArbError::Rpc("node down".to_string()));
        }
        Ok(self.factories.get(&factory).map_or(0, |pairs| pairs.len() as u64))
    }

    async fn factory_pair_at(&self, factory: Address, index: u64) -> Result<Address> {
        self.factories
            .get(&factory)
            .and_then(|pairs| pairs.get(index as usize).copied())
            .ok_or_else(|| ArbError::Rpc(format!("no pair {} in factory {}", index, factory)))
    }

    async fn estimate_gas(&self, _call: &ExecutorCall) -> Result<u64> {
        self.estimates.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_estimate.swap(false, Ordering::SeqCst) {
            return Err(ArbError::Rpc("execution reverted".to_string()));
        }
        Ok(self.gas_estimate.load(Ordering::SeqCst))
    }

    async fn sign_transaction(
        &self,
        call: &ExecutorCall,
        gas: &GasTerms,
    ) -> Result<SignedTransaction> {
        let nonce = self.signed.fetch_add(1, Ordering::SeqCst);
        let mut raw = call.data.to_vec();
        raw.extend_from_slice(&nonce.to_be_bytes());
        raw.extend_from_slice(&gas.gas_limit.to_be_bytes());
        Ok(SignedTransaction {
            hash: keccak256(&raw),
            raw: Bytes::from(raw),
        })
    }

    async fn inclusion_block(&self, tx_hash: B256) -> Result<Option<u64>> {
        Ok(self.included.get(&tx_hash).map(|block| *block))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMode {
    /// Simulation passes and pays the builder generously
    Succeed,
    /// Simulation reports a reverted transaction
    Revert,
    /// The relay cannot be reached
    Unavailable,
}

/// Relay double that mines one block per submission. The submitted target
/// block is published on `feed`, and the bundle lands on the configured
/// send.
pub struct MockRelay {
    chain: Arc<MockChain>,
    feed: Arc<BlockFeed>,
    mode: SimulationMode,
    reject_sends: AtomicBool,
    send_delay: Mutex<Duration>,
    include_on: AtomicU32,
    simulations: AtomicU32,
    sends: AtomicU32,
    targets: Mutex<Vec<u64>>,
}

impl MockRelay {
    pub fn new(chain: Arc<MockChain>, feed: Arc<BlockFeed>, mode: SimulationMode) -> Self {
        Self {
            chain,
            feed,
            mode,
            reject_sends: AtomicBool::new(false),
            send_delay: Mutex::new(Duration::ZERO),
            include_on: AtomicU32::new(0),
            simulations: AtomicU32::new(0),
            sends: AtomicU32::new(0),
            targets: Mutex::new(Vec::new()),
        }
    }

    /// Include the bundle submitted on the `n`th send (1-based)
    pub fn include_on_send(&self, n: u32) {
        self.include_on.store(n, Ordering::SeqCst);
    }

    /// Hold every submission this long before it reaches the relay
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn reject_sends(&self) {
        self.reject_sends.store(true, Ordering::SeqCst);
    }

    pub fn simulations(&self) -> u32 {
        self.simulations.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<u64> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleRelay for MockRelay {
    async fn simulate(&self, _bundle: &Bundle, _state_block: u64) -> Result<SimulationResult> {
        self.simulations.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            SimulationMode::Succeed => Ok(SimulationResult {
                success: true,
                coinbase_diff: U256::from(u128::MAX),
                gas_used: 150_000,
                error: None,
            }),
            SimulationMode::Revert => Ok(SimulationResult::failed("execution reverted")),
            SimulationMode::Unavailable => Err(ArbError::Rpc("relay unreachable".to_string())),
        }
    }

    async fn send_bundle(&self, bundle: &Bundle) -> Result<BundleHandle> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(ArbError::Relay("bundle rejected".to_string()));
        }

        let target = bundle.target_block();
        self.targets.lock().unwrap().push(target);
        if self.include_on.load(Ordering::SeqCst) == n {
            for hash in bundle.tx_hashes() {
                self.chain.mark_included(hash, target);
            }
        }
        let base_fee = self.feed.snapshot().base_fee_per_gas;
        self.feed.publish(BlockState::new(target, base_fee));

        Ok(BundleHandle {
            bundle_hash: Some(format!("0x{:x}", n)),
            target_block: target,
            tx_hashes: bundle.tx_hashes(),
        })
    }
}
