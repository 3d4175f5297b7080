//! Chain access
//!
//! Everything the engine needs from an Ethereum node sits behind
//! [`ChainClient`], so detection and submission can run against a mock.
//! [`RpcChainClient`] is the alloy-backed implementation; every call it
//! makes is wrapped in the configured RPC timeout.

use crate::contracts::{IUniswapV2Factory, IUniswapV2Pair};
use crate::error::{with_timeout, ArbError, Result};
use crate::types::{ExecutorCall, GasTerms, SignedTransaction};
use alloy::eips::eip2718::Encodable2718;
use alloy::eips::BlockNumberOrTag;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address of the key that signs bundle transactions
    fn signer_address(&self) -> Address;

    async fn block_number(&self) -> Result<u64>;

    async fn base_fee_per_gas(&self) -> Result<u128>;

    /// `(reserve0, reserve1)` of a V2-style pair
    async fn pair_reserves(&self, pair: Address) -> Result<(U256, U256)>;

    /// `(token0, token1)` of a V2-style pair
    async fn pair_tokens(&self, pair: Address) -> Result<(Address, Address)>;

    async fn factory_pair_count(&self, factory: Address) -> Result<u64>;

    async fn factory_pair_at(&self, factory: Address, index: u64) -> Result<Address>;

    async fn estimate_gas(&self, call: &ExecutorCall) -> Result<u64>;

    /// Sign (but do not broadcast) a transaction for the given call
    async fn sign_transaction(&self, call: &ExecutorCall, gas: &GasTerms)
        -> Result<SignedTransaction>;

    /// Block a transaction was mined in, if any
    async fn inclusion_block(&self, tx_hash: B256) -> Result<Option<u64>>;
}

pub struct RpcChainClient {
    provider: DynProvider,
    wallet: EthereumWallet,
    signer_address: Address,
    chain_id: u64,
    timeout: Duration,
}

impl RpcChainClient {
    /// Connect to `rpc_url` (http(s) or ws(s)) and resolve the chain id
    pub async fn connect(
        rpc_url: &str,
        signer: PrivateKeySigner,
        timeout: Duration,
    ) -> Result<Self> {
        let provider = with_timeout("provider connect", timeout, async {
            ProviderBuilder::new()
                .connect(rpc_url)
                .await
                .map_err(ArbError::rpc)
        })
        .await?
        .erased();

        let chain_id = with_timeout("chain id", timeout, async {
            provider.get_chain_id().await.map_err(ArbError::rpc)
        })
        .await?;

        let signer_address = signer.address();
        info!("Connected to chain {} as {}", chain_id, signer_address);

        Ok(Self {
            provider,
            wallet: EthereumWallet::from(signer),
            signer_address,
            chain_id,
            timeout,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn request(&self, call: &ExecutorCall) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(call.to)
            .with_input(call.data.clone())
            .with_value(call.value)
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    fn signer_address(&self) -> Address {
        self.signer_address
    }

    async fn block_number(&self) -> Result<u64> {
        with_timeout("block number", self.timeout, async {
            self.provider.get_block_number().await.map_err(ArbError::rpc)
        })
        .await
    }

    async fn base_fee_per_gas(&self) -> Result<u128> {
        let block = with_timeout("latest block", self.timeout, async {
            self.provider
                .get_block_by_number(BlockNumberOrTag::Latest)
                .await
                .map_err(ArbError::rpc)
        })
        .await?
        .ok_or_else(|| ArbError::Rpc("latest block not available".to_string()))?;

        Ok(block
            .header
            .base_fee_per_gas
            .map(u128::from)
            .unwrap_or_default())
    }

    async fn pair_reserves(&self, pair: Address) -> Result<(U256, U256)> {
        let contract = IUniswapV2Pair::new(pair, self.provider.clone());
        let reserves = with_timeout("reserve read", self.timeout, async {
            contract.getReserves().call().await.map_err(ArbError::rpc)
        })
        .await?;

        Ok((U256::from(reserves.reserve0), U256::from(reserves.reserve1)))
    }

    async fn pair_tokens(&self, pair: Address) -> Result<(Address, Address)> {
        let contract = IUniswapV2Pair::new(pair, self.provider.clone());
        with_timeout("pair tokens", self.timeout, async {
            let token0 = contract.token0().call().await.map_err(ArbError::rpc)?;
            let token1 = contract.token1().call().await.map_err(ArbError::rpc)?;
            Ok((token0, token1))
        })
        .await
    }

    async fn factory_pair_count(&self, factory: Address) -> Result<u64> {
        let contract = IUniswapV2Factory::new(factory, self.provider.clone());
        let count = with_timeout("factory pair count", self.timeout, async {
            contract.allPairsLength().call().await.map_err(ArbError::rpc)
        })
        .await?;

        Ok(count.saturating_to::<u64>())
    }

    async fn factory_pair_at(&self, factory: Address, index: u64) -> Result<Address> {
        let contract = IUniswapV2Factory::new(factory, self.provider.clone());
        with_timeout("factory pair", self.timeout, async {
            contract
                .allPairs(U256::from(index))
                .call()
                .await
                .map_err(ArbError::rpc)
        })
        .await
    }

    async fn estimate_gas(&self, call: &ExecutorCall) -> Result<u64> {
        let request = self.request(call);
        with_timeout("gas estimate", self.timeout, async {
            self.provider
                .estimate_gas(request)
                .await
                .map_err(ArbError::rpc)
        })
        .await
    }

    async fn sign_transaction(
        &self,
        call: &ExecutorCall,
        gas: &GasTerms,
    ) -> Result<SignedTransaction> {
        let nonce = with_timeout("nonce", self.timeout, async {
            self.provider
                .get_transaction_count(self.signer_address)
                .await
                .map_err(ArbError::rpc)
        })
        .await?;

        let request = self
            .request(call)
            .with_nonce(nonce)
            .with_chain_id(self.chain_id)
            .with_gas_limit(gas.gas_limit)
            .with_max_fee_per_gas(gas.max_fee_per_gas)
            .with_max_priority_fee_per_gas(gas.max_priority_fee_per_gas);

        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| ArbError::Rpc(format!("signing failed: {}", e)))?;

        let hash = *envelope.tx_hash();
        debug!("Signed bundle transaction {} (nonce {})", hash, nonce);

        Ok(SignedTransaction {
            hash,
            raw: Bytes::from(envelope.encoded_2718()),
        })
    }

    async fn inclusion_block(&self, tx_hash: B256) -> Result<Option<u64>> {
        let receipt = with_timeout("receipt", self.timeout, async {
            self.provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(ArbError::rpc)
        })
        .await?;

        Ok(receipt.and_then(|r| r.block_number))
    }
}
