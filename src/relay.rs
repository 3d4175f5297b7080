//! Private bundle relay
//!
//! [`BundleRelay`] is the capability the submitter needs: simulate a
//! bundle against current state, then hand it to the relay for a target
//! block. [`FlashbotsRelay`] speaks the Flashbots JSON-RPC dialect
//! (`eth_callBundle` / `eth_sendBundle`) and authenticates every request
//! with the relay signing key.

use crate::arbitrage::bundle::Bundle;
use crate::error::{with_timeout, ArbError, Result};
use alloy::hex;
use alloy::primitives::{keccak256, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a bundle simulation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimulationResult {
    pub success: bool,
    /// Net payment to the block builder (coinbase balance delta)
    pub coinbase_diff: U256,
    pub gas_used: u64,
    pub error: Option<String>,
}

impl SimulationResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Receipt of a submitted bundle. Inclusion is resolved by watching the
/// chain for the target block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHandle {
    pub bundle_hash: Option<String>,
    pub target_block: u64,
    pub tx_hashes: Vec<B256>,
}

#[async_trait]
pub trait BundleRelay: Send + Sync {
    async fn simulate(&self, bundle: &Bundle, state_block: u64) -> Result<SimulationResult>;

    async fn send_bundle(&self, bundle: &Bundle) -> Result<BundleHandle>;
}

pub struct FlashbotsRelay {
    client: reqwest::Client,
    relay_url: String,
    auth_signer: PrivateKeySigner,
    timeout: Duration,
}

impl FlashbotsRelay {
    pub fn new(
        relay_url: impl Into<String>,
        auth_signer: PrivateKeySigner,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay_url: relay_url.into(),
            auth_signer,
            timeout,
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// `X-Flashbots-Signature` value: `<address>:<signature over keccak(body)>`
    async fn signature_header(&self, body: &str) -> Result<String> {
        let digest = format!("0x{}", hex::encode(keccak256(body.as_bytes())));
        let signature = self
            .auth_signer
            .sign_message(digest.as_bytes())
            .await
            .map_err(|e| ArbError::Relay(format!("cannot sign relay request: {}", e)))?;

        Ok(format!(
            "{:?}:0x{}",
            self.auth_signer.address(),
            hex::encode(signature.as_bytes())
        ))
    }

    /// One signed JSON-RPC round trip. The deadline covers the response body.
    async fn call(&self, what: &'static str, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        })
        .to_string();
        let signature = self.signature_header(&body).await?;

        with_timeout(what, self.timeout, self.exchange(body, signature)).await
    }

    async fn exchange(&self, body: String, signature: String) -> Result<Value> {
        let response = self
            .client
            .post(&self.relay_url)
            .header("Content-Type", "application/json")
            .header("X-Flashbots-Signature", signature)
            .body(body)
            .send()
            .await
            .map_err(ArbError::rpc)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ArbError::Rpc(format!("relay returned status {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ArbError::Relay(format!("status {}: {}", status, text)));
        }

        let payload: Value = response.json().await.map_err(ArbError::rpc)?;
        parse_rpc_response(payload)
    }
}

/// Unwrap a JSON-RPC envelope; relay-side errors are fatal for the bundle
fn parse_rpc_response(payload: Value) -> Result<Value> {
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown relay error");
        return Err(ArbError::Relay(message.to_string()));
    }
    payload
        .get("result")
        .cloned()
        .ok_or_else(|| ArbError::Relay("relay response has no result".to_string()))
}

/// Read an `eth_callBundle` result. Any reverted transaction fails the bundle.
fn parse_simulation(result: &Value) -> SimulationResult {
    if let Some(results) = result.get("results").and_then(Value::as_array) {
        for tx in results {
            let reason = tx
                .get("error")
                .or_else(|| tx.get("revert"))
                .and_then(Value::as_str);
            if let Some(reason) = reason {
                return SimulationResult::failed(reason);
            }
        }
    }

    let coinbase_diff = result
        .get("coinbaseDiff")
        .and_then(Value::as_str)
        .and_then(|s| U256::from_str_radix(s, 10).ok())
        .unwrap_or_default();
    let gas_used = result
        .get("totalGasUsed")
        .and_then(Value::as_u64)
        .unwrap_or_default();

    SimulationResult {
        success: true,
        coinbase_diff,
        gas_used,
        error: None,
    }
}

#[async_trait]
impl BundleRelay for FlashbotsRelay {
    async fn simulate(&self, bundle: &Bundle, state_block: u64) -> Result<SimulationResult> {
        let params = json!([{
            "txs": bundle.raw_transactions(),
            "blockNumber": format!("0x{:x}", bundle.target_block()),
            "stateBlockNumber": format!("0x{:x}", state_block),
        }]);

        let result = self.call("bundle simulation", "eth_callBundle", params).await?;
        let simulation = parse_simulation(&result);
        if let Some(error) = &simulation.error {
            warn!("Bundle simulation for block {} reverted: {}", bundle.target_block(), error);
        } else {
            debug!(
                "Bundle simulation ok: coinbase diff {}, gas {}",
                simulation.coinbase_diff, simulation.gas_used
            );
        }
        Ok(simulation)
    }

    async fn send_bundle(&self, bundle: &Bundle) -> Result<BundleHandle> {
        let params = json!([bundle.to_relay_params()]);
        let result = self.call("bundle submission", "eth_sendBundle", params).await?;

        Ok(BundleHandle {
            bundle_hash: result
                .get("bundleHash")
                .and_then(Value::as_str)
                .map(str::to_string),
            target_block: bundle.target_block(),
            tx_hashes: bundle.tx_hashes(),
        })
    }
}
