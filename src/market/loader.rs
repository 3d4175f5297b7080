//! Factory scan
//!
//! Enumerates pairs from V2-style factories, keeps the ones quoted against
//! the base token and builds a registry from them.

use super::{Market, MarketRegistry, UniswapV2Pair};
use crate::chain::ChainClient;
use crate::error::{ArbError, Result};
use crate::types::Protocol;
use alloy::primitives::Address;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Concurrent pair lookups per factory
const PAIR_FETCH_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryConfig {
    pub address: Address,
    pub protocol: Protocol,
}

/// Scan every factory (up to `max_pairs` each) and build the registry.
///
/// A factory that fails to answer is skipped and one failing pair is
/// dropped. Fails when factories were given and none of them answered.
pub async fn load_markets(
    chain: Arc<dyn ChainClient>,
    factories: &[FactoryConfig],
    base_token: Address,
    max_pairs: usize,
) -> Result<MarketRegistry> {
    let mut markets: Vec<Arc<dyn Market>> = Vec::new();
    let mut last_error = None;
    let mut answered = 0usize;

    for factory in factories {
        match load_factory(chain.clone(), factory, base_token, max_pairs).await {
            Ok(found) => {
                answered += 1;
                info!(
                    "Loaded {} {} pairs against base token from {}",
                    found.len(),
                    factory.protocol,
                    factory.address
                );
                markets.extend(found);
            }
            Err(e) => {
                warn!("Skipping factory {}: {}", factory.address, e);
                last_error = Some(e);
            }
        }
    }

    if answered == 0 {
        if let Some(e) = last_error {
            return Err(ArbError::Rpc(format!(
                "none of {} factories answered: {}",
                factories.len(),
                e
            )));
        }
    }

    let registry = MarketRegistry::new(markets);
    info!(
        "Market registry: {} markets, {} tradable tokens",
        registry.len(),
        registry.token_count()
    );
    Ok(registry)
}

async fn load_factory(
    chain: Arc<dyn ChainClient>,
    factory: &FactoryConfig,
    base_token: Address,
    max_pairs: usize,
) -> Result<Vec<Arc<dyn Market>>> {
    let count = chain.factory_pair_count(factory.address).await?;
    let count = count.min(max_pairs as u64);
    debug!("Factory {} exposes {} pairs to scan", factory.address, count);

    let pairs: Vec<Option<Arc<dyn Market>>> = stream::iter(0..count)
        .map(|index| {
            let chain = chain.clone();
            async move { load_pair(chain, factory, base_token, index).await }
        })
        .buffered(PAIR_FETCH_CONCURRENCY)
        .try_collect()
        .await?;

    Ok(pairs.into_iter().flatten().collect())
}

async fn load_pair(
    chain: Arc<dyn ChainClient>,
    factory: &FactoryConfig,
    base_token: Address,
    index: u64,
) -> Result<Option<Arc<dyn Market>>> {
    let pair = match chain.factory_pair_at(factory.address, index).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Pair #{} of {} unavailable: {}", index, factory.address, e);
            return Ok(None);
        }
    };

    let (token0, token1) = match chain.pair_tokens(pair).await {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!("Tokens of pair {} unavailable: {}", pair, e);
            return Ok(None);
        }
    };

    let token = if token0 == base_token {
        token1
    } else if token1 == base_token {
        token0
    } else {
        return Ok(None);
    };

    let market = UniswapV2Pair::new(pair, token0, token1, token, factory.protocol, chain)?;
    Ok(Some(Arc::new(market)))
}
