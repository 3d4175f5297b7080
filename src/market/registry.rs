//! Market registry
//!
//! Markets grouped by the token they trade against the base asset. Only
//! tokens with at least two venues are tradable, so only those appear in
//! the token index. The registry itself is immutable; updates build a new
//! one and swap it in through [`SharedRegistry`], so a detection pass
//! always works on a consistent snapshot.

use super::Market;
use alloy::primitives::{Address, U256};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Minimum number of venues for a token to be tradable
pub const MIN_MARKETS_PER_TOKEN: usize = 2;

#[derive(Debug, Default)]
pub struct MarketRegistry {
    markets: Vec<Arc<dyn Market>>,
    by_address: HashMap<Address, usize>,
    by_token: BTreeMap<Address, Vec<usize>>,
}

impl MarketRegistry {
    pub fn new(markets: Vec<Arc<dyn Market>>) -> Self {
        let mut registry = Self::default();
        for market in markets {
            // First registration of an address wins
            if registry.by_address.contains_key(&market.market_address()) {
                continue;
            }
            registry
                .by_address
                .insert(market.market_address(), registry.markets.len());
            registry.markets.push(market);
        }
        registry.rebuild_index();
        registry
    }

    fn rebuild_index(&mut self) {
        let mut grouped: BTreeMap<Address, Vec<usize>> = BTreeMap::new();
        for (index, market) in self.markets.iter().enumerate() {
            grouped.entry(market.token_address()).or_default().push(index);
        }
        grouped.retain(|_, indices| indices.len() >= MIN_MARKETS_PER_TOKEN);
        self.by_token = grouped;
    }

    /// New registry holding these markets plus `extra`
    pub fn with_markets(&self, extra: Vec<Arc<dyn Market>>) -> Self {
        let mut all = self.markets.clone();
        all.extend(extra);
        Self::new(all)
    }

    /// Tokens tradable on at least two markets
    pub fn tokens(&self) -> impl Iterator<Item = Address> + '_ {
        self.by_token.keys().copied()
    }

    pub fn markets_for(&self, token: Address) -> Vec<Arc<dyn Market>> {
        self.by_token
            .get(&token)
            .map(|indices| indices.iter().map(|i| self.markets[*i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn market(&self, address: Address) -> Option<Arc<dyn Market>> {
        self.by_address
            .get(&address)
            .map(|i| self.markets[*i].clone())
    }

    /// All registered markets, tradable or not
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.by_token.len()
    }
}

/// Summary of the last detection pass, as exposed by the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarketState {
    pub opportunity_count: usize,
    pub total_profit: U256,
    pub last_updated: u64,
}

/// Registry handle shared between the detector, the submitter and reloads
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<ArcSwap<MarketRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: MarketRegistry) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
        }
    }

    /// Current registry; stays valid even if a reload swaps in a new one
    pub fn snapshot(&self) -> Arc<MarketRegistry> {
        self.inner.load_full()
    }

    pub fn replace(&self, registry: MarketRegistry) {
        self.inner.store(Arc::new(registry));
    }

    pub fn append(&self, extra: Vec<Arc<dyn Market>>) {
        self.inner
            .rcu(|current| Arc::new(current.with_markets(extra.clone())));
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(MarketRegistry::default())
    }
}
