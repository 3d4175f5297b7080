//! Arbitrage Service
//!
//! The one entry point for callers: initialize from settings, then
//! `evaluate()` for ranked opportunities and `execute()` to race them as
//! bundles. `start()`/`stop()` manage the block subscription that keeps
//! the current block fresh.

use crate::arbitrage::{
    AbandonReason, BundleOutcome, BundleSubmitter, CrossedMarketDetector, RouteGuard,
};
use crate::block_feed::BlockFeed;
use crate::chain::{ChainClient, RpcChainClient};
use crate::config::{EngineConfig, PolicyThresholds, SettingsSource};
use crate::error::{ArbError, Result};
use crate::market::{load_markets, FactoryConfig, MarketRegistry, MarketState, SharedRegistry};
use crate::relay::{BundleRelay, FlashbotsRelay};
use crate::types::{BlockState, CrossedMarketOpportunity};
use crate::utils::now;
use alloy::primitives::{Address, U256};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const SERVICE_TYPE: &str = "arbitrage";
pub const CAPABILITY_DESCRIPTION: &str =
    "Provides arbitrage trading capabilities across DEX markets";

/// Blocks a route sits out after its first abandonment
const ROUTE_COOLDOWN_BLOCKS: u64 = 2;

/// Everything the engine runs on, already connected
pub struct EngineParts {
    pub chain: Arc<dyn ChainClient>,
    pub relay: Arc<dyn BundleRelay>,
    pub feed: Arc<BlockFeed>,
    pub registry: MarketRegistry,
    pub thresholds: PolicyThresholds,
    pub bundle_executor: Address,
    pub base_token: Address,
    pub factories: Vec<FactoryConfig>,
    pub max_pairs_per_factory: usize,
    pub rpc_timeout: Duration,
}

struct Engine {
    chain: Arc<dyn ChainClient>,
    feed: Arc<BlockFeed>,
    registry: SharedRegistry,
    detector: CrossedMarketDetector,
    submitter: BundleSubmitter,
    base_token: Address,
    factories: Vec<FactoryConfig>,
    max_pairs_per_factory: usize,
}

pub struct ArbitrageService {
    engine: Option<Engine>,
    shutdown: watch::Sender<bool>,
    routes: RouteGuard,
    state: ArcSwap<MarketState>,
}

impl ArbitrageService {
    /// An uninitialized service; every engine call fails until `initialize`
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine: None,
            shutdown,
            routes: RouteGuard::new(ROUTE_COOLDOWN_BLOCKS),
            state: ArcSwap::from_pointee(MarketState::default()),
        }
    }

    pub fn service_type(&self) -> &'static str {
        SERVICE_TYPE
    }

    pub fn capability_description(&self) -> &'static str {
        CAPABILITY_DESCRIPTION
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Validate settings, then connect. Configuration errors surface before
    /// any network access.
    pub async fn initialize(&mut self, settings: &dyn SettingsSource) -> Result<()> {
        let config = EngineConfig::from_settings(settings)?;
        self.initialize_with_config(config).await
    }

    pub async fn initialize_with_config(&mut self, config: EngineConfig) -> Result<()> {
        let chain = RpcChainClient::connect(
            config.rpc_url(),
            config.signing_key.clone(),
            config.rpc_timeout,
        )
        .await?;
        let chain: Arc<dyn ChainClient> = Arc::new(chain);
        let relay: Arc<dyn BundleRelay> = Arc::new(FlashbotsRelay::new(
            config.relay_url.clone(),
            config.relay_signing_key.clone(),
            config.rpc_timeout,
        ));

        let feed = Arc::new(BlockFeed::new(config.ws_url.clone()));
        let block = chain.block_number().await?;
        let base_fee = chain.base_fee_per_gas().await?;
        feed.publish(BlockState::new(block, base_fee));

        let registry = load_markets(
            chain.clone(),
            &config.factories,
            config.base_token,
            config.max_pairs_per_factory,
        )
        .await?;
        if registry.token_count() == 0 {
            warn!("No tradable markets at block {}, evaluation finds nothing", block);
        } else {
            info!(
                "Loaded {} markets, {} tradable tokens, at block {}",
                registry.len(),
                registry.token_count(),
                block
            );
        }

        self.install(EngineParts {
            chain,
            relay,
            feed,
            registry,
            thresholds: config.thresholds,
            bundle_executor: config.bundle_executor,
            base_token: config.base_token,
            factories: config.factories,
            max_pairs_per_factory: config.max_pairs_per_factory,
            rpc_timeout: config.rpc_timeout,
        });
        Ok(())
    }

    /// Build a service over already-connected capabilities
    pub fn from_parts(parts: EngineParts) -> Self {
        let mut service = Self::new();
        service.install(parts);
        service
    }

    fn install(&mut self, parts: EngineParts) {
        let registry = SharedRegistry::new(parts.registry);
        let detector = CrossedMarketDetector::new(
            parts.thresholds.clone(),
            parts.base_token,
            parts.rpc_timeout,
        );
        let submitter = BundleSubmitter::new(
            parts.chain.clone(),
            parts.relay,
            registry.clone(),
            parts.feed.subscribe(),
            self.shutdown.subscribe(),
            parts.thresholds,
            parts.bundle_executor,
            parts.base_token,
        );

        self.engine = Some(Engine {
            chain: parts.chain,
            feed: parts.feed,
            registry,
            detector,
            submitter,
            base_token: parts.base_token,
            factories: parts.factories,
            max_pairs_per_factory: parts.max_pairs_per_factory,
        });
    }

    fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(ArbError::NotInitialized)
    }

    /// Scan the registry against the latest block
    pub async fn evaluate(&self) -> Result<Vec<CrossedMarketOpportunity>> {
        let engine = self.engine()?;
        let block = engine.feed.snapshot();
        let registry = engine.registry.snapshot();

        let opportunities = engine.detector.evaluate_markets(&registry, &block).await;

        let total_profit = opportunities
            .iter()
            .fold(U256::ZERO, |acc, opp| acc.saturating_add(opp.profit));
        self.state.store(Arc::new(MarketState {
            opportunity_count: opportunities.len(),
            total_profit,
            last_updated: now(),
        }));
        debug!(
            "Evaluated {} tokens at block {}: {} opportunities",
            registry.token_count(),
            block.current_block,
            opportunities.len()
        );

        Ok(opportunities)
    }

    /// Race the given opportunities from the current block. Routes already
    /// in flight or cooling down are skipped.
    pub async fn execute(
        &self,
        opportunities: &[CrossedMarketOpportunity],
        max_attempts: Option<u32>,
    ) -> Result<Vec<BundleOutcome>> {
        let engine = self.engine()?;
        let current_block = engine.feed.current_block();

        let claimed: Vec<CrossedMarketOpportunity> = opportunities
            .iter()
            .filter(|opp| {
                let claimed = self.routes.try_claim(opp.route(), current_block);
                if !claimed {
                    debug!("Skipping {}: route busy or cooling down", opp);
                }
                claimed
            })
            .cloned()
            .collect();
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = engine
            .submitter
            .take_crossed_markets(&claimed, current_block, max_attempts)
            .await;

        let settled_at = engine.feed.current_block();
        for outcome in &outcomes {
            let route = outcome.route();
            self.routes.release(route);
            match outcome {
                BundleOutcome::Included { .. } => self.routes.record_success(route),
                BundleOutcome::Abandoned {
                    reason: AbandonReason::Cancelled,
                    ..
                } => {}
                BundleOutcome::Abandoned { .. } => self.routes.record_failure(route, settled_at),
            }
        }
        self.routes.cleanup(settled_at);

        Ok(outcomes)
    }

    /// Begin following new blocks. Cancels nothing already running.
    pub async fn start(&self) -> Result<()> {
        let engine = self.engine()?;
        self.shutdown.send_replace(false);
        engine.feed.start().await;
        Ok(())
    }

    /// Stop the block subscription and cancel pending retries. Safe to call
    /// repeatedly, or before `initialize`.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(engine) = &self.engine {
            engine.feed.stop().await;
        }
    }

    pub fn current_block(&self) -> Result<u64> {
        Ok(self.engine()?.feed.current_block())
    }

    /// Receiver that changes on every new block
    pub fn subscribe_blocks(&self) -> Result<watch::Receiver<BlockState>> {
        Ok(self.engine()?.feed.subscribe())
    }

    /// Summary of the last `evaluate()` pass
    pub fn market_state(&self) -> MarketState {
        self.state.load().as_ref().clone()
    }

    pub fn registry(&self) -> Result<Arc<MarketRegistry>> {
        Ok(self.engine()?.registry.snapshot())
    }

    /// Reload markets from the configured factories and swap the registry.
    /// The old registry is kept when the reload fails or comes back empty.
    pub async fn refresh_registry(&self) -> Result<usize> {
        let engine = self.engine()?;
        let reloaded = load_markets(
            engine.chain.clone(),
            &engine.factories,
            engine.base_token,
            engine.max_pairs_per_factory,
        )
        .await
        .and_then(|registry| {
            if registry.token_count() == 0 && engine.registry.snapshot().token_count() > 0 {
                Err(ArbError::Rpc("reload found no tradable markets".to_string()))
            } else {
                Ok(registry)
            }
        });

        match reloaded {
            Ok(registry) => {
                let count = registry.len();
                engine.registry.replace(registry);
                info!("Market registry refreshed: {} markets", count);
                Ok(count)
            }
            Err(e) => {
                warn!("Market registry refresh failed, keeping previous: {}", e);
                Err(e)
            }
        }
    }
}

impl Default for ArbitrageService {
    fn default() -> Self {
        Self::new()
    }
}

/// Background `execute` calls. Draining after `stop()` lets submissions
/// already in flight finish instead of being dropped with the runtime.
#[derive(Default)]
pub struct Submissions {
    tasks: JoinSet<()>,
}

impl Submissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(
        &mut self,
        service: Arc<ArbitrageService>,
        opportunities: Vec<CrossedMarketOpportunity>,
        max_attempts: Option<u32>,
    ) {
        self.tasks.spawn(async move {
            match service.execute(&opportunities, max_attempts).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome.error() {
                            None => info!("Included: {:?}", outcome),
                            Some(e) => info!("Abandoned {:?}: {}", outcome.route(), e),
                        }
                    }
                }
                Err(e) => error!("Execution failed: {}", e),
            }
        });
    }

    /// Collect finished tasks without waiting
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!("Submission task failed: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every submission to settle. Returns how many were pending.
    pub async fn drain(&mut self) -> usize {
        let pending = self.tasks.len();
        if pending > 0 {
            info!("Waiting for {} submissions in flight", pending);
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Submission task failed: {}", e);
            }
        }
        pending
    }
}
