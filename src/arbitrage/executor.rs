//! Bundle Submitter
//!
//! Turns crossed-market opportunities into private bundles and races them
//! for inclusion. Each opportunity runs its own state machine:
//!
//! ```text
//! BUILD -> SIMULATE -> SUBMIT -> AWAIT_INCLUSION -> INCLUDED
//!   ^                                  |
//!   +------------- RETRY <-------------+   (not included, attempts left)
//! ```
//!
//! Any stage can end in ABANDONED. A failed simulation or a relay rejection
//! abandons at once. Transient RPC errors and missed blocks retry once the
//! next block arrives, until the attempt budget runs out. Market calldata is
//! built once per opportunity; only gas terms and the target block change
//! between attempts.

use crate::arbitrage::bundle::Bundle;
use crate::chain::ChainClient;
use crate::config::PolicyThresholds;
use crate::contracts::IBundleExecutor;
use crate::error::{ArbError, Result};
use crate::market::{Market, SharedRegistry};
use crate::relay::{BundleHandle, BundleRelay};
use crate::types::{BlockState, CrossedMarketOpportunity, ExecutorCall, GasTerms};
use crate::utils::{apply_fraction, to_display};
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolCall;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Attempt budget when the caller does not give one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Longest wait for the target block before checking inclusion anyway, and
/// for the next block before retrying after a transient error
pub const DEFAULT_INCLUSION_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// A market of the route is no longer in the registry
    MarketUnavailable,
    /// Gas plus builder payment would consume the whole profit
    Unprofitable,
    Build(String),
    SimulationFailed(String),
    RelayRejected(String),
    AttemptsExhausted,
    Cancelled,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AbandonReason::MarketUnavailable => write!(f, "market unavailable"),
            AbandonReason::Unprofitable => write!(f, "unprofitable after gas and builder payment"),
            AbandonReason::Build(e) => write!(f, "build failed: {}", e),
            AbandonReason::SimulationFailed(e) => write!(f, "simulation failed: {}", e),
            AbandonReason::RelayRejected(e) => write!(f, "relay rejected: {}", e),
            AbandonReason::AttemptsExhausted => write!(f, "attempts exhausted"),
            AbandonReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleOutcome {
    Included {
        route: (Address, Address),
        block: u64,
        tx_hash: B256,
        attempts: u32,
    },
    Abandoned {
        route: (Address, Address),
        reason: AbandonReason,
        attempts: u32,
    },
}

impl BundleOutcome {
    pub fn is_included(&self) -> bool {
        matches!(self, BundleOutcome::Included { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            BundleOutcome::Included { attempts, .. }
            | BundleOutcome::Abandoned { attempts, .. } => *attempts,
        }
    }

    pub fn route(&self) -> (Address, Address) {
        match self {
            BundleOutcome::Included { route, .. } | BundleOutcome::Abandoned { route, .. } => {
                *route
            }
        }
    }

    /// The error an abandonment corresponds to, for callers that report failures
    pub fn error(&self) -> Option<ArbError> {
        let BundleOutcome::Abandoned {
            reason, attempts, ..
        } = self
        else {
            return None;
        };
        Some(match reason {
            AbandonReason::SimulationFailed(e) => ArbError::SimulationFailed(e.clone()),
            AbandonReason::RelayRejected(e) => ArbError::Relay(e.clone()),
            AbandonReason::AttemptsExhausted => ArbError::InclusionTimeout {
                attempts: *attempts,
            },
            other => ArbError::Rpc(other.to_string()),
        })
    }
}

/// Per-opportunity submission stage
enum BundleState {
    Build,
    Simulate(Bundle),
    Submit(Bundle),
    AwaitInclusion(BundleHandle),
    Retry(String),
    Included { block: u64, tx_hash: B256 },
    Abandoned(AbandonReason),
}

/// Everything about an opportunity that stays fixed across attempts
struct BundlePlan {
    executor_call: ExecutorCall,
    /// Round trip through the buy market, used to estimate gas when the
    /// full call cannot be estimated
    round_trip_call: ExecutorCall,
    coinbase_payment: U256,
    profit: U256,
}

pub struct BundleSubmitter {
    chain: Arc<dyn ChainClient>,
    relay: Arc<dyn BundleRelay>,
    registry: SharedRegistry,
    blocks: watch::Receiver<BlockState>,
    shutdown: watch::Receiver<bool>,
    thresholds: PolicyThresholds,
    executor: Address,
    base_token: Address,
    inclusion_wait: Duration,
}

impl BundleSubmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        relay: Arc<dyn BundleRelay>,
        registry: SharedRegistry,
        blocks: watch::Receiver<BlockState>,
        shutdown: watch::Receiver<bool>,
        thresholds: PolicyThresholds,
        executor: Address,
        base_token: Address,
    ) -> Self {
        Self {
            chain,
            relay,
            registry,
            blocks,
            shutdown,
            thresholds,
            executor,
            base_token,
            inclusion_wait: DEFAULT_INCLUSION_WAIT,
        }
    }

    pub fn with_inclusion_wait(mut self, wait: Duration) -> Self {
        self.inclusion_wait = wait;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Race every opportunity concurrently, each with its own attempt budget
    pub async fn take_crossed_markets(
        &self,
        opportunities: &[CrossedMarketOpportunity],
        current_block: u64,
        max_attempts: Option<u32>,
    ) -> Vec<BundleOutcome> {
        let max_attempts = max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);
        info!(
            "Submitting {} opportunities from block {} (max {} attempts each)",
            opportunities.len(),
            current_block,
            max_attempts
        );

        join_all(
            opportunities
                .iter()
                .map(|opp| self.run_opportunity(opp, current_block, max_attempts)),
        )
        .await
    }

    async fn run_opportunity(
        &self,
        opp: &CrossedMarketOpportunity,
        current_block: u64,
        max_attempts: u32,
    ) -> BundleOutcome {
        let route = opp.route();
        let mut attempts = 0u32;
        // Block the latest attempt was built on; a retry waits for a newer one
        let mut attempt_block = current_block;

        let plan = match self.plan(opp).await {
            Ok(plan) => plan,
            Err(reason) => {
                warn!("Abandoning {}: {}", opp, reason);
                return BundleOutcome::Abandoned {
                    route,
                    reason,
                    attempts,
                };
            }
        };

        let mut state = BundleState::Build;
        loop {
            state = match state {
                BundleState::Build => {
                    if self.is_cancelled() {
                        BundleState::Abandoned(AbandonReason::Cancelled)
                    } else if attempts >= max_attempts {
                        BundleState::Abandoned(AbandonReason::AttemptsExhausted)
                    } else {
                        attempts += 1;
                        let block = *self.blocks.borrow();
                        let target = block.current_block.max(current_block) + 1;
                        attempt_block = target - 1;
                        match self.build(&plan, &block, target, attempts, max_attempts).await {
                            Ok(Some(bundle)) => BundleState::Simulate(bundle),
                            Ok(None) => BundleState::Abandoned(AbandonReason::Unprofitable),
                            Err(e) if e.is_transient() => BundleState::Retry(e.to_string()),
                            Err(e) => BundleState::Abandoned(AbandonReason::Build(e.to_string())),
                        }
                    }
                }

                BundleState::Simulate(bundle) => {
                    let state_block = bundle.target_block().saturating_sub(1);
                    match self.relay.simulate(&bundle, state_block).await {
                        Ok(sim) if sim.success && sim.coinbase_diff >= plan.coinbase_payment => {
                            debug!(
                                "Simulation ok for {:?}: builder receives {}",
                                route, sim.coinbase_diff
                            );
                            BundleState::Submit(bundle)
                        }
                        Ok(sim) => BundleState::Abandoned(AbandonReason::SimulationFailed(
                            sim.error.unwrap_or_else(|| {
                                format!(
                                    "builder payment {} below expected {}",
                                    sim.coinbase_diff, plan.coinbase_payment
                                )
                            }),
                        )),
                        Err(e) if e.is_transient() => BundleState::Retry(e.to_string()),
                        Err(e) => BundleState::Abandoned(AbandonReason::SimulationFailed(
                            e.to_string(),
                        )),
                    }
                }

                BundleState::Submit(bundle) => match self.relay.send_bundle(&bundle).await {
                    Ok(handle) => {
                        info!(
                            "Bundle submitted for block {} (attempt {}/{}) {:?}",
                            bundle.target_block(),
                            bundle.attempt(),
                            bundle.max_attempts(),
                            handle.bundle_hash
                        );
                        BundleState::AwaitInclusion(handle)
                    }
                    Err(e) if e.is_transient() => BundleState::Retry(e.to_string()),
                    Err(e) => BundleState::Abandoned(AbandonReason::RelayRejected(e.to_string())),
                },

                BundleState::AwaitInclusion(handle) => match self.await_inclusion(&handle).await {
                    Ok(Some((block, tx_hash))) => BundleState::Included { block, tx_hash },
                    Ok(None) => {
                        BundleState::Retry(format!("not included in block {}", handle.target_block))
                    }
                    Err(e) => BundleState::Retry(e.to_string()),
                },

                BundleState::Retry(reason) => {
                    debug!("Retrying {:?} after attempt {}: {}", route, attempts, reason);
                    if attempts < max_attempts {
                        self.wait_for_block_after(attempt_block).await;
                    }
                    BundleState::Build
                }

                BundleState::Included { block, tx_hash } => {
                    info!(
                        "Bundle included in block {} after {} attempts: {} (profit {} ETH)",
                        block,
                        attempts,
                        tx_hash,
                        to_display(plan.profit, 18)
                    );
                    return BundleOutcome::Included {
                        route,
                        block,
                        tx_hash,
                        attempts,
                    };
                }

                BundleState::Abandoned(reason) => {
                    warn!("Abandoning {} after {} attempts: {}", opp, attempts, reason);
                    return BundleOutcome::Abandoned {
                        route,
                        reason,
                        attempts,
                    };
                }
            };
        }
    }

    /// Resolve markets and encode both legs. Done once per opportunity.
    async fn plan(
        &self,
        opp: &CrossedMarketOpportunity,
    ) -> std::result::Result<BundlePlan, AbandonReason> {
        let registry = self.registry.snapshot();
        let (Some(buy), Some(sell)) = (
            registry.market(opp.buy_from_market),
            registry.market(opp.sell_to_market),
        ) else {
            return Err(AbandonReason::MarketUnavailable);
        };

        let build_error = |e: ArbError| AbandonReason::Build(e.to_string());

        // Bought tokens go straight into the sell market when it accepts them
        let first_leg = buy
            .sell_tokens_to_next_market(
                self.base_token,
                opp.token_address,
                opp.base_amount_in,
                sell.as_ref(),
                self.executor,
            )
            .await
            .map_err(build_error)?;
        let second_leg = sell
            .sell_tokens(
                opp.token_address,
                self.base_token,
                first_leg.amount_out,
                self.executor,
            )
            .await
            .map_err(build_error)?;

        let coinbase_payment = apply_fraction(opp.profit, self.thresholds.miner_reward_percentage);

        let executor_call = ExecutorCall {
            to: self.executor,
            data: IBundleExecutor::uniswapWethCall {
                _wethAmountToFirstMarket: opp.base_amount_in,
                _ethAmountToCoinbase: coinbase_payment,
                _targets: vec![first_leg.target, second_leg.target],
                _payloads: vec![first_leg.data, second_leg.data],
            }
            .abi_encode()
            .into(),
            value: U256::ZERO,
        };
        let round_trip_call = ExecutorCall {
            to: self.executor,
            data: IBundleExecutor::roundTripCall {
                _market: buy.market_address(),
                _wethAmount: opp.base_amount_in,
            }
            .abi_encode()
            .into(),
            value: U256::ZERO,
        };

        Ok(BundlePlan {
            executor_call,
            round_trip_call,
            coinbase_payment,
            profit: opp.profit,
        })
    }

    /// Estimate gas and sign the executor call for `target`.
    /// `None` when gas and builder payment leave no profit.
    async fn build(
        &self,
        plan: &BundlePlan,
        block: &BlockState,
        target: u64,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Option<Bundle>> {
        let gas_estimate = match self.chain.estimate_gas(&plan.executor_call).await {
            Ok(gas) => gas,
            Err(e) => {
                debug!("Full estimate failed ({}), estimating round trip instead", e);
                self.chain
                    .estimate_gas(&plan.round_trip_call)
                    .await?
                    .saturating_mul(2)
            }
        };

        // 20% headroom over the estimate
        let gas_limit = gas_estimate.saturating_mul(6) / 5;
        if gas_limit > self.thresholds.gas_limit {
            debug!(
                "Gas {} exceeds policy limit {}",
                gas_limit, self.thresholds.gas_limit
            );
            return Ok(None);
        }

        let max_fee_per_gas = block.next_base_fee();
        let gas_cost = U256::from(gas_limit) * U256::from(max_fee_per_gas);
        if gas_cost + plan.coinbase_payment >= plan.profit {
            return Ok(None);
        }

        let gas = GasTerms {
            gas_limit,
            max_fee_per_gas,
            // The builder is paid through the coinbase transfer
            max_priority_fee_per_gas: 0,
        };
        let signed = self.chain.sign_transaction(&plan.executor_call, &gas).await?;

        Ok(Some(
            Bundle::builder(target)
                .transaction(signed)
                .attempt(attempt, max_attempts)
                .build(),
        ))
    }

    /// Wait until the feed moves past `block`. Returns early on shutdown or
    /// after `inclusion_wait`.
    async fn wait_for_block_after(&self, block: u64) {
        let mut blocks = self.blocks.clone();
        let mut shutdown = self.shutdown.clone();

        let next_block = async {
            loop {
                if blocks.borrow_and_update().current_block > block {
                    return;
                }
                if blocks.changed().await.is_err() {
                    return;
                }
            }
        };

        let stopped = async {
            loop {
                if *shutdown.borrow_and_update() {
                    return;
                }
                if shutdown.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            reached = tokio::time::timeout(self.inclusion_wait, next_block) => {
                if reached.is_err() {
                    debug!("No block after {} within {:?}", block, self.inclusion_wait);
                }
            }
            _ = stopped => {}
        }
    }

    /// Wait for the target block, then look the bundle's transactions up
    async fn await_inclusion(&self, handle: &BundleHandle) -> Result<Option<(u64, B256)>> {
        let mut blocks = self.blocks.clone();
        let target = handle.target_block;

        let reached = tokio::time::timeout(self.inclusion_wait, async {
            loop {
                if blocks.borrow_and_update().current_block >= target {
                    return true;
                }
                if blocks.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        if !reached {
            debug!("Block {} not observed within {:?}", target, self.inclusion_wait);
        }

        for tx_hash in &handle.tx_hashes {
            if let Some(block) = self.chain.inclusion_block(*tx_hash).await? {
                return Ok(Some((block, *tx_hash)));
            }
        }
        Ok(None)
    }
}
