//! Route guard
//!
//! Keeps the service from racing the same route twice and from hammering a
//! route that keeps getting abandoned. A route is the `(buy_market,
//! sell_market)` pair of an opportunity.
//!
//! - In flight: a route is claimed when its bundle is handed to the
//!   submitter and released when the outcome comes back.
//! - Cooldown: every abandonment escalates the suppression window
//!   (initial, 5x, 25x, ... up to the cap). An inclusion clears it.

use alloy::primitives::Address;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

pub type RouteKey = (Address, Address);

/// Escalation multiplier per failure
const ESCALATION_FACTOR: u64 = 5;

/// Longest suppression in blocks (~1 hour at 12s blocks)
const DEFAULT_MAX_COOLDOWN: u64 = 300;

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    last_failed_block: u64,
    cooldown_blocks: u64,
    failure_count: u32,
}

impl CooldownEntry {
    fn expires_at(&self) -> u64 {
        self.last_failed_block.saturating_add(self.cooldown_blocks)
    }
}

#[derive(Debug)]
pub struct RouteGuard {
    in_flight: DashSet<RouteKey>,
    entries: DashMap<RouteKey, CooldownEntry>,
    initial_cooldown: u64,
    max_cooldown: u64,
}

impl RouteGuard {
    /// `initial_cooldown` = blocks to suppress after the first failure (0 disables cooldown)
    pub fn new(initial_cooldown: u64) -> Self {
        Self {
            in_flight: DashSet::new(),
            entries: DashMap::new(),
            initial_cooldown,
            max_cooldown: DEFAULT_MAX_COOLDOWN.max(initial_cooldown),
        }
    }

    /// Claim a route for submission. False when it is already in flight or
    /// still cooling down.
    pub fn try_claim(&self, route: RouteKey, current_block: u64) -> bool {
        if self.is_cooled_down(route, current_block) {
            return false;
        }
        self.in_flight.insert(route)
    }

    pub fn release(&self, route: RouteKey) {
        self.in_flight.remove(&route);
    }

    pub fn is_in_flight(&self, route: RouteKey) -> bool {
        self.in_flight.contains(&route)
    }

    pub fn is_cooled_down(&self, route: RouteKey, current_block: u64) -> bool {
        if self.initial_cooldown == 0 {
            return false;
        }
        self.entries
            .get(&route)
            .is_some_and(|entry| current_block < entry.expires_at())
    }

    /// Escalate the cooldown: initial x 5^(failures-1), capped
    pub fn record_failure(&self, route: RouteKey, block: u64) {
        if self.initial_cooldown == 0 {
            return;
        }

        let mut entry = self.entries.entry(route).or_insert(CooldownEntry {
            last_failed_block: block,
            cooldown_blocks: 0,
            failure_count: 0,
        });
        entry.failure_count += 1;
        entry.last_failed_block = block;
        entry.cooldown_blocks = self
            .initial_cooldown
            .saturating_mul(ESCALATION_FACTOR.saturating_pow(entry.failure_count - 1))
            .min(self.max_cooldown);

        debug!(
            "Route cooldown: {:?} -> {:?} | fail #{} | {} blocks",
            route.0, route.1, entry.failure_count, entry.cooldown_blocks
        );
    }

    pub fn record_success(&self, route: RouteKey) {
        if self.entries.remove(&route).is_some() {
            info!("Route cooldown reset: {:?} -> {:?} (bundle included)", route.0, route.1);
        }
    }

    /// Drop expired entries
    pub fn cleanup(&self, current_block: u64) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| current_block < entry.expires_at());
        // Other tasks may record failures while this runs
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Route cooldown cleanup: removed {} expired entries", removed);
        }
    }

    pub fn active_count(&self, current_block: u64) -> usize {
        self.entries
            .iter()
            .filter(|entry| current_block < entry.expires_at())
            .count()
    }
}

impl Default for RouteGuard {
    fn default() -> Self {
        Self::new(2)
    }
}
