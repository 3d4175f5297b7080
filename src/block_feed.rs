//! Block feed
//!
//! Follows `newHeads` over a WebSocket subscription and publishes the
//! latest [`BlockState`] through a watch channel. The feed is the only
//! writer; readers take copies. Block numbers only move forward: stale or
//! duplicate heads and malformed notifications are ignored. A dropped
//! subscription is re-established with exponential backoff.

use crate::error::{ArbError, Result};
use crate::types::BlockState;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn parse_hex_u128(value: Option<&Value>) -> Option<u128> {
    let raw = value?.as_str()?;
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    u128::from_str_radix(digits, 16).ok()
}

/// Apply a block header (the `result` of a `newHeads` notification).
/// Returns true when the published state changed.
pub fn apply_head(state: &watch::Sender<BlockState>, head: &Value) -> bool {
    let Some(number) = parse_hex_u128(head.get("number")).and_then(|n| u64::try_from(n).ok())
    else {
        return false;
    };
    let base_fee = parse_hex_u128(head.get("baseFeePerGas"));

    state.send_if_modified(|current| {
        if number <= current.current_block {
            return false;
        }
        current.current_block = number;
        if let Some(fee) = base_fee {
            current.base_fee_per_gas = fee;
        }
        true
    })
}

/// Apply a full `eth_subscription` notification envelope
pub fn apply_notification(state: &watch::Sender<BlockState>, notification: &Value) -> bool {
    match notification.pointer("/params/result") {
        Some(head) => apply_head(state, head),
        None => false,
    }
}

pub struct BlockFeed {
    ws_url: String,
    state: Arc<watch::Sender<BlockState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BlockFeed {
    pub fn new(ws_url: impl Into<String>) -> Self {
        let (state, _) = watch::channel(BlockState::default());
        let (shutdown, _) = watch::channel(false);
        Self {
            ws_url: ws_url.into(),
            state: Arc::new(state),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn subscribe(&self) -> watch::Receiver<BlockState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> BlockState {
        *self.state.borrow()
    }

    pub fn current_block(&self) -> u64 {
        self.snapshot().current_block
    }

    /// Seed or advance the state directly (e.g. from an RPC read at startup)
    pub fn publish(&self, block: BlockState) -> bool {
        self.state.send_if_modified(|current| {
            if block.current_block <= current.current_block {
                return false;
            }
            *current = block;
            true
        })
    }

    pub fn apply_notification(&self, notification: &Value) -> bool {
        apply_notification(&self.state, notification)
    }

    /// Start the subscription task. No-op when already running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        self.shutdown.send_replace(false);

        let ws_url = self.ws_url.clone();
        let state = self.state.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(run_feed(ws_url, state, shutdown)));
        info!("Block feed started on {}", self.ws_url);
    }

    /// Stop the subscription task. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Block feed task ended abnormally: {}", e);
            }
            info!("Block feed stopped at block {}", self.current_block());
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

async fn run_feed(
    ws_url: String,
    state: Arc<watch::Sender<BlockState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match follow_heads(&ws_url, &state, &mut shutdown, &mut backoff).await {
            Ok(()) => return,
            Err(e) => warn!(
                "Block subscription dropped: {}. Reconnecting in {:?}",
                e, backoff
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Follow heads until shutdown (Ok) or the subscription fails (Err)
async fn follow_heads(
    ws_url: &str,
    state: &watch::Sender<BlockState>,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Duration,
) -> Result<()> {
    let provider = ProviderBuilder::new()
        .connect_ws(WsConnect::new(ws_url))
        .await
        .map_err(ArbError::rpc)?;
    let mut subscription = provider
        .subscribe::<_, Value>(("newHeads",))
        .await
        .map_err(ArbError::rpc)?;
    info!("Subscribed to newHeads on {}", ws_url);

    loop {
        tokio::select! {
            head = subscription.recv() => {
                let head = head.map_err(ArbError::rpc)?;
                *backoff = INITIAL_BACKOFF;
                if apply_head(state, &head) {
                    let current = *state.borrow();
                    debug!(
                        "New block {} (base fee {})",
                        current.current_block, current.base_fee_per_gas
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(number: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
                "result": {"number": number, "baseFeePerGas": "0x3b9aca00"}
            }
        })
    }

    #[test]
    fn test_newer_block_updates_state() {
        let feed = BlockFeed::new("ws://localhost:8546");
        assert!(feed.apply_notification(&notification("0x10")));
        assert_eq!(feed.snapshot(), BlockState::new(16, 1_000_000_000));
    }

    #[test]
    fn test_stale_and_duplicate_blocks_ignored() {
        let feed = BlockFeed::new("ws://localhost:8546");
        assert!(feed.apply_notification(&notification("0x10")));
        assert!(!feed.apply_notification(&notification("0x10")));
        assert!(!feed.apply_notification(&notification("0xf")));
        assert_eq!(feed.current_block(), 16);
    }

    #[test]
    fn test_malformed_notifications_are_noops() {
        let feed = BlockFeed::new("ws://localhost:8546");
        feed.publish(BlockState::new(5, 7));

        assert!(!feed.apply_notification(&json!({"params": {}})));
        assert!(!feed.apply_notification(&json!({"params": {"result": {}}})));
        assert!(!feed.apply_notification(&json!({"params": {"result": {"number": 17}}})));
        assert!(!feed.apply_notification(&notification("not-hex")));
        assert!(!feed.apply_notification(&json!("garbage")));
        assert_eq!(feed.snapshot(), BlockState::new(5, 7));
    }

    #[test]
    fn test_head_without_base_fee_keeps_previous_fee() {
        let feed = BlockFeed::new("ws://localhost:8546");
        feed.publish(BlockState::new(5, 7));
        assert!(feed.apply_notification(&json!({"params": {"result": {"number": "0x6"}}})));
        assert_eq!(feed.snapshot(), BlockState::new(6, 7));
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let feed = BlockFeed::new("ws://localhost:8546");
        let mut rx = feed.subscribe();
        assert!(feed.publish(BlockState::new(100, 1)));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().current_block, 100);
        assert!(!feed.publish(BlockState::new(99, 1)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let feed = BlockFeed::new("ws://127.0.0.1:1");
        feed.stop().await;
        feed.start().await;
        assert!(feed.is_running().await);
        feed.start().await;
        feed.stop().await;
        feed.stop().await;
        assert!(!feed.is_running().await);
    }
}
