//! Configuration management
//!
//! Engine settings come from a key/value [`SettingsSource`] (process env
//! plus `.env` in production, a map in tests). Policy thresholds have
//! built-in defaults and can be overridden from a TOML file.

use crate::error::{ArbError, Result};
use crate::market::FactoryConfig;
use crate::types::Protocol;
use crate::utils::{expand_decimals, DEFAULT_GAS_LIMIT, ETHER};
use alloy::primitives::{address, Address, U256};
use alloy::signers::local::PrivateKeySigner;
use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const WS_URL_KEY: &str = "ARBITRAGE_ETHEREUM_WS_URL";
pub const HTTP_URL_KEY: &str = "ARBITRAGE_EVM_PROVIDER_URL";
pub const PRIVATE_KEY_KEY: &str = "ARBITRAGE_EVM_PRIVATE_KEY";
pub const RELAY_KEY_KEY: &str = "FLASHBOTS_RELAY_SIGNING_KEY";
pub const EXECUTOR_KEY: &str = "BUNDLE_EXECUTOR_ADDRESS";
pub const RELAY_URL_KEY: &str = "FLASHBOTS_RELAY_URL";
pub const FACTORIES_KEY: &str = "ARBITRAGE_FACTORY_ADDRESSES";
pub const MAX_PAIRS_KEY: &str = "ARBITRAGE_MAX_PAIRS_PER_FACTORY";
pub const RPC_TIMEOUT_KEY: &str = "ARBITRAGE_RPC_TIMEOUT_MS";

pub const DEFAULT_RELAY_URL: &str = "https://relay.flashbots.net";
pub const DEFAULT_MAX_PAIRS_PER_FACTORY: usize = 1000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// Wrapped ether on mainnet, the base asset of every market
pub const WETH_ADDRESS: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
pub const UNISWAP_V2_FACTORY: Address = address!("5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f");
pub const SUSHISWAP_FACTORY: Address = address!("C0AEe478e3658e2610c5F7A4A2E1777cE9e4f2Ac");

/// Key/value settings lookup
pub trait SettingsSource {
    fn get_setting(&self, key: &str) -> Option<String>;
}

/// Process environment, seeded from `.env` when present
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSettings;

impl EnvSettings {
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self
    }
}

impl SettingsSource for EnvSettings {
    fn get_setting(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl SettingsSource for HashMap<String, String> {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Non-empty, trimmed setting
fn setting(source: &dyn SettingsSource, key: &str) -> Option<String> {
    source
        .get_setting(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_setting<T: FromStr>(source: &dyn SettingsSource, key: &'static str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    setting(source, key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ArbError::InvalidSetting {
                key,
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Derive a WebSocket endpoint from an HTTP one (`https` -> `wss`, `http` -> `ws`)
pub fn derive_ws_url(http_url: &str) -> Result<String> {
    let mut url = url::Url::parse(http_url).map_err(|e| ArbError::InvalidSetting {
        key: HTTP_URL_KEY,
        reason: e.to_string(),
    })?;

    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ArbError::InvalidSetting {
                key: HTTP_URL_KEY,
                reason: format!("unsupported scheme {}", other),
            })
        }
    };
    url.set_scheme(scheme).map_err(|_| ArbError::InvalidSetting {
        key: HTTP_URL_KEY,
        reason: format!("cannot switch to {}", scheme),
    })?;

    // Url always serializes a root path; keep the caller's form
    let mut derived = url.to_string();
    if !http_url.ends_with('/') && derived.ends_with('/') {
        derived.pop();
    }
    Ok(derived)
}

/// Parse `address[:protocol]` entries separated by commas
fn parse_factories(raw: &str) -> Result<Vec<FactoryConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (addr, protocol) = match entry.split_once(':') {
                Some((addr, protocol)) => (addr, protocol.trim()),
                None => (entry, "uniswapv2"),
            };
            let address = Address::from_str(addr.trim()).map_err(|e| ArbError::InvalidSetting {
                key: FACTORIES_KEY,
                reason: format!("{}: {}", addr, e),
            })?;
            let protocol = match protocol.to_ascii_lowercase().as_str() {
                "uniswapv2" | "uniswap" => Protocol::UniswapV2,
                "sushiswap" | "sushi" => Protocol::SushiSwap,
                other => {
                    return Err(ArbError::InvalidSetting {
                        key: FACTORIES_KEY,
                        reason: format!("unknown protocol {}", other),
                    })
                }
            };
            Ok(FactoryConfig { address, protocol })
        })
        .collect()
}

pub fn default_factories() -> Vec<FactoryConfig> {
    vec![
        FactoryConfig {
            address: UNISWAP_V2_FACTORY,
            protocol: Protocol::UniswapV2,
        },
        FactoryConfig {
            address: SUSHISWAP_FACTORY,
            protocol: Protocol::SushiSwap,
        },
    ]
}

/// Gates applied to every opportunity and bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyThresholds {
    /// Profit (base units) an opportunity must exceed after gas
    pub min_profit_threshold: U256,
    /// Upper bound on base input per opportunity
    pub max_trade_size: U256,
    /// Gas budget per bundle transaction
    pub gas_limit: u64,
    /// Share of gross profit paid to the block builder
    pub miner_reward_percentage: Decimal,
    /// Minimum base-asset reserve for a market to be considered
    pub liquidity_floor: U256,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            min_profit_threshold: ETHER / U256::from(100),
            max_trade_size: ETHER * U256::from(10),
            gas_limit: DEFAULT_GAS_LIMIT,
            miner_reward_percentage: Decimal::new(8, 1),
            liquidity_floor: ETHER,
        }
    }
}

/// TOML form of [`PolicyThresholds`]; ether amounts in whole units
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ThresholdsFile {
    #[serde(default)]
    pub min_profit_eth: Option<Decimal>,
    #[serde(default)]
    pub max_trade_size_eth: Option<Decimal>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default)]
    pub miner_reward_percentage: Option<Decimal>,
    #[serde(default)]
    pub liquidity_floor_eth: Option<Decimal>,
}

fn ether_amount(value: Decimal, field: &'static str) -> anyhow::Result<U256> {
    let wei = expand_decimals(value, 18)?;
    anyhow::ensure!(!wei.is_negative(), "{} must not be negative", field);
    Ok(wei.into_raw())
}

impl PolicyThresholds {
    /// Load a TOML override file; unset fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read thresholds file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse thresholds TOML: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let file: ThresholdsFile = toml::from_str(content)?;
        let mut thresholds = Self::default();

        if let Some(v) = file.min_profit_eth {
            thresholds.min_profit_threshold = ether_amount(v, "min_profit_eth")?;
        }
        if let Some(v) = file.max_trade_size_eth {
            thresholds.max_trade_size = ether_amount(v, "max_trade_size_eth")?;
        }
        if let Some(v) = file.gas_limit {
            anyhow::ensure!(v > 0, "gas_limit must be positive");
            thresholds.gas_limit = v;
        }
        if let Some(v) = file.miner_reward_percentage {
            anyhow::ensure!(
                v >= Decimal::ZERO && v < Decimal::ONE,
                "miner_reward_percentage must be in [0, 1)"
            );
            thresholds.miner_reward_percentage = v;
        }
        if let Some(v) = file.liquidity_floor_eth {
            thresholds.liquidity_floor = ether_amount(v, "liquidity_floor_eth")?;
        }

        Ok(thresholds)
    }
}

/// Validated engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ws_url: String,
    pub http_url: Option<String>,
    pub signing_key: PrivateKeySigner,
    pub relay_signing_key: PrivateKeySigner,
    pub bundle_executor: Address,
    pub relay_url: String,
    pub factories: Vec<FactoryConfig>,
    pub max_pairs_per_factory: usize,
    pub rpc_timeout: Duration,
    pub base_token: Address,
    pub thresholds: PolicyThresholds,
}

impl EngineConfig {
    /// Validate settings in a fixed order so the first missing one is reported
    pub fn from_settings(source: &dyn SettingsSource) -> Result<Self> {
        let ws_setting = setting(source, WS_URL_KEY);
        let http_url = setting(source, HTTP_URL_KEY);

        // Provider URLs usually carry API keys
        debug!(
            "ArbitrageService initialize - URLs: ws={:?} http={:?}",
            ws_setting, http_url
        );

        let ws_url = match (ws_setting, &http_url) {
            (Some(ws), _) => ws,
            (None, Some(http)) => {
                let derived = derive_ws_url(http)?;
                debug!("Using derived WebSocket URL: {}", derived);
                derived
            }
            (None, None) => return Err(ArbError::MissingUrls),
        };

        let signing_key = setting(source, PRIVATE_KEY_KEY).ok_or(ArbError::MissingSigningKey)?;
        let signing_key = parse_signer(&signing_key, PRIVATE_KEY_KEY)?;

        let relay_key = setting(source, RELAY_KEY_KEY).ok_or(ArbError::MissingRelayKey)?;
        let relay_signing_key = parse_signer(&relay_key, RELAY_KEY_KEY)?;

        let executor = setting(source, EXECUTOR_KEY).ok_or(ArbError::MissingExecutorAddress)?;
        let bundle_executor =
            Address::from_str(&executor).map_err(|e| ArbError::InvalidSetting {
                key: EXECUTOR_KEY,
                reason: e.to_string(),
            })?;

        let factories = match setting(source, FACTORIES_KEY) {
            Some(raw) => parse_factories(&raw)?,
            None => default_factories(),
        };

        Ok(Self {
            ws_url,
            http_url,
            signing_key,
            relay_signing_key,
            bundle_executor,
            relay_url: setting(source, RELAY_URL_KEY)
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            factories,
            max_pairs_per_factory: parse_setting(source, MAX_PAIRS_KEY)?
                .unwrap_or(DEFAULT_MAX_PAIRS_PER_FACTORY),
            rpc_timeout: Duration::from_millis(
                parse_setting(source, RPC_TIMEOUT_KEY)?.unwrap_or(DEFAULT_RPC_TIMEOUT_MS),
            ),
            base_token: WETH_ADDRESS,
            thresholds: PolicyThresholds::default(),
        })
    }

    /// RPC endpoint for state reads and signing: HTTP when configured, else the WebSocket
    pub fn rpc_url(&self) -> &str {
        self.http_url.as_deref().unwrap_or(&self.ws_url)
    }

    pub fn with_thresholds(mut self, thresholds: PolicyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

fn parse_signer(raw: &str, key: &'static str) -> Result<PrivateKeySigner> {
    PrivateKeySigner::from_str(raw).map_err(|e| ArbError::InvalidSetting {
        key,
        reason: e.to_string(),
    })
}
