//! Engine Error Taxonomy
//!
//! One error type for the whole library. Configuration and not-initialized
//! errors halt the caller; RPC and timeout errors are transient and count
//! against the attempt budget of whatever operation raised them; simulation
//! and relay errors are fatal for a single opportunity only.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArbError>;

#[derive(Debug, Error)]
pub enum ArbError {
    #[error("Missing both ARBITRAGE_ETHEREUM_WS_URL and ARBITRAGE_EVM_PROVIDER_URL")]
    MissingUrls,

    #[error("Missing ARBITRAGE_EVM_PRIVATE_KEY")]
    MissingSigningKey,

    #[error("Missing FLASHBOTS_RELAY_SIGNING_KEY")]
    MissingRelayKey,

    #[error("Missing BUNDLE_EXECUTOR_ADDRESS")]
    MissingExecutorAddress,

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("Market {market} does not trade {token}")]
    UnsupportedToken {
        market: alloy::primitives::Address,
        token: alloy::primitives::Address,
    },

    #[error("Swap on {market} yields no output")]
    ZeroOutput { market: alloy::primitives::Address },

    #[error("Fixed-point overflow: {0}")]
    Overflow(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Bundle simulation failed: {0}")]
    SimulationFailed(String),

    #[error("Relay rejected bundle: {0}")]
    Relay(String),

    #[error("Bundle not included after {attempts} attempts")]
    InclusionTimeout { attempts: u32 },

    #[error("ArbitrageService not initialized")]
    NotInitialized,
}

impl ArbError {
    /// Transient errors may be retried within the caller's attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, ArbError::Rpc(_) | ArbError::Timeout(_))
    }

    /// Errors that must stop startup or the calling action.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ArbError::MissingUrls
                | ArbError::MissingSigningKey
                | ArbError::MissingRelayKey
                | ArbError::MissingExecutorAddress
                | ArbError::InvalidSetting { .. }
        )
    }

    pub fn rpc(err: impl std::fmt::Display) -> Self {
        ArbError::Rpc(err.to_string())
    }
}

/// Run an external call under a deadline. An elapsed deadline is reported as
/// a transient [`ArbError::Timeout`].
pub async fn with_timeout<T, F>(
    what: &'static str,
    limit: std::time::Duration,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ArbError::Timeout(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_classes() {
        assert!(ArbError::Rpc("boom".into()).is_transient());
        assert!(ArbError::Timeout("simulate").is_transient());
        assert!(!ArbError::SimulationFailed("revert".into()).is_transient());
        assert!(!ArbError::Relay("bad signature".into()).is_transient());
        assert!(ArbError::MissingRelayKey.is_configuration());
        assert!(!ArbError::NotInitialized.is_configuration());
    }

    #[test]
    fn test_configuration_messages_are_distinct() {
        let messages = [
            ArbError::MissingUrls.to_string(),
            ArbError::MissingSigningKey.to_string(),
            ArbError::MissingRelayKey.to_string(),
            ArbError::MissingExecutorAddress.to_string(),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in messages.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed_is_transient() {
        let result: Result<()> = with_timeout("reserve read", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, ArbError::Timeout("reserve read")));
        assert!(err.is_transient());
    }
}
