//! The resolver tier contract.
//!
//! A tier is one pluggable strategy for passing a challenge. Concrete
//! provider integrations live outside this crate and are registered on the
//! chain at construction time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{ChallengeContext, ResolutionOutcome, TierKind};
use crate::pipeline::config::duration_ms;

/// Error raised by a single tier. Never escapes the chain.
#[derive(Debug, Error)]
pub enum TierError {
    /// The provider returned an error.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider did not answer in time.
    #[error("Tier timed out after {0:?}")]
    Timeout(Duration),

    /// The tier is not usable, for example a missing API key.
    #[error("Tier unavailable: {0}")]
    Unavailable(String),

    /// The tier's wait was abandoned before an answer arrived.
    #[error("Tier cancelled")]
    Cancelled,
}

/// One strategy in the resolution chain.
#[async_trait]
pub trait ResolverTier: Send + Sync {
    /// Which position of the chain this tier fills.
    fn kind(&self) -> TierKind;

    /// Further narrows which challenges the tier attempts.
    ///
    /// The chain checks `TierKind::handles` first, so an override can only
    /// exclude challenges, never widen a recognition tier's reach.
    fn accepts(&self, _challenge: &ChallengeContext) -> bool {
        true
    }

    /// Attempts the challenge once.
    async fn attempt(&self, challenge: &ChallengeContext) -> Result<ResolutionOutcome, TierError>;
}

/// Provider settings for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub enabled: bool,
    /// Provider identifier, e.g. `2captcha` or `tesseract`.
    pub provider: Option<String>,
    /// Environment variable holding the provider API key.
    pub api_key_env: Option<String>,
    /// Budget the provider should respect for one attempt.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Provider-specific options.
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: None,
            api_key_env: None,
            timeout: Duration::from_secs(60),
            options: HashMap::new(),
        }
    }
}

impl TierConfig {
    /// Reads the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String, TierError> {
        let var = self
            .api_key_env
            .as_deref()
            .ok_or_else(|| TierError::Unavailable("no api_key_env configured".to_string()))?;
        std::env::var(var)
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| TierError::Unavailable(format!("{} is not set", var)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeKind;
    use uuid::Uuid;

    struct FixedTier(TierKind);

    #[async_trait]
    impl ResolverTier for FixedTier {
        fn kind(&self) -> TierKind {
            self.0
        }

        async fn attempt(&self, _: &ChallengeContext) -> Result<ResolutionOutcome, TierError> {
            Ok(ResolutionOutcome::solved(self.0, "ok", 1.0))
        }
    }

    #[test]
    fn test_accepts_defaults_to_every_challenge() {
        let recaptcha = ChallengeContext::new(ChallengeKind::Recaptcha, Uuid::new_v4(), "u", vec![]);
        let text = ChallengeContext::new(ChallengeKind::Text, Uuid::new_v4(), "u", vec![]);

        assert!(FixedTier(TierKind::PaidService).accepts(&recaptcha));
        assert!(FixedTier(TierKind::Manual).accepts(&text));
        // Kind gating happens in the chain, not here.
        assert!(FixedTier(TierKind::Vision).accepts(&recaptcha));
    }

    #[test]
    fn test_api_key_lookup() {
        let config = TierConfig::default();
        assert!(matches!(config.api_key(), Err(TierError::Unavailable(_))));

        let config = TierConfig {
            api_key_env: Some("APPLYFLOW_TEST_TIER_KEY_UNSET".to_string()),
            ..Default::default()
        };
        let err = config.api_key().unwrap_err();
        assert!(err.to_string().contains("APPLYFLOW_TEST_TIER_KEY_UNSET"));
    }

    #[test]
    fn test_tier_config_yaml() {
        let yaml = r#"
provider: 2captcha
api_key_env: SOLVER_KEY
timeout: 45000
options:
  soft_id: 42
"#;
        let config: TierConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.provider.as_deref(), Some("2captcha"));
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.options["soft_id"], serde_json::json!(42));
    }
}
