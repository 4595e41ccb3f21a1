//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Errors raised while loading a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid runtime configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("effect_limit must be at least 1")]
    ZeroEffectLimit,
}

/// Options for a [`crate::Runtime`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Maximum number of listener notifications in one settlement, nested
    /// settlements included. `None` drains pending listeners to exhaustion.
    ///
    /// When the limit is hit the remaining listeners are dropped from the
    /// queue and [`crate::Error::RunawayFlush`] is sent to the fault handler.
    pub effect_limit: Option<usize>,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the effect limit.
    pub fn with_effect_limit(mut self, limit: usize) -> Self {
        self.effect_limit = Some(limit);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.effect_limit == Some(0) {
            return Err(ConfigError::ZeroEffectLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.effect_limit.is_none());
    }

    #[test]
    fn effect_limit_is_parsed() {
        let config = RuntimeConfig::from_json(r#"{ "effect_limit": 16 }"#).unwrap();
        assert_eq!(config.effect_limit, Some(16));
    }

    #[test]
    fn zero_limit_is_rejected() {
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "effect_limit": 0 }"#),
            Err(ConfigError::ZeroEffectLimit)
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "effects": 3 }"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
