//! Configuration for transaction registries

use std::env;

use serde::{Deserialize, Serialize};

/// Registry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Label attached to every log line emitted for this registry
    pub name: String,
    /// Maximum number of recorded faults kept until drained (oldest dropped first)
    pub max_faults: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "global".to_string(),
            max_faults: 1024,
        }
    }
}

impl RegistryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TXN_REGISTRY_NAME`: Registry label (default: global)
    /// - `TXN_MAX_FAULTS`: Fault log capacity (default: 1024)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env::var("TXN_REGISTRY_NAME").unwrap_or(defaults.name),
            max_faults: env::var("TXN_MAX_FAULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|max| *max > 0)
                .unwrap_or(defaults.max_faults),
        }
    }

    /// Configuration for a named, private registry.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
